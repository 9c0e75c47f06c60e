pub mod error;
pub mod config;
pub mod value;
pub mod backend;
pub mod affinity;
pub mod pool;
pub mod segregation;
pub mod session;
pub mod cursor;
pub mod lob;
pub mod xa;
pub mod proxy;
pub mod dispatch;
pub mod server;

pub use backend::{DriverRegistry, Xid};
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use proxy::Proxy;
pub use session::SessionId;
