//!
//! proxima server binary
//! ---------------------
//! Command-line entry point for the proxy's HTTP call surface. Configuration comes from an
//! optional JSON file, then `proxima.*` properties in the environment, then CLI flags.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use proxima::config::ProxyConfig;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        if let Some(v) = args[i].strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(v.to_string());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool { args.iter().any(|a| a == flag) }

// `PROXIMA_DATASOURCE_REPORTS_URL` style variables are awkward for dotted keys, so properties
// are passed verbatim: any variable whose name starts with `proxima.`.
fn env_properties() -> Vec<(String, String)> { env::vars().filter(|(k, _)| k.starts_with("proxima.")).collect() }

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("proxima server\n\nUSAGE:\n  proxima_server [--config PATH] [--bind ADDR] [--set proxima.KEY=VALUE]...\n\nOPTIONS:\n  --config PATH     JSON configuration file (env: PROXIMA_CONFIG)\n  --bind ADDR       Listen address (env: PROXIMA_BIND, default 127.0.0.1:1059)\n  --set K=V         Apply one proxima.* property, e.g. proxima.datasource.reports.url=memory://reports\n\nLogging follows RUST_LOG, e.g. RUST_LOG=proxima=debug.\n");
        return Ok(());
    }

    let config_path = arg_value(&args, "--config").or_else(|| env::var("PROXIMA_CONFIG").ok()).map(PathBuf::from);
    let mut config = match &config_path {
        Some(p) => ProxyConfig::load(p)?,
        None => ProxyConfig::default(),
    };

    let mut props = env_properties();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--set" && i + 1 < args.len() {
            let (k, v) = args[i + 1].split_once('=').with_context(|| format!("--set expects KEY=VALUE, got '{}'", args[i + 1]))?;
            props.push((k.to_string(), v.to_string()));
            i += 1;
        }
        i += 1;
    }
    if !props.is_empty() {
        let unknown = config.apply_properties(props).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        for key in unknown {
            eprintln!("warning: ignoring unknown property {key}");
        }
    }

    if let Some(bind) = arg_value(&args, "--bind").or_else(|| env::var("PROXIMA_BIND").ok()) {
        config.server.bind = bind;
    }

    tracing::info!(
        bind = %config.server.bind,
        config = ?config_path,
        datasources = config.datasources.len(),
        "proxima starting"
    );
    proxima::server::run(config).await
}
