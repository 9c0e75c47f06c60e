//!
//! proxima HTTP server
//! -------------------
//! Axum transport for the dispatcher. One JSON call per request:
//!
//! - `POST /v1/call` takes a `dispatch::Request` and answers with a `dispatch::Reply`; the HTTP
//!   status follows the error category so plain HTTP clients can branch without parsing.
//! - `GET /v1/health` reports liveness, session count and per-pool statistics.
//! - `GET /v1/pools/{datasource}` shows one pool in detail (idle connections, segregation slots).

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::FutureExt;
use serde_json::json;
use tracing::{error, info};

use crate::backend::DriverRegistry;
use crate::config::ProxyConfig;
use crate::dispatch::{Dispatcher, Reply, Request};
use crate::error::ProxyError;
use crate::proxy::Proxy;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

pub fn router(proxy: Arc<Proxy>) -> Router {
    let state = AppState { dispatcher: Dispatcher::new(proxy) };
    Router::new()
        .route("/", get(|| async { "proxima ok" }))
        .route("/v1/health", get(health))
        .route("/v1/call", post(call))
        .route("/v1/pools/{datasource}", get(pool))
        .with_state(state)
}

/// Build the proxy from `config`, start its background work and serve until the listener fails.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config.server.bind.parse().with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let proxy = Proxy::new(config, DriverRegistry::with_builtin()).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    proxy.start_background();
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(target: "proxima::server", %addr, "listening");
    let served = axum::serve(listener, router(proxy.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    proxy.shutdown().await;
    served.context("http server")?;
    Ok(())
}

async fn call(State(state): State<AppState>, Json(req): Json<Request>) -> impl IntoResponse {
    let op = req.op_name();
    match AssertUnwindSafe(state.dispatcher.handle(req)).catch_unwind().await {
        Ok((status, reply)) => (StatusCode::from_u16(status).unwrap_or(StatusCode::UNPROCESSABLE_ENTITY), Json(reply)),
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "panic"
            };
            error!(target: "proxima::server", op = op, "call panicked: {}", msg);
            let err = ProxyError::internal("internal server error");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(Reply::failure(&err)))
        }
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let proxy = state.dispatcher.proxy();
    Json(json!({
        "status": "ok",
        "sessions": proxy.sessions().len(),
        "branches": proxy.coordinator().len(),
        "pools": proxy.pool_stats(),
    }))
}

async fn pool(State(state): State<AppState>, Path(datasource): Path<String>) -> impl IntoResponse {
    match state.dispatcher.proxy().pool_report(&datasource) {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!(Reply::failure(&e)))),
    }
}
