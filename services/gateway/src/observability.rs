use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::http::{StatusCode, header};
use axum::routing::get;
use relay_metrics::MetricsRegistry;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogConfig;

// Initialise tracing from the log section. Safe to call once per process;
// repeated calls (as in tests) are ignored.
pub fn init_logging(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));
    let console_layer = cfg
        .console_enable
        .then(|| tracing_subscriber::fmt::layer());
    let file_layer = if cfg.file_enable {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(format!("{}.log", cfg.file_base_name))
        {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            ),
            Err(err) => {
                eprintln!("failed to open log file {}: {err}", cfg.file_base_name);
                None
            }
        }
    } else {
        None
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Shared readiness flag: flips to false once shutdown starts.
#[derive(Debug)]
pub struct Readiness(AtomicBool);

impl Readiness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Bind the control endpoint and return its local address plus the serving
/// future's join handle. Routes: `GET /metrics`, `GET /healthz`, `GET /ready`.
pub async fn serve_control(
    addr: SocketAddr,
    metrics: Arc<MetricsRegistry>,
    readiness: Arc<Readiness>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let render_metrics = Arc::clone(&metrics);
    let app = axum::Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&render_metrics);
                async move {
                    (
                        [(
                            header::CONTENT_TYPE,
                            "text/plain; version=0.0.4; charset=utf-8",
                        )],
                        metrics.render_prometheus(),
                    )
                }
            }),
        )
        .route("/healthz", get(|| async { "ok\n" }))
        .route(
            "/ready",
            get(move || {
                let readiness = Arc::clone(&readiness);
                async move {
                    if readiness.is_ready() {
                        (StatusCode::OK, "ready\n")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
                    }
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control endpoint {addr}"))?;
    let local_addr = listener.local_addr().context("read control local address")?;
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::warn!(error = %err, "control endpoint exited");
        }
    });
    Ok((local_addr, handle))
}
