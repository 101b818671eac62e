//! Builds the full gateway stack from a `GatewayConfig` and owns its
//! lifecycle: construction order is worker pool, limiters, router (with its
//! middleware chain), codec with the admission callback, then the server.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use relay_gateway::codec::{FrameCallback, FrameCodec, send_frame};
use relay_gateway::limits::{IpLimiter, MessageLimiter};
use relay_gateway::middleware::{
    BackpressureConfig, RateLimitRejectConfig, backpressure_middleware, debug_logging_middleware,
    rate_limit_middleware,
};
use relay_gateway::overload::OverloadController;
use relay_gateway::server::{GatewayServer, GatewayServerConfig};
use relay_gateway::worker::{TaskPriority, WorkerPool, WorkerPoolConfig};
use relay_gateway::{Connection, ConnectionManager, MessageRouter};
use relay_metrics::MetricsRegistry;
use relay_wire::BufferPool;

use crate::config::GatewayConfig;
use crate::observability::{Readiness, serve_control};
use crate::routes::{
    MSG_HEARTBEAT, MSG_REJECT_INFLIGHT, MSG_REJECT_IP_QPS, register_core_routes,
};

// Buffers retained by the global tier of the buffer pool.
const POOL_MAX_CACHED: usize = 1024;
const POOL_DEFAULT_CAPACITY: usize = 4096;
// Drain poll step while waiting for in-flight work during shutdown.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A started gateway: data plane, control plane, and the pieces tests poke at.
pub struct RunningGateway {
    pub addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub metrics: Arc<MetricsRegistry>,
    pub readiness: Arc<Readiness>,
    server: Arc<GatewayServer>,
    worker_pool: Arc<WorkerPool>,
    overload: Arc<OverloadController>,
    shutdown_grace: Duration,
    serve_task: tokio::task::JoinHandle<()>,
    control_task: tokio::task::JoinHandle<()>,
}

/// Build and start a gateway from config. Binds both listeners (port 0 works
/// for tests) and spawns the accept loop.
pub async fn start(cfg: GatewayConfig) -> Result<RunningGateway> {
    let metrics = MetricsRegistry::new();
    let pool = BufferPool::new(POOL_MAX_CACHED, POOL_DEFAULT_CAPACITY);
    pool.warmup(64, POOL_DEFAULT_CAPACITY);
    let readiness = Readiness::new();

    let worker_pool = WorkerPool::new(
        WorkerPoolConfig {
            workers: cfg.thread_pool.workers,
            min_threads: cfg.thread_pool.min_threads,
            max_threads: cfg.thread_pool.max_threads,
            max_queue_size: cfg.thread_pool.max_queue_size,
            auto_tune: cfg.thread_pool.auto_tune,
            high_watermark: cfg.thread_pool.high_watermark,
            low_watermark: cfg.thread_pool.low_watermark,
            up_threshold: cfg.thread_pool.up_threshold,
            down_threshold: cfg.thread_pool.down_threshold,
        },
        Arc::clone(&metrics),
    );
    let overload = OverloadController::new(cfg.max_inflight, Arc::clone(&metrics));
    let ip_limiter = IpLimiter::new(cfg.ip_limit.clone());
    let msg_limiter = MessageLimiter::new();
    msg_limiter.update_from_config(&cfg.message_limits);

    let router = build_router(&cfg, &metrics, &msg_limiter);
    let frame_cb = build_frame_callback(
        &cfg,
        Arc::clone(&router),
        Arc::clone(&worker_pool),
        Arc::clone(&overload),
        Arc::clone(&ip_limiter),
        Arc::clone(&metrics),
    );
    let codec = FrameCodec::new(frame_cb, cfg.max_frame_bytes, Arc::clone(&metrics));

    let server = GatewayServer::bind(
        GatewayServerConfig {
            bind: cfg.bind,
            idle_timeout_ms: cfg.idle_timeout_ms,
            max_send_buffer_bytes: cfg.max_send_buffer_bytes,
        },
        codec,
        ConnectionManager::new(),
        ip_limiter,
        Arc::clone(&metrics),
        pool,
    )
    .await?;

    let (control_addr, control_task) = serve_control(
        cfg.control_bind,
        Arc::clone(&metrics),
        Arc::clone(&readiness),
    )
    .await?;

    let addr = server.local_addr();
    let serve_server = Arc::clone(&server);
    let serve_task = tokio::spawn(async move {
        if let Err(err) = serve_server.serve().await {
            tracing::error!(error = %err, "gateway accept loop exited");
        }
    });
    tracing::info!(%addr, control = %control_addr, "gateway started");

    Ok(RunningGateway {
        addr,
        control_addr,
        metrics,
        readiness,
        server,
        worker_pool,
        overload,
        shutdown_grace: Duration::from_millis(cfg.shutdown_grace_ms),
        serve_task,
        control_task,
    })
}

impl RunningGateway {
    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    pub fn inflight(&self) -> i64 {
        self.overload.inflight()
    }

    /// Graceful stop: refuse new connections, give in-flight work the grace
    /// window (ending early once it drains), then close everything.
    pub async fn shutdown(self) {
        tracing::info!("starting graceful shutdown");
        self.readiness.set(false);
        self.server.stop_accept();

        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            if self.overload.inflight() == 0 {
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(
                        inflight = self.overload.inflight(),
                        "grace window elapsed with work in flight"
                    );
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }

        self.server.close_all();
        self.worker_pool.shutdown().await;
        let _ = self.serve_task.await;
        self.control_task.abort();
        tracing::info!("gateway stopped");
    }
}

fn build_router(
    cfg: &GatewayConfig,
    metrics: &Arc<MetricsRegistry>,
    msg_limiter: &Arc<MessageLimiter>,
) -> Arc<MessageRouter> {
    let router = MessageRouter::new(Arc::clone(metrics));

    router.use_middleware(rate_limit_middleware(
        Arc::clone(msg_limiter),
        Arc::clone(metrics),
        RateLimitRejectConfig {
            send_error_frame: cfg.backpressure.send_error_frame,
            ..RateLimitRejectConfig::default()
        },
    ));
    if let Some(shedding) = backpressure_middleware(
        BackpressureConfig {
            reject_low_priority: cfg.backpressure.reject_low_priority,
            low_priority_msg_types: cfg.backpressure.low_priority_msg_types.clone(),
            always_allow_msg_types: always_allow_with_heartbeat(cfg),
            send_error_frame: cfg.backpressure.send_error_frame,
            error_msg_type: cfg.backpressure.error_msg_type,
            error_body: cfg.backpressure.error_body.clone(),
        },
        Arc::clone(metrics),
    ) {
        router.use_middleware(shedding);
    }
    if matches!(cfg.log.level.as_str(), "debug" | "trace") {
        router.use_middleware(debug_logging_middleware());
    }

    register_core_routes(&router);
    router
}

// Heartbeats always survive shedding, whatever the config says.
fn always_allow_with_heartbeat(cfg: &GatewayConfig) -> std::collections::HashSet<u16> {
    let mut allow = cfg.backpressure.always_allow_msg_types.clone();
    allow.insert(MSG_HEARTBEAT);
    allow
}

// The dispatch gate between the codec and the worker pool: per-IP QPS, the
// global in-flight cap, then priority-classed submission. Runs on the
// connection's read path, so everything here is cheap and non-blocking.
fn build_frame_callback(
    cfg: &GatewayConfig,
    router: Arc<MessageRouter>,
    worker_pool: Arc<WorkerPool>,
    overload: Arc<OverloadController>,
    ip_limiter: Arc<IpLimiter>,
    metrics: Arc<MetricsRegistry>,
) -> FrameCallback {
    let low_priority = cfg.backpressure.low_priority_msg_types.clone();
    let always_allow = always_allow_with_heartbeat(cfg);
    let send_error_frame = cfg.backpressure.send_error_frame;
    let queue_full_msg_type = cfg.backpressure.error_msg_type;
    Arc::new(move |conn: &Arc<Connection>, msg_type: u16, body: Bytes| {
        if !ip_limiter.allow_qps(conn.remote_ip()) {
            metrics.inc_ip_reject_qps();
            send_frame(conn, MSG_REJECT_IP_QPS, b"ip qps limit");
            return;
        }

        let Some(inflight) = overload.try_acquire() else {
            metrics.inflight_rejects.inc();
            metrics.total_errors.inc();
            metrics.inflight_reject_exemplar.set(
                &conn.trace_id(),
                conn.session_id(),
                metrics.inflight_rejects.value(),
            );
            send_frame(conn, MSG_REJECT_INFLIGHT, b"inflight limit");
            return;
        };

        let priority = if always_allow.contains(&msg_type) {
            TaskPriority::High
        } else if low_priority.contains(&msg_type) {
            TaskPriority::Low
        } else {
            TaskPriority::Normal
        };

        // The job holds a weak handle; a connection closed while queued just
        // skips dispatch. The in-flight slot travels with the job and is
        // released on drop even if the pool sheds it.
        let router = Arc::clone(&router);
        let weak = Arc::downgrade(conn);
        let job = async move {
            let _inflight = inflight;
            if let Some(conn) = weak.upgrade() {
                router.on_message(conn, msg_type, body).await;
            }
        };
        if worker_pool.submit(priority, job).is_err() {
            // The refused job was dropped inside submit, releasing its slot.
            metrics.dropped_frames.inc();
            metrics.total_errors.inc();
            if send_error_frame {
                send_frame(conn, queue_full_msg_type, b"server busy");
            }
            tracing::warn!(msg_type, "worker queue full, dropping frame");
        }
    })
}

/// Run the gateway until SIGINT/SIGTERM, then drain and stop.
pub async fn run(cfg: GatewayConfig) -> Result<()> {
    let gateway = start(cfg).await?;
    wait_for_signal().await?;
    gateway.shutdown().await;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("wait for SIGINT")?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for SIGINT")
    }
}
