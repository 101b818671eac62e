// Built-in middlewares: per-msg-type rate limiting, backpressure-aware
// shedding of low-priority traffic, and debug frame logging.
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relay_metrics::MetricsRegistry;

use crate::codec::send_frame;
use crate::limits::{MessageLimiter, MsgRejectReason};
use crate::router::{Middleware, Next};

// Connections in backpressure before low-priority shedding kicks in globally.
const GLOBAL_BACKPRESSURE_THRESHOLD: i64 = 100;
// Log sampling: one warn per this many rate-limit drops.
const RATE_LIMIT_LOG_SAMPLE: u64 = 10_000;
// Log sampling: one warn per this many backpressure drops.
const BACKPRESSURE_LOG_SAMPLE: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct RateLimitRejectConfig {
    pub send_error_frame: bool,
    pub error_msg_type: u16,
    pub error_body: String,
}

impl Default for RateLimitRejectConfig {
    fn default() -> Self {
        Self {
            send_error_frame: true,
            error_msg_type: 65003,
            error_body: "msg rate limit".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub reject_low_priority: bool,
    pub low_priority_msg_types: HashSet<u16>,
    pub always_allow_msg_types: HashSet<u16>,
    pub send_error_frame: bool,
    pub error_msg_type: u16,
    pub error_body: String,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            reject_low_priority: false,
            low_priority_msg_types: HashSet::new(),
            always_allow_msg_types: HashSet::new(),
            send_error_frame: true,
            error_msg_type: 0xFFFF,
            error_body: "backpressure".to_string(),
        }
    }
}

// Releases the limiter's concurrency slot once the handler completes, on
// every exit path out of the chain.
struct FinishGuard {
    limiter: Arc<MessageLimiter>,
    msg_type: u16,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.limiter.on_finish(self.msg_type);
    }
}

/// Gate each frame through the per-msg-type limiter. Rejections emit the
/// configured error frame and update the reject exemplars.
pub fn rate_limit_middleware(
    limiter: Arc<MessageLimiter>,
    metrics: Arc<MetricsRegistry>,
    reject: RateLimitRejectConfig,
) -> Middleware {
    let drop_count = Arc::new(AtomicU64::new(0));
    Arc::new(move |ctx, next: Next| {
        let limiter = Arc::clone(&limiter);
        let metrics = Arc::clone(&metrics);
        let reject = reject.clone();
        let drop_count = Arc::clone(&drop_count);
        Box::pin(async move {
            let msg_type = ctx.msg_type;
            match limiter.allow(msg_type) {
                Ok(()) => {
                    let _finish = FinishGuard {
                        limiter,
                        msg_type,
                    };
                    next(ctx).await;
                }
                Err(reason) => {
                    let session_id = ctx.conn.session_id().to_string();
                    metrics.total_errors.inc();
                    metrics.inc_msg_reject(msg_type);
                    metrics.set_msg_reject_exemplar(msg_type, &ctx.trace_id, &session_id);
                    match reason {
                        MsgRejectReason::Tokens => {
                            metrics.token_rejects.inc();
                            metrics.token_reject_exemplar.set(
                                &ctx.trace_id,
                                &session_id,
                                metrics.token_rejects.value(),
                            );
                        }
                        MsgRejectReason::Concurrency => {
                            metrics.concurrent_rejects.inc();
                            metrics.concurrent_reject_exemplar.set(
                                &ctx.trace_id,
                                &session_id,
                                metrics.concurrent_rejects.value(),
                            );
                        }
                    }
                    if reject.send_error_frame {
                        send_frame(&ctx.conn, reject.error_msg_type, reject.error_body.as_bytes());
                    }
                    let dropped = drop_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % RATE_LIMIT_LOG_SAMPLE == 0 {
                        tracing::warn!(
                            msg_type,
                            trace_id = %ctx.trace_id,
                            session_id = %session_id,
                            ?reason,
                            "rate limited (sampled)"
                        );
                    }
                }
            }
        })
    })
}

/// Shed low-priority frames while the connection is self-congested or the
/// global backpressure count is high. Returns `None` when shedding is off.
pub fn backpressure_middleware(
    cfg: BackpressureConfig,
    metrics: Arc<MetricsRegistry>,
) -> Option<Middleware> {
    if !cfg.reject_low_priority || cfg.low_priority_msg_types.is_empty() {
        return None;
    }
    let cfg = Arc::new(cfg);
    let drop_count = Arc::new(AtomicU64::new(0));
    Some(Arc::new(move |ctx, next: Next| {
        let cfg = Arc::clone(&cfg);
        let metrics = Arc::clone(&metrics);
        let drop_count = Arc::clone(&drop_count);
        Box::pin(async move {
            let self_congested = ctx.conn.is_read_paused();
            let global_panic = !self_congested
                && metrics.backpressure_active() > GLOBAL_BACKPRESSURE_THRESHOLD;
            if (self_congested || global_panic)
                && !cfg.always_allow_msg_types.contains(&ctx.msg_type)
                && cfg.low_priority_msg_types.contains(&ctx.msg_type)
            {
                metrics.backpressure_dropped_low_pri.inc();
                metrics.dropped_frames.inc();
                metrics.inc_msg_reject(ctx.msg_type);
                if cfg.send_error_frame {
                    send_frame(&ctx.conn, cfg.error_msg_type, cfg.error_body.as_bytes());
                }
                let dropped = drop_count.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % BACKPRESSURE_LOG_SAMPLE == 0 {
                    tracing::warn!(
                        msg_type = ctx.msg_type,
                        self_congested,
                        global_panic,
                        "dropping low-priority frame (sampled)"
                    );
                }
                return;
            }
            next(ctx).await;
        })
    }))
}

/// Trace every dispatched frame at debug level.
pub fn debug_logging_middleware() -> Middleware {
    Arc::new(|ctx, next: Next| {
        Box::pin(async move {
            tracing::debug!(
                msg_type = ctx.msg_type,
                body_size = ctx.body.len(),
                trace_id = %ctx.trace_id,
                "frame dispatched"
            );
            next(ctx).await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::limits::MsgLimitConfig;
    use crate::router::MessageRouter;
    use anyhow::Result;
    use bytes::Bytes;
    use relay_wire::BufferPool;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_conn(metrics: &Arc<MetricsRegistry>) -> Result<Arc<Connection>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let _client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        Ok(Connection::new(
            server,
            1 << 20,
            Arc::clone(metrics),
            BufferPool::new(4, 4096),
        ))
    }

    fn counting_router(
        metrics: &Arc<MetricsRegistry>,
        msg_type: u16,
    ) -> (Arc<MessageRouter>, Arc<Mutex<u32>>) {
        let router = MessageRouter::new(Arc::clone(metrics));
        let handled = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&handled);
        router.register(msg_type, move |_conn, _body: Bytes| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });
        (router, handled)
    }

    #[tokio::test]
    async fn rate_limit_rejects_when_tokens_exhausted() -> Result<()> {
        let metrics = MetricsRegistry::new();
        let limiter = MessageLimiter::new();
        limiter.update_from_config(&HashMap::from([(
            2u16,
            MsgLimitConfig {
                enabled: true,
                max_qps: 3,
                max_concurrent: 0,
            },
        )]));
        let (router, handled) = counting_router(&metrics, 2);
        router.use_middleware(rate_limit_middleware(
            limiter,
            Arc::clone(&metrics),
            RateLimitRejectConfig::default(),
        ));

        let conn = test_conn(&metrics).await?;
        for _ in 0..10 {
            router.on_message(Arc::clone(&conn), 2, Bytes::new()).await;
        }
        assert_eq!(*handled.lock().unwrap(), 3);
        assert_eq!(metrics.token_rejects.value(), 7);
        assert_eq!(metrics.msg_reject_count(2), 7);
        assert!(metrics.token_reject_exemplar.get().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_releases_concurrency_after_handler() -> Result<()> {
        let metrics = MetricsRegistry::new();
        let limiter = MessageLimiter::new();
        limiter.update_from_config(&HashMap::from([(
            5u16,
            MsgLimitConfig {
                enabled: true,
                max_qps: 0,
                max_concurrent: 1,
            },
        )]));
        let (router, handled) = counting_router(&metrics, 5);
        router.use_middleware(rate_limit_middleware(
            Arc::clone(&limiter),
            Arc::clone(&metrics),
            RateLimitRejectConfig::default(),
        ));

        let conn = test_conn(&metrics).await?;
        // Sequential dispatches: the slot frees between frames, so all pass.
        for _ in 0..5 {
            router.on_message(Arc::clone(&conn), 5, Bytes::new()).await;
        }
        assert_eq!(*handled.lock().unwrap(), 5);
        assert_eq!(limiter.stats(5).concurrent, 0);
        Ok(())
    }

    #[tokio::test]
    async fn shedding_drops_low_priority_on_paused_connection() -> Result<()> {
        let metrics = MetricsRegistry::new();
        let (router, handled) = counting_router(&metrics, 20);
        let middleware = backpressure_middleware(
            BackpressureConfig {
                reject_low_priority: true,
                low_priority_msg_types: HashSet::from([20u16]),
                always_allow_msg_types: HashSet::from([1u16]),
                send_error_frame: false,
                ..BackpressureConfig::default()
            },
            Arc::clone(&metrics),
        )
        .expect("enabled");
        router.use_middleware(middleware);

        // A tiny send buffer forces the connection into backpressure.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let _client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        let conn = Connection::new(
            server,
            100,
            Arc::clone(&metrics),
            BufferPool::new(4, 4096),
        );
        conn.send(Bytes::from(vec![0u8; 90]));
        assert!(conn.is_read_paused());

        router.on_message(Arc::clone(&conn), 20, Bytes::new()).await;
        assert_eq!(*handled.lock().unwrap(), 0);
        assert_eq!(metrics.backpressure_dropped_low_pri.value(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn shedding_spares_always_allow_and_normal_types() -> Result<()> {
        let metrics = MetricsRegistry::new();
        let router = MessageRouter::new(Arc::clone(&metrics));
        let handled = Arc::new(Mutex::new(Vec::new()));
        for msg_type in [1u16, 20, 30] {
            let log = Arc::clone(&handled);
            router.register(msg_type, move |_conn, _body: Bytes| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(msg_type);
                    Ok(())
                }
            });
        }
        let middleware = backpressure_middleware(
            BackpressureConfig {
                reject_low_priority: true,
                low_priority_msg_types: HashSet::from([1u16, 20]),
                always_allow_msg_types: HashSet::from([1u16]),
                send_error_frame: false,
                ..BackpressureConfig::default()
            },
            Arc::clone(&metrics),
        )
        .expect("enabled");
        router.use_middleware(middleware);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let _client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        let conn = Connection::new(
            server,
            100,
            Arc::clone(&metrics),
            BufferPool::new(4, 4096),
        );
        conn.send(Bytes::from(vec![0u8; 90]));
        assert!(conn.is_read_paused());

        // Heartbeat (always-allow) and a normal type pass; low-pri drops.
        router.on_message(Arc::clone(&conn), 1, Bytes::new()).await;
        router.on_message(Arc::clone(&conn), 20, Bytes::new()).await;
        router.on_message(Arc::clone(&conn), 30, Bytes::new()).await;
        assert_eq!(*handled.lock().unwrap(), vec![1, 30]);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_shedding_returns_none() {
        let metrics = MetricsRegistry::new();
        assert!(backpressure_middleware(BackpressureConfig::default(), metrics).is_none());
    }
}
