// Per-message-type admission: a token bucket for rate, an atomic counter for
// concurrency. The token is debited before the concurrency check and refunded
// if that check fails, which keeps admission FIFO-fair and prevents long-term
// rate drift under sustained concurrency rejection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct MsgLimitConfig {
    pub enabled: bool,
    /// Token bucket rate and capacity; 0 disables the rate check.
    pub max_qps: u32,
    /// Concurrent in-flight cap; 0 disables the concurrency check.
    pub max_concurrent: u32,
}

/// Why `allow` refused a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgRejectReason {
    /// The token bucket is empty.
    Tokens,
    /// The concurrency cap is reached.
    Concurrency,
}

#[derive(Debug)]
struct BucketState {
    cfg: MsgLimitConfig,
    tokens: f64,
    last_refill_ns: u64,
}

#[derive(Debug)]
struct MsgState {
    bucket: Mutex<BucketState>,
    concurrent: AtomicI64,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgLimitStats {
    pub accepted: u64,
    pub dropped: u64,
    pub concurrent: i64,
}

/// Message-type admission gate.
#[derive(Debug, Default)]
pub struct MessageLimiter {
    states: Mutex<HashMap<u16, Arc<MsgState>>>,
}

impl MessageLimiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed or refresh per-type limits. New entries start with a full bucket.
    pub fn update_from_config(&self, limits: &HashMap<u16, MsgLimitConfig>) {
        let now = now_ns();
        let mut states = self.states.lock().expect("message limiter poisoned");
        for (msg_type, cfg) in limits {
            match states.get(msg_type) {
                Some(state) => {
                    let mut bucket = state.bucket.lock().expect("bucket poisoned");
                    bucket.cfg = *cfg;
                }
                None => {
                    states.insert(
                        *msg_type,
                        Arc::new(MsgState {
                            bucket: Mutex::new(BucketState {
                                cfg: *cfg,
                                tokens: f64::from(cfg.max_qps),
                                last_refill_ns: now,
                            }),
                            concurrent: AtomicI64::new(0),
                            accepted: AtomicU64::new(0),
                            dropped: AtomicU64::new(0),
                        }),
                    );
                }
            }
        }
    }

    /// Gate one frame of `msg_type`. Every `Ok(())` must be paired with one
    /// `on_finish(msg_type)` once the handler completes.
    pub fn allow(&self, msg_type: u16) -> Result<(), MsgRejectReason> {
        self.allow_at(msg_type, now_ns())
    }

    pub fn on_finish(&self, msg_type: u16) {
        let state = self.state(msg_type);
        let cfg = state.bucket.lock().expect("bucket poisoned").cfg;
        if cfg.enabled && cfg.max_concurrent > 0 {
            state.concurrent.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self, msg_type: u16) -> MsgLimitStats {
        let state = self.state(msg_type);
        MsgLimitStats {
            accepted: state.accepted.load(Ordering::Relaxed),
            dropped: state.dropped.load(Ordering::Relaxed),
            concurrent: state.concurrent.load(Ordering::Relaxed),
        }
    }

    fn allow_at(&self, msg_type: u16, now_ns: u64) -> Result<(), MsgRejectReason> {
        let state = self.state(msg_type);
        let cfg = {
            let mut bucket = state.bucket.lock().expect("bucket poisoned");
            let cfg = bucket.cfg;
            if !cfg.enabled {
                state.accepted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if cfg.max_qps > 0 {
                let capacity = f64::from(cfg.max_qps.max(1));
                let rate_per_ns = f64::from(cfg.max_qps) / 1e9;
                let elapsed = now_ns.saturating_sub(bucket.last_refill_ns);
                if elapsed > 0 {
                    bucket.tokens = (bucket.tokens + elapsed as f64 * rate_per_ns).min(capacity);
                    bucket.last_refill_ns = now_ns;
                }
                if bucket.tokens < 1.0 {
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(MsgRejectReason::Tokens);
                }
                bucket.tokens -= 1.0;
            }
            cfg
        };

        if cfg.max_concurrent > 0 {
            let prev = state.concurrent.fetch_add(1, Ordering::Relaxed);
            if prev >= i64::from(cfg.max_concurrent) {
                state.concurrent.fetch_sub(1, Ordering::Relaxed);
                state.dropped.fetch_add(1, Ordering::Relaxed);
                // Refund the token debited above so the admitted rate does
                // not drift below max_qps over time.
                if cfg.max_qps > 0 {
                    let mut bucket = state.bucket.lock().expect("bucket poisoned");
                    bucket.tokens += 1.0;
                }
                return Err(MsgRejectReason::Concurrency);
            }
        }
        state.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn state(&self, msg_type: u16) -> Arc<MsgState> {
        let mut states = self.states.lock().expect("message limiter poisoned");
        Arc::clone(states.entry(msg_type).or_insert_with(|| {
            // Unconfigured types default to disabled (always admitted).
            Arc::new(MsgState {
                bucket: Mutex::new(BucketState {
                    cfg: MsgLimitConfig::default(),
                    tokens: 0.0,
                    last_refill_ns: now_ns(),
                }),
                concurrent: AtomicI64::new(0),
                accepted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            })
        }))
    }
}

fn now_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
