// Per-source-IP connection and QPS caps with TTL-based state cleanup.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default)]
pub struct IpLimitConfig {
    /// 0 disables the connection cap.
    pub max_conn_per_ip: u32,
    /// 0 disables the QPS cap.
    pub max_qps_per_ip: u32,
    /// Addresses exempt from both caps.
    pub whitelist: HashSet<String>,
    /// Seconds of inactivity after which per-IP state is collected.
    pub state_ttl_sec: u64,
}

#[derive(Debug, Default)]
struct QpsState {
    window_sec: u64,
    count: u32,
    last_access: u64,
}

#[derive(Debug, Default)]
struct IpState {
    cfg: IpLimitConfig,
    conn_count: HashMap<String, u32>,
    qps: HashMap<String, QpsState>,
    last_gc_sec: u64,
}

/// Source-IP admission gate. All state sits behind one mutex; every critical
/// section is O(1) apart from the occasional TTL sweep.
#[derive(Debug)]
pub struct IpLimiter {
    state: Mutex<IpState>,
}

impl IpLimiter {
    pub fn new(cfg: IpLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(IpState {
                cfg,
                ..IpState::default()
            }),
        })
    }

    pub fn update_config(&self, cfg: IpLimitConfig) {
        let mut state = self.state.lock().expect("ip limiter poisoned");
        state.cfg = cfg;
    }

    /// Admission check at accept time. Counts the connection when admitted.
    pub fn allow_conn(&self, ip: &str) -> bool {
        self.allow_conn_at(ip, epoch_sec())
    }

    /// Release one connection slot for `ip`, saturating at zero.
    pub fn on_conn_close(&self, ip: &str) {
        let mut state = self.state.lock().expect("ip limiter poisoned");
        if let Some(count) = state.conn_count.get_mut(ip)
            && *count > 0
        {
            *count -= 1;
        }
    }

    /// Per-frame QPS check over a fixed one-second window.
    pub fn allow_qps(&self, ip: &str) -> bool {
        self.allow_qps_at(ip, epoch_sec())
    }

    pub fn conn_count(&self, ip: &str) -> u32 {
        let state = self.state.lock().expect("ip limiter poisoned");
        state.conn_count.get(ip).copied().unwrap_or(0)
    }

    fn allow_conn_at(&self, ip: &str, now_sec: u64) -> bool {
        let mut state = self.state.lock().expect("ip limiter poisoned");
        if state.cfg.whitelist.contains(ip) {
            return true;
        }
        let max = state.cfg.max_conn_per_ip;
        if max == 0 {
            return true;
        }
        gc_if_needed(&mut state, now_sec);
        let count = state.conn_count.entry(ip.to_string()).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        touch(&mut state, ip, now_sec);
        true
    }

    fn allow_qps_at(&self, ip: &str, now_sec: u64) -> bool {
        let mut state = self.state.lock().expect("ip limiter poisoned");
        if state.cfg.whitelist.contains(ip) {
            return true;
        }
        let max = state.cfg.max_qps_per_ip;
        if max == 0 {
            return true;
        }
        gc_if_needed(&mut state, now_sec);
        let window = state.qps.entry(ip.to_string()).or_default();
        if window.window_sec != now_sec {
            window.window_sec = now_sec;
            window.count = 0;
        }
        if window.count >= max {
            return false;
        }
        window.count += 1;
        window.last_access = now_sec;
        true
    }
}

fn touch(state: &mut IpState, ip: &str, now_sec: u64) {
    state
        .qps
        .entry(ip.to_string())
        .or_default()
        .last_access = now_sec;
}

// Sweep at most once per TTL: drop QPS entries that have gone quiet and
// connection entries that are both quiet and at zero.
fn gc_if_needed(state: &mut IpState, now_sec: u64) {
    let ttl = state.cfg.state_ttl_sec;
    if ttl == 0 {
        return;
    }
    if state.last_gc_sec != 0 && now_sec - state.last_gc_sec < ttl {
        return;
    }
    state.last_gc_sec = now_sec;

    let qps = &state.qps;
    let expired: Vec<String> = state
        .conn_count
        .iter()
        .filter(|(ip, count)| {
            let last = qps.get(*ip).map(|w| w.last_access).unwrap_or(0);
            **count == 0 && last > 0 && now_sec - last > ttl
        })
        .map(|(ip, _)| ip.clone())
        .collect();
    for ip in expired {
        state.conn_count.remove(&ip);
        state.qps.remove(&ip);
    }
    state
        .qps
        .retain(|_, window| now_sec - window.last_access <= ttl);
}

fn epoch_sec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
