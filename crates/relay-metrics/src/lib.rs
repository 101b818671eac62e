// Process-wide serving metrics: atomic counters and gauges, a fixed-bucket
// latency histogram, and Prometheus text exposition with trace exemplars.
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Monotonically increasing additive value.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time value that can move both ways.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    /// Raise the gauge to `v` if it is below it (peak tracking).
    pub fn set_max(&self, v: i64) {
        self.0.fetch_max(v, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

// Upper bounds of the observation buckets, in milliseconds.
const BUCKET_BOUNDS_MS: [f64; 4] = [1.0, 5.0, 10.0, 50.0];
// Bounds advertised in the Prometheus exposition.
const EXPOSITION_BOUNDS: [&str; 5] = ["1", "5", "20", "100", "+Inf"];

/// Latency distribution over five fixed millisecond buckets.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    count: AtomicU64,
    sum_ms_bits: AtomicU64,
    buckets: [AtomicU64; 5],
}

#[derive(Debug, Clone, Copy)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub buckets: [u64; 5],
}

impl LatencyHistogram {
    pub fn observe(&self, ms: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // CAS loop over the f64 bit pattern; there is no atomic float add.
        let mut current = self.sum_ms_bits.load(Ordering::Relaxed);
        loop {
            let updated = (f64::from_bits(current) + ms).to_bits();
            match self.sum_ms_bits.compare_exchange_weak(
                current,
                updated,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.buckets[Self::bucket_index(ms)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_ms: f64::from_bits(self.sum_ms_bits.load(Ordering::Relaxed)),
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }

    fn bucket_index(ms: f64) -> usize {
        BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms < *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len())
    }

    fn render_prometheus(&self, name: &str, out: &mut String) {
        let snap = self.snapshot();
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0u64;
        for (bucket, bound) in snap.buckets.iter().zip(EXPOSITION_BOUNDS) {
            cumulative += bucket;
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        let _ = writeln!(out, "{name}_sum {:.6}", snap.sum_ms);
        let _ = writeln!(out, "{name}_count {}", snap.count);
    }
}

/// Trace attachment for a metric sample; last writer wins.
#[derive(Debug, Clone)]
pub struct Exemplar {
    pub trace_id: String,
    pub session_id: String,
    pub value: u64,
}

#[derive(Debug, Default)]
pub struct ExemplarSlot(Mutex<Option<Exemplar>>);

impl ExemplarSlot {
    pub fn set(&self, trace_id: &str, session_id: &str, value: u64) {
        let mut slot = self.0.lock().expect("exemplar slot poisoned");
        *slot = Some(Exemplar {
            trace_id: trace_id.to_string(),
            session_id: session_id.to_string(),
            value,
        });
    }

    pub fn get(&self) -> Option<Exemplar> {
        self.0.lock().expect("exemplar slot poisoned").clone()
    }

    fn render_suffix(&self) -> String {
        match self.get() {
            Some(ex) => format!(
                " # {{trace_id=\"{}\",session_id=\"{}\"}} {}",
                ex.trace_id, ex.session_id, ex.value
            ),
            None => String::new(),
        }
    }
}

/// All serving metrics for one gateway process.
///
/// Components receive the registry as an `Arc` so tests can observe counters
/// in isolation; `global()` exists for contexts where threading one through
/// is not practical.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub connections: Gauge,
    pub total_frames: Counter,
    pub total_errors: Counter,
    pub bytes_in: Counter,
    pub bytes_out: Counter,
    pub dropped_frames: Counter,
    pub inflight_frames: Gauge,
    pub backpressure_triggered: Counter,
    backpressure_active: AtomicI64,
    pub backpressure_dropped_low_pri: Counter,
    pub backpressure_duration_ms: Counter,
    backpressure_start_ms: AtomicU64,
    pub inflight_rejects: Counter,
    pub token_rejects: Counter,
    pub concurrent_rejects: Counter,
    pub ip_reject_conn: Counter,
    pub ip_reject_qps: Counter,
    pub send_queue_max_bytes: Gauge,
    pub worker_queue_size: Gauge,
    pub worker_live_threads: Gauge,
    pub frame_latency: LatencyHistogram,
    pub token_reject_exemplar: ExemplarSlot,
    pub concurrent_reject_exemplar: ExemplarSlot,
    pub inflight_reject_exemplar: ExemplarSlot,
    msg_rejects: Mutex<HashMap<u16, u64>>,
    msg_reject_exemplar: Mutex<Option<(u16, Exemplar)>>,
}

fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Shared process-wide registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(MetricsRegistry::new))
    }

    pub fn inc_ip_reject_conn(&self) {
        self.ip_reject_conn.inc();
        self.total_errors.inc();
    }

    pub fn inc_ip_reject_qps(&self) {
        self.ip_reject_qps.inc();
        self.total_errors.inc();
    }

    pub fn inc_msg_reject(&self, msg_type: u16) {
        let mut rejects = self.msg_rejects.lock().expect("msg rejects poisoned");
        *rejects.entry(msg_type).or_insert(0) += 1;
    }

    pub fn msg_reject_count(&self, msg_type: u16) -> u64 {
        let rejects = self.msg_rejects.lock().expect("msg rejects poisoned");
        rejects.get(&msg_type).copied().unwrap_or(0)
    }

    pub fn set_msg_reject_exemplar(&self, msg_type: u16, trace_id: &str, session_id: &str) {
        let value = self.msg_reject_count(msg_type);
        let mut slot = self
            .msg_reject_exemplar
            .lock()
            .expect("msg reject exemplar poisoned");
        *slot = Some((
            msg_type,
            Exemplar {
                trace_id: trace_id.to_string(),
                session_id: session_id.to_string(),
                value,
            },
        ));
    }

    /// A connection entered backpressure (read paused).
    pub fn on_backpressure_enter(&self) {
        self.backpressure_triggered.inc();
        let prev = self.backpressure_active.fetch_add(1, Ordering::Relaxed);
        if prev == 0 {
            self.backpressure_start_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    /// A connection left backpressure. Saturates at zero: an unmatched exit
    /// must not drive the active count negative.
    pub fn on_backpressure_exit(&self) {
        let mut current = self.backpressure_active.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return;
            }
            match self.backpressure_active.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if current == 1 {
            let start = self.backpressure_start_ms.swap(0, Ordering::Relaxed);
            if start > 0 {
                self.backpressure_duration_ms.add(now_ms().saturating_sub(start));
            }
        }
    }

    pub fn backpressure_active(&self) -> i64 {
        self.backpressure_active.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of every metric in the registry.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        render_gauge(&mut out, "server_connections", &self.connections);
        render_counter(&mut out, "server_total_frames", &self.total_frames, None);
        render_counter(&mut out, "server_total_errors", &self.total_errors, None);
        render_counter(&mut out, "server_bytes_in", &self.bytes_in, None);
        render_counter(&mut out, "server_bytes_out", &self.bytes_out, None);
        render_counter(&mut out, "server_dropped_frames", &self.dropped_frames, None);
        render_counter(
            &mut out,
            "server_backpressure_triggered_total",
            &self.backpressure_triggered,
            None,
        );
        let _ = writeln!(out, "# TYPE server_backpressure_active gauge");
        let _ = writeln!(
            out,
            "server_backpressure_active {}\n",
            self.backpressure_active()
        );
        render_counter(
            &mut out,
            "server_backpressure_drop_lowpri",
            &self.backpressure_dropped_low_pri,
            None,
        );
        render_counter(
            &mut out,
            "server_backpressure_duration_ms",
            &self.backpressure_duration_ms,
            None,
        );
        render_counter(
            &mut out,
            "server_inflight_rejects_total",
            &self.inflight_rejects,
            Some(&self.inflight_reject_exemplar),
        );
        render_counter(
            &mut out,
            "server_token_rejects_total",
            &self.token_rejects,
            Some(&self.token_reject_exemplar),
        );
        render_counter(
            &mut out,
            "server_concurrent_rejects_total",
            &self.concurrent_rejects,
            Some(&self.concurrent_reject_exemplar),
        );
        render_counter(&mut out, "server_ip_reject_conn_total", &self.ip_reject_conn, None);
        render_counter(&mut out, "server_ip_reject_qps_total", &self.ip_reject_qps, None);
        render_gauge(&mut out, "server_send_queue_max_bytes", &self.send_queue_max_bytes);
        render_gauge(&mut out, "server_worker_queue_size", &self.worker_queue_size);
        render_gauge(&mut out, "server_worker_live_threads", &self.worker_live_threads);
        render_gauge(&mut out, "server_inflight_frames", &self.inflight_frames);

        {
            let rejects = self.msg_rejects.lock().expect("msg rejects poisoned");
            if !rejects.is_empty() {
                let exemplar = self
                    .msg_reject_exemplar
                    .lock()
                    .expect("msg reject exemplar poisoned")
                    .clone();
                let _ = writeln!(out, "# TYPE server_msg_reject_total counter");
                let mut types: Vec<_> = rejects.iter().collect();
                types.sort();
                for (msg_type, count) in types {
                    let suffix = match &exemplar {
                        Some((ex_type, ex)) if ex_type == msg_type => format!(
                            " # {{trace_id=\"{}\",session_id=\"{}\"}} {}",
                            ex.trace_id, ex.session_id, ex.value
                        ),
                        _ => String::new(),
                    };
                    let _ = writeln!(
                        out,
                        "server_msg_reject_total{{msgType=\"{msg_type}\"}} {count}{suffix}"
                    );
                }
                out.push('\n');
            }
        }

        self.frame_latency
            .render_prometheus("server_frame_latency_ms", &mut out);
        out.push('\n');
        out
    }

    /// One-line operational summary for the periodic report timer.
    pub fn log_snapshot(&self) {
        tracing::info!(
            connections = self.connections.value(),
            total_frames = self.total_frames.value(),
            total_errors = self.total_errors.value(),
            bytes_in = self.bytes_in.value(),
            bytes_out = self.bytes_out.value(),
            dropped_frames = self.dropped_frames.value(),
            inflight = self.inflight_frames.value(),
            backpressure_active = self.backpressure_active(),
            worker_queue = self.worker_queue_size.value(),
            worker_threads = self.worker_live_threads.value(),
            "metrics snapshot"
        );
    }
}

fn render_counter(out: &mut String, name: &str, counter: &Counter, exemplar: Option<&ExemplarSlot>) {
    let suffix = exemplar.map(ExemplarSlot::render_suffix).unwrap_or_default();
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {}{suffix}\n", counter.value());
}

fn render_gauge(out: &mut String, name: &str, gauge: &Gauge) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {}\n", gauge.value());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_split_on_bounds() {
        let histogram = LatencyHistogram::default();
        for ms in [0.2, 0.9, 1.0, 4.9, 7.0, 12.0, 49.9, 50.0, 400.0] {
            histogram.observe(ms);
        }
        let snap = histogram.snapshot();
        assert_eq!(snap.count, 9);
        assert_eq!(snap.buckets, [2, 2, 1, 2, 2]);
        assert!((snap.sum_ms - 525.9).abs() < 1e-9);
    }

    #[test]
    fn backpressure_exit_saturates_at_zero() {
        let metrics = MetricsRegistry::new();
        metrics.on_backpressure_exit();
        assert_eq!(metrics.backpressure_active(), 0);

        metrics.on_backpressure_enter();
        metrics.on_backpressure_enter();
        assert_eq!(metrics.backpressure_active(), 2);
        metrics.on_backpressure_exit();
        metrics.on_backpressure_exit();
        metrics.on_backpressure_exit();
        assert_eq!(metrics.backpressure_active(), 0);
        assert_eq!(metrics.backpressure_triggered.value(), 2);
    }

    #[test]
    fn render_includes_counters_and_histogram() {
        let metrics = MetricsRegistry::new();
        metrics.total_frames.add(5);
        metrics.frame_latency.observe(3.0);
        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE server_total_frames counter"));
        assert!(text.contains("server_total_frames 5"));
        assert!(text.contains("server_frame_latency_ms_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("server_frame_latency_ms_count 1"));
    }

    #[test]
    fn exemplar_renders_after_sample() {
        let metrics = MetricsRegistry::new();
        metrics.token_rejects.add(3);
        metrics.token_reject_exemplar.set("trace-1", "sess-1", 3);
        let text = metrics.render_prometheus();
        assert!(
            text.contains("server_token_rejects_total 3 # {trace_id=\"trace-1\",session_id=\"sess-1\"} 3")
        );
    }

    #[test]
    fn msg_reject_exemplar_attaches_to_matching_type() {
        let metrics = MetricsRegistry::new();
        metrics.inc_msg_reject(2);
        metrics.inc_msg_reject(2);
        metrics.inc_msg_reject(9);
        metrics.set_msg_reject_exemplar(2, "t", "s");
        let text = metrics.render_prometheus();
        assert!(text.contains("server_msg_reject_total{msgType=\"2\"} 2 # {trace_id=\"t\",session_id=\"s\"} 2"));
        assert!(text.contains("server_msg_reject_total{msgType=\"9\"} 1\n"));
    }
}
