//! Bounded multi-priority task pool for handler work.
//!
//! Workers are plain tasks on the runtime; the pool adds what the runtime
//! does not give us: a bounded queue with priority classes, an eviction
//! policy under overflow, and optional one-at-a-time autoscaling between a
//! minimum and maximum worker count.
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_metrics::MetricsRegistry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

// Autoscaler sampling period.
const ADJUST_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    /// 0 disables the queue bound.
    pub max_queue_size: usize,
    pub auto_tune: bool,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub up_threshold: u32,
    pub down_threshold: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            min_threads: 2,
            max_threads: 8,
            max_queue_size: 10_000,
            auto_tune: false,
            high_watermark: 2_000,
            low_watermark: 0,
            up_threshold: 3,
            down_threshold: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("worker queue full")]
pub struct QueueFull;

#[derive(Default)]
struct Queues {
    high: VecDeque<Task>,
    normal: VecDeque<Task>,
    low: VecDeque<Task>,
    total: usize,
    target: usize,
    threads_to_stop: usize,
}

struct PoolInner {
    queues: Mutex<Queues>,
    notify: Notify,
    stopping: AtomicBool,
    live: AtomicUsize,
    cfg: WorkerPoolConfig,
    metrics: Arc<MetricsRegistry>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded multi-priority executor for dispatch jobs.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(mut cfg: WorkerPoolConfig, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        if cfg.min_threads == 0 {
            cfg.min_threads = 1;
        }
        if cfg.max_threads < cfg.min_threads {
            cfg.max_threads = cfg.min_threads;
        }
        cfg.workers = cfg.workers.clamp(cfg.min_threads, cfg.max_threads);

        let inner = Arc::new(PoolInner {
            queues: Mutex::new(Queues {
                target: cfg.workers,
                ..Queues::default()
            }),
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            cfg: cfg.clone(),
            metrics,
            handles: Mutex::new(Vec::new()),
        });
        let pool = Arc::new(Self {
            inner: Arc::clone(&inner),
        });
        for _ in 0..cfg.workers {
            spawn_worker(&inner);
        }
        if cfg.auto_tune {
            let handle = tokio::spawn(adjust_loop(Arc::clone(&inner)));
            inner.handles.lock().expect("pool handles poisoned").push(handle);
        }
        pool
    }

    /// Queue a task. Under overflow the policy runs: Low is refused outright,
    /// Normal may evict one queued Low task, High may evict one Low then one
    /// Normal. Evicted tasks are dropped (their guards release on drop).
    pub fn submit<F>(&self, priority: TaskPriority, task: F) -> Result<(), QueueFull>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(QueueFull);
        }
        let mut queues = inner.queues.lock().expect("pool queues poisoned");
        if inner.cfg.max_queue_size > 0
            && queues.total >= inner.cfg.max_queue_size
            && !make_room(&mut queues, priority, &inner.metrics)
        {
            return Err(QueueFull);
        }
        let task: Task = Box::pin(task);
        match priority {
            TaskPriority::High => queues.high.push_back(task),
            TaskPriority::Normal => queues.normal.push_back(task),
            TaskPriority::Low => queues.low.push_back(task),
        }
        queues.total += 1;
        inner.metrics.worker_queue_size.inc();
        drop(queues);
        inner.notify.notify_one();
        Ok(())
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queues.lock().expect("pool queues poisoned").total
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Grow or shrink toward `new_target`, clamped to `[min, max]`. Shrinking
    /// signals workers to exit at their next idle wakeup.
    pub fn resize(&self, new_target: usize) {
        do_resize(&self.inner, new_target);
    }

    /// Stop accepting work, drain the queues, and join every worker.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = {
            let mut handles = inner.handles.lock().expect("pool handles poisoned");
            handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn spawn_worker(inner: &Arc<PoolInner>) {
    let handle = tokio::spawn(worker_loop(Arc::clone(inner)));
    inner
        .handles
        .lock()
        .expect("pool handles poisoned")
        .push(handle);
}

fn make_room(queues: &mut Queues, incoming: TaskPriority, metrics: &MetricsRegistry) -> bool {
    let evicted = match incoming {
        TaskPriority::Low => false,
        TaskPriority::Normal => queues.low.pop_front().is_some(),
        TaskPriority::High => {
            queues.low.pop_front().is_some() || queues.normal.pop_front().is_some()
        }
    };
    if evicted {
        queues.total -= 1;
        metrics.worker_queue_size.dec();
        metrics.dropped_frames.inc();
    }
    evicted
}

async fn worker_loop(inner: Arc<PoolInner>) {
    inner.live.fetch_add(1, Ordering::AcqRel);
    inner.metrics.worker_live_threads.inc();
    loop {
        let task = {
            let mut queues = inner.queues.lock().expect("pool queues poisoned");
            if inner.stopping.load(Ordering::Acquire) && queues.total == 0 {
                break;
            }
            // Scale-down: exit while idle, never while work is pending above
            // the low watermark.
            if !inner.stopping.load(Ordering::Acquire)
                && queues.threads_to_stop > 0
                && queues.total <= inner.cfg.low_watermark
            {
                queues.threads_to_stop -= 1;
                break;
            }
            let task = queues
                .high
                .pop_front()
                .or_else(|| queues.normal.pop_front())
                .or_else(|| queues.low.pop_front());
            if task.is_some() {
                queues.total -= 1;
                inner.metrics.worker_queue_size.dec();
            }
            task
        };
        match task {
            Some(task) => task.await,
            None => {
                // Register before re-checking the stop flag so a
                // notify_waiters between the two cannot be lost.
                let mut notified = std::pin::pin!(inner.notify.notified());
                notified.as_mut().enable();
                if inner.stopping.load(Ordering::Acquire) {
                    break;
                }
                notified.await;
            }
        }
    }
    inner.live.fetch_sub(1, Ordering::AcqRel);
    inner.metrics.worker_live_threads.dec();
}

// Depth-based autoscaling: one step per threshold crossing, sampled twice a
// second, mirroring the queue watermarks used for admission.
async fn adjust_loop(inner: Arc<PoolInner>) {
    let mut high_count = 0u32;
    let mut low_count = 0u32;
    let mut ticker = tokio::time::interval(ADJUST_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        let depth = inner.queues.lock().expect("pool queues poisoned").total;
        let live = inner.live.load(Ordering::Acquire);
        if depth > inner.cfg.high_watermark {
            high_count += 1;
            low_count = 0;
        } else if depth <= inner.cfg.low_watermark {
            low_count += 1;
            high_count = 0;
        } else {
            high_count = 0;
            low_count = 0;
        }
        if high_count >= inner.cfg.up_threshold && live < inner.cfg.max_threads {
            do_resize(&inner, live + 1);
            high_count = 0;
        }
        if low_count >= inner.cfg.down_threshold && live > inner.cfg.min_threads {
            do_resize(&inner, live - 1);
            low_count = 0;
        }
    }
}

fn do_resize(inner: &Arc<PoolInner>, new_target: usize) {
    if inner.stopping.load(Ordering::Acquire) {
        return;
    }
    let new_target = new_target.clamp(inner.cfg.min_threads, inner.cfg.max_threads);
    let mut queues = inner.queues.lock().expect("pool queues poisoned");
    let old = queues.target;
    if new_target == old {
        return;
    }
    queues.target = new_target;
    if new_target > old {
        tracing::info!(from = old, to = new_target, "worker pool expanding");
        for _ in 0..new_target - old {
            spawn_worker(inner);
        }
    } else {
        queues.threads_to_stop += old - new_target;
        tracing::info!(from = old, to = new_target, "worker pool shrinking");
        drop(queues);
        inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn small_cfg(workers: usize, max_queue: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers,
            min_threads: workers,
            max_threads: workers,
            max_queue_size: max_queue,
            auto_tune: false,
            ..WorkerPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn submitted_tasks_run() {
        let pool = WorkerPool::new(small_cfg(2, 0), MetricsRegistry::new());
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_policy_evicts_by_priority() {
        // No workers draining: pool is created stopping-free but we block the
        // single worker with a long task so the queue state is observable.
        let pool = WorkerPool::new(small_cfg(1, 2), MetricsRegistry::new());
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        pool.submit(TaskPriority::Normal, async move {
            release.notified().await;
        })
        .expect("blocker");
        // Give the worker time to pick up the blocker.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ran_low = Arc::new(AtomicU32::new(0));
        let low_flag = Arc::clone(&ran_low);
        pool.submit(TaskPriority::Low, async move {
            low_flag.fetch_add(1, Ordering::SeqCst);
        })
        .expect("low fits");
        pool.submit(TaskPriority::Normal, async {}).expect("normal fits");
        assert_eq!(pool.queue_size(), 2);

        // Queue is full: another Low is refused outright.
        assert!(pool.submit(TaskPriority::Low, async {}).is_err());
        // Normal evicts the queued Low task.
        pool.submit(TaskPriority::Normal, async {}).expect("evicts low");
        assert_eq!(pool.queue_size(), 2);
        // High evicts a queued Normal once Low is exhausted.
        pool.submit(TaskPriority::High, async {}).expect("evicts normal");
        assert_eq!(pool.queue_size(), 2);

        gate.notify_one();
        pool.shutdown().await;
        // The evicted Low task never ran.
        assert_eq!(ran_low.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn high_priority_runs_before_low() {
        let pool = WorkerPool::new(small_cfg(1, 0), MetricsRegistry::new());
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        pool.submit(TaskPriority::Normal, async move {
            release.notified().await;
        })
        .expect("blocker");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let low_order = Arc::clone(&order);
        pool.submit(TaskPriority::Low, async move {
            low_order.lock().unwrap().push("low");
        })
        .expect("low");
        let high_order = Arc::clone(&order);
        pool.submit(TaskPriority::High, async move {
            high_order.lock().unwrap().push("high");
        })
        .expect("high");

        gate.notify_one();
        pool.shutdown().await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn resize_respects_bounds() {
        let cfg = WorkerPoolConfig {
            workers: 2,
            min_threads: 1,
            max_threads: 4,
            max_queue_size: 0,
            auto_tune: false,
            ..WorkerPoolConfig::default()
        };
        let pool = WorkerPool::new(cfg, MetricsRegistry::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.live_workers(), 2);

        pool.resize(100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.live_workers(), 4);

        pool.resize(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new(small_cfg(2, 0), MetricsRegistry::new());
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(TaskPriority::Low, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
