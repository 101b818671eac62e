use anyhow::{Context, Result};
use relay_gateway::limits::{IpLimitConfig, MsgLimitConfig};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Gateway service configuration sourced from environment variables, with an
// optional YAML override file for ops deployments.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Data-plane listener bind address.
    pub bind: SocketAddr,
    // Control/metrics HTTP listener bind address.
    pub control_bind: SocketAddr,
    // Tokio worker threads for the data plane; 0 means hardware concurrency.
    pub io_threads: usize,
    // Connections idle longer than this are reaped.
    pub idle_timeout_ms: u64,
    // Grace window for draining on shutdown.
    pub shutdown_grace_ms: u64,
    // Max frame size accepted on the data port.
    pub max_frame_bytes: usize,
    // Global cap on frames admitted but not yet completed.
    pub max_inflight: u32,
    // Per-connection send queue cap.
    pub max_send_buffer_bytes: usize,
    pub thread_pool: ThreadPoolConfig,
    pub backpressure: BackpressureSection,
    pub ip_limit: IpLimitConfig,
    // Per-msg-type admission limits.
    pub message_limits: HashMap<u16, MsgLimitConfig>,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub workers: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    pub max_queue_size: usize,
    pub auto_tune: bool,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub up_threshold: u32,
    pub down_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct BackpressureSection {
    pub reject_low_priority: bool,
    pub low_priority_msg_types: HashSet<u16>,
    pub always_allow_msg_types: HashSet<u16>,
    pub send_error_frame: bool,
    pub error_msg_type: u16,
    pub error_body: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    // trace | debug | info | warn | error.
    pub level: String,
    // The tracing subscriber writes synchronously; these are accepted but
    // have no effect.
    pub async_queue_size: usize,
    pub flush_interval_ms: u64,
    pub console_enable: bool,
    pub file_enable: bool,
    pub file_base_name: String,
    // Accepted for compatibility; rotation is left to external tooling.
    pub file_max_size_mb: u64,
    pub file_max_files: u64,
}

const DEFAULT_GATEWAY_CONFIG_PATH: &str = "/usr/local/relay/gateway.yml";
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_INFLIGHT: u32 = 10_000;
const DEFAULT_MAX_SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_STATE_TTL_SEC: u64 = 300;
const DEFAULT_BACKPRESSURE_ERROR_TYPE: u16 = 0xFFFF;

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    bind: Option<String>,
    control_bind: Option<String>,
    io_threads: Option<usize>,
    idle_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    max_inflight: Option<u32>,
    max_send_buffer_bytes: Option<usize>,
    thread_pool: Option<ThreadPoolOverride>,
    backpressure: Option<BackpressureOverride>,
    ip_limit: Option<IpLimitOverride>,
    message_limits: Option<HashMap<u16, MsgLimitConfig>>,
    log: Option<LogOverride>,
}

#[derive(Debug, Deserialize)]
struct ThreadPoolOverride {
    workers: Option<usize>,
    min_threads: Option<usize>,
    max_threads: Option<usize>,
    max_queue_size: Option<usize>,
    auto_tune: Option<bool>,
    high_watermark: Option<usize>,
    low_watermark: Option<usize>,
    up_threshold: Option<u32>,
    down_threshold: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BackpressureOverride {
    reject_low_priority: Option<bool>,
    low_priority_msg_types: Option<Vec<u16>>,
    always_allow_msg_types: Option<Vec<u16>>,
    send_error_frame: Option<bool>,
    error_msg_type: Option<u16>,
    error_body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpLimitOverride {
    max_conn_per_ip: Option<u32>,
    max_qps_per_ip: Option<u32>,
    whitelist: Option<Vec<String>>,
    state_ttl_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LogOverride {
    level: Option<String>,
    async_queue_size: Option<usize>,
    flush_interval_ms: Option<u64>,
    console: Option<LogSinkOverride>,
    file: Option<LogFileOverride>,
}

#[derive(Debug, Deserialize)]
struct LogSinkOverride {
    enable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LogFileOverride {
    enable: Option<bool>,
    base_name: Option<String>,
    max_size_mb: Option<u64>,
    max_files: Option<u64>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                // Config loads before logging is up, so warn on stderr.
                eprintln!("invalid value for {key}: {raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("RELAY_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse RELAY_BIND")?;
        let control_bind = std::env::var("RELAY_CONTROL_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
            .parse()
            .with_context(|| "parse RELAY_CONTROL_BIND")?;
        Ok(Self {
            bind,
            control_bind,
            io_threads: env_parse("RELAY_IO_THREADS", 0),
            idle_timeout_ms: env_parse("RELAY_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS),
            shutdown_grace_ms: env_parse("RELAY_SHUTDOWN_GRACE_MS", DEFAULT_SHUTDOWN_GRACE_MS),
            max_frame_bytes: env_parse("RELAY_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES),
            max_inflight: env_parse("RELAY_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT),
            max_send_buffer_bytes: env_parse(
                "RELAY_MAX_SEND_BUFFER_BYTES",
                DEFAULT_MAX_SEND_BUFFER_BYTES,
            ),
            thread_pool: ThreadPoolConfig {
                workers: env_parse("RELAY_WORKERS", 4),
                min_threads: env_parse("RELAY_WORKERS_MIN", 2),
                max_threads: env_parse("RELAY_WORKERS_MAX", 8),
                max_queue_size: env_parse("RELAY_WORKER_QUEUE_SIZE", 10_000),
                auto_tune: env_bool("RELAY_WORKER_AUTO_TUNE", false),
                high_watermark: env_parse("RELAY_WORKER_HIGH_WATERMARK", 2_000),
                low_watermark: env_parse("RELAY_WORKER_LOW_WATERMARK", 0),
                up_threshold: env_parse("RELAY_WORKER_UP_THRESHOLD", 3),
                down_threshold: env_parse("RELAY_WORKER_DOWN_THRESHOLD", 10),
            },
            backpressure: BackpressureSection {
                reject_low_priority: env_bool("RELAY_BP_REJECT_LOW_PRIORITY", false),
                low_priority_msg_types: HashSet::new(),
                always_allow_msg_types: HashSet::new(),
                send_error_frame: env_bool("RELAY_BP_SEND_ERROR_FRAME", true),
                error_msg_type: env_parse(
                    "RELAY_BP_ERROR_MSG_TYPE",
                    DEFAULT_BACKPRESSURE_ERROR_TYPE,
                ),
                error_body: std::env::var("RELAY_BP_ERROR_BODY")
                    .unwrap_or_else(|_| "backpressure".to_string()),
            },
            ip_limit: IpLimitConfig {
                max_conn_per_ip: env_parse("RELAY_IP_MAX_CONN", 0),
                max_qps_per_ip: env_parse("RELAY_IP_MAX_QPS", 0),
                whitelist: HashSet::new(),
                state_ttl_sec: env_parse("RELAY_IP_STATE_TTL_SEC", DEFAULT_STATE_TTL_SEC),
            },
            message_limits: HashMap::new(),
            log: LogConfig {
                level: std::env::var("RELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                async_queue_size: env_parse("RELAY_LOG_ASYNC_QUEUE_SIZE", 8192),
                flush_interval_ms: env_parse("RELAY_LOG_FLUSH_INTERVAL_MS", 1_000),
                console_enable: env_bool("RELAY_LOG_CONSOLE", true),
                file_enable: env_bool("RELAY_LOG_FILE", false),
                file_base_name: std::env::var("RELAY_LOG_FILE_BASE")
                    .unwrap_or_else(|_| "gateway".to_string()),
                file_max_size_mb: env_parse("RELAY_LOG_FILE_MAX_SIZE_MB", 100),
                file_max_files: env_parse("RELAY_LOG_FILE_MAX_FILES", 5),
            },
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("RELAY_GATEWAY_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_GATEWAY_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read RELAY_GATEWAY_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read gateway config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let overrides: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            config.apply(overrides)?;
        }
        Ok(config)
    }

    fn apply(&mut self, overrides: GatewayConfigOverride) -> Result<()> {
        if let Some(value) = overrides.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = overrides.control_bind {
            self.control_bind = value.parse().with_context(|| "parse control_bind")?;
        }
        if let Some(value) = overrides.io_threads {
            self.io_threads = value;
        }
        if let Some(value) = overrides.idle_timeout_ms
            && value > 0
        {
            self.idle_timeout_ms = value;
        }
        if let Some(value) = overrides.shutdown_grace_ms
            && value > 0
        {
            self.shutdown_grace_ms = value;
        }
        if let Some(value) = overrides.max_frame_bytes
            && value > 0
        {
            self.max_frame_bytes = value;
        }
        if let Some(value) = overrides.max_inflight {
            self.max_inflight = value;
        }
        if let Some(value) = overrides.max_send_buffer_bytes
            && value > 0
        {
            self.max_send_buffer_bytes = value;
        }
        if let Some(pool) = overrides.thread_pool {
            if let Some(value) = pool.workers
                && value > 0
            {
                self.thread_pool.workers = value;
            }
            if let Some(value) = pool.min_threads
                && value > 0
            {
                self.thread_pool.min_threads = value;
            }
            if let Some(value) = pool.max_threads
                && value > 0
            {
                self.thread_pool.max_threads = value;
            }
            if let Some(value) = pool.max_queue_size {
                self.thread_pool.max_queue_size = value;
            }
            if let Some(value) = pool.auto_tune {
                self.thread_pool.auto_tune = value;
            }
            if let Some(value) = pool.high_watermark {
                self.thread_pool.high_watermark = value;
            }
            if let Some(value) = pool.low_watermark {
                self.thread_pool.low_watermark = value;
            }
            if let Some(value) = pool.up_threshold
                && value > 0
            {
                self.thread_pool.up_threshold = value;
            }
            if let Some(value) = pool.down_threshold
                && value > 0
            {
                self.thread_pool.down_threshold = value;
            }
        }
        if let Some(bp) = overrides.backpressure {
            if let Some(value) = bp.reject_low_priority {
                self.backpressure.reject_low_priority = value;
            }
            if let Some(value) = bp.low_priority_msg_types {
                self.backpressure.low_priority_msg_types = value.into_iter().collect();
            }
            if let Some(value) = bp.always_allow_msg_types {
                self.backpressure.always_allow_msg_types = value.into_iter().collect();
            }
            if let Some(value) = bp.send_error_frame {
                self.backpressure.send_error_frame = value;
            }
            if let Some(value) = bp.error_msg_type {
                self.backpressure.error_msg_type = value;
            }
            if let Some(value) = bp.error_body {
                self.backpressure.error_body = value;
            }
        }
        if let Some(ip) = overrides.ip_limit {
            if let Some(value) = ip.max_conn_per_ip {
                self.ip_limit.max_conn_per_ip = value;
            }
            if let Some(value) = ip.max_qps_per_ip {
                self.ip_limit.max_qps_per_ip = value;
            }
            if let Some(value) = ip.whitelist {
                self.ip_limit.whitelist = value.into_iter().collect();
            }
            if let Some(value) = ip.state_ttl_sec {
                self.ip_limit.state_ttl_sec = value;
            }
        }
        if let Some(limits) = overrides.message_limits {
            self.message_limits = limits;
        }
        if let Some(log) = overrides.log {
            if let Some(value) = log.level {
                self.log.level = value;
            }
            if let Some(value) = log.async_queue_size
                && value > 0
            {
                self.log.async_queue_size = value;
            }
            if let Some(value) = log.flush_interval_ms
                && value > 0
            {
                self.log.flush_interval_ms = value;
            }
            if let Some(console) = log.console
                && let Some(value) = console.enable
            {
                self.log.console_enable = value;
            }
            if let Some(file) = log.file {
                if let Some(value) = file.enable {
                    self.log.file_enable = value;
                }
                if let Some(value) = file.base_name {
                    self.log.file_base_name = value;
                }
                if let Some(value) = file.max_size_mb
                    && value > 0
                {
                    self.log.file_max_size_mb = value;
                }
                if let Some(value) = file.max_files
                    && value > 0
                {
                    self.log.file_max_files = value;
                }
            }
        }
        Ok(())
    }
}
