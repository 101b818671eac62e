// Shared fixtures for gateway integration tests.
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use gateway::app::{self, RunningGateway};
use gateway::config::GatewayConfig;

/// Config bound to ephemeral ports with test-friendly timeouts.
pub fn test_config() -> Result<GatewayConfig> {
    let mut cfg = GatewayConfig::from_env()?;
    cfg.bind = "127.0.0.1:0".parse()?;
    cfg.control_bind = "127.0.0.1:0".parse()?;
    cfg.shutdown_grace_ms = 2_000;
    Ok(cfg)
}

pub async fn start_gateway(cfg: GatewayConfig) -> Result<RunningGateway> {
    app::start(cfg).await
}

/// Poll `probe` until it returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
