// Gateway service main entry point.
use anyhow::{Context, Result};
use gateway::app;
use gateway::config::GatewayConfig;
use gateway::observability;

fn main() -> Result<()> {
    let cfg = GatewayConfig::from_env_or_yaml()?;
    observability::init_logging(&cfg.log);

    // The data-plane I/O thread count is a config knob, so the runtime is
    // built by hand instead of through the attribute macro.
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if cfg.io_threads > 0 {
        builder.worker_threads(cfg.io_threads);
    }
    let runtime = builder.build().context("build tokio runtime")?;
    runtime.block_on(app::run(cfg))
}
