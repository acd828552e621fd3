// vellumd: standalone sync daemon entry point.

use anyhow::Context;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = vellum_daemon::config::DaemonConfig::load();
    info!("starting vellum daemon");
    vellum_daemon::runtime::run_standalone(config)
        .await
        .context("vellum daemon terminated unexpectedly")
}
