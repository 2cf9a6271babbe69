use envconfig::Envconfig;
use kube::Client;
use oprc_dbm::{config::DbmConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = DbmConfig::init_from_env()?;
    info!(?cfg, "Starting DBM");

    let client = Client::try_default().await?;
    runtime::run_all(client, cfg).await
}
