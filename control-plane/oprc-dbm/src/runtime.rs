use std::net::SocketAddr;

use kube::Client;
use tokio::{task::JoinHandle, try_join};

use crate::{config::DbmConfig, controller::run_controller, web::run_http_server};

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &DbmConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Spawn the controller: watches, lister resync and the worker pool.
pub fn spawn_controller(
    client: Client,
    cfg: DbmConfig,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_controller(client, cfg).await })
}

pub fn spawn_http(addr: SocketAddr) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_http_server(addr).await })
}

/// Start both controller and health server and wait until either finishes.
pub async fn run_all(client: Client, cfg: DbmConfig) -> anyhow::Result<()> {
    let http_addr = compute_http_addr(&cfg);

    let controller = spawn_controller(client, cfg);
    let http = spawn_http(http_addr);

    let (c_res, h_res) = try_join!(controller, http)?;
    c_res?;
    h_res?;
    Ok(())
}
