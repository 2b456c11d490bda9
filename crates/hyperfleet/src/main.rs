//! Process entry point: load configuration, open the durable store,
//! rebuild the runtime registry, then run the lifecycle supervisor and
//! reverse proxy until the process receives a shutdown signal.
//!
//! The authenticated JSON/HTTP API described in spec §6 (`POST
//! /machines`, etc.) is an external collaborator that sits in front of
//! [`hyperfleet::lifecycle::Engine`] — it is not part of this binary.
//! `PORT` is still read and validated at boot since that layer depends
//! on it, but nothing binds to it here.

use hyperfleet::config::Config;
use hyperfleet::lifecycle::{supervisor, Engine};
use hyperfleet::network::{NetworkManager, ShellExecutor};
use hyperfleet::oci::Resolver;
use hyperfleet::proxy::{self, ReverseProxy};
use hyperfleet::registry::Registry;
use hyperfleet::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal error during boot");
        std::process::exit(1);
    }
}

async fn run() -> hyperfleet::error::Result<()> {
    let config = Config::from_env()?;
    info!(port = config.port, proxy_port = config.proxy_port, "configuration loaded");

    let store = Store::open(&config.database_path).await?;

    let resolver = Arc::new(
        Resolver::open(
            config.oci_cache_dir.clone(),
            config.oci_max_cache_size_bytes,
            config.init_path.clone(),
            config.oci_default_rootfs_size_mib,
        )
        .await?,
    );

    let network = Arc::new(NetworkManager::new(Box::new(ShellExecutor), config.network_bridge_name.clone()));
    let registry = Arc::new(Registry::new());

    let engine = Arc::new(Engine::new(store.clone(), resolver, network, registry, config.clone()));
    engine.rebuild_registry_on_boot().await?;

    let supervisor_handle = tokio::spawn(supervisor::run(engine.clone()));

    let proxy = Arc::new(ReverseProxy::new(
        store,
        config.proxy_prefix.clone(),
        config.proxy_host_suffix.clone(),
        config.proxy_exposed_port_poll_interval_ms,
    ));
    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
    let proxy_handle = tokio::spawn(proxy::serve(proxy, proxy_addr));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = supervisor_handle => {
            if let Err(e) = result {
                error!(error = %e, "lifecycle supervisor task panicked");
            }
        }
        result = proxy_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "reverse proxy accept loop failed"),
                Err(e) => error!(error = %e, "reverse proxy task panicked"),
            }
        }
    }

    Ok(())
}
