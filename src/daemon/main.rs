mod cmd;
mod config;

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use keel::{
    agent::{
        Agent, Collaborators,
        control_plane::HttpControlPlane,
        cpuset::{CgroupApplier, CpuApplier, NoopApplier},
        fetch::HttpBlobFetcher,
        hypervisor::qemu::QemuHypervisor,
        storage::StorageManager,
    },
    utils::tracing::init_tracing,
};
use tracing::{error, info};

use crate::{cmd::Cli, config::Config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config_path).await?;
    info!(path = %config.config_path.display(), host_id = %config.host_id, "config loaded");

    let Some(servers_path) = config.servers_path.clone() else {
        bail!("servers-path is not configured");
    };

    let cpu_applier: Arc<dyn CpuApplier> = if config.disable_set_cgroup {
        Arc::new(NoopApplier)
    } else {
        Arc::new(CgroupApplier::new(&servers_path))
    };

    let deps = Collaborators {
        hypervisor: QemuHypervisor::new(config.hypervisor.clone(), &servers_path),
        control_plane: Arc::new(HttpControlPlane::new(&config.control_plane)?),
        storage: Arc::new(StorageManager::from_config(&config.storage)),
        fetcher: Arc::new(HttpBlobFetcher::new(config.fetch_timeout())?),
        cpu_applier,
    };

    let agent = Agent::new(config.to_agent_config(), deps).await?;
    let signal = agent.bootstrap().await?;

    tokio::select! {
        result = signal.wait() => {
            if let Err(e) = result {
                error!(error = %e, "startup failed");
                agent.shutdown().await;
                return Err(e.into());
            }
            info!("node online");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during startup");
            agent.shutdown().await;
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    agent.shutdown().await;

    Ok(())
}
