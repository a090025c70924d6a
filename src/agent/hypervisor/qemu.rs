use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Hypervisor, LaunchOptions, Monitor, MonitorError, qmp::QmpMonitor};
use crate::{
    agent::guest::descriptor::GuestDescriptor,
    constants::{MONITOR_SOCKET_NAME, PID_FILE_NAME},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary() -> String {
    "qemu-system-x86_64".to_string()
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            extra_args: Vec::new(),
        }
    }
}

/// Runs each guest as a daemonized qemu process with its pid file and QMP
/// socket inside the instance directory, so guests outlive the agent and are
/// found again by path after a restart.
pub struct QemuHypervisor {
    config: QemuConfig,
    servers_path: PathBuf,
}

impl QemuHypervisor {
    pub fn new(config: QemuConfig, servers_path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            config,
            servers_path: servers_path.into(),
        })
    }

    fn guest_dir(&self, guest_id: &str) -> PathBuf {
        self.servers_path.join(guest_id)
    }

    async fn read_pid(&self, guest_id: &str) -> Option<u32> {
        let raw = tokio::fs::read_to_string(self.guest_dir(guest_id).join(PID_FILE_NAME))
            .await
            .ok()?;
        raw.trim().parse().ok()
    }

    pub fn build_args(&self, guest_id: &str, desc: &GuestDescriptor, opts: &LaunchOptions) -> Vec<String> {
        let dir = self.guest_dir(guest_id);
        let mut args = vec![
            "-name".to_string(),
            format!("guest={guest_id}"),
            "-daemonize".to_string(),
            "-pidfile".to_string(),
            dir.join(PID_FILE_NAME).display().to_string(),
            "-qmp".to_string(),
            format!("unix:{},server,nowait", dir.join(MONITOR_SOCKET_NAME).display()),
            "-smp".to_string(),
            format!("{},maxcpus={}", desc.cpu, desc.cpu.max(1) * 2),
            "-m".to_string(),
            format!("{}M,slots=8,maxmem={}M", desc.mem_mb, desc.mem_mb * 4),
            "-vnc".to_string(),
            format!(":{}", opts.vnc_port.saturating_sub(crate::constants::VNC_PORT_BASE)),
        ];

        for disk in &desc.disks {
            args.push("-drive".to_string());
            args.push(format!(
                "file={},if=virtio,id={},format=qcow2,cache=none,aio=native",
                disk.path,
                disk.drive_name()
            ));
        }

        for (i, nic) in desc.nics.iter().enumerate() {
            args.push("-netdev".to_string());
            args.push(format!("bridge,id=net{i},br={}", nic.bridge));
            args.push("-device".to_string());
            args.push(format!("virtio-net-pci,netdev=net{i},mac={}", nic.mac));
        }

        if let Some(tls_dir) = &opts.tls_dir {
            args.push("-object".to_string());
            args.push(format!(
                "tls-creds-x509,id=migtls0,dir={},endpoint=server,verify-peer=on",
                tls_dir.display()
            ));
        }

        if let Some(incoming) = &opts.incoming {
            args.push("-incoming".to_string());
            args.push(incoming.clone());
        }

        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    async fn probe(&self, guest_id: &str) -> bool {
        match self.read_pid(guest_id).await {
            Some(pid) => Path::new(&format!("/proc/{pid}")).exists(),
            None => false,
        }
    }

    async fn launch(&self, guest_id: &str, desc: &GuestDescriptor, opts: &LaunchOptions) -> Result<()> {
        let dir = self.guest_dir(guest_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let _ = tokio::fs::remove_file(dir.join(MONITOR_SOCKET_NAME)).await;

        let args = self.build_args(guest_id, desc, opts);
        debug!(guest_id, binary = %self.config.binary, ?args, "launching qemu");

        let output = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn {}", self.config.binary))?;

        if !output.status.success() {
            bail!(
                "qemu exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(guest_id, vnc_port = opts.vnc_port, "qemu launched");
        Ok(())
    }

    async fn connect(&self, guest_id: &str) -> Result<Arc<dyn Monitor>, MonitorError> {
        let socket = self.guest_dir(guest_id).join(MONITOR_SOCKET_NAME);
        let monitor = QmpMonitor::connect_with_retry(&socket, 10, Duration::from_millis(100)).await?;
        Ok(Arc::new(monitor))
    }

    async fn terminate(&self, guest_id: &str) -> Result<()> {
        let Some(pid) = self.read_pid(guest_id).await else {
            debug!(guest_id, "no pid file, nothing to terminate");
            return Ok(());
        };

        if !Path::new(&format!("/proc/{pid}")).exists() {
            return Ok(());
        }

        warn!(guest_id, pid, "force-killing qemu");
        let status = Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .await
            .context("failed to execute kill command")?;

        if !status.success() {
            bail!("failed to kill qemu {pid}: exit code {:?}", status.code());
        }
        Ok(())
    }
}
