use std::sync::Arc;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::agent::{
    Agent,
    error::{AgentError, AgentResult},
    guest::{
        RuntimeState,
        descriptor::{GuestDescriptor, NicDesc, NicQuery},
    },
    hypervisor::MonitorCommand,
    task::{TaskHandle, TaskKind},
};

/// Commands that take a running guest from `current` to `target`. Only
/// growth can be applied live.
fn live_changes(current: &GuestDescriptor, target: &GuestDescriptor) -> AgentResult<Vec<MonitorCommand>> {
    if target.cpu < current.cpu {
        return Err(AgentError::precondition(format!(
            "cannot drop vcpus of a running guest ({} -> {})",
            current.cpu, target.cpu
        )));
    }
    if target.mem_mb < current.mem_mb {
        return Err(AgentError::precondition(format!(
            "cannot shrink memory of a running guest ({}MB -> {}MB)",
            current.mem_mb, target.mem_mb
        )));
    }

    let mut commands: Vec<MonitorCommand> = (current.cpu..target.cpu)
        .map(|index| MonitorCommand::HotplugVcpu { index })
        .collect();
    if target.mem_mb > current.mem_mb {
        commands.push(MonitorCommand::HotplugMemory {
            id: format!("mem-{}", Uuid::new_v4().simple()),
            size_mb: target.mem_mb - current.mem_mb,
        });
    }

    for disk in &target.disks {
        let Some(old) = current.disk(&disk.disk_id) else {
            continue;
        };
        if disk.size_mb < old.size_mb {
            return Err(AgentError::precondition(format!("disk {} can only grow", disk.disk_id)));
        }
        if disk.size_mb > old.size_mb {
            commands.push(MonitorCommand::BlockResize {
                drive: old.drive_name(),
                size_mb: disk.size_mb,
            });
        }
    }
    Ok(commands)
}

impl Agent {
    /// Takes over an updated descriptor. With `fw_only` only the network
    /// interfaces are replaced. A running guest gets added vCPUs, memory and
    /// grown disks applied live in a task; everything else takes effect on
    /// the next start. The VNC port stays the one this host handed out.
    pub async fn guest_sync(
        self: &Arc<Self>,
        id: &str,
        desc: GuestDescriptor,
        fw_only: bool,
    ) -> AgentResult<Option<TaskHandle>> {
        let guest = self.guest(id)?;
        if desc.uuid != id {
            return Err(AgentError::precondition(format!(
                "descriptor belongs to {}, not {id}",
                desc.uuid
            )));
        }

        let mut guard = guest.lock().await;
        if fw_only {
            let nics = desc.nics;
            guard.update_descriptor(|d| d.nics = nics).await?;
            info!(guest_id = id, "guest interfaces synced");
            return Ok(None);
        }

        let mut desc = desc;
        desc.vnc_port = guard.descriptor.as_ref().and_then(|d| d.vnc_port);
        match guard.runtime() {
            RuntimeState::Unloaded | RuntimeState::Loaded | RuntimeState::Stopped => {
                guard.save_descriptor(desc).await?;
                info!(guest_id = id, "guest descriptor synced");
                return Ok(None);
            }
            RuntimeState::Running => {}
            other => {
                return Err(AgentError::precondition(format!("cannot sync guest while {other:?}")));
            }
        }

        let commands = live_changes(guard.descriptor()?, &desc)?;
        let monitor = guard
            .monitor()
            .ok_or_else(|| AgentError::precondition("guest has no control channel"))?;
        drop(guard);

        let work = {
            let guest = guest.clone();
            async move {
                let applied = commands.len();
                for command in commands {
                    monitor.execute(command).await?;
                }
                guest.lock().await.save_descriptor(desc).await?;
                anyhow::Ok(json!({ "applied": applied }))
            }
        };

        Ok(Some(self.tasks.spawn(TaskKind::Sync, id, work, |_| async {})))
    }

    /// Finds the guest owning an interface, among known guests or, with
    /// `candidate`, among guests still awaiting confirmation. Guests without
    /// a descriptor are skipped.
    pub async fn guest_nic_desc(&self, query: &NicQuery, candidate: bool) -> Option<(GuestDescriptor, NicDesc)> {
        let guests = if candidate {
            self.registry.candidate_guests()
        } else {
            self.registry.known_guests()
        };

        for guest in guests {
            let guard = guest.lock().await;
            let Some(desc) = guard.descriptor.as_ref() else {
                continue;
            };
            if let Some(nic) = desc.find_nic(query) {
                return Some((desc.clone(), nic.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{
            task::TaskOutcome,
            testing::{TestAgent, descriptor},
        },
        constants::DESCRIPTOR_FILE_NAME,
    };

    #[tokio::test]
    async fn test_sync_stopped_guest_keeps_vnc_port() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.agent.stop("vm-1", None).await.unwrap().wait().await;
        let guest = t.agent.registry().get("vm-1").unwrap();
        let vnc_port = guest.lock().await.descriptor().unwrap().vnc_port;

        let mut desc = descriptor("vm-1", &["d1", "d2"]);
        desc.cpu = 1;
        assert!(t.agent.guest_sync("vm-1", desc, false).await.unwrap().is_none());

        let on_disk = GuestDescriptor::load(guest.dir().join(DESCRIPTOR_FILE_NAME)).await.unwrap();
        assert_eq!(on_disk.cpu, 1);
        assert_eq!(on_disk.disks.len(), 2);
        assert_eq!(on_disk.vnc_port, vnc_port);
    }

    #[tokio::test]
    async fn test_sync_running_guest_grows_live() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        let mut desc = descriptor("vm-1", &["d1"]);
        desc.cpu = 3;
        desc.mem_mb = 3072;
        desc.disks[0].size_mb = 20480;
        let task = t.agent.guest_sync("vm-1", desc, false).await.unwrap().unwrap();
        assert_eq!(task.wait().await, TaskOutcome::Succeeded(json!({ "applied": 3 })));

        let commands = t.hypervisor.commands("vm-1");
        assert!(commands.contains(&MonitorCommand::HotplugVcpu { index: 2 }));
        assert!(commands.contains(&MonitorCommand::BlockResize {
            drive: "drive_0".to_string(),
            size_mb: 20480,
        }));
        assert!(commands.iter().any(|c| matches!(
            c,
            MonitorCommand::HotplugMemory { size_mb: 1024, .. }
        )));

        let guest = t.agent.registry().get("vm-1").unwrap();
        let guard = guest.lock().await;
        let desc = guard.descriptor().unwrap();
        assert_eq!((desc.cpu, desc.mem_mb), (3, 3072));
        assert!(desc.vnc_port.is_some());
    }

    #[tokio::test]
    async fn test_sync_running_guest_rejects_shrink() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        let mut desc = descriptor("vm-1", &["d1"]);
        desc.cpu = 1;
        let err = t.agent.guest_sync("vm-1", desc, false).await.unwrap_err();
        assert!(err.is_precondition());

        let mut desc = descriptor("vm-1", &["d1"]);
        desc.disks[0].size_mb = 1024;
        let err = t.agent.guest_sync("vm-1", desc, false).await.unwrap_err();
        assert!(err.is_precondition());

        let guest = t.agent.registry().get("vm-1").unwrap();
        assert_eq!(guest.lock().await.descriptor().unwrap().cpu, 2);
    }

    #[tokio::test]
    async fn test_sync_interfaces_only() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        let mut desc = descriptor("vm-1", &["d1"]);
        desc.cpu = 8;
        desc.nics[0].ip = "10.0.0.77".to_string();
        assert!(t.agent.guest_sync("vm-1", desc, true).await.unwrap().is_none());

        let guest = t.agent.registry().get("vm-1").unwrap();
        let guard = guest.lock().await;
        let desc = guard.descriptor().unwrap();
        assert_eq!(desc.cpu, 2);
        assert_eq!(desc.nics[0].ip, "10.0.0.77");
    }

    #[tokio::test]
    async fn test_sync_rejects_foreign_descriptor() {
        let t = TestAgent::new().await;
        t.agent
            .create_guest("vm-1", Some(descriptor("vm-1", &["d1"])))
            .await
            .unwrap();
        let err = t
            .agent
            .guest_sync("vm-1", descriptor("vm-2", &["d1"]), false)
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(matches!(
            t.agent.guest_sync("vm-9", descriptor("vm-9", &[]), false).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_nic_lookup_across_guests() {
        let t = TestAgent::new().await;
        t.agent
            .create_guest("vm-1", Some(descriptor("vm-1", &["d1"])))
            .await
            .unwrap();
        let mut other = descriptor("vm-2", &["d1"]);
        other.nics[0].mac = "00:22:aa:00:00:02".to_string();
        other.nics[0].ip = "10.0.0.3".to_string();
        t.agent.create_guest("vm-2", Some(other)).await.unwrap();
        t.agent.create_guest("vm-3", None).await.unwrap();

        let query = NicQuery {
            mac: "00:22:AA:00:00:02".to_string(),
            ..Default::default()
        };
        let (desc, nic) = t.agent.guest_nic_desc(&query, false).await.unwrap();
        assert_eq!(desc.uuid, "vm-2");
        assert_eq!(nic.ip, "10.0.0.3");

        let query = NicQuery {
            ifname: "vnic-vm-1".to_string(),
            bridge: "br0".to_string(),
            ..Default::default()
        };
        assert_eq!(t.agent.guest_nic_desc(&query, false).await.unwrap().0.uuid, "vm-1");
        assert!(t.agent.guest_nic_desc(&query, true).await.is_none());

        let query = NicQuery {
            mac: "00:22:aa:00:00:02".to_string(),
            ip: "10.0.0.2".to_string(),
            ..Default::default()
        };
        assert!(t.agent.guest_nic_desc(&query, false).await.is_none());
    }
}
