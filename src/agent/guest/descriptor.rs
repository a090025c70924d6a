use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::storage::StorageKind;

/// Hardware description of a guest. The copy under the instance directory is
/// the source of truth; the in-memory copy is only mutated under the guest
/// lock and written back on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuestDescriptor {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host_id: String,
    pub cpu: u32,
    pub mem_mb: u64,
    #[serde(default)]
    pub disks: Vec<DiskDesc>,
    #[serde(default)]
    pub nics: Vec<NicDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,

    /// Fields the agent does not interpret but must round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskDesc {
    pub disk_id: String,
    pub index: u32,
    pub path: String,
    pub size_mb: u64,
    #[serde(default)]
    pub storage_id: String,
    #[serde(default)]
    pub storage_kind: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NicDesc {
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub bridge: String,
    /// Host side interface name.
    #[serde(default)]
    pub ifname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,
    #[serde(default)]
    pub vpc: bool,
}

/// Criteria for finding a guest interface. Empty fields match anything; the
/// mac is compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicQuery {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ifname: String,
    #[serde(default)]
    pub bridge: String,
}

impl NicQuery {
    fn matches(&self, nic: &NicDesc) -> bool {
        (self.mac.is_empty() || nic.mac.eq_ignore_ascii_case(&self.mac))
            && (self.ip.is_empty() || nic.ip == self.ip)
            && (self.ifname.is_empty() || nic.ifname == self.ifname)
            && (self.bridge.is_empty() || nic.bridge == self.bridge)
    }
}

impl DiskDesc {
    /// Name the hypervisor knows this disk's block device by.
    pub fn drive_name(&self) -> String {
        format!("drive_{}", self.index)
    }
}

impl GuestDescriptor {
    pub fn disk(&self, disk_id: &str) -> Option<&DiskDesc> {
        self.disks.iter().find(|d| d.disk_id == disk_id)
    }

    pub fn disk_mut(&mut self, disk_id: &str) -> Option<&mut DiskDesc> {
        self.disks.iter_mut().find(|d| d.disk_id == disk_id)
    }

    pub fn vpc_nic(&self) -> Option<&NicDesc> {
        self.nics.iter().find(|n| n.vpc)
    }

    pub fn find_nic(&self, query: &NicQuery) -> Option<&NicDesc> {
        self.nics.iter().find(|n| query.matches(n))
    }

    /// No disk lives on host-local storage, so another host can run the
    /// guest from the same disks.
    pub fn is_shared_storage(&self) -> bool {
        self.disks.iter().all(|d| d.storage_kind == StorageKind::Shared)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("read descriptor {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse descriptor {}", path.display()))
    }

    /// Write through a temp file so a crash never leaves a torn descriptor.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let raw = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("write descriptor {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("replace descriptor {}", path.display()))?;
        Ok(())
    }
}
