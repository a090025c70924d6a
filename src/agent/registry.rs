use std::{
    collections::HashMap,
    net::TcpListener,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    agent::{
        guest::{Guest, RuntimeState, descriptor::GuestDescriptor},
        hypervisor::Hypervisor,
        reconcile::{BootstrapSignal, Reconciler},
    },
    constants::{DESCRIPTOR_FILE_NAME, MONITOR_PORT_BASE, VNC_PORT_BASE, VNC_PORT_WRAP},
    utils::id::is_instance_id,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("guest {0} exists")]
    AlreadyExists(String),

    #[error("guest {0} not found")]
    NotFound(String),

    #[error("registry already bootstrapped")]
    AlreadyBootstrapped,

    #[error("no storage directory configured")]
    NoStorageDir,

    #[error("loading guests from disk: {0}")]
    Load(String),

    #[error("no free vnc port")]
    NoFreeVncPort,
}

#[derive(Default)]
struct VncPorts {
    last: u16,
    in_use: HashMap<String, u16>,
}

/// Every guest on this host, split by how far it has been confirmed against
/// the control plane. A guest sits in exactly one of the three maps; moves go
/// candidate to known, or candidate to unknown and then out.
pub struct Registry {
    servers_path: Option<PathBuf>,
    hypervisor: Arc<dyn Hypervisor>,

    known: papaya::HashMap<String, Arc<Guest>>,
    candidate: papaya::HashMap<String, Arc<Guest>>,
    unknown: papaya::HashMap<String, Arc<Guest>>,

    // serializes membership changes so two creates of one id cannot both win
    membership: Mutex<()>,
    dirty: std::sync::Mutex<Vec<String>>,
    vnc: std::sync::Mutex<VncPorts>,

    bootstrapped: AtomicBool,
    loaded: AtomicBool,
}

impl Registry {
    pub fn new(servers_path: Option<PathBuf>, hypervisor: Arc<dyn Hypervisor>) -> Arc<Self> {
        Arc::new(Self {
            servers_path,
            hypervisor,
            known: papaya::HashMap::new(),
            candidate: papaya::HashMap::new(),
            unknown: papaya::HashMap::new(),
            membership: Mutex::new(()),
            dirty: std::sync::Mutex::new(Vec::new()),
            vnc: std::sync::Mutex::new(VncPorts::default()),
            bootstrapped: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        })
    }

    pub fn servers_path(&self) -> Option<&Path> {
        self.servers_path.as_deref()
    }

    pub fn guest_dir(&self, id: &str) -> PathBuf {
        match &self.servers_path {
            Some(root) => root.join(id),
            None => PathBuf::from(id),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.known.pin().contains_key(id)
            || self.candidate.pin().contains_key(id)
            || self.unknown.pin().contains_key(id)
    }

    /// Allocates a fresh `Unloaded` guest. Exactly one of any number of
    /// concurrent creates for the same id succeeds.
    pub async fn create(&self, id: &str) -> Result<Arc<Guest>, RegistryError> {
        let _membership = self.membership.lock().await;
        if self.contains(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }

        let guest = Guest::new(id, self.guest_dir(id), self.hypervisor.clone());
        self.known.pin().insert(id.to_string(), guest.clone());
        debug!(guest_id = id, "guest created");
        Ok(guest)
    }

    /// Known guests, then candidates still awaiting confirmation.
    pub fn get(&self, id: &str) -> Result<Arc<Guest>, RegistryError> {
        if let Some(guest) = self.known.pin().get(id) {
            return Ok(guest.clone());
        }
        self.candidate
            .pin()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get_known(&self, id: &str) -> Result<Arc<Guest>, RegistryError> {
        self.known
            .pin()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<Arc<Guest>, RegistryError> {
        let _membership = self.membership.lock().await;
        let removed = self
            .known
            .pin()
            .remove(id)
            .cloned()
            .or_else(|| self.unknown.pin().remove(id).cloned());

        match removed {
            Some(guest) => {
                self.release_vnc_port(id);
                debug!(guest_id = id, "guest removed");
                Ok(guest)
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Candidate to known.
    pub async fn import(&self, id: &str) -> bool {
        let _membership = self.membership.lock().await;
        let Some(guest) = self.candidate.pin().remove(id).cloned() else {
            return false;
        };
        self.known.pin().insert(id.to_string(), guest);
        true
    }

    /// Candidate to unknown, queued for a follow-up check.
    pub async fn mark_unknown(&self, id: &str) -> bool {
        let _membership = self.membership.lock().await;
        let Some(guest) = self.candidate.pin().remove(id).cloned() else {
            return false;
        };
        self.unknown.pin().insert(id.to_string(), guest);
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.push(id.to_string());
        }
        true
    }

    pub fn take_dirty(&self) -> Vec<String> {
        self.dirty
            .lock()
            .map(|mut d| std::mem::take(&mut *d))
            .unwrap_or_default()
    }

    pub fn dirty(&self) -> Vec<String> {
        self.dirty.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.known.pin().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn candidate_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.candidate.pin().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn unknown_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.unknown.pin().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn known_guests(&self) -> Vec<Arc<Guest>> {
        self.known.pin().values().cloned().collect()
    }

    pub fn candidate_guests(&self) -> Vec<Arc<Guest>> {
        self.candidate.pin().values().cloned().collect()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub(crate) fn set_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    /// Picks the next free VNC port after the last one handed out, skipping
    /// ports held by guests or bound by anything else on the host. The
    /// monitor port at the same offset has to be free too.
    pub fn free_vnc_port(&self, guest_id: &str) -> Result<u16, RegistryError> {
        self.pick_vnc_port(guest_id, is_tcp_port_used)
    }

    fn pick_vnc_port(
        &self,
        guest_id: &str,
        port_used: impl Fn(&str, u16) -> bool,
    ) -> Result<u16, RegistryError> {
        let mut vnc = match self.vnc.lock() {
            Ok(vnc) => vnc,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(port) = vnc.in_use.get(guest_id) {
            return Ok(*port);
        }

        let mut offset = vnc.last.saturating_add(1);
        for _ in 0..VNC_PORT_WRAP {
            if offset > VNC_PORT_WRAP {
                offset = 1;
            }
            let port = VNC_PORT_BASE + offset;
            let held = vnc.in_use.values().any(|p| *p == port);
            if !held
                && !port_used("0.0.0.0", port)
                && !port_used("127.0.0.1", MONITOR_PORT_BASE + offset)
            {
                vnc.last = if offset >= VNC_PORT_WRAP { 0 } else { offset };
                vnc.in_use.insert(guest_id.to_string(), port);
                return Ok(port);
            }
            offset += 1;
        }

        warn!(guest_id, "every vnc port offset is taken");
        Err(RegistryError::NoFreeVncPort)
    }

    pub fn record_vnc_port(&self, guest_id: &str, port: u16) {
        if let Ok(mut vnc) = self.vnc.lock() {
            vnc.in_use.insert(guest_id.to_string(), port);
        }
    }

    pub fn release_vnc_port(&self, guest_id: &str) {
        if let Ok(mut vnc) = self.vnc.lock() {
            vnc.in_use.remove(guest_id);
        }
    }

    /// Loads every instance directory holding a descriptor as a candidate,
    /// with its state taken from a liveness probe.
    pub async fn load_from_disk(&self) -> Result<usize> {
        let Some(root) = self.servers_path.clone() else {
            return Ok(0);
        };
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create {}", root.display()))?;

        let mut entries = tokio::fs::read_dir(&root)
            .await
            .with_context(|| format!("read {}", root.display()))?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_instance_id(&name) || !entry.file_type().await?.is_dir() {
                continue;
            }

            let desc_path = entry.path().join(DESCRIPTOR_FILE_NAME);
            if !desc_path.exists() {
                debug!(guest_id = %name, "no descriptor, skipping");
                continue;
            }

            let desc = match GuestDescriptor::load(&desc_path).await {
                Ok(desc) => desc,
                Err(e) => {
                    warn!(guest_id = %name, error = %e, "unreadable descriptor, skipping");
                    continue;
                }
            };

            let guest = Guest::new(&name, entry.path(), self.hypervisor.clone());
            let alive = self.hypervisor.probe(&name).await;
            {
                let mut guard = guest.lock().await;
                if let Some(port) = desc.vnc_port {
                    self.record_vnc_port(&name, port);
                }
                guard.state_mut().descriptor = Some(desc);
                guard.transition(if alive {
                    RuntimeState::Running
                } else {
                    RuntimeState::Stopped
                });
            }

            let _membership = self.membership.lock().await;
            if self.contains(&name) {
                continue;
            }
            self.candidate.pin().insert(name.clone(), guest);
            loaded += 1;
            debug!(guest_id = %name, alive, "candidate discovered");
        }

        info!(count = loaded, "guests discovered on disk");
        Ok(loaded)
    }

    /// Loads local guests and starts reconciling them. Runs once; the signal
    /// resolves after orphan follow-ups have been dispatched.
    pub async fn bootstrap(&self, reconciler: Arc<Reconciler>) -> Result<BootstrapSignal, RegistryError> {
        if self.servers_path.is_none() {
            return Err(RegistryError::NoStorageDir);
        }
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::AlreadyBootstrapped);
        }

        let count = self
            .load_from_disk()
            .await
            .map_err(|e| RegistryError::Load(format!("{e:#}")))?;

        let (signal, notifier) = BootstrapSignal::new();
        if count == 0 {
            tokio::spawn(async move {
                let result = reconciler.on_load_complete().await;
                notifier.fire(result);
            });
        } else {
            tokio::spawn(async move {
                let result = reconciler.run().await;
                notifier.fire(result);
            });
        }

        Ok(signal)
    }
}

/// First port above `base` that nothing on the host is bound to.
pub fn free_port_by_base(base: u16) -> u16 {
    let mut port = base.saturating_add(1);
    while port < u16::MAX && is_tcp_port_used("0.0.0.0", port) {
        port += 1;
    }
    port
}

fn is_tcp_port_used(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_err()
}
