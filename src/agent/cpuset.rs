use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    agent::{guest::RuntimeState, registry::Registry},
    constants::PID_FILE_NAME,
    machinery::store::{Key, PartialKey, Store},
};

const COLLECTION: &str = "cpuset";
const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PARENT_SLICE: &str = "keel.slice";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuAssignment {
    pub guest_id: String,
    pub cores: Vec<u32>,
    /// Pinned by an operator; the balancer leaves it alone.
    #[serde(default)]
    pub manual: bool,
}

fn key(guest_id: &str) -> Key<CpuAssignment> {
    Key::new(COLLECTION, guest_id)
}

/// Puts a guest's vCPU threads on a set of host cores.
#[async_trait]
pub trait CpuApplier: Send + Sync {
    async fn apply(&self, guest_id: &str, cores: &[u32]) -> Result<()>;

    async fn release(&self, guest_id: &str) -> Result<()>;
}

/// cgroup v2 cpuset per guest under `keel.slice`. Best effort: hosts
/// without cgroup v2 just run unpinned.
pub struct CgroupApplier {
    root: PathBuf,
    servers_path: PathBuf,
}

impl CgroupApplier {
    pub fn new(servers_path: impl Into<PathBuf>) -> Self {
        Self {
            root: Path::new(CGROUP_ROOT).join(PARENT_SLICE),
            servers_path: servers_path.into(),
        }
    }

    fn scope_path(&self, guest_id: &str) -> PathBuf {
        self.root.join(format!("keel-{guest_id}.scope"))
    }
}

/// Keeps bookkeeping only, for hosts where cgroups are managed elsewhere.
pub struct NoopApplier;

#[async_trait]
impl CpuApplier for NoopApplier {
    async fn apply(&self, _guest_id: &str, _cores: &[u32]) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _guest_id: &str) -> Result<()> {
        Ok(())
    }
}

async fn is_cgroup_v2_available() -> bool {
    fs::metadata(Path::new(CGROUP_ROOT).join("cgroup.controllers"))
        .await
        .is_ok()
}

fn cpu_list(cores: &[u32]) -> String {
    cores
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl CpuApplier for CgroupApplier {
    async fn apply(&self, guest_id: &str, cores: &[u32]) -> Result<()> {
        if !is_cgroup_v2_available().await {
            debug!(guest_id, "cgroup v2 not available, skipping cpuset");
            return Ok(());
        }

        let path = self.scope_path(guest_id);
        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        fs::write(path.join("cpuset.cpus"), cpu_list(cores))
            .await
            .context("write cpuset.cpus")?;

        let pid_path = self.servers_path.join(guest_id).join(PID_FILE_NAME);
        match fs::read_to_string(&pid_path).await {
            Ok(pid) => {
                if let Err(e) = fs::write(path.join("cgroup.procs"), pid.trim()).await {
                    warn!(guest_id, error = %e, "failed to move guest into cpuset");
                }
            }
            Err(e) => debug!(guest_id, error = %e, "no pid file, cpuset not attached"),
        }
        Ok(())
    }

    async fn release(&self, guest_id: &str) -> Result<()> {
        let path = self.scope_path(guest_id);
        if !path.exists() {
            return Ok(());
        }
        if let Err(e) = fs::remove_dir(&path).await {
            debug!(guest_id, error = %e, "could not remove cpuset scope");
        }
        Ok(())
    }
}

/// Periodically spreads running guests' vCPUs over host cores.
pub struct CpusetBalancer {
    registry: Arc<Registry>,
    store: Arc<Store>,
    applier: Arc<dyn CpuApplier>,
    host_cores: Vec<u32>,
    interval: Duration,
    enabled: AtomicBool,
    purged: AtomicBool,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CpusetBalancer {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<Store>,
        applier: Arc<dyn CpuApplier>,
        host_cores: Vec<u32>,
        enabled: bool,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            applier,
            host_cores,
            interval,
            enabled: AtomicBool::new(enabled),
            purged: AtomicBool::new(false),
            worker: std::sync::Mutex::new(None),
        })
    }

    pub fn host_cores() -> Vec<u32> {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (0..n as u32).collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.purged.store(false, Ordering::SeqCst);
        }
    }

    pub fn assignment(&self, guest_id: &str) -> Result<Option<CpuAssignment>> {
        self.store.get(&key(guest_id))
    }

    pub fn assignments(&self) -> Result<Vec<CpuAssignment>> {
        self.store
            .list(&PartialKey::<CpuAssignment>::collection(COLLECTION))
    }

    /// Operator pin; excluded from automatic balancing until removed.
    pub async fn set_manual(&self, guest_id: &str, cores: Vec<u32>) -> Result<()> {
        let assignment = CpuAssignment {
            guest_id: guest_id.to_string(),
            cores,
            manual: true,
        };
        self.store.put(&key(guest_id), &assignment)?;
        self.applier.apply(guest_id, &assignment.cores).await
    }

    pub async fn remove_manual(&self, guest_id: &str) -> Result<()> {
        self.release(guest_id).await
    }

    pub async fn release(&self, guest_id: &str) -> Result<()> {
        self.store.delete(&key(guest_id))?;
        self.applier.release(guest_id).await
    }

    /// Drops bookkeeping for guests that are no longer on this host.
    pub async fn purge_stale(&self, known: &[String]) -> Result<usize> {
        let known: HashSet<&str> = known.iter().map(String::as_str).collect();
        let mut purged = 0;
        for assignment in self.assignments()? {
            if known.contains(assignment.guest_id.as_str()) {
                continue;
            }
            self.release(&assignment.guest_id).await?;
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "stale cpu assignments purged");
        }
        Ok(purged)
    }

    /// Drops all bookkeeping, once per disable.
    pub async fn purge_all(&self) -> Result<usize> {
        if self.purged.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let assignments = self.assignments()?;
        for assignment in &assignments {
            if let Err(e) = self.applier.release(&assignment.guest_id).await {
                warn!(guest_id = %assignment.guest_id, error = %e, "failed to release cpuset");
            }
        }
        let purged = self
            .store
            .delete_prefix(&PartialKey::<CpuAssignment>::collection(COLLECTION))?;
        info!(purged, "cpu assignments purged");
        Ok(purged)
    }

    /// One balancing pass over running guests. Automatic assignments of
    /// guests that stopped running are dropped. Returns how many assignments
    /// changed.
    pub async fn rebalance_once(&self) -> Result<usize> {
        let existing: HashMap<String, CpuAssignment> = self
            .assignments()?
            .into_iter()
            .map(|a| (a.guest_id.clone(), a))
            .collect();

        let mut running = Vec::new();
        for guest in self.registry.known_guests() {
            let guard = guest.lock().await;
            if guard.runtime() != RuntimeState::Running {
                continue;
            }
            let Some(desc) = guard.descriptor.as_ref() else {
                continue;
            };
            running.push((guest.id().to_string(), desc.cpu));
        }

        let manual: Vec<CpuAssignment> = existing.values().filter(|a| a.manual).cloned().collect();
        let plan = plan_assignments(&self.host_cores, &running, &manual);

        let changed: Vec<CpuAssignment> = plan
            .into_iter()
            .filter(|a| existing.get(&a.guest_id) != Some(a))
            .collect();
        self.store
            .put_all(changed.iter().map(|a| (key(&a.guest_id), a)))?;

        for assignment in &changed {
            if let Err(e) = self.applier.apply(&assignment.guest_id, &assignment.cores).await {
                warn!(guest_id = %assignment.guest_id, error = %e, "failed to apply cpuset");
            }
        }

        let running_ids: HashSet<&str> = running.iter().map(|(id, _)| id.as_str()).collect();
        let mut dropped = 0;
        for assignment in existing.values() {
            if assignment.manual || running_ids.contains(assignment.guest_id.as_str()) {
                continue;
            }
            self.store.delete(&key(&assignment.guest_id))?;
            if let Err(e) = self.applier.release(&assignment.guest_id).await {
                warn!(guest_id = %assignment.guest_id, error = %e, "failed to release cpuset");
            }
            dropped += 1;
        }

        debug!(guests = running.len(), changed = changed.len(), dropped, "cpuset pass done");
        Ok(changed.len() + dropped)
    }

    async fn tick(self: &Arc<Self>) {
        if !self.is_enabled() {
            if let Err(e) = self.purge_all().await {
                warn!(error = %e, "cpuset purge failed");
            }
            return;
        }

        let this = self.clone();
        match tokio::spawn(async move { this.rebalance_once().await }).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "cpuset pass failed"),
            Err(e) => error!(error = %e, "cpuset pass panicked"),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.tick().await;
            }
        });

        if let Ok(mut slot) = self.worker.lock() {
            if let Some(old) = slot.replace(worker) {
                old.abort();
            }
        }
        info!(interval = ?self.interval, "cpuset balancer started");
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(worker) = slot.take() {
                worker.abort();
            }
        }
    }
}

/// Greedy placement: largest guests first, each onto its least loaded
/// cores. Manual pins count as load and are returned unchanged.
pub fn plan_assignments(
    host_cores: &[u32],
    running: &[(String, u32)],
    manual: &[CpuAssignment],
) -> Vec<CpuAssignment> {
    let mut load: HashMap<u32, u32> = host_cores.iter().map(|c| (*c, 0)).collect();
    let pinned: HashSet<&str> = manual.iter().map(|a| a.guest_id.as_str()).collect();

    for assignment in manual {
        for core in &assignment.cores {
            *load.entry(*core).or_default() += 1;
        }
    }

    let mut guests: Vec<&(String, u32)> = running
        .iter()
        .filter(|(id, _)| !pinned.contains(id.as_str()))
        .collect();
    guests.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut plan: Vec<CpuAssignment> = manual.to_vec();
    for (guest_id, vcpus) in guests {
        let want = (*vcpus as usize).clamp(1, host_cores.len().max(1));
        let mut cores: Vec<u32> = host_cores.to_vec();
        cores.sort_by_key(|c| (load.get(c).copied().unwrap_or_default(), *c));
        cores.truncate(want);
        cores.sort_unstable();

        for core in &cores {
            *load.entry(*core).or_default() += 1;
        }
        plan.push(CpuAssignment {
            guest_id: guest_id.clone(),
            cores,
            manual: false,
        });
    }

    plan
}
