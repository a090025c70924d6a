use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::agent::{
    action_log::ActionLog,
    control_plane::{ControlPlane, ControlPlaneError, GuestListQuery},
    cpuset::CpusetBalancer,
    hypervisor::Hypervisor,
    registry::Registry,
};

/// The agent cannot serve without this succeeding.
#[derive(Debug, Clone, Error)]
pub enum StartupError {
    #[error("failed to mark host online: {0}")]
    HostOnline(ControlPlaneError),

    #[error("bootstrap worker exited without reporting")]
    Aborted,
}

type SignalValue = Option<Result<(), StartupError>>;

/// Resolves once the registry is loaded and orphan follow-ups are out.
#[derive(Clone, Debug)]
pub struct BootstrapSignal {
    rx: watch::Receiver<SignalValue>,
}

pub(crate) struct BootstrapNotifier {
    tx: watch::Sender<SignalValue>,
}

impl BootstrapSignal {
    pub(crate) fn new() -> (Self, BootstrapNotifier) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, BootstrapNotifier { tx })
    }

    pub fn is_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub async fn wait(mut self) -> Result<(), StartupError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Err(StartupError::Aborted)),
            Err(_) => Err(StartupError::Aborted),
        }
    }
}

impl BootstrapNotifier {
    pub(crate) fn fire(self, result: Result<(), StartupError>) {
        let _ = self.tx.send(Some(result));
    }
}

/// Confirms guests found on disk against the control plane after a restart
/// and cleans up the ones it disowns.
pub struct Reconciler {
    registry: Arc<Registry>,
    control_plane: Arc<dyn ControlPlane>,
    hypervisor: Arc<dyn Hypervisor>,
    cpuset: Arc<CpusetBalancer>,
    action_log: Arc<ActionLog>,
    host_id: String,
    retry: Duration,
    followups: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        control_plane: Arc<dyn ControlPlane>,
        hypervisor: Arc<dyn Hypervisor>,
        cpuset: Arc<CpusetBalancer>,
        action_log: Arc<ActionLog>,
        host_id: impl Into<String>,
        retry: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            control_plane,
            hypervisor,
            cpuset,
            action_log,
            host_id: host_id.into(),
            retry,
            followups: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Runs both rounds until they succeed back to back, then finishes the
    /// load. A failed query in either round starts over from round one.
    pub async fn run(self: &Arc<Self>) -> Result<(), StartupError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.rounds().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(attempt, error = %e, retry = ?self.retry, "reconciliation failed, retrying");
                    tokio::time::sleep(self.retry).await;
                }
            }
        }

        self.on_load_complete().await
    }

    async fn rounds(&self) -> Result<(), ControlPlaneError> {
        for pending_delete in [false, true] {
            let ids = self.registry.candidate_ids();
            if ids.is_empty() {
                continue;
            }

            let query = GuestListQuery::for_host(&self.host_id, pending_delete, ids);
            let found = self.control_plane.list_guests(&query).await?;
            info!(pending_delete, asked = query.ids.len(), found = found.len(), "reconciliation round");

            for id in found {
                if self.registry.import(&id).await {
                    info!(guest_id = %id, "guest confirmed");
                }
            }
        }

        for id in self.registry.candidate_ids() {
            if self.registry.mark_unknown(&id).await {
                warn!(guest_id = %id, "guest not known to control plane, marked dirty");
            }
        }
        Ok(())
    }

    /// Announces the host, tidies cpu bookkeeping and dispatches a check for
    /// every dirty guest.
    pub async fn on_load_complete(self: &Arc<Self>) -> Result<(), StartupError> {
        if let Err(e) = self.control_plane.put_host_online(&self.host_id).await {
            error!(host_id = %self.host_id, error = %e, "failed to mark host online");
            return Err(StartupError::HostOnline(e));
        }
        self.registry.set_loaded();
        info!(host_id = %self.host_id, "host online, registry loaded");

        let purged = if self.cpuset.is_enabled() {
            self.cpuset.purge_stale(&self.registry.known_ids()).await
        } else {
            self.cpuset.purge_all().await
        };
        if let Err(e) = purged {
            warn!(error = %e, "cpu bookkeeping purge failed");
        }

        let dirty = self.registry.take_dirty();
        let mut followups = Vec::with_capacity(dirty.len());
        for guest_id in dirty {
            let this = self.clone();
            followups.push(tokio::spawn(async move { this.follow_up(&guest_id).await }));
        }
        if let Ok(mut slot) = self.followups.lock() {
            slot.extend(followups);
        }

        Ok(())
    }

    async fn follow_up(&self, guest_id: &str) {
        let verdict = match self
            .control_plane
            .verify_dirty_server(guest_id, &self.host_id)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(guest_id, error = %e, "dirty server check failed");
                return;
            }
        };

        if !verdict.guest_unknown_need_clean {
            info!(guest_id, "control plane still claims dirty guest, keeping it");
            return;
        }

        let guest = match self.registry.delete(guest_id).await {
            Ok(guest) => guest,
            Err(e) => {
                warn!(guest_id, error = %e, "dirty guest vanished before cleanup");
                return;
            }
        };

        if let Err(e) = self.hypervisor.terminate(guest_id).await {
            warn!(guest_id, error = %e, "failed to stop orphan guest");
        }
        if let Err(e) = tokio::fs::remove_dir_all(guest.dir()).await {
            warn!(guest_id, error = %e, "failed to remove orphan guest dir");
        }
        if let Err(e) = self.cpuset.release(guest_id).await {
            warn!(guest_id, error = %e, "failed to release orphan cpuset");
        }
        if let Err(e) = self.action_log.purge(guest_id) {
            warn!(guest_id, error = %e, "failed to purge orphan action journal");
        }
        info!(guest_id, "orphan guest cleaned");
    }

    /// Waits for dispatched follow-ups. Used on shutdown.
    pub async fn wait_followups(&self) {
        let handles = self
            .followups
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
