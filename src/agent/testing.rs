use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;

use crate::agent::{
    action_log::ActionLogEntry,
    control_plane::{ControlPlane, ControlPlaneError, DirtyServerVerdict, GuestListQuery, TaskReport},
    fetch::BlobFetcher,
    guest::descriptor::{DiskDesc, GuestDescriptor, NicDesc},
    hypervisor::{Hypervisor, LaunchOptions, Monitor, MonitorCommand, MonitorError, MonitorEvent},
    storage::{DiskPrepareContext, Storage, StorageKind},
};

pub fn descriptor(id: &str, disks: &[&str]) -> GuestDescriptor {
    GuestDescriptor {
        uuid: id.to_string(),
        name: format!("vm-{id}"),
        host_id: "host-1".to_string(),
        cpu: 2,
        mem_mb: 2048,
        disks: disks
            .iter()
            .enumerate()
            .map(|(i, disk_id)| DiskDesc {
                disk_id: disk_id.to_string(),
                index: i as u32,
                path: format!("/srv/disks/{disk_id}.qcow2"),
                size_mb: 10240,
                storage_id: "local".to_string(),
                storage_kind: StorageKind::Local,
                backing_file: None,
                template_id: None,
            })
            .collect(),
        nics: vec![NicDesc {
            mac: "00:22:aa:00:00:01".to_string(),
            ip: "10.0.0.2".to_string(),
            bridge: "br0".to_string(),
            ifname: format!("vnic-{id}"),
            net_id: Some("net-1".to_string()),
            vpc: true,
        }],
        vnc_port: None,
        extra: Map::new(),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct HypervisorScript {
    alive: HashSet<String>,
    launches: Vec<(String, LaunchOptions)>,
    terminated: Vec<String>,
    commands: HashMap<String, Vec<MonitorCommand>>,
    monitors: HashMap<String, Arc<FakeMonitor>>,
    failing: Vec<String>,
    status: HashMap<String, String>,
    block_jobs: HashMap<String, Vec<Value>>,
    migrate_replies: VecDeque<Value>,
    fail_connect: bool,
    fail_launch: bool,
    ignore_powerdown: bool,
}

/// Records everything and answers the control channel from a script.
#[derive(Default, Clone)]
pub struct FakeHypervisor {
    script: Arc<Mutex<HypervisorScript>>,
    connects: Arc<AtomicUsize>,
}

impl FakeHypervisor {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Latest channel opened for the guest.
    pub fn monitor(&self, guest_id: &str) -> Arc<FakeMonitor> {
        match lock(&self.script).monitors.get(guest_id) {
            Some(m) => m.clone(),
            None => panic!("no monitor opened for {guest_id}"),
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.script).fail_connect = fail;
    }

    pub fn fail_launch(&self, fail: bool) {
        lock(&self.script).fail_launch = fail;
    }

    /// Commands whose debug form starts with `prefix` fail.
    pub fn fail_command(&self, prefix: &str) {
        lock(&self.script).failing.push(prefix.to_string());
    }

    /// Guests keep running after a powerdown request.
    pub fn ignore_powerdown(&self, ignore: bool) {
        lock(&self.script).ignore_powerdown = ignore;
    }

    pub fn set_alive(&self, guest_id: &str, alive: bool) {
        let mut script = lock(&self.script);
        if alive {
            script.alive.insert(guest_id.to_string());
        } else {
            script.alive.remove(guest_id);
        }
    }

    pub fn set_status(&self, guest_id: &str, status: &str) {
        lock(&self.script)
            .status
            .insert(guest_id.to_string(), status.to_string());
    }

    pub fn set_block_jobs(&self, guest_id: &str, jobs: Vec<Value>) {
        lock(&self.script).block_jobs.insert(guest_id.to_string(), jobs);
    }

    pub fn push_migrate_reply(&self, reply: Value) {
        lock(&self.script).migrate_replies.push_back(reply);
    }

    pub fn commands(&self, guest_id: &str) -> Vec<MonitorCommand> {
        lock(&self.script)
            .commands
            .get(guest_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn launches(&self) -> Vec<(String, LaunchOptions)> {
        lock(&self.script).launches.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        lock(&self.script).terminated.clone()
    }

    fn answer(&self, guest_id: &str, command: &MonitorCommand) -> Result<Value, MonitorError> {
        let mut script = lock(&self.script);
        script
            .commands
            .entry(guest_id.to_string())
            .or_default()
            .push(command.clone());

        let debug = format!("{command:?}");
        if script.failing.iter().any(|p| debug.starts_with(p.as_str())) {
            return Err(MonitorError::Command {
                class: "GenericError".to_string(),
                desc: format!("{debug} refused"),
            });
        }

        Ok(match command {
            MonitorCommand::QueryStatus => {
                let status = script
                    .status
                    .get(guest_id)
                    .cloned()
                    .unwrap_or_else(|| "running".to_string());
                json!({ "status": status })
            }
            MonitorCommand::QueryBlockJobs => {
                Value::Array(script.block_jobs.get(guest_id).cloned().unwrap_or_default())
            }
            MonitorCommand::QueryMigrate => script
                .migrate_replies
                .pop_front()
                .unwrap_or_else(|| json!({ "status": "completed" })),
            MonitorCommand::Quit => {
                script.alive.remove(guest_id);
                json!({})
            }
            MonitorCommand::Powerdown => {
                if !script.ignore_powerdown {
                    script.alive.remove(guest_id);
                }
                json!({})
            }
            MonitorCommand::Human(cmd) => json!(format!("ok: {cmd}")),
            _ => json!({}),
        })
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn probe(&self, guest_id: &str) -> bool {
        lock(&self.script).alive.contains(guest_id)
    }

    async fn launch(&self, guest_id: &str, _desc: &GuestDescriptor, opts: &LaunchOptions) -> Result<()> {
        let mut script = lock(&self.script);
        if script.fail_launch {
            bail!("launch refused");
        }
        script.launches.push((guest_id.to_string(), opts.clone()));
        script.alive.insert(guest_id.to_string());
        Ok(())
    }

    async fn connect(&self, guest_id: &str) -> Result<Arc<dyn Monitor>, MonitorError> {
        if lock(&self.script).fail_connect {
            return Err(MonitorError::Io("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (events, _) = broadcast::channel(16);
        let monitor = Arc::new(FakeMonitor {
            guest_id: guest_id.to_string(),
            hypervisor: self.clone(),
            events,
            closed: AtomicBool::new(false),
        });
        lock(&self.script)
            .monitors
            .insert(guest_id.to_string(), monitor.clone());
        Ok(monitor)
    }

    async fn terminate(&self, guest_id: &str) -> Result<()> {
        let mut script = lock(&self.script);
        script.alive.remove(guest_id);
        script.terminated.push(guest_id.to_string());
        Ok(())
    }
}

pub struct FakeMonitor {
    guest_id: String,
    hypervisor: FakeHypervisor,
    events: broadcast::Sender<MonitorEvent>,
    closed: AtomicBool,
}

impl FakeMonitor {
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn execute(&self, command: MonitorCommand) -> Result<Value, MonitorError> {
        if self.is_closed() {
            return Err(MonitorError::Disconnected);
        }
        self.hypervisor.answer(&self.guest_id, &command)
    }

    fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ControlPlaneScript {
    list_replies: VecDeque<Result<Vec<String>, ControlPlaneError>>,
    queries: Vec<GuestListQuery>,
    online: usize,
    fail_online: bool,
    unknown: HashSet<String>,
    dirty_checks: Vec<String>,
    reports: Vec<TaskReport>,
    statuses: Vec<(String, String)>,
    actions: Vec<ActionLogEntry>,
    progress: Vec<(String, f32)>,
}

#[derive(Default)]
pub struct FakeControlPlane {
    script: Mutex<ControlPlaneScript>,
}

impl FakeControlPlane {
    /// Queues the answer to the next list query. With nothing queued the
    /// control plane claims no guests.
    pub fn push_list(&self, reply: Result<Vec<&str>, ControlPlaneError>) {
        lock(&self.script)
            .list_replies
            .push_back(reply.map(|ids| ids.into_iter().map(str::to_string).collect()));
    }

    pub fn fail_online(&self, fail: bool) {
        lock(&self.script).fail_online = fail;
    }

    pub fn mark_unknown(&self, guest_id: &str) {
        lock(&self.script).unknown.insert(guest_id.to_string());
    }

    pub fn queries(&self) -> Vec<GuestListQuery> {
        lock(&self.script).queries.clone()
    }

    pub fn online_calls(&self) -> usize {
        lock(&self.script).online
    }

    pub fn dirty_checks(&self) -> Vec<String> {
        lock(&self.script).dirty_checks.clone()
    }

    pub fn reports(&self) -> Vec<TaskReport> {
        lock(&self.script).reports.clone()
    }

    pub fn statuses(&self) -> Vec<(String, String)> {
        lock(&self.script).statuses.clone()
    }

    pub fn actions(&self) -> Vec<ActionLogEntry> {
        lock(&self.script).actions.clone()
    }

    pub fn progress(&self) -> Vec<(String, f32)> {
        lock(&self.script).progress.clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_guests(&self, query: &GuestListQuery) -> Result<Vec<String>, ControlPlaneError> {
        let mut script = lock(&self.script);
        script.queries.push(query.clone());
        let reply = script.list_replies.pop_front().unwrap_or_else(|| Ok(Vec::new()))?;
        Ok(reply.into_iter().filter(|id| query.ids.contains(id)).collect())
    }

    async fn put_host_online(&self, _host_id: &str) -> Result<(), ControlPlaneError> {
        let mut script = lock(&self.script);
        script.online += 1;
        if script.fail_online {
            return Err(ControlPlaneError::Rejected {
                status: 503,
                message: "host disabled".to_string(),
            });
        }
        Ok(())
    }

    async fn verify_dirty_server(
        &self,
        guest_id: &str,
        _host_id: &str,
    ) -> Result<DirtyServerVerdict, ControlPlaneError> {
        let mut script = lock(&self.script);
        script.dirty_checks.push(guest_id.to_string());
        Ok(DirtyServerVerdict {
            guest_unknown_need_clean: script.unknown.contains(guest_id),
        })
    }

    async fn report_task(&self, report: &TaskReport) -> Result<(), ControlPlaneError> {
        lock(&self.script).reports.push(report.clone());
        Ok(())
    }

    async fn update_status(&self, guest_id: &str, status: &str) -> Result<(), ControlPlaneError> {
        lock(&self.script)
            .statuses
            .push((guest_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn record_action(&self, entry: &ActionLogEntry) -> Result<(), ControlPlaneError> {
        lock(&self.script).actions.push(entry.clone());
        Ok(())
    }

    async fn update_migration_progress(
        &self,
        guest_id: &str,
        progress: f32,
    ) -> Result<(), ControlPlaneError> {
        lock(&self.script)
            .progress
            .push((guest_id.to_string(), progress));
        Ok(())
    }
}

/// Storage that only records calls; `fail_disk` makes one disk's preparation
/// fail.
pub struct FakeStorage {
    id: String,
    kind: StorageKind,
    prepared: Mutex<Vec<(String, usize, usize)>>,
    deleted: Mutex<Vec<(String, String)>>,
    converted: Mutex<Vec<(String, String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeStorage {
    pub fn new(id: &str, kind: StorageKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            prepared: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            converted: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_disk(&self, disk_id: &str) {
        lock(&self.failing).insert(disk_id.to_string());
    }

    /// (disk id, index, total) of every preparation attempt, in order.
    pub fn prepared(&self) -> Vec<(String, usize, usize)> {
        lock(&self.prepared).clone()
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        lock(&self.deleted).clone()
    }

    pub fn converted(&self) -> Vec<(String, String, String)> {
        lock(&self.converted).clone()
    }
}

#[async_trait]
impl Storage for FakeStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn prepare_migrate_destination(&self, ctx: &DiskPrepareContext) -> Result<()> {
        lock(&self.prepared).push((ctx.disk.disk_id.clone(), ctx.index, ctx.total));
        if lock(&self.failing).contains(&ctx.disk.disk_id) {
            bail!("disk {} unavailable", ctx.disk.disk_id);
        }
        Ok(())
    }

    async fn disk_backing_ref(&self, disk: &DiskDesc) -> Result<Option<String>> {
        Ok(match self.kind {
            StorageKind::Local => Some(disk.path.clone()),
            StorageKind::Shared => None,
        })
    }

    fn snapshot_overlay_path(&self, disk: &DiskDesc, snapshot_id: &str) -> String {
        format!("/srv/snapshots/{}/{snapshot_id}.qcow2", disk.disk_id)
    }

    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<()> {
        lock(&self.deleted).push((disk.disk_id.clone(), snapshot_id.to_string()));
        Ok(())
    }

    async fn convert_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, convert_into: &str) -> Result<()> {
        lock(&self.converted).push((
            disk.disk_id.clone(),
            snapshot_id.to_string(),
            convert_into.to_string(),
        ));
        Ok(())
    }

    async fn clone_disk(&self, _disk: &DiskDesc, target_disk_id: &str) -> Result<String> {
        Ok(format!("/srv/disks/{target_disk_id}.qcow2"))
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    fetched: Mutex<Vec<(String, PathBuf)>>,
    fail: AtomicBool,
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakeFetcher {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every fetch takes `delay` before it answers.
    pub fn delay(&self, delay: std::time::Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn fetched(&self) -> Vec<(String, PathBuf)> {
        lock(&self.fetched).clone()
    }
}

#[async_trait]
impl BlobFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        lock(&self.fetched).push((url.to_string(), dest.to_path_buf()));
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("source refused {url}");
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, b"mem").await?;
        Ok(3)
    }
}

/// Binds a forwarding daemon on `path` that keeps forwards in memory and
/// hands out bind ports from 20000. Returns every call it received.
pub fn serve_fake_forwarder(path: &Path) -> Arc<Mutex<Vec<Value>>> {
    use crate::agent::forward::Forward;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let listener = tokio::net::UnixListener::bind(path).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = seen.clone();

    tokio::spawn(async move {
        let mut forwards: Vec<Forward> = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let Ok(Some(line)) = lines.next_line().await else {
                continue;
            };
            let call: Value = serde_json::from_str(&line).unwrap();
            lock(&calls).push(call.clone());
            let params = &call["params"];

            let reply = match call["method"].as_str().unwrap() {
                "open" => {
                    let fwd = Forward {
                        proto: serde_json::from_value(params["proto"].clone()).unwrap(),
                        bind_addr: params["bind_addr"].as_str().unwrap().to_string(),
                        bind_port: 20000 + forwards.len() as u16,
                        remote_addr: params["remote_addr"].as_str().unwrap().to_string(),
                        remote_port: params["remote_port"].as_u64().unwrap() as u16,
                    };
                    forwards.push(fwd.clone());
                    json!({ "result": fwd })
                }
                "close" => {
                    let port = params["bind_port"].as_u64().unwrap() as u16;
                    match forwards.iter().position(|f| f.bind_port == port) {
                        Some(i) => json!({ "result": forwards.remove(i) }),
                        None => json!({ "error": { "code": "not_found", "message": format!("port {port}") } }),
                    }
                }
                "list_by_remote" => {
                    let addr = params["remote_addr"].as_str();
                    let matching: Vec<_> = forwards
                        .iter()
                        .filter(|f| addr.is_none_or(|a| f.remote_addr == a))
                        .cloned()
                        .collect();
                    json!({ "result": { "forwards": matching } })
                }
                "list" => json!({ "result": { "forwards": forwards } }),
                other => json!({ "error": { "code": "bad_method", "message": other } }),
            };

            let mut out = reply.to_string();
            out.push('\n');
            let _ = write.write_all(out.as_bytes()).await;
        }
    });

    seen
}

/// An agent wired to fakes, with a `local` and a `shared` storage backend.
pub struct TestAgent {
    pub agent: Arc<crate::agent::Agent>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub control_plane: Arc<FakeControlPlane>,
    pub local: Arc<FakeStorage>,
    pub shared: Arc<FakeStorage>,
    pub fetcher: Arc<FakeFetcher>,
    pub dir: tempfile::TempDir,
}

impl TestAgent {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut crate::agent::AgentConfig)) -> Self {
        use crate::agent::{AgentConfig, Collaborators, MigrationSettings, cpuset::NoopApplier, storage::StorageManager};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig {
            host_id: "host-1".to_string(),
            master_ip: "192.168.1.10".to_string(),
            servers_path: Some(dir.path().join("servers")),
            memory_snapshots_path: dir.path().join("memory"),
            store_path: dir.path().join("store"),
            store_size_mib: 16,
            sdn_socket_path: dir.path().join("sdn.sock"),
            enable_cpu_binding: true,
            host_cores: vec![0, 1, 2, 3],
            cpuset_balance_interval: Duration::from_secs(120),
            reconcile_retry: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(200),
            stop_shared_guests_on_exit: true,
            migration: MigrationSettings {
                expected_rate_mb: 32,
                min_timeout: Duration::from_secs(5),
                precopy_timeout: Duration::from_millis(300),
                precopy_poll: Duration::from_millis(10),
            },
        };
        tweak(&mut config);

        let hypervisor = Arc::new(FakeHypervisor::default());
        let control_plane = Arc::new(FakeControlPlane::default());
        let local = FakeStorage::new("local", StorageKind::Local);
        let shared = FakeStorage::new("shared", StorageKind::Shared);
        let fetcher = Arc::new(FakeFetcher::default());

        let storage = Arc::new(StorageManager::default());
        storage.register(local.clone());
        storage.register(shared.clone());

        let agent = crate::agent::Agent::new(
            config,
            Collaborators {
                hypervisor: hypervisor.clone(),
                control_plane: control_plane.clone(),
                storage,
                fetcher: fetcher.clone(),
                cpu_applier: Arc::new(NoopApplier),
            },
        )
        .await
        .unwrap();

        Self {
            agent,
            hypervisor,
            control_plane,
            local,
            shared,
            fetcher,
            dir,
        }
    }

    /// Creates a guest with `disks` and brings it to `Running`.
    pub async fn running_guest(&self, id: &str, disks: &[&str]) {
        self.agent
            .create_guest(id, Some(descriptor(id, disks)))
            .await
            .unwrap();
        let reply = self.agent.start(id, None).await.unwrap();
        let outcome = reply.task.unwrap().wait().await;
        assert!(outcome.is_success(), "start failed: {outcome:?}");
    }
}
