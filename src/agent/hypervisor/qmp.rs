use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf},
    net::UnixStream,
    sync::{Mutex, broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{MirrorSync, Monitor, MonitorCommand, MonitorError, MonitorEvent};
use crate::constants::MIGRATE_TLS_HOSTNAME;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_BACKOFF: Duration = Duration::from_secs(2);
const MIGRATE_TLS_ID: &str = "migtls0";

#[derive(Debug, Serialize)]
struct QmpRequest<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QmpMessage {
    Return {
        #[serde(rename = "return")]
        ret: Value,
    },
    Error {
        error: QmpError,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    Greeting {
        #[serde(rename = "QMP")]
        #[allow(dead_code)]
        qmp: Value,
    },
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

type Reply = Result<Value, MonitorError>;

struct Shared {
    pending: std::sync::Mutex<VecDeque<oneshot::Sender<Reply>>>,
    events: broadcast::Sender<MonitorEvent>,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            for waiter in pending.drain(..) {
                let _ = waiter.send(Err(MonitorError::Disconnected));
            }
        }
    }

    fn complete(&self, reply: Reply) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.pop_front());
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => warn!("qmp reply without a pending command"),
        }
    }
}

/// QMP channel shared by every task touching one guest. Replies arrive in
/// request order, so commands are written under one lock and matched FIFO by
/// the reader task; events fan out through a broadcast channel.
pub struct QmpMonitor {
    writer: Mutex<WriteHalf<UnixStream>>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    socket_path: PathBuf,
    command_timeout: Duration,
}

impl QmpMonitor {
    pub async fn connect(socket_path: &Path) -> Result<Self, MonitorError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| MonitorError::Io(format!("{}: {e}", socket_path.display())))?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        let n = reader
            .read_line(&mut greeting)
            .await
            .map_err(|e| MonitorError::Io(e.to_string()))?;
        if n == 0 {
            return Err(MonitorError::Disconnected);
        }
        match serde_json::from_str::<QmpMessage>(greeting.trim()) {
            Ok(QmpMessage::Greeting { .. }) => {}
            _ => return Err(MonitorError::Protocol(format!("bad greeting: {}", greeting.trim()))),
        }
        debug!(socket = %socket_path.display(), "qmp greeting received");

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            pending: std::sync::Mutex::new(VecDeque::new()),
            events,
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(reader, shared.clone()));
        let monitor = Self {
            writer: Mutex::new(write_half),
            shared,
            reader,
            socket_path: socket_path.to_path_buf(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        };

        monitor.raw("qmp_capabilities", None).await?;
        debug!(socket = %socket_path.display(), "qmp capabilities negotiated");

        Ok(monitor)
    }

    /// Connects with exponential backoff while the socket is still being
    /// created by a freshly launched process.
    pub async fn connect_with_retry(
        socket_path: &Path,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Self, MonitorError> {
        let mut last_error = MonitorError::Disconnected;
        for attempt in 0..max_retries {
            match Self::connect(socket_path).await {
                Ok(monitor) => return Ok(monitor),
                Err(e) => {
                    let delay = backoff_delay(retry_delay, attempt);
                    trace!(attempt, delay_ms = delay.as_millis(), error = %e, "qmp connect failed, retrying");
                    last_error = e;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_error)
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn raw(&self, command: &str, arguments: Option<Value>) -> Reply {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::Disconnected);
        }

        let mut line = serde_json::to_string(&QmpRequest {
            execute: command,
            arguments,
        })
        .map_err(|e| MonitorError::Protocol(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            if let Ok(mut pending) = self.shared.pending.lock() {
                pending.push_back(tx);
            }
            trace!(command, "sending qmp command");
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                self.shared.close();
                return Err(MonitorError::Io(e.to_string()));
            }
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(MonitorError::Disconnected),
            Err(_) => {
                warn!(command, timeout = ?self.command_timeout, "qmp command timed out");
                Err(MonitorError::Timeout)
            }
        }
    }
}

impl Drop for QmpMonitor {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: BufReader<tokio::io::ReadHalf<UnixStream>>, shared: Arc<Shared>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let message = match serde_json::from_str::<QmpMessage>(line.trim()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, line = %line.trim(), "unparsable qmp line");
                continue;
            }
        };

        match message {
            QmpMessage::Return { ret } => shared.complete(Ok(ret)),
            QmpMessage::Error { error } => shared.complete(Err(MonitorError::Command {
                class: error.class,
                desc: error.desc,
            })),
            QmpMessage::Event { event, data } => {
                debug!(event, "qmp event");
                let _ = shared.events.send(parse_event(&event, &data));
            }
            QmpMessage::Greeting { .. } => {}
        }
    }

    debug!("qmp socket closed");
    shared.close();
}

fn parse_event(event: &str, data: &Value) -> MonitorEvent {
    let device = data["device"].as_str().unwrap_or_default().to_string();
    match event {
        "BLOCK_JOB_READY" => MonitorEvent::BlockJobReady { device },
        "BLOCK_JOB_COMPLETED" => MonitorEvent::BlockJobCompleted {
            device,
            error: data["error"].as_str().map(str::to_string),
        },
        "BLOCK_JOB_CANCELLED" => MonitorEvent::BlockJobCancelled { device },
        "SHUTDOWN" => MonitorEvent::Shutdown,
        other => MonitorEvent::Other(other.to_string()),
    }
}

/// Maps a command onto the QMP calls implementing it. Most are one call;
/// a few need setup calls first and answer with the last reply.
fn to_qmp(command: &MonitorCommand) -> Vec<(&'static str, Option<Value>)> {
    match command {
        MonitorCommand::Human(line) => vec![(
            "human-monitor-command",
            Some(json!({ "command-line": line })),
        )],
        MonitorCommand::QueryStatus => vec![("query-status", None)],
        MonitorCommand::Pause => vec![("stop", None)],
        MonitorCommand::Resume => vec![("cont", None)],
        MonitorCommand::Powerdown => vec![("system_powerdown", None)],
        MonitorCommand::Quit => vec![("quit", None)],
        MonitorCommand::QueryBlockJobs => vec![("query-block-jobs", None)],
        MonitorCommand::SnapshotBlkdev { drive, overlay } => vec![(
            "blockdev-snapshot-sync",
            Some(json!({ "device": drive, "snapshot-file": overlay, "format": "qcow2" })),
        )],
        MonitorCommand::DriveMirror {
            drive,
            target,
            sync,
        } => vec![(
            "drive-mirror",
            Some(json!({
                "device": drive,
                "target": target,
                "sync": match sync { MirrorSync::Top => "top", MirrorSync::Full => "full" },
                "mode": "existing",
            })),
        )],
        MonitorCommand::BlockJobCancel { drive } => {
            vec![("block-job-cancel", Some(json!({ "device": drive })))]
        }
        MonitorCommand::BlockResize { drive, size_mb } => vec![(
            "block_resize",
            Some(json!({ "device": drive, "size": size_mb * 1024 * 1024 })),
        )],
        MonitorCommand::IoThrottle { drive, bps, iops } => vec![(
            "block_set_io_throttle",
            Some(json!({
                "device": drive,
                "bps": bps, "bps_rd": 0, "bps_wr": 0,
                "iops": iops, "iops_rd": 0, "iops_wr": 0,
            })),
        )],
        MonitorCommand::ReopenDrive { drive, path } => vec![(
            "human-monitor-command",
            Some(json!({ "command-line": format!("change {drive} {path}") })),
        )],
        MonitorCommand::HotplugVcpu { index } => vec![("cpu-add", Some(json!({ "id": index })))],
        MonitorCommand::HotplugMemory { id, size_mb } => vec![
            (
                "object-add",
                Some(json!({
                    "qom-type": "memory-backend-ram",
                    "id": format!("mem-{id}"),
                    "size": size_mb * 1024 * 1024,
                })),
            ),
            (
                "device_add",
                Some(json!({ "driver": "pc-dimm", "id": id, "memdev": format!("mem-{id}") })),
            ),
        ],
        MonitorCommand::Migrate { uri, tls_dir } => {
            let mut calls = Vec::new();
            if let Some(dir) = tls_dir {
                calls.push((
                    "object-add",
                    Some(json!({
                        "qom-type": "tls-creds-x509",
                        "id": MIGRATE_TLS_ID,
                        "dir": dir,
                        "endpoint": "client",
                        "verify-peer": true,
                    })),
                ));
                calls.push((
                    "migrate-set-parameters",
                    Some(json!({
                        "tls-creds": MIGRATE_TLS_ID,
                        "tls-hostname": MIGRATE_TLS_HOSTNAME,
                    })),
                ));
            }
            calls.push(("migrate", Some(json!({ "uri": uri }))));
            calls
        }
        MonitorCommand::QueryMigrate => vec![("query-migrate", None)],
        MonitorCommand::MigrateCancel => vec![("migrate_cancel", None)],
        MonitorCommand::SaveMemory { path } => {
            vec![("migrate", Some(json!({ "uri": format!("file:{path}") })))]
        }
        MonitorCommand::AnnounceSelf => vec![("announce-self", None)],
    }
}

#[async_trait]
impl Monitor for QmpMonitor {
    async fn execute(&self, command: MonitorCommand) -> Result<Value, MonitorError> {
        let mut last = Value::Null;
        for (name, arguments) in to_qmp(&command) {
            last = self.raw(name, arguments).await?;
        }
        Ok(last)
    }

    fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    base.saturating_mul(multiplier).min(MAX_BACKOFF)
}
