//! Process host seam and the default child-process implementation.
//!
//! The master never spawns OS processes directly; it asks a
//! [`ProcessHost`] for a connected child. [`ChildProcessHost`] runs the
//! worker binary with piped stdio and frames envelopes as JSON lines.
//! Tests substitute an in-process host that runs a worker runtime on an
//! in-memory channel pair.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use peepsy_proto::{Channel, PeepsyError, StdioChannel, WorkerMode, MAX_CONCURRENCY_ENV};

/// Everything needed to start (and later restart) one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Worker executable.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mode: WorkerMode,
    /// Group the worker joins on spawn.
    pub group: Option<String>,
    /// Concurrency cap forwarded to the worker via `PEEPSY_MAX_CONCURRENCY`.
    pub max_concurrency: Option<usize>,
    /// Exempt this worker from the restart controller.
    pub disable_auto_restart: bool,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            mode: WorkerMode::Sequential,
            group: None,
            max_concurrency: None,
            disable_auto_restart: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn without_auto_restart(mut self) -> Self {
        self.disable_auto_restart = true;
        self
    }
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Kill/wait handle over one spawned child.
#[async_trait]
pub trait ChildControl: Send + Sync {
    /// Forcible termination (SIGKILL-equivalent). Idempotent; succeeding
    /// after the child already exited is fine.
    async fn kill(&self) -> Result<(), PeepsyError>;

    /// Resolve once the child has exited.
    async fn wait(&self) -> ExitInfo;
}

/// A connected, running child as handed back by a host.
pub struct SpawnedChild {
    pub pid: u32,
    pub channel: Arc<dyn Channel>,
    pub control: Arc<dyn ChildControl>,
}

impl std::fmt::Debug for SpawnedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedChild").field("pid", &self.pid).finish()
    }
}

/// Source of worker processes.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    async fn spawn(&self, target: &str, spec: &SpawnSpec) -> Result<SpawnedChild, PeepsyError>;
}

/// Default host: one OS child process per worker, JSON-line envelopes
/// over piped stdin/stdout. The child's stderr passes through for its
/// own logging.
#[derive(Debug, Default)]
pub struct ChildProcessHost;

impl ChildProcessHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessHost for ChildProcessHost {
    async fn spawn(&self, target: &str, spec: &SpawnSpec) -> Result<SpawnedChild, PeepsyError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(max) = spec.max_concurrency {
            command.env(MAX_CONCURRENCY_ENV, max.to_string());
        }

        let mut child = command.spawn().map_err(|e| {
            PeepsyError::process(format!(
                "Failed to spawn {} for target {}: {}",
                spec.program.display(),
                target,
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PeepsyError::process("Child stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PeepsyError::process("Child stdout was not piped"))?;
        let pid = child.id().unwrap_or(0);
        let channel: Arc<dyn Channel> = Arc::new(StdioChannel::new(stdout, stdin));

        // A watcher task owns the Child so kill and wait never contend
        // over it. Kill requests arrive on a channel; the exit status
        // fans out over a watch.
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel(None::<ExitInfo>);
        let watched_target = target.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        debug!("{}: kill after exit: {}", watched_target, e);
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!("{}: wait failed: {}", watched_target, e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        Ok(SpawnedChild {
            pid,
            channel,
            control: Arc::new(ProcessControl { kill_tx, exit_rx }),
        })
    }
}

struct ProcessControl {
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

#[async_trait]
impl ChildControl for ProcessControl {
    async fn kill(&self) -> Result<(), PeepsyError> {
        // A closed channel means the watcher already observed the exit.
        let _ = self.kill_tx.send(()).await;
        Ok(())
    }

    async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = *rx.borrow() {
                return info;
            }
            if rx.changed().await.is_err() {
                return ExitInfo {
                    code: None,
                    signal: None,
                };
            }
        }
    }
}
