//! Shell processes and the registry that keys them by terminal id.
//!
//! A [`ShellProcess`] outlives the socket that created it: closing the
//! browser tab's socket only detaches, and a later socket with the same
//! terminal id resumes the same process. Processes leave the registry when
//! they exit or are explicitly killed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::ChildKiller;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::pty::{Pty, PtyError, SpawnCommand};

/// Grace period between SIGHUP and SIGKILL during drain.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

const INPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("spawn task failed: {0}")]
    Join(String),

    #[error("terminal {0} was closed while starting")]
    Removed(String),

    #[error("process has exited")]
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    Absent,
    Starting,
    Attached,
    Detached,
}

/// A child running on a PTY, plus the plumbing to talk to it.
pub struct ShellProcess {
    pub terminal_id: String,
    pub cluster_id: String,
    command: String,
    pid: Option<u32>,
    pty: Mutex<Pty>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    size: Mutex<(u16, u16)>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    input_tx: mpsc::Sender<Bytes>,
    output: Arc<Broker>,
    attached: Arc<AtomicUsize>,
    exited: CancellationToken,
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcess")
            .field("terminal_id", &self.terminal_id)
            .field("cluster_id", &self.cluster_id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// RAII guard that decrements the attach count on drop.
pub struct AttachGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

impl ShellProcess {
    /// Spawn `command` on a new PTY and start its I/O threads.
    ///
    /// Blocks on fork/exec; call from the blocking pool.
    pub fn spawn(
        terminal_id: String,
        cluster_id: String,
        command: SpawnCommand,
        rows: u16,
        cols: u16,
    ) -> Result<Self, ProcessError> {
        let mut pty = Pty::spawn(rows, cols, &command)?;
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let killer = pty.clone_killer();
        let child = pty.take_child();
        let pid = pty.pid();

        let exited = CancellationToken::new();
        if let Some(mut child) = child {
            let exited = exited.clone();
            let terminal = terminal_id.clone();
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match child.wait() {
                        Ok(status) => {
                            tracing::debug!(terminal = %terminal, ?status, "shell exited")
                        }
                        Err(e) => tracing::error!(terminal = %terminal, ?e, "error waiting for shell"),
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("child exit monitor task panicked: {:?}", e);
                }
                exited.cancel();
            });
        } else {
            exited.cancel();
        }

        let output = Arc::new(Broker::new());
        let broker = Arc::clone(&output);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Read;
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => broker.publish(Bytes::copy_from_slice(&buf[..n])),
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Write;
                let mut writer = writer;
                while let Some(data) = input_rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        tracing::info!(
            terminal = %terminal_id,
            cluster = %cluster_id,
            pid = ?pid,
            command = %command.display(),
            "shell started"
        );

        Ok(Self {
            terminal_id,
            cluster_id,
            command: command.display(),
            pid,
            pty: Mutex::new(pty),
            killer: Mutex::new(killer),
            size: Mutex::new((rows, cols)),
            cwd: command.cwd,
            env: command.env,
            input_tx,
            output,
            attached: Arc::new(AtomicUsize::new(0)),
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Current `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        self.pty.lock().resize(rows, cols)?;
        *self.size.lock() = (rows, cols);
        Ok(())
    }

    /// Queue bytes for the PTY. Order is preserved.
    pub async fn write(&self, data: Bytes) -> Result<(), ProcessError> {
        self.input_tx.send(data).await.map_err(|_| ProcessError::Exited)
    }

    /// Output produced so far plus a live receiver.
    pub fn subscribe(&self) -> (Bytes, broadcast::Receiver<Bytes>) {
        self.output.subscribe()
    }

    pub fn attach(&self) -> AttachGuard {
        self.attached.fetch_add(1, Ordering::AcqRel);
        AttachGuard {
            counter: Arc::clone(&self.attached),
        }
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Fires once the child has exited.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Ask the shell's process group to hang up.
    pub fn hangup(&self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGHUP);
        #[cfg(not(unix))]
        self.kill();
    }

    /// Kill the child and, on Unix, everything in its process group.
    pub fn kill(&self) {
        if self.has_exited() {
            tracing::debug!(terminal = %self.terminal_id, "shell already exited, skipping kill");
            return;
        }
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        if let Some(killer) = self.killer.lock().as_mut() {
            if let Err(e) = killer.kill() {
                tracing::debug!(terminal = %self.terminal_id, %e, "kill failed");
            }
        }
    }

    /// portable_pty calls setsid() when spawning, so the child leads its own
    /// process group and a negative pid reaches everything it started.
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else { return };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        if self.has_exited() {
            return;
        }
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

type Slot = Arc<OnceCell<Arc<ShellProcess>>>;

/// `terminalId -> ShellProcess`, with atomic get-or-spawn.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the process for `terminal_id`, spawning it with `spawn` if
    /// there is none.
    ///
    /// Concurrent callers with the same id share a single spawn. The boolean
    /// is `true` when an existing process was returned (a resume). On spawn
    /// failure the entry is removed so a later call can retry.
    pub async fn get_or_spawn<F>(
        &self,
        terminal_id: &str,
        spawn: F,
    ) -> Result<(Arc<ShellProcess>, bool), ProcessError>
    where
        F: FnOnce() -> Result<ShellProcess, ProcessError> + Send + 'static,
    {
        let slot: Slot = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(terminal_id.to_string()).or_default())
        };

        let spawned = AtomicBool::new(false);
        let result = slot
            .get_or_try_init(|| async {
                spawned.store(true, Ordering::Relaxed);
                let process = tokio::task::spawn_blocking(spawn)
                    .await
                    .map_err(|e| ProcessError::Join(e.to_string()))??;
                Ok::<_, ProcessError>(Arc::new(process))
            })
            .await
            .map(Arc::clone);
        let spawned = spawned.load(Ordering::Relaxed);

        match result {
            Ok(process) if spawned => {
                if !self.holds_slot(terminal_id, &slot) {
                    tracing::info!(terminal = %terminal_id, "terminal closed while starting, killing shell");
                    process.kill();
                    return Err(ProcessError::Removed(terminal_id.to_string()));
                }
                self.monitor_exit(terminal_id.to_string(), &process);
                Ok((process, false))
            }
            Ok(process) => Ok((process, true)),
            Err(e) => {
                if spawned {
                    let mut map = self.inner.lock();
                    if map.get(terminal_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                        map.remove(terminal_id);
                    }
                }
                Err(e)
            }
        }
    }

    fn holds_slot(&self, terminal_id: &str, slot: &Slot) -> bool {
        self.inner
            .lock()
            .get(terminal_id)
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Deregister the process when its child exits, if the id still maps to it.
    fn monitor_exit(&self, terminal_id: String, process: &Arc<ShellProcess>) {
        let registry = self.clone();
        let exited = process.exited();
        let identity = Arc::downgrade(process);
        tokio::spawn(async move {
            exited.cancelled().await;
            if registry.remove_if_same(&terminal_id, &identity) {
                tracing::info!(terminal = %terminal_id, "shell exited, deregistered");
            }
        });
    }

    fn remove_if_same(&self, terminal_id: &str, identity: &Weak<ShellProcess>) -> bool {
        let mut map = self.inner.lock();
        let same = map
            .get(terminal_id)
            .and_then(|slot| slot.get())
            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), identity.as_ptr()));
        if same {
            map.remove(terminal_id);
        }
        same
    }

    pub fn get(&self, terminal_id: &str) -> Option<Arc<ShellProcess>> {
        self.inner
            .lock()
            .get(terminal_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn state(&self, terminal_id: &str) -> ShellState {
        match self.inner.lock().get(terminal_id).map(|slot| slot.get().cloned()) {
            None => ShellState::Absent,
            Some(None) => ShellState::Starting,
            Some(Some(p)) if p.attached() > 0 => ShellState::Attached,
            Some(Some(_)) => ShellState::Detached,
        }
    }

    /// Kill and deregister. Returns `false` if nothing was registered.
    ///
    /// A process still starting is killed by its spawner once the spawn
    /// finishes and finds its entry gone.
    pub fn kill(&self, terminal_id: &str) -> bool {
        let slot = self.inner.lock().remove(terminal_id);
        match slot {
            Some(slot) => {
                if let Some(process) = slot.get() {
                    tracing::info!(terminal = %terminal_id, "killing shell");
                    process.kill();
                }
                true
            }
            None => false,
        }
    }

    /// Kill `process`, deregistering it only if its id still maps to it.
    pub fn kill_process(&self, process: &Arc<ShellProcess>) -> bool {
        let removed = self.remove_if_same(&process.terminal_id, &Arc::downgrade(process));
        process.kill();
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove every process: SIGHUP now, SIGKILL after a grace period.
    ///
    /// Returns a handle for the escalation task, or `None` if the registry
    /// was already empty.
    pub fn drain(&self) -> Option<tokio::task::JoinHandle<()>> {
        let processes: Vec<Arc<ShellProcess>> = {
            let mut map = self.inner.lock();
            map.drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect()
        };
        if processes.is_empty() {
            return None;
        }
        for process in &processes {
            process.hangup();
        }
        Some(tokio::spawn(async move {
            tokio::time::sleep(DRAIN_GRACE).await;
            for process in &processes {
                process.kill();
            }
        }))
    }
}
