// src/process/mod.rs

//! Spawning and supervising a daemon child process.
//!
//! [`spawn_supervised`] starts the binary with piped output and hands back
//! three things: a [`ChildHandle`] used to stop it, a channel of output lines,
//! and a one-shot exit report. The child itself is owned by a supervisor task,
//! which either reports the exit or, when asked, terminates the child
//! gracefully (SIGTERM, then a hard kill after a grace period). The
//! [`Termination`] returned by [`ChildHandle::terminate`] resolves once the
//! child is gone; the runtime must stay alive until then or the child is
//! killed outright.

use crate::errors::ProcessError;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the child was killed by a signal.
    pub code: Option<i32>,
}

/// Control side of a supervised child.
///
/// Dropping the handle without calling [`ChildHandle::terminate`] still
/// terminates the child.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Detach the output readers, then ask the supervisor to stop the child.
    pub fn terminate(mut self) -> Termination {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        Termination {
            supervisor: self.supervisor.take(),
        }
    }
}

/// Pending end of a child whose termination was requested.
///
/// Dropping it does not cancel the termination, it only stops waiting.
#[derive(Debug, Default)]
pub struct Termination {
    supervisor: Option<JoinHandle<()>>,
}

impl Termination {
    /// Wait until the child has exited, at most a little past the grace
    /// period after which the supervisor kills it.
    pub async fn wait(self) {
        let Some(supervisor) = self.supervisor else {
            return;
        };
        match tokio::time::timeout(TERMINATE_GRACE + Duration::from_secs(1), supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Process: supervisor task failed: {}", e),
            Err(_) => warn!("Process: gave up waiting for child to exit"),
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

pub struct Supervised {
    pub handle: ChildHandle,
    pub lines: mpsc::UnboundedReceiver<OutputLine>,
    pub exited: oneshot::Receiver<ExitReport>,
}

/// Spawn `spec` and start forwarding its output.
///
/// Must be called from within a tokio runtime.
pub fn spawn_supervised(spec: &SpawnSpec) -> Result<Supervised, ProcessError> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let pid = child.id();
    debug!("Process: spawned {} (pid {:?})", spec.program.display(), pid);

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, line_tx.clone(), OutputLine::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, line_tx, OutputLine::Stderr)));
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let supervisor = tokio::spawn(supervise(child, shutdown_rx, exit_tx));

    Ok(Supervised {
        handle: ChildHandle {
            pid,
            readers,
            shutdown: Some(shutdown_tx),
            supervisor: Some(supervisor),
        },
        lines: line_rx,
        exited: exit_rx,
    })
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<OutputLine>, wrap: fn(String) -> OutputLine)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).is_err() {
            break;
        }
    }
}

async fn supervise(mut child: Child, shutdown: oneshot::Receiver<()>, exited: oneshot::Sender<ExitReport>) {
    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Process: failed to wait for child: {}", e);
                    None
                }
            };
            let _ = exited.send(ExitReport { code });
        }
        // a dropped handle counts as a shutdown request
        _ = shutdown => terminate(&mut child).await,
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) if kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok() => {
                if let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    debug!("Process: pid {} exited after SIGTERM ({})", pid, status);
                    return;
                }
                warn!("Process: pid {} ignored SIGTERM, killing", pid);
            }
            _ => {}
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Process: failed to kill child: {}", e);
    }
}
