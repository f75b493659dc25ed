//! Child-process launching for acpx invocations.
//!
//! The adapter never touches `tokio::process` directly; it goes through the
//! [`ProcessLauncher`] seam so tests can substitute an in-memory fake.
//! [`TokioLauncher`] is the real implementation.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::spawn::ResolvedSpawnCommand;

/// Environment variable injected into every child.
pub const SHELL_MARKER_ENV: &str = "OPENCLAW_SHELL";
/// Fixed value of [`SHELL_MARKER_ENV`].
pub const SHELL_MARKER_VALUE: &str = "acp";

/// Grace period between SIGTERM and a hard kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A resolved invocation plus the directory to run it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: ResolvedSpawnCommand,
    pub cwd: PathBuf,
}

/// Normalized outcome of a child process.
///
/// Exactly one of "exited" (`code`/`signal`) or `error` describes the end.
#[derive(Debug, Clone, Default)]
pub struct SpawnExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<Arc<io::Error>>,
}

impl SpawnExit {
    pub fn failed(err: io::Error) -> Self {
        Self {
            code: None,
            signal: None,
            error: Some(Arc::new(err)),
        }
    }

    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
            error: None,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
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
            error: None,
        }
    }

    /// `true` for a clean, zero exit.
    pub fn success(&self) -> bool {
        self.error.is_none() && self.code.unwrap_or(0) == 0 && self.signal.is_none()
    }
}

/// Control over a running child.
#[async_trait]
pub trait ChildHandle: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Wait for the child to end. The first outcome observed is kept; later
    /// calls return it unchanged.
    async fn wait(&mut self) -> SpawnExit;

    /// Ask the child to stop, forcing it after a short grace period.
    async fn terminate(&mut self);
}

/// A freshly spawned child with its three standard streams.
pub struct SpawnedProcess {
    /// `None` once closed; dropping it sends EOF.
    pub stdin: Option<BoxedWriter>,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub child: Box<dyn ChildHandle>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.child.id())
            .field("stdin_open", &self.stdin.is_some())
            .finish()
    }
}

/// Spawns children for the adapter.
pub trait ProcessLauncher: Send + Sync {
    /// Start the process described by `request`.
    ///
    /// Implementations must merge [`SHELL_MARKER_ENV`]=[`SHELL_MARKER_VALUE`]
    /// over the inherited environment.
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess>;
}

// Compile-time assertion: both seams must be usable as trait objects.
const _: () = {
    fn _assert_object_safe(_: &dyn ProcessLauncher, _: &dyn ChildHandle) {}
};

/// Launches real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let resolved = &request.command;
        let mut cmd = Command::new(&resolved.command);
        cmd.args(&resolved.args)
            .current_dir(&request.cwd)
            .env(SHELL_MARKER_ENV, SHELL_MARKER_VALUE)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        if resolved.windows_hide {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn()?;
        debug!(
            command = %resolved.command,
            pid = ?child.id(),
            cwd = %request.cwd.display(),
            "spawned acpx child"
        );

        let stdin = child.stdin.take().map(|s| Box::pin(s) as BoxedWriter);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

        Ok(SpawnedProcess {
            stdin,
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            child: Box::new(TokioChild {
                child,
                settled: None,
            }),
        })
    }
}

struct TokioChild {
    child: tokio::process::Child,
    settled: Option<SpawnExit>,
}

#[async_trait]
impl ChildHandle for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> SpawnExit {
        if let Some(exit) = &self.settled {
            return exit.clone();
        }
        let exit = match self.child.wait().await {
            Ok(status) => SpawnExit::from_status(status),
            Err(e) => SpawnExit::failed(e),
        };
        self.settled = Some(exit.clone());
        exit
    }

    async fn terminate(&mut self) {
        if self.settled.is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.child.id(), "acpx child exited after SIGTERM");
                self.settled = Some(SpawnExit::from_status(status));
            }
            _ => {
                debug!(pid = ?self.child.id(), "acpx child ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Fully buffered result of a single-shot invocation.
#[derive(Debug, Clone, Default)]
pub struct CollectedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<Arc<io::Error>>,
}

/// Run a child to completion with stdin closed, buffering both streams.
///
/// A spawn failure is reported through [`CollectedOutput::error`] rather
/// than returned, mirroring how a running child reports failure.
pub async fn collect(launcher: &dyn ProcessLauncher, request: &SpawnRequest) -> CollectedOutput {
    let process = match launcher.spawn(request) {
        Ok(process) => process,
        Err(err) => {
            return CollectedOutput {
                error: Some(Arc::new(err)),
                ..Default::default()
            };
        }
    };

    let SpawnedProcess {
        stdin,
        mut stdout,
        mut stderr,
        mut child,
    } = process;
    drop(stdin);

    // Drain both pipes while waiting so a chatty child cannot fill a pipe
    // buffer and deadlock.
    let read_stdout = async {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.ok();
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await.ok();
        String::from_utf8_lossy(&buf).into_owned()
    };

    let (exit, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
    CollectedOutput {
        stdout,
        stderr,
        exit_code: exit.code,
        signal: exit.signal,
        error: exit.error,
    }
}

/// Why a spawn failed, when the cause is recognisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The executable does not exist.
    MissingCommand,
    /// The working directory does not exist.
    MissingCwd,
}

/// Disambiguate an ENOENT-class failure.
///
/// The OS reports a missing executable and a missing working directory the
/// same way; only the former says anything about backend health.
pub fn classify_spawn_failure(err: &io::Error, cwd: &Path) -> Option<SpawnFailure> {
    if err.kind() != io::ErrorKind::NotFound {
        return None;
    }
    if !cwd.as_os_str().is_empty() && cwd.exists() {
        Some(SpawnFailure::MissingCommand)
    } else {
        Some(SpawnFailure::MissingCwd)
    }
}
