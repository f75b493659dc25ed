//! In-memory launcher and logger doubles.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use acpx_runtime::RuntimeLogger;
use acpx_runtime::process::{
    BoxedReader, BoxedWriter, ChildHandle, ProcessLauncher, SpawnExit, SpawnRequest, SpawnedProcess,
};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, DuplexStream};

/// Canned behaviour for one fake spawn.
#[derive(Debug, Clone, Default)]
pub struct FakeResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Fail the spawn itself with this error kind.
    pub spawn_error: Option<io::ErrorKind>,
    /// Keep stdout open after the canned output until terminated.
    pub hold_open: bool,
    /// Close stdout after the canned output but keep running until
    /// terminated.
    pub linger: bool,
}

impl FakeResponse {
    /// Successful exit printing `lines`, one per line.
    pub fn lines(lines: &[&str]) -> Self {
        let mut stdout = lines.join("\n");
        if !stdout.is_empty() {
            stdout.push('\n');
        }
        Self {
            stdout,
            ..Self::default()
        }
    }

    pub fn spawn_error(kind: io::ErrorKind) -> Self {
        Self {
            spawn_error: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn lingering(mut self) -> Self {
        self.linger = true;
        self
    }
}

/// One call to [`FakeLauncher::spawn`].
#[derive(Debug, Clone)]
pub struct RecordedSpawn {
    pub request: SpawnRequest,
    stdin: Arc<Mutex<Vec<u8>>>,
}

impl RecordedSpawn {
    /// Full argv after the program.
    pub fn args(&self) -> &[String] {
        &self.request.command.args
    }

    /// Everything written to the child's stdin so far.
    pub fn stdin_text(&self) -> String {
        let buf = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let args = self.args();
        let idx = args.iter().position(|a| a == flag)?;
        args.get(idx + 1).map(String::as_str)
    }
}

/// [`ProcessLauncher`] that never starts a process.
///
/// Responses are served in push order; once the queue is empty the default
/// response (a clean exit with no output) is used.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    queue: Mutex<VecDeque<FakeResponse>>,
    fallback: FakeResponse,
    spawns: Mutex<Vec<RecordedSpawn>>,
    terminations: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for every spawn not covered by the queue.
    pub fn with_fallback(response: FakeResponse) -> Self {
        Self {
            fallback: response,
            ..Self::default()
        }
    }

    pub fn push(&self, response: FakeResponse) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn spawns(&self) -> Vec<RecordedSpawn> {
        self.spawns.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// How many children were terminated.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let stdin = Arc::new(Mutex::new(Vec::new()));
        self.spawns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedSpawn {
                request: request.clone(),
                stdin: Arc::clone(&stdin),
            });

        let response = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(kind) = response.spawn_error {
            return Err(io::Error::new(kind, "fake spawn failure"));
        }

        let canned = io::Cursor::new(response.stdout.into_bytes());
        let (stdout, hold): (BoxedReader, Option<DuplexStream>) = if response.hold_open {
            let (writer, reader) = tokio::io::duplex(64);
            (Box::pin(canned.chain(reader)) as BoxedReader, Some(writer))
        } else {
            (Box::pin(canned) as BoxedReader, None)
        };

        Ok(SpawnedProcess {
            stdin: Some(Box::pin(RecordingWriter { buf: stdin }) as BoxedWriter),
            stdout,
            stderr: Box::pin(io::Cursor::new(response.stderr.into_bytes())),
            child: Box::new(FakeChild {
                exit: SpawnExit::exited(response.exit_code),
                hold,
                linger: response.linger,
                terminations: Arc::clone(&self.terminations),
            }),
        })
    }
}

struct FakeChild {
    exit: SpawnExit,
    /// Write half of a held-open stdout; dropping it sends EOF.
    hold: Option<DuplexStream>,
    linger: bool,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl ChildHandle for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> SpawnExit {
        if self.hold.is_some() || self.linger {
            std::future::pending::<()>().await;
        }
        self.exit.clone()
    }

    async fn terminate(&mut self) {
        self.linger = false;
        if self.hold.take().is_some() || self.exit.signal.is_none() {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
        self.exit = SpawnExit {
            code: None,
            signal: Some(15),
            error: None,
        };
    }
}

struct RecordingWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Severity of a [`RecordingLogger`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// [`RuntimeLogger`] that keeps every message for later assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    entries: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    /// Debug lines from the spawn resolver.
    pub fn resolver_lines(&self) -> Vec<String> {
        self.messages(LogLevel::Debug)
            .into_iter()
            .filter(|m| m.starts_with("acpx spawn resolver:"))
            .collect()
    }

    fn push(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((level, message.to_string()));
    }
}

impl RuntimeLogger for RecordingLogger {
    fn info(&self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }

    fn debug(&self, message: &str) {
        self.push(LogLevel::Debug, message);
    }
}
