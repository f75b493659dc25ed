//! The acpx runtime adapter.
//!
//! [`AcpxRuntime`] is the public surface: session lifecycle, turn execution,
//! health probing and capability advertisement. It keeps no session table;
//! everything it needs to address a session again lives in the handle token.
//!
//! ```text
//! caller ──► AcpxRuntime ──► resolve_spawn_command ──► ProcessLauncher ──► translate_lines ──► caller
//!                 │                 (cache, policy)        (child)          (stdout → events)
//!                 └─ probe / doctor reuse the same path with `--version` / `--help`
//! ```

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{AcpErrorCode, AcpRuntimeError, Result};
use crate::events::{RuntimeEvent, translate_lines};
use crate::handle::{HandleState, SessionHandle, SessionMode};
use crate::logger::{RuntimeLogger, TracingLogger};
use crate::process::{
    CollectedOutput, ProcessLauncher, SpawnFailure, SpawnRequest, SpawnedProcess, TokioLauncher,
    classify_spawn_failure, collect,
};
use crate::spawn::{
    ResolvedSpawnCommand, SpawnError, SpawnOptions, SpawnResolutionCache, SpawnResolutionEvent,
    SpawnRuntime, resolve_spawn_command,
};

/// Control identifiers advertised by [`AcpRuntime::get_capabilities`].
pub const CONTROL_SET_MODE: &str = "session/set_mode";
pub const CONTROL_SET_CONFIG_OPTION: &str = "session/set_config_option";
pub const CONTROL_STATUS: &str = "session/status";

/// acpx error code meaning the named session is already gone.
const NO_SESSION_CODE: &str = "NO_SESSION";

/// Events produced by one turn.
pub type EventStream = Pin<Box<dyn Stream<Item = RuntimeEvent> + Send>>;

/// Last observed backend availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No probe has run yet.
    #[default]
    Unknown,
    Healthy,
    Unavailable,
}

/// Kind of turn being submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnMode {
    /// A fresh prompt.
    #[default]
    Prompt,
    /// A follow-up nudging an in-flight turn.
    Steer,
}

impl TurnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Steer => "steer",
        }
    }
}

/// Arguments to [`AcpRuntime::ensure_session`].
#[derive(Debug, Clone)]
pub struct EnsureSessionInput {
    pub session_key: String,
    pub agent: String,
    pub mode: SessionMode,
    /// Overrides the configured working directory for this session.
    pub cwd: Option<PathBuf>,
}

/// Arguments to [`AcpRuntime::run_turn`].
#[derive(Debug, Clone)]
pub struct RunTurnInput {
    pub handle: SessionHandle,
    pub text: String,
    pub mode: TurnMode,
    pub request_id: String,
    /// Overrides [`RuntimeConfig::queue_owner_ttl_seconds`] for this turn.
    pub ttl_seconds: Option<f64>,
    pub cancel: Option<CancellationToken>,
}

/// Static description of what the adapter supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeCapabilities {
    pub controls: BTreeSet<String>,
}

/// Result of [`AcpRuntime::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    /// e.g. `status=alive acpxRecordId=rec-1 acpxSessionId=sid-1 pid=4242`
    pub summary: String,
    pub acpx_record_id: Option<String>,
    pub backend_session_id: Option<String>,
    pub agent_session_id: Option<String>,
    /// The raw status line as printed by acpx.
    pub details: Option<Value>,
}

/// Operator-facing health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub ok: bool,
    pub code: Option<String>,
    pub message: String,
    pub install_command: Option<String>,
    pub version: Option<String>,
    pub details: Vec<String>,
}

/// Session backend driven by an external agent CLI.
///
/// # Object Safety
///
/// Every method returns a concrete type or a boxed stream, so hosts can hold
/// `Arc<dyn AcpRuntime>` and swap in fakes.
#[async_trait]
pub trait AcpRuntime: Send + Sync {
    /// Create or reattach the named session and return its handle.
    async fn ensure_session(&self, input: EnsureSessionInput) -> Result<SessionHandle>;

    /// Submit one turn. Failures after the call begins arrive as a trailing
    /// [`RuntimeEvent::Error`] rather than as an `Err`.
    fn run_turn(&self, input: RunTurnInput) -> EventStream;

    fn get_capabilities(&self) -> RuntimeCapabilities;

    async fn get_status(&self, handle: &SessionHandle) -> Result<RuntimeStatus>;

    async fn set_mode(&self, handle: &SessionHandle, mode: &str) -> Result<()>;

    async fn set_config_option(&self, handle: &SessionHandle, key: &str, value: &str)
    -> Result<()>;

    /// Cancel the in-flight turn, if any. An already-gone session is not an error.
    async fn cancel(&self, handle: &SessionHandle, reason: Option<&str>) -> Result<()>;

    /// Close the session. An already-gone session is not an error.
    async fn close(&self, handle: &SessionHandle, reason: Option<&str>) -> Result<()>;

    /// Check the backend binary and record the outcome.
    async fn probe_availability(&self) -> HealthState;

    /// `true` only after a successful probe. Before the first probe this is
    /// `false` without meaning unavailable; [`AcpxRuntime::health`]
    /// distinguishes [`HealthState::Unknown`] from
    /// [`HealthState::Unavailable`]. No call is refused on health.
    fn is_healthy(&self) -> bool;

    /// Probe and explain the result.
    async fn doctor(&self) -> DoctorReport;
}

// Compile-time assertion: AcpRuntime must be usable as `dyn AcpRuntime`.
const _: () = {
    fn _assert_object_safe(_: &dyn AcpRuntime) {}
};

/// Collaborators injected into [`AcpxRuntime`].
#[derive(Clone)]
pub struct RuntimeOptions {
    pub logger: Arc<dyn RuntimeLogger>,
    pub launcher: Arc<dyn ProcessLauncher>,
    /// Share one cache between adapters to share resolution work and
    /// resolver log dedup.
    pub spawn_cache: SpawnResolutionCache,
    pub spawn_runtime: SpawnRuntime,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
            launcher: Arc::new(TokioLauncher),
            spawn_cache: SpawnResolutionCache::new(),
            spawn_runtime: SpawnRuntime::current(),
        }
    }
}

impl RuntimeOptions {
    pub fn with_logger(mut self, logger: Arc<dyn RuntimeLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_spawn_cache(mut self, cache: SpawnResolutionCache) -> Self {
        self.spawn_cache = cache;
        self
    }

    pub fn with_spawn_runtime(mut self, runtime: SpawnRuntime) -> Self {
        self.spawn_runtime = runtime;
        self
    }
}

/// Shared, poison-tolerant health cell.
#[derive(Debug, Clone, Default)]
struct SharedHealth(Arc<Mutex<HealthState>>);

impl SharedHealth {
    fn get(&self) -> HealthState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: HealthState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Everything needed to resolve and launch one acpx invocation. Cheap to
/// clone into a turn stream.
#[derive(Clone)]
struct Invoker {
    command: String,
    strict: bool,
    cache: SpawnResolutionCache,
    spawn_runtime: Arc<SpawnRuntime>,
    launcher: Arc<dyn ProcessLauncher>,
    logger: Arc<dyn RuntimeLogger>,
}

impl Invoker {
    fn resolve(&self, args: &[String]) -> std::result::Result<ResolvedSpawnCommand, SpawnError> {
        let logger = &self.logger;
        let on_resolved = |event: &SpawnResolutionEvent| {
            logger.debug(&format!(
                "acpx spawn resolver: command={} mode={} cache={} resolution={}",
                event.command,
                if event.strict_windows_cmd_wrapper { "strict" } else { "lenient" },
                if event.cache_hit { "hit" } else { "miss" },
                event.resolution,
            ));
        };
        let options = SpawnOptions {
            strict_windows_cmd_wrapper: self.strict,
            cache: Some(&self.cache),
            on_resolved: Some(&on_resolved),
        };
        resolve_spawn_command(&self.command, args, &options, &self.spawn_runtime)
    }

    async fn collect(
        &self,
        args: &[String],
        cwd: &Path,
    ) -> std::result::Result<CollectedOutput, SpawnError> {
        let command = self.resolve(args)?;
        let request = SpawnRequest {
            command,
            cwd: cwd.to_path_buf(),
        };
        Ok(collect(self.launcher.as_ref(), &request).await)
    }
}

/// Adapter that drives the `acpx` CLI.
pub struct AcpxRuntime {
    config: RuntimeConfig,
    invoker: Invoker,
    health: SharedHealth,
}

impl std::fmt::Debug for AcpxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpxRuntime")
            .field("command", &self.config.command)
            .field("cwd", &self.config.cwd)
            .field("health", &self.health.get())
            .finish()
    }
}

impl AcpxRuntime {
    /// Build an adapter with the default collaborators.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_options(config, RuntimeOptions::default())
    }

    pub fn with_options(config: RuntimeConfig, options: RuntimeOptions) -> Self {
        let invoker = Invoker {
            command: config.command.clone(),
            strict: config.strict_windows_cmd_wrapper,
            cache: options.spawn_cache,
            spawn_runtime: Arc::new(options.spawn_runtime),
            launcher: options.launcher,
            logger: options.logger,
        };
        Self {
            config,
            invoker,
            health: SharedHealth::default(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Last probe outcome, including "not probed yet".
    pub fn health(&self) -> HealthState {
        self.health.get()
    }

    fn control_args(&self, state: &HandleState, verb: &[&str]) -> Vec<String> {
        let mut args = base_args(Path::new(&state.cwd));
        args.push(state.agent.clone());
        args.extend(verb.iter().map(|s| s.to_string()));
        args
    }

    fn prompt_args(&self, state: &HandleState, ttl_seconds: f64) -> Vec<String> {
        let mut args = base_args(Path::new(&state.cwd));
        args.extend([
            self.config.permission_mode.cli_flag().to_string(),
            "--non-interactive-permissions".to_string(),
            self.config.non_interactive_permissions.as_str().to_string(),
            "--ttl".to_string(),
            ttl_seconds.to_string(),
            state.agent.clone(),
            "prompt".to_string(),
            "--session".to_string(),
            state.name.clone(),
            "--file".to_string(),
            "-".to_string(),
        ]);
        args
    }

    /// Run a single-shot verb and return every JSON line it printed.
    ///
    /// A `type:"error"` line or a non-zero exit fails the call with `code`.
    async fn run_control(
        &self,
        state: &HandleState,
        verb: &[&str],
        code: AcpErrorCode,
        tolerate_no_session: bool,
    ) -> Result<Vec<Value>> {
        let args = self.control_args(state, verb);
        let cwd = Path::new(&state.cwd);
        let output = self
            .invoker
            .collect(&args, cwd)
            .await
            .map_err(|e| AcpRuntimeError::from_spawn(code, e))?;

        if let Some(err) = &output.error {
            return Err(spawn_failure(
                err,
                cwd,
                &self.config.command,
                code,
                &self.health,
            ));
        }

        let values = parse_json_lines(&output.stdout);
        if let Some((err_code, message)) = values.iter().find_map(control_error) {
            if tolerate_no_session && err_code.as_deref() == Some(NO_SESSION_CODE) {
                debug!(session = %state.name, verb = ?verb, "acpx session already gone");
                return Ok(values);
            }
            let message = match err_code {
                Some(c) => format!("{c}: {message}"),
                None => message,
            };
            return Err(AcpRuntimeError::new(code, message));
        }

        if output.exit_code.unwrap_or(0) != 0 || output.signal.is_some() {
            return Err(AcpRuntimeError::new(
                code,
                exit_message(&output.stderr, output.exit_code, output.signal),
            ));
        }
        Ok(values)
    }

    fn decode(&self, handle: &SessionHandle) -> Result<HandleState> {
        handle.state().ok_or_else(|| {
            AcpRuntimeError::invalid_option(format!(
                "invalid acpx runtime handle for session {}",
                handle.session_key
            ))
        })
    }

    /// Run `--version` then `--help`, record health, and describe the result.
    async fn check_backend(&self) -> DoctorReport {
        let cwd = self.config.cwd.clone();
        let mut details = vec![format!("command: {}", self.config.command)];

        let version = match self.probe_step("--version", &cwd).await {
            Ok(stdout) => parse_version(&stdout),
            Err(message) => return self.unavailable(message, None, details),
        };
        if let Some(v) = &version {
            details.push(format!("version: {v}"));
        }

        if let Some(expected) = &self.config.expected_version {
            if version.as_deref() != Some(expected.as_str()) {
                let message = format!(
                    "acpx version mismatch: expected {expected}, found {}",
                    version.as_deref().unwrap_or("unknown")
                );
                let install = self.config.install_command_for(expected);
                return self.unavailable(message, Some(install), details);
            }
        }

        if let Err(message) = self.probe_step("--help", &cwd).await {
            return self.unavailable(message, None, details);
        }

        self.health.set(HealthState::Healthy);
        DoctorReport {
            ok: true,
            code: None,
            message: match &version {
                Some(v) => format!("acpx {v} is available"),
                None => "acpx is available".to_string(),
            },
            install_command: None,
            version,
            details,
        }
    }

    async fn probe_step(&self, flag: &str, cwd: &Path) -> std::result::Result<String, String> {
        let output = self
            .invoker
            .collect(&[flag.to_string()], cwd)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(err) = &output.error {
            return Err(match classify_spawn_failure(err, cwd) {
                Some(SpawnFailure::MissingCommand) => {
                    format!("acpx command not found: {}", self.config.command)
                }
                _ => format!("failed to run acpx {flag}: {err}"),
            });
        }
        if output.exit_code.unwrap_or(0) != 0 || output.signal.is_some() {
            return Err(format!(
                "acpx {flag} failed: {}",
                exit_message(&output.stderr, output.exit_code, output.signal)
            ));
        }
        Ok(output.stdout)
    }

    fn unavailable(
        &self,
        message: String,
        install_command: Option<String>,
        details: Vec<String>,
    ) -> DoctorReport {
        self.health.set(HealthState::Unavailable);
        self.invoker.logger.warn(&message);
        DoctorReport {
            ok: false,
            code: Some(AcpErrorCode::BackendUnavailable.as_str().to_string()),
            message,
            install_command: Some(
                install_command.unwrap_or_else(|| self.config.install_command.clone()),
            ),
            version: None,
            details,
        }
    }
}

#[async_trait]
impl AcpRuntime for AcpxRuntime {
    async fn ensure_session(&self, input: EnsureSessionInput) -> Result<SessionHandle> {
        let session_key = input.session_key.trim();
        if session_key.is_empty() {
            return Err(AcpRuntimeError::session_init("ACP session key is required"));
        }
        let agent = input.agent.trim();
        if agent.is_empty() {
            return Err(AcpRuntimeError::session_init("ACP agent id is required"));
        }
        let cwd = input.cwd.unwrap_or_else(|| self.config.cwd.clone());

        let mut state = HandleState {
            name: session_key.to_string(),
            agent: agent.to_string(),
            cwd: cwd.to_string_lossy().into_owned(),
            mode: input.mode,
            acpx_record_id: None,
            backend_session_id: None,
            agent_session_id: None,
        };

        let code = AcpErrorCode::SessionInitFailed;
        let ensured = self
            .run_control(&state, &["sessions", "ensure", "--name", session_key], code, false)
            .await?;
        let ids = match find_session_ids(&ensured) {
            Some(ids) => ids,
            None => {
                debug!(session = session_key, "acpx ensure returned no ids, creating session");
                let created = self
                    .run_control(&state, &["sessions", "new", "--name", session_key], code, false)
                    .await?;
                find_session_ids(&created).ok_or_else(|| {
                    AcpRuntimeError::session_init(format!(
                        "acpx did not return a session id for {session_key}"
                    ))
                })?
            }
        };

        state.acpx_record_id = ids.acpx_record_id;
        state.backend_session_id = ids.backend_session_id;
        state.agent_session_id = ids.agent_session_id;
        Ok(SessionHandle::from_state(&state))
    }

    fn run_turn(&self, input: RunTurnInput) -> EventStream {
        let RunTurnInput {
            handle,
            text,
            mode,
            request_id,
            ttl_seconds,
            cancel,
        } = input;
        let cancel = cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Box::pin(futures::stream::empty());
        }

        let ttl = ttl_seconds.unwrap_or(self.config.queue_owner_ttl_seconds);
        let prepared = self.decode(&handle).and_then(|state| {
            check_ttl(ttl)?;
            let args = self.prompt_args(&state, ttl);
            Ok((state, args))
        });
        let invoker = self.invoker.clone();
        let health = self.health.clone();
        let command_name = self.config.command.clone();

        let stream = async_stream::stream! {
            // The token may fire between the call and the first poll.
            if cancel.is_cancelled() {
                return;
            }
            let (state, args) = match prepared {
                Ok(prepared) => prepared,
                Err(err) => {
                    yield error_event(&err);
                    return;
                }
            };
            let cwd = PathBuf::from(&state.cwd);

            let command = match invoker.resolve(&args) {
                Ok(command) => command,
                Err(err) => {
                    yield error_event(&AcpRuntimeError::from_spawn(AcpErrorCode::TurnFailed, err));
                    return;
                }
            };

            debug!(
                session = %state.name,
                request_id = %request_id,
                mode = mode.as_str(),
                ttl,
                "starting acpx turn"
            );

            let process = match invoker.launcher.spawn(&SpawnRequest { command, cwd: cwd.clone() }) {
                Ok(process) => process,
                Err(err) => {
                    let err = Arc::new(err);
                    let err = spawn_failure(&err, &cwd, &command_name, AcpErrorCode::TurnFailed, &health);
                    yield error_event(&err);
                    return;
                }
            };
            let SpawnedProcess { stdin, stdout, mut stderr, mut child } = process;

            // The prompt goes in whole, then EOF.
            let mut writer = tokio::spawn(async move {
                let Some(mut stdin) = stdin else { return };
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    warn!(error = %e, "failed to write prompt to acpx stdin");
                    return;
                }
                let _ = stdin.shutdown().await;
            });
            let mut stderr_reader = tokio::spawn(async move {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).await.ok();
                String::from_utf8_lossy(&buf).into_owned()
            });

            let events = translate_lines(stdout);
            tokio::pin!(events);
            let mut saw_terminal = false;

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    next = events.next() => match next {
                        Some(event) => Step::Event(event),
                        None => Step::Eof,
                    },
                };
                match step {
                    Step::Event(event) => {
                        saw_terminal |= event.is_terminal();
                        yield event;
                    }
                    Step::Eof => break,
                    Step::Cancelled => {
                        debug!(session = %state.name, request_id = %request_id, "acpx turn cancelled");
                        child.terminate().await;
                        writer.abort();
                        stderr_reader.abort();
                        return;
                    }
                }
            }

            // stdout can close while the child lingers; keep honouring cancel.
            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                finished = async {
                    let exit = child.wait().await;
                    let _ = (&mut writer).await;
                    let stderr_text = (&mut stderr_reader).await.unwrap_or_default();
                    (exit, stderr_text)
                } => Some(finished),
            };
            let Some((exit, stderr_text)) = finished else {
                debug!(session = %state.name, request_id = %request_id, "acpx turn cancelled after stdout closed");
                child.terminate().await;
                writer.abort();
                stderr_reader.abort();
                return;
            };
            if saw_terminal {
                return;
            }

            if let Some(err) = &exit.error {
                let err = spawn_failure(err, &cwd, &command_name, AcpErrorCode::TurnFailed, &health);
                yield error_event(&err);
            } else if exit.success() {
                yield RuntimeEvent::Done { stop_reason: None };
            } else {
                let message = exit_message(&stderr_text, exit.code, exit.signal);
                yield error_event(&AcpRuntimeError::turn_failed(message));
            }
        };
        Box::pin(stream)
    }

    fn get_capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            controls: [CONTROL_SET_MODE, CONTROL_SET_CONFIG_OPTION, CONTROL_STATUS]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    async fn get_status(&self, handle: &SessionHandle) -> Result<RuntimeStatus> {
        let state = self.decode(handle)?;
        let values = self
            .run_control(
                &state,
                &["status", "--session", state.name.as_str()],
                AcpErrorCode::TurnFailed,
                false,
            )
            .await?;
        let detail = values.into_iter().rev().find(Value::is_object);

        let Some(detail) = detail else {
            return Ok(RuntimeStatus {
                summary: "acpx status unavailable".to_string(),
                acpx_record_id: state.acpx_record_id,
                backend_session_id: state.backend_session_id,
                agent_session_id: state.agent_session_id,
                details: None,
            });
        };

        Ok(RuntimeStatus {
            summary: status_summary(&detail),
            acpx_record_id: str_field(&detail, "acpxRecordId").or(state.acpx_record_id),
            backend_session_id: str_field(&detail, "acpxSessionId").or(state.backend_session_id),
            agent_session_id: str_field(&detail, "agentSessionId").or(state.agent_session_id),
            details: Some(detail),
        })
    }

    async fn set_mode(&self, handle: &SessionHandle, mode: &str) -> Result<()> {
        let mode = mode.trim();
        if mode.is_empty() {
            return Err(AcpRuntimeError::invalid_option("ACP runtime mode is required"));
        }
        let state = self.decode(handle)?;
        self.run_control(
            &state,
            &["set-mode", mode, "--session", state.name.as_str()],
            AcpErrorCode::TurnFailed,
            false,
        )
        .await?;
        Ok(())
    }

    async fn set_config_option(
        &self,
        handle: &SessionHandle,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AcpRuntimeError::invalid_option("ACP config option key is required"));
        }
        let state = self.decode(handle)?;
        self.run_control(
            &state,
            &["set", key, value, "--session", state.name.as_str()],
            AcpErrorCode::TurnFailed,
            false,
        )
        .await?;
        Ok(())
    }

    async fn cancel(&self, handle: &SessionHandle, reason: Option<&str>) -> Result<()> {
        let state = self.decode(handle)?;
        debug!(session = %state.name, reason = reason.unwrap_or(""), "cancelling acpx turn");
        self.run_control(
            &state,
            &["cancel", "--session", state.name.as_str()],
            AcpErrorCode::TurnFailed,
            true,
        )
        .await?;
        Ok(())
    }

    async fn close(&self, handle: &SessionHandle, reason: Option<&str>) -> Result<()> {
        let state = self.decode(handle)?;
        debug!(session = %state.name, reason = reason.unwrap_or(""), "closing acpx session");
        self.run_control(
            &state,
            &["sessions", "close", "--session", state.name.as_str()],
            AcpErrorCode::TurnFailed,
            true,
        )
        .await?;
        Ok(())
    }

    async fn probe_availability(&self) -> HealthState {
        self.check_backend().await;
        self.health.get()
    }

    fn is_healthy(&self) -> bool {
        self.health.get() == HealthState::Healthy
    }

    async fn doctor(&self) -> DoctorReport {
        self.check_backend().await
    }
}

enum Step {
    Event(RuntimeEvent),
    Eof,
    Cancelled,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SessionIds {
    acpx_record_id: Option<String>,
    backend_session_id: Option<String>,
    agent_session_id: Option<String>,
}

fn base_args(cwd: &Path) -> Vec<String> {
    vec![
        "--format".to_string(),
        "json".to_string(),
        "--json-strict".to_string(),
        "--cwd".to_string(),
        cwd.to_string_lossy().into_owned(),
    ]
}

/// Map a spawn failure to an adapter error, updating health only when the
/// binary itself is missing.
fn spawn_failure(
    err: &Arc<io::Error>,
    cwd: &Path,
    command: &str,
    fallback: AcpErrorCode,
    health: &SharedHealth,
) -> AcpRuntimeError {
    let mapped = match classify_spawn_failure(err, cwd) {
        Some(SpawnFailure::MissingCommand) => {
            health.set(HealthState::Unavailable);
            AcpRuntimeError::backend_unavailable(format!("acpx command not found: {command}"))
        }
        Some(SpawnFailure::MissingCwd) => AcpRuntimeError::session_init(format!(
            "ACP runtime working directory does not exist: {}",
            cwd.display()
        )),
        None => AcpRuntimeError::new(fallback, format!("failed to run acpx: {err}")),
    };
    mapped.with_source(Arc::clone(err))
}

/// A queue-owner TTL acpx can use: finite and non-negative.
fn check_ttl(ttl: f64) -> Result<()> {
    if ttl.is_finite() && ttl >= 0.0 {
        Ok(())
    } else {
        Err(AcpRuntimeError::invalid_option(format!(
            "queue-owner TTL must be a finite, non-negative number of seconds (got {ttl})"
        )))
    }
}

fn error_event(err: &AcpRuntimeError) -> RuntimeEvent {
    RuntimeEvent::error(err.message.clone(), Some(err.code.as_str().to_string()))
}

fn exit_message(stderr: &str, code: Option<i32>, signal: Option<i32>) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match (code, signal) {
        (_, Some(signal)) => format!("acpx terminated by signal {signal}"),
        (Some(code), None) => format!("acpx exited with code {code}"),
        (None, None) => "acpx exited abnormally".to_string(),
    }
}

fn parse_json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(line, error = %e, "skipping malformed acpx output line");
                None
            }
        })
        .collect()
}

/// `(code, message)` of a `type:"error"` line.
fn control_error(v: &Value) -> Option<(Option<String>, String)> {
    if v.get("type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let code = match v.get("code") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let message = str_field(v, "message").unwrap_or_else(|| "acpx reported an error".to_string());
    Some((code, message))
}

fn find_session_ids(values: &[Value]) -> Option<SessionIds> {
    values.iter().find_map(|v| {
        let ids = SessionIds {
            acpx_record_id: str_field(v, "acpxRecordId"),
            backend_session_id: str_field(v, "acpxSessionId"),
            agent_session_id: str_field(v, "agentSessionId"),
        };
        (ids != SessionIds::default()).then_some(ids)
    })
}

fn status_summary(detail: &Value) -> String {
    let status = detail
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let mut parts = vec![format!("status={status}")];
    if let Some(id) = str_field(detail, "acpxRecordId") {
        parts.push(format!("acpxRecordId={id}"));
    }
    if let Some(id) = str_field(detail, "acpxSessionId") {
        parts.push(format!("acpxSessionId={id}"));
    }
    if let Some(pid) = detail.get("pid").filter(|p| p.is_number()) {
        parts.push(format!("pid={pid}"));
    }
    parts.join(" ")
}

/// Last token of the first non-empty line, e.g. `acpx 0.1.15` → `0.1.15`.
fn parse_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().last())
        .map(|v| v.trim_start_matches('v').to_string())
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionMode;
    use serde_json::json;

    fn state() -> HandleState {
        HandleState {
            name: "agent:codex:acp:1".to_string(),
            agent: "codex".to_string(),
            cwd: "/srv/work".to_string(),
            mode: SessionMode::Persistent,
            acpx_record_id: None,
            backend_session_id: None,
            agent_session_id: None,
        }
    }

    fn runtime(config: RuntimeConfig) -> AcpxRuntime {
        AcpxRuntime::with_options(
            config,
            RuntimeOptions::default().with_logger(Arc::new(crate::logger::NoopLogger)),
        )
    }

    #[test]
    fn control_args_follow_global_flags_then_agent() {
        let rt = runtime(RuntimeConfig::new("acpx", "/tmp"));
        let args = rt.control_args(&state(), &["status", "--session", "agent:codex:acp:1"]);
        assert_eq!(
            args,
            vec![
                "--format",
                "json",
                "--json-strict",
                "--cwd",
                "/srv/work",
                "codex",
                "status",
                "--session",
                "agent:codex:acp:1",
            ]
        );
    }

    #[test]
    fn prompt_args_carry_permissions_and_ttl() {
        let mut config = RuntimeConfig::new("acpx", "/tmp");
        config.permission_mode = PermissionMode::ApproveAll;
        let rt = runtime(config);

        let args = rt.prompt_args(&state(), 0.1);
        assert_eq!(
            args,
            vec![
                "--format",
                "json",
                "--json-strict",
                "--cwd",
                "/srv/work",
                "--approve-all",
                "--non-interactive-permissions",
                "fail",
                "--ttl",
                "0.1",
                "codex",
                "prompt",
                "--session",
                "agent:codex:acp:1",
                "--file",
                "-",
            ]
        );

        let args = rt.prompt_args(&state(), 180.0);
        let ttl = args.iter().position(|a| a == "--ttl").unwrap();
        assert_eq!(args[ttl + 1], "180");
    }

    #[test]
    fn summary_embeds_status_ids_and_pid() {
        let detail = json!({
            "acpxRecordId": "rec-1",
            "acpxSessionId": "sid-1",
            "agentSessionId": "inner-1",
            "status": "alive",
            "pid": 4242,
            "uptime": 120,
        });
        assert_eq!(
            status_summary(&detail),
            "status=alive acpxRecordId=rec-1 acpxSessionId=sid-1 pid=4242"
        );
        assert_eq!(status_summary(&json!({ "status": "dead" })), "status=dead");
    }

    #[test]
    fn session_ids_skip_lines_without_ids() {
        let values = vec![
            json!({ "action": "noise" }),
            json!({ "acpxRecordId": "rec-a", "acpxSessionId": "sid-a" }),
        ];
        let ids = find_session_ids(&values).unwrap();
        assert_eq!(ids.acpx_record_id.as_deref(), Some("rec-a"));
        assert_eq!(ids.backend_session_id.as_deref(), Some("sid-a"));
        assert_eq!(ids.agent_session_id, None);

        assert_eq!(find_session_ids(&[json!({ "acpxRecordId": "" })]), None);
    }

    #[test]
    fn control_error_stringifies_codes() {
        let (code, message) =
            control_error(&json!({ "type": "error", "code": 404, "message": "gone" })).unwrap();
        assert_eq!(code.as_deref(), Some("404"));
        assert_eq!(message, "gone");
        assert!(control_error(&json!({ "status": "alive" })).is_none());
    }

    #[test]
    fn exit_message_prefers_stderr() {
        assert_eq!(exit_message("  boom \n", Some(1), None), "boom");
        assert_eq!(exit_message("", Some(2), None), "acpx exited with code 2");
        assert_eq!(exit_message("", None, Some(9)), "acpx terminated by signal 9");
    }

    #[test]
    fn version_is_last_token_of_first_line() {
        assert_eq!(parse_version("mock-acpx 0.1.15\n").as_deref(), Some("0.1.15"));
        assert_eq!(parse_version("\nacpx v0.2.0\nextra").as_deref(), Some("0.2.0"));
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn parse_json_lines_skips_garbage() {
        let values = parse_json_lines("{\"a\":1}\nnot json\n\n{\"b\":2}\n");
        assert_eq!(values, vec![json!({ "a": 1 }), json!({ "b": 2 })]);
    }

    #[test]
    fn capabilities_advertise_controls() {
        let rt = runtime(RuntimeConfig::new("acpx", "/tmp"));
        let caps = rt.get_capabilities();
        assert!(caps.controls.contains(CONTROL_SET_MODE));
        assert!(caps.controls.contains(CONTROL_SET_CONFIG_OPTION));
        assert!(caps.controls.contains(CONTROL_STATUS));
    }

    #[test]
    fn ttl_must_be_finite_and_non_negative() {
        assert!(check_ttl(0.0).is_ok());
        assert!(check_ttl(180.0).is_ok());
        for bad in [-0.5, f64::NAN, f64::INFINITY] {
            let err = check_ttl(bad).unwrap_err();
            assert_eq!(err.code, AcpErrorCode::InvalidRuntimeOption);
        }
    }

    #[test]
    fn health_starts_unknown() {
        let rt = runtime(RuntimeConfig::new("acpx", "/tmp"));
        assert_eq!(rt.health(), HealthState::Unknown);
        assert!(!rt.is_healthy());
    }

    #[tokio::test]
    async fn control_verbs_reject_foreign_handles() {
        let rt = runtime(RuntimeConfig::new("acpx", "/tmp"));
        let mut handle = SessionHandle::from_state(&state());
        handle.runtime_session_name = "not-a-token".to_string();

        let err = rt.cancel(&handle, None).await.unwrap_err();
        assert_eq!(err.code, AcpErrorCode::InvalidRuntimeOption);
    }

    #[tokio::test]
    async fn set_mode_rejects_empty_mode() {
        let rt = runtime(RuntimeConfig::new("acpx", "/tmp"));
        let handle = SessionHandle::from_state(&state());
        let err = rt.set_mode(&handle, "  ").await.unwrap_err();
        assert_eq!(err.code, AcpErrorCode::InvalidRuntimeOption);

        let err = rt.set_config_option(&handle, "", "x").await.unwrap_err();
        assert_eq!(err.code, AcpErrorCode::InvalidRuntimeOption);
    }

    #[tokio::test]
    async fn ensure_rejects_blank_key_and_agent() {
        let rt = runtime(RuntimeConfig::new("acpx", "/tmp"));
        let err = rt
            .ensure_session(EnsureSessionInput {
                session_key: " ".to_string(),
                agent: "codex".to_string(),
                mode: SessionMode::Persistent,
                cwd: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, AcpErrorCode::SessionInitFailed);

        let err = rt
            .ensure_session(EnsureSessionInput {
                session_key: "k".to_string(),
                agent: String::new(),
                mode: SessionMode::Persistent,
                cwd: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, AcpErrorCode::SessionInitFailed);
    }

    #[tokio::test]
    async fn pre_cancelled_turn_is_empty() {
        let rt = runtime(RuntimeConfig::new("/definitely/missing/acpx", "/tmp"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<RuntimeEvent> = rt
            .run_turn(RunTurnInput {
                handle: SessionHandle::from_state(&state()),
                text: "should-not-run".to_string(),
                mode: TurnMode::Prompt,
                request_id: "req-1".to_string(),
                ttl_seconds: None,
                cancel: Some(cancel),
            })
            .collect()
            .await;
        assert!(events.is_empty());
        assert_eq!(rt.health(), HealthState::Unknown);
    }
}
