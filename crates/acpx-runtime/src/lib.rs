//! Session runtime adapter for the `acpx` agent CLI.
//!
//! The adapter spawns `acpx` once per call, feeds it a prompt or a control
//! verb, and turns its line-delimited JSON output into [`RuntimeEvent`]s.
//! Callers keep a single opaque [`SessionHandle`] token between calls; the
//! adapter itself is stateless apart from its spawn cache and health flag.
//!
//! # Architecture
//!
//! ```text
//! Host
//!   |
//!   v
//! AcpxRuntime (impl AcpRuntime)
//!   |  ensure_session / run_turn / get_status / set_mode / cancel / close
//!   |
//!   +--> spawn::resolve_spawn_command   (PATH, .cmd shims, strict policy, cache)
//!   +--> process::ProcessLauncher       (child, OPENCLAW_SHELL=acp, exit)
//!   +--> events::translate_lines        (stdout lines -> RuntimeEvent)
//!   +--> handle::encode_handle_state    (acpx:v1:<hex(json)>)
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod logger;
pub mod process;
pub mod runtime;
pub mod spawn;

// Re-export the primary public API at the crate root.
pub use config::{ConfigError, NonInteractivePermissions, PermissionMode, RuntimeConfig};
pub use error::{AcpErrorCode, AcpRuntimeError};
pub use events::{PromptEventTranslator, RuntimeEvent, TextStream, parse_prompt_event_line};
pub use handle::{
    ACPX_BACKEND_ID, HandleState, SessionHandle, SessionMode, decode_handle_state,
    encode_handle_state,
};
pub use logger::{NoopLogger, RuntimeLogger, TracingLogger};
pub use process::{ProcessLauncher, TokioLauncher};
pub use runtime::{
    AcpRuntime, AcpxRuntime, DoctorReport, EnsureSessionInput, EventStream, HealthState,
    RunTurnInput, RuntimeCapabilities, RuntimeOptions, RuntimeStatus, TurnMode,
};
pub use spawn::{SpawnError, SpawnResolutionCache, SpawnRuntime};
