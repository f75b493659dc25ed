//! Opaque session handles.
//!
//! A handle token is the only state a caller keeps between calls. It carries
//! everything needed to address the session again, so any adapter instance
//! sharing the same config can cancel or close a session created elsewhere.
//!
//! Format: `acpx:v1:<hex(json)>`

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend tag reported on every handle.
pub const ACPX_BACKEND_ID: &str = "acpx";

/// Token prefix; bumps with the payload layout.
const HANDLE_PREFIX: &str = "acpx:v1:";

/// Lifetime of the backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Persistent,
    Oneshot,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Persistent => "persistent",
            Self::Oneshot => "oneshot",
        })
    }
}

/// Decoded payload of a handle token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleState {
    /// Logical session name passed to `--name` / `--session`.
    pub name: String,
    /// Agent the session was ensured against (e.g. `codex`).
    pub agent: String,
    pub cwd: String,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acpx_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

/// Encode `state` into an opaque token.
pub fn encode_handle_state(state: &HandleState) -> String {
    // Only strings and unit enums: serialization cannot fail.
    let json = serde_json::to_vec(state).unwrap_or_default();
    format!("{HANDLE_PREFIX}{}", hex::encode(json))
}

/// Decode a token produced by [`encode_handle_state`].
///
/// Tokens come back from caller-owned storage, so anything malformed or
/// foreign yields `None` instead of an error.
pub fn decode_handle_state(token: &str) -> Option<HandleState> {
    let payload = token.trim().strip_prefix(HANDLE_PREFIX)?;
    let bytes = hex::decode(payload).ok()?;
    let state: HandleState = serde_json::from_slice(&bytes).ok()?;
    if state.name.trim().is_empty() || state.agent.trim().is_empty() {
        return None;
    }
    Some(state)
}

/// A live session as seen by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// The caller's key for this session; also the acpx session name.
    pub session_key: String,
    /// Always [`ACPX_BACKEND_ID`].
    pub backend: String,
    /// Opaque token; the only field a caller needs to persist.
    pub runtime_session_name: String,
    pub cwd: PathBuf,
    pub acpx_record_id: Option<String>,
    pub backend_session_id: Option<String>,
    pub agent_session_id: Option<String>,
}

impl SessionHandle {
    /// Build a handle (and its token) from decoded state.
    pub fn from_state(state: &HandleState) -> Self {
        Self {
            session_key: state.name.clone(),
            backend: ACPX_BACKEND_ID.to_string(),
            runtime_session_name: encode_handle_state(state),
            cwd: PathBuf::from(&state.cwd),
            acpx_record_id: state.acpx_record_id.clone(),
            backend_session_id: state.backend_session_id.clone(),
            agent_session_id: state.agent_session_id.clone(),
        }
    }

    /// Rebuild a handle from a persisted token.
    pub fn from_token(token: &str) -> Option<Self> {
        decode_handle_state(token).map(|state| Self::from_state(&state))
    }

    /// Decode this handle's token.
    pub fn state(&self) -> Option<HandleState> {
        decode_handle_state(&self.runtime_session_name)
    }
}
