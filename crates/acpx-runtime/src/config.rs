//! Adapter configuration.
//!
//! A [`RuntimeConfig`] is fully resolved before the adapter is built and is
//! never re-read afterwards. It can be assembled in code with
//! [`RuntimeConfig::new`] or parsed from TOML with
//! [`RuntimeConfig::from_toml_str`].
//!
//! ```toml
//! command = "/usr/local/bin/acpx"
//! cwd = "/srv/agents"
//! permission_mode = "approve-reads"
//! non_interactive_permissions = "fail"
//! strict_windows_cmd_wrapper = true
//! queue_owner_ttl_seconds = 30.0
//! install_command = "npm install -g acpx"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Binary name used when none is configured.
pub const DEFAULT_COMMAND: &str = "acpx";

/// Lease the child keeps on an abandoned turn slot, in seconds.
pub const DEFAULT_QUEUE_OWNER_TTL_SECONDS: f64 = 0.1;

/// Install hint surfaced by `doctor` when nothing else is configured.
pub const DEFAULT_INSTALL_COMMAND: &str = "npm install -g acpx";

/// Errors raised while parsing or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse runtime config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read runtime config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime config `command` must not be empty")]
    EmptyCommand,

    #[error("queue_owner_ttl_seconds must be a finite, non-negative number (got {0})")]
    InvalidTtl(f64),
}

/// How the child answers tool permission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    ApproveAll,
    #[default]
    ApproveReads,
    DenyAll,
}

impl PermissionMode {
    /// The acpx flag selecting this mode.
    pub fn cli_flag(&self) -> &'static str {
        match self {
            Self::ApproveAll => "--approve-all",
            Self::ApproveReads => "--approve-reads",
            Self::DenyAll => "--deny-all",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ApproveAll => "approve-all",
            Self::ApproveReads => "approve-reads",
            Self::DenyAll => "deny-all",
        })
    }
}

/// What the child does when a permission prompt cannot be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NonInteractivePermissions {
    Deny,
    #[default]
    Fail,
}

impl NonInteractivePermissions {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Fail => "fail",
        }
    }
}

/// Immutable per-adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Executable path or bare name resolved against `PATH`.
    #[serde(default = "default_command")]
    pub command: String,
    /// Default working directory for sessions that do not name one.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub non_interactive_permissions: NonInteractivePermissions,
    /// Refuse to fall back to shell execution for unresolvable `.cmd`
    /// wrappers on Windows.
    #[serde(default = "default_true")]
    pub strict_windows_cmd_wrapper: bool,
    /// Default `--ttl` passed to `prompt` when a turn does not override it.
    #[serde(default = "default_ttl")]
    pub queue_owner_ttl_seconds: f64,
    /// Shown to operators when the backend is unavailable.
    #[serde(default = "default_install_command")]
    pub install_command: String,
    /// Whether the host may install acpx next to itself instead of globally.
    #[serde(default)]
    pub allow_local_install: bool,
    /// When set, probes require `acpx --version` to report exactly this.
    #[serde(default)]
    pub expected_version: Option<String>,
}

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}

fn default_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> f64 {
    DEFAULT_QUEUE_OWNER_TTL_SECONDS
}

fn default_install_command() -> String {
    DEFAULT_INSTALL_COMMAND.to_string()
}

impl RuntimeConfig {
    /// Build a config with defaults for everything but command and cwd.
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            permission_mode: PermissionMode::default(),
            non_interactive_permissions: NonInteractivePermissions::default(),
            strict_windows_cmd_wrapper: true,
            queue_owner_ttl_seconds: DEFAULT_QUEUE_OWNER_TTL_SECONDS,
            install_command: DEFAULT_INSTALL_COMMAND.to_string(),
            allow_local_install: false,
            expected_version: None,
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check the invariants the adapter relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        let ttl = self.queue_owner_ttl_seconds;
        if !ttl.is_finite() || ttl < 0.0 {
            return Err(ConfigError::InvalidTtl(ttl));
        }
        Ok(())
    }

    /// Install hint for a pinned version, local or global depending on
    /// [`RuntimeConfig::allow_local_install`].
    pub fn install_command_for(&self, version: &str) -> String {
        if self.allow_local_install {
            format!("npm install --omit=dev --no-save acpx@{version}")
        } else {
            format!("npm install -g acpx@{version}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_defaults() {
        let cfg = RuntimeConfig::new("acpx", "/tmp");
        assert_eq!(cfg.command, "acpx");
        assert_eq!(cfg.cwd, PathBuf::from("/tmp"));
        assert_eq!(cfg.permission_mode, PermissionMode::ApproveReads);
        assert_eq!(cfg.non_interactive_permissions, NonInteractivePermissions::Fail);
        assert!(cfg.strict_windows_cmd_wrapper);
        assert_eq!(cfg.queue_owner_ttl_seconds, DEFAULT_QUEUE_OWNER_TTL_SECONDS);
        assert_eq!(cfg.install_command, DEFAULT_INSTALL_COMMAND);
        assert!(cfg.expected_version.is_none());
    }

    #[test]
    fn parses_full_document() {
        let cfg = RuntimeConfig::from_toml_str(
            r#"
            command = "/opt/acpx/bin/acpx"
            cwd = "/srv/agents"
            permission_mode = "approve-all"
            non_interactive_permissions = "deny"
            strict_windows_cmd_wrapper = false
            queue_owner_ttl_seconds = 180.0
            install_command = "brew install acpx"
            allow_local_install = true
            expected_version = "0.1.15"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.command, "/opt/acpx/bin/acpx");
        assert_eq!(cfg.cwd, PathBuf::from("/srv/agents"));
        assert_eq!(cfg.permission_mode, PermissionMode::ApproveAll);
        assert_eq!(cfg.non_interactive_permissions, NonInteractivePermissions::Deny);
        assert!(!cfg.strict_windows_cmd_wrapper);
        assert_eq!(cfg.queue_owner_ttl_seconds, 180.0);
        assert_eq!(cfg.install_command, "brew install acpx");
        assert!(cfg.allow_local_install);
        assert_eq!(cfg.expected_version.as_deref(), Some("0.1.15"));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.command, DEFAULT_COMMAND);
        assert_eq!(cfg.queue_owner_ttl_seconds, DEFAULT_QUEUE_OWNER_TTL_SECONDS);
    }

    #[test]
    fn rejects_empty_command() {
        let err = RuntimeConfig::from_toml_str("command = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand));
    }

    #[test]
    fn rejects_negative_ttl() {
        let err = RuntimeConfig::from_toml_str("queue_owner_ttl_seconds = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTtl(_)));
    }

    #[test]
    fn rejects_unknown_permission_mode() {
        let err = RuntimeConfig::from_toml_str("permission_mode = \"yolo\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RuntimeConfig::load(Path::new("/definitely/missing/acpx.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/definitely/missing/acpx.toml"));
    }

    #[test]
    fn permission_flags() {
        assert_eq!(PermissionMode::ApproveAll.cli_flag(), "--approve-all");
        assert_eq!(PermissionMode::ApproveReads.cli_flag(), "--approve-reads");
        assert_eq!(PermissionMode::DenyAll.cli_flag(), "--deny-all");
        assert_eq!(NonInteractivePermissions::Fail.as_str(), "fail");
    }

    #[test]
    fn install_command_respects_local_flag() {
        let mut cfg = RuntimeConfig::new("acpx", "/tmp");
        assert_eq!(cfg.install_command_for("0.1.15"), "npm install -g acpx@0.1.15");
        cfg.allow_local_install = true;
        assert_eq!(
            cfg.install_command_for("0.1.15"),
            "npm install --omit=dev --no-save acpx@0.1.15"
        );
    }
}
