//! Configuration file handling for acpx-host.
//!
//! The config file is a plain [`RuntimeConfig`] TOML document. Resolution
//! chain: `--config` flag > `ACPX_HOST_CONFIG` env var > XDG config file >
//! built-in defaults, with `--command` / `--cwd` applied on top.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use acpx_runtime::RuntimeConfig;

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "ACPX_HOST_CONFIG";

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the acpx-host config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/acpx-host` or
/// `~/.config/acpx-host`, never the macOS `Application Support` location.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("acpx-host");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("acpx-host")
}

/// Return the path to the default config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Command-line values that override the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
}

/// Where the effective config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Flag(PathBuf),
    Env(PathBuf),
    DefaultFile(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(path) => write!(f, "--config {}", path.display()),
            Self::Env(path) => write!(f, "{CONFIG_ENV}={}", path.display()),
            Self::DefaultFile(path) => write!(f, "{}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

/// Resolve the adapter config from the process environment.
pub fn resolve(overrides: &Overrides) -> Result<(RuntimeConfig, ConfigSource)> {
    let env_path = std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    resolve_with(overrides, env_path, &config_path())
}

/// Resolution with the environment passed in.
///
/// An explicitly named file (flag or env) must exist; the XDG file is
/// optional.
pub fn resolve_with(
    overrides: &Overrides,
    env_path: Option<PathBuf>,
    default_path: &Path,
) -> Result<(RuntimeConfig, ConfigSource)> {
    let (mut config, source) = if let Some(path) = &overrides.config {
        (load(path)?, ConfigSource::Flag(path.clone()))
    } else if let Some(path) = env_path {
        let config = load(&path).with_context(|| format!("{CONFIG_ENV} points at a bad file"))?;
        (config, ConfigSource::Env(path))
    } else if default_path.is_file() {
        (
            load(default_path)?,
            ConfigSource::DefaultFile(default_path.to_path_buf()),
        )
    } else {
        (
            RuntimeConfig::from_toml_str("").context("built-in defaults are invalid")?,
            ConfigSource::Defaults,
        )
    };

    if let Some(command) = &overrides.command {
        config.command = command.clone();
    }
    if let Some(cwd) = &overrides.cwd {
        config.cwd = cwd.clone();
    }
    config.validate().context("invalid acpx-host configuration")?;
    Ok((config, source))
}

fn load(path: &Path) -> Result<RuntimeConfig> {
    RuntimeConfig::load(path)
        .with_context(|| format!("failed to load config file {}", path.display()))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
