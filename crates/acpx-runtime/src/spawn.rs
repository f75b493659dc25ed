//! Platform-aware resolution of how to invoke the acpx binary.
//!
//! On Unix the resolver is close to identity. On Windows a bare command may
//! land on an npm `.cmd` shim, which cannot be executed without a shell; the
//! resolver digs the real entrypoint out of the shim and only falls back to
//! `cmd.exe` when the caller's policy allows it.
//!
//! ```text
//! command ──► resolve_candidate ──► SpawnResolutionCache ──► apply_policy ──► materialize
//!             (PATH, PATHEXT, shim)   (per command string)   (strict/lenient)  (argv)
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Operating-system family the resolver reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) { Self::Windows } else { Self::Unix }
    }
}

/// Host context the resolver inspects.
#[derive(Debug, Clone)]
pub struct SpawnRuntime {
    pub platform: Platform,
    /// Environment used for `PATH`/`PATHEXT`/`ComSpec` lookups.
    pub env: HashMap<String, String>,
    /// Interpreter for script entrypoints found behind `.cmd` shims.
    pub exec_path: PathBuf,
}

impl SpawnRuntime {
    /// Snapshot of the current process.
    pub fn current() -> Self {
        Self {
            platform: Platform::current(),
            env: std::env::vars().collect(),
            exec_path: PathBuf::from("node"),
        }
    }

    /// Case-insensitive on Windows, where `Path` and `PATH` are the same.
    fn env_var(&self, key: &str) -> Option<&str> {
        match self.platform {
            Platform::Windows => self
                .env
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str()),
            Platform::Unix => self.env.get(key).map(String::as_str),
        }
    }
}

/// How a command ends up being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnResolution {
    /// Executed as given.
    Direct,
    /// A JavaScript entrypoint run through [`SpawnRuntime::exec_path`].
    NodeEntrypoint,
    /// A native executable found behind a `.cmd` shim.
    ExeEntrypoint,
    /// Wrapped in `cmd.exe /d /s /c`.
    ShellFallback,
    /// A `.cmd`/`.bat` wrapper whose target could not be found.
    UnresolvedWrapper,
}

impl fmt::Display for SpawnResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::NodeEntrypoint => "node-entrypoint",
            Self::ExeEntrypoint => "exe-entrypoint",
            Self::ShellFallback => "shell-fallback",
            Self::UnresolvedWrapper => "unresolved-wrapper",
        })
    }
}

/// Result of the expensive filesystem/PATH probing, before policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCandidate {
    pub command: String,
    pub leading_args: Vec<String>,
    pub resolution: SpawnResolution,
    pub windows_hide: bool,
}

/// Final invocation handed to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSpawnCommand {
    pub command: String,
    pub args: Vec<String>,
    /// `true` when `command` is the Windows command interpreter.
    pub shell: bool,
    pub windows_hide: bool,
    pub resolution: SpawnResolution,
}

impl ResolvedSpawnCommand {
    /// Identity resolution, used by tests and by callers that bypass policy.
    pub fn direct(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            shell: false,
            windows_hide: false,
            resolution: SpawnResolution::Direct,
        }
    }
}

/// Reported to the caller the first time a command is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnResolutionEvent {
    pub command: String,
    pub cache_hit: bool,
    pub strict_windows_cmd_wrapper: bool,
    pub resolution: SpawnResolution,
}

/// Resolver policy failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpawnError {
    #[error(
        "{wrapper} wrapper resolved, but no executable/Node entrypoint could be resolved without shell execution"
    )]
    StrictWrapper { wrapper: String },
}

#[derive(Debug, Default)]
struct CacheState {
    candidates: HashMap<String, SpawnCandidate>,
    reported: HashSet<String>,
}

/// Memoizes candidates per literal command string.
///
/// Cloning shares the underlying map; build a fresh one with
/// [`SpawnResolutionCache::new`] to isolate adapters from each other.
/// Concurrent misses on the same key race benignly: resolution is a pure
/// function of the command and runtime, so the last writer wins.
#[derive(Debug, Clone, Default)]
pub struct SpawnResolutionCache {
    inner: Arc<Mutex<CacheState>>,
}

impl SpawnResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached candidate for exactly `command`, if any.
    pub fn get(&self, command: &str) -> Option<SpawnCandidate> {
        self.state().candidates.get(command).cloned()
    }

    pub fn insert(&self, command: &str, candidate: SpawnCandidate) {
        self.state().candidates.insert(command.to_string(), candidate);
    }

    /// Returns `true` the first time `command` is marked.
    fn mark_reported(&self, command: &str) -> bool {
        self.state().reported.insert(command.to_string())
    }

    pub fn len(&self) -> usize {
        self.state().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callback receiving [`SpawnResolutionEvent`]s.
pub type ResolutionCallback<'a> = &'a (dyn Fn(&SpawnResolutionEvent) + Send + Sync);

/// Per-call resolver options.
#[derive(Clone, Copy, Default)]
pub struct SpawnOptions<'a> {
    pub strict_windows_cmd_wrapper: bool,
    pub cache: Option<&'a SpawnResolutionCache>,
    pub on_resolved: Option<ResolutionCallback<'a>>,
}

impl fmt::Debug for SpawnOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("strict_windows_cmd_wrapper", &self.strict_windows_cmd_wrapper)
            .field("cache", &self.cache.is_some())
            .field("on_resolved", &self.on_resolved.is_some())
            .finish()
    }
}

/// Resolve `command args…` into a concrete invocation.
///
/// Probing is skipped on a cache hit, but the strict/lenient policy is
/// applied on every call. The callback fires once per command per cache,
/// including on the failure path, before the error is returned.
pub fn resolve_spawn_command(
    command: &str,
    args: &[String],
    options: &SpawnOptions<'_>,
    runtime: &SpawnRuntime,
) -> Result<ResolvedSpawnCommand, SpawnError> {
    let strict = options.strict_windows_cmd_wrapper;

    let cached = options.cache.and_then(|cache| cache.get(command));
    let cache_hit = cached.is_some();
    let candidate = match cached {
        Some(candidate) => candidate,
        None => {
            let candidate = resolve_candidate(command, runtime);
            if let Some(cache) = options.cache {
                cache.insert(command, candidate.clone());
            }
            candidate
        }
    };

    let report = |resolution: SpawnResolution| {
        let Some(callback) = options.on_resolved else {
            return;
        };
        let first = options.cache.is_none_or(|cache| cache.mark_reported(command));
        if first {
            callback(&SpawnResolutionEvent {
                command: command.to_string(),
                cache_hit,
                strict_windows_cmd_wrapper: strict,
                resolution,
            });
        }
    };

    let program = match apply_policy(&candidate, !strict, runtime) {
        Ok(program) => program,
        Err(err) => {
            report(candidate.resolution);
            return Err(err);
        }
    };

    let resolved = materialize(program, args);
    report(resolved.resolution);
    Ok(resolved)
}

/// Probe the filesystem for how `command` would be executed.
pub fn resolve_candidate(command: &str, runtime: &SpawnRuntime) -> SpawnCandidate {
    let direct = |command: String| SpawnCandidate {
        command,
        leading_args: Vec::new(),
        resolution: SpawnResolution::Direct,
        windows_hide: false,
    };

    if runtime.platform != Platform::Windows {
        return direct(command.to_string());
    }

    let resolved = resolve_windows_executable(command, runtime);
    let ext = extension_lower(&resolved);
    match ext.as_deref() {
        Some("js" | "cjs" | "mjs") => node_entrypoint(&resolved, runtime),
        Some("cmd" | "bat") => match shim_entrypoint(&resolved) {
            Some(target) if extension_lower(&target).as_deref() == Some("exe") => SpawnCandidate {
                command: target.to_string_lossy().into_owned(),
                leading_args: Vec::new(),
                resolution: SpawnResolution::ExeEntrypoint,
                windows_hide: true,
            },
            Some(target) => node_entrypoint(&target, runtime),
            None => SpawnCandidate {
                command: resolved.to_string_lossy().into_owned(),
                leading_args: Vec::new(),
                resolution: SpawnResolution::UnresolvedWrapper,
                windows_hide: false,
            },
        },
        _ => direct(resolved.to_string_lossy().into_owned()),
    }
}

/// Turn an unresolved wrapper into a shell invocation, or refuse to.
pub fn apply_policy(
    candidate: &SpawnCandidate,
    allow_shell_fallback: bool,
    runtime: &SpawnRuntime,
) -> Result<SpawnCandidate, SpawnError> {
    if candidate.resolution != SpawnResolution::UnresolvedWrapper {
        return Ok(candidate.clone());
    }
    if !allow_shell_fallback {
        let wrapper = Path::new(&candidate.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| candidate.command.clone());
        return Err(SpawnError::StrictWrapper { wrapper });
    }
    let interpreter = runtime.env_var("ComSpec").unwrap_or("cmd.exe").to_string();
    Ok(SpawnCandidate {
        command: interpreter,
        leading_args: vec![
            "/d".to_string(),
            "/s".to_string(),
            "/c".to_string(),
            candidate.command.clone(),
        ],
        resolution: SpawnResolution::ShellFallback,
        windows_hide: true,
    })
}

fn materialize(program: SpawnCandidate, args: &[String]) -> ResolvedSpawnCommand {
    let shell = program.resolution == SpawnResolution::ShellFallback;
    let mut argv = program.leading_args;
    argv.extend(args.iter().cloned());
    ResolvedSpawnCommand {
        command: program.command,
        args: argv,
        shell,
        windows_hide: program.windows_hide,
        resolution: program.resolution,
    }
}

fn node_entrypoint(script: &Path, runtime: &SpawnRuntime) -> SpawnCandidate {
    SpawnCandidate {
        command: runtime.exec_path.to_string_lossy().into_owned(),
        leading_args: vec![script.to_string_lossy().into_owned()],
        resolution: SpawnResolution::NodeEntrypoint,
        windows_hide: true,
    }
}

fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn path_extensions(runtime: &SpawnRuntime) -> Vec<String> {
    runtime
        .env_var("PATHEXT")
        .unwrap_or(".COM;.EXE;.BAT;.CMD")
        .split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// Try `base`, then `base` + each PATHEXT entry (as written and lowercased).
fn find_with_extensions(base: &Path, exts: &[String]) -> Option<PathBuf> {
    if base.extension().is_some() && base.is_file() {
        return Some(base.to_path_buf());
    }
    exts.iter()
        .flat_map(|ext| [ext.clone(), ext.to_ascii_lowercase()])
        .map(|ext| {
            let mut name = base.as_os_str().to_os_string();
            name.push(ext);
            PathBuf::from(name)
        })
        .find(|p| p.is_file())
}

fn resolve_windows_executable(command: &str, runtime: &SpawnRuntime) -> PathBuf {
    let exts = path_extensions(runtime);
    let has_dir = command.contains('/') || command.contains('\\');

    if has_dir {
        return find_with_extensions(Path::new(command), &exts)
            .unwrap_or_else(|| PathBuf::from(command));
    }

    runtime
        .env_var("PATH")
        .unwrap_or("")
        .split(';')
        .filter(|d| !d.trim().is_empty())
        .find_map(|dir| find_with_extensions(&Path::new(dir.trim()).join(command), &exts))
        .unwrap_or_else(|| PathBuf::from(command))
}

/// Pull the `%dp0%`-relative target out of an npm-style `.cmd` shim.
///
/// `node.exe` references are the shim's interpreter probe, not the target.
fn shim_entrypoint(shim: &Path) -> Option<PathBuf> {
    let contents = std::fs::read_to_string(shim).ok()?;
    let base = shim.parent()?;

    for marker in ["%dp0%\\", "%~dp0\\", "%~dp0"] {
        for (idx, _) in contents.match_indices(marker) {
            let rest = &contents[idx + marker.len()..];
            let end = rest
                .find(|c: char| c == '"' || c.is_whitespace())
                .unwrap_or(rest.len());
            let relative = rest[..end].trim_start_matches('\\');
            if relative.is_empty() {
                continue;
            }
            let target = relative
                .split('\\')
                .filter(|s| !s.is_empty())
                .fold(base.to_path_buf(), |acc, part| acc.join(part));
            let is_node = target
                .file_name()
                .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case("node.exe"));
            let runnable = matches!(
                extension_lower(&target).as_deref(),
                Some("js" | "cjs" | "mjs" | "exe")
            );
            if !is_node && runnable && target.is_file() {
                return Some(target);
            }
        }
    }
    None
}
