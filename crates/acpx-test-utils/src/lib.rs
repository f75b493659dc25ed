//! Shared test utilities for acpx runtime tests.
//!
//! Two ways to stand in for the real `acpx` binary:
//! - **[`MockAcpx`]**: a POSIX shell script written to a temp dir. It speaks
//!   the acpx wire format and appends every invocation to `calls.log` next to
//!   itself. Unix only, since it needs `/bin/sh`.
//! - **[`FakeLauncher`]**: an in-memory [`ProcessLauncher`] returning canned
//!   output. Deterministic and platform-independent.

mod fake;

use std::path::{Path, PathBuf};

use acpx_runtime::{PermissionMode, RuntimeConfig};
use serde_json::Value;
use tempfile::TempDir;

pub use fake::{FakeLauncher, FakeResponse, LogLevel, RecordedSpawn, RecordingLogger};

/// Version reported by the mock's `--version`.
pub const MOCK_ACPX_VERSION: &str = "0.1.15";

/// The mock CLI.
///
/// Prompt text triggers special behaviour:
///
/// | stdin contains      | behaviour                                        |
/// |---------------------|--------------------------------------------------|
/// | `trigger-error`     | `type:error` line with code `-32000`, exit 1     |
/// | `split-spacing`     | chunks `alpha`, ` beta`, ` gamma`, then done     |
/// | `double-done`       | one chunk, then two `done` lines                 |
/// | `exit-without-done` | one chunk, clean exit, no terminal line          |
/// | `crash-turn`        | one chunk, stderr, exit 4                        |
/// | `hold-open`         | one chunk, then sleeps until killed              |
///
/// Session names containing `missing` make `cancel`/`sessions close` answer
/// `NO_SESSION`; `fresh` makes `sessions ensure` return no ids; `crash` makes
/// `status` fail with stderr. `set-mode bogus` is rejected.
pub const MOCK_ACPX_SCRIPT: &str = r##"#!/bin/sh
# Stand-in for the acpx CLI. Every invocation is appended to calls.log
# beside this script as one JSON object.

LOG="$(dirname "$0")/calls.log"
SHELL_MARKER="${OPENCLAW_SHELL:-}"

json_escape() {
  printf '%s' "$1" | sed -e 's/\\/\\\\/g' -e 's/"/\\"/g' | awk 'NR > 1 { printf "\\n" } { printf "%s", $0 }'
}

for arg in "$@"; do
  case "$arg" in
    --version) echo "mock-acpx 0.1.15"; exit 0 ;;
    --help) echo "mock-acpx help"; exit 0 ;;
  esac
done

ARGS=""
VERB=""
AGENT="unknown"
PREV=""
POS1=""
POS2=""
SESSION=""
NAME=""
PENDING=""
for arg in "$@"; do
  if [ -n "$ARGS" ]; then ARGS="$ARGS,"; fi
  ARGS="$ARGS\"$(json_escape "$arg")\""
  case "$PENDING" in
    session) SESSION="$arg"; PENDING=""; PREV="$arg"; continue ;;
    name) NAME="$arg"; PENDING=""; PREV="$arg"; continue ;;
    skip) PENDING=""; PREV="$arg"; continue ;;
  esac
  if [ -z "$VERB" ]; then
    case "$arg" in
      prompt|cancel|sessions|set-mode|set|status)
        VERB="$arg"; AGENT="${PREV:-unknown}"; PREV="$arg"; continue ;;
    esac
  fi
  case "$arg" in
    --session) PENDING=session ;;
    --name) PENDING=name ;;
    --file|--cwd|--format|--ttl|--non-interactive-permissions) PENDING=skip ;;
    --*) ;;
    *)
      if [ -n "$VERB" ]; then
        if [ -z "$POS1" ]; then POS1="$arg"; elif [ -z "$POS2" ]; then POS2="$arg"; fi
      fi
      ;;
  esac
  PREV="$arg"
done
ARGS="[$ARGS]"

log_entry() {
  printf '{"kind":"%s","agent":"%s","args":%s,"sessionName":"%s","openclawShell":"%s"%s}\n' \
    "$1" "$(json_escape "$AGENT")" "$ARGS" "$(json_escape "$2")" "$(json_escape "$SHELL_MARKER")" "$3" >> "$LOG"
}

emit_update() {
  printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"%s","update":%s}}\n' \
    "$(json_escape "$SESSION")" "$1"
}

chunk() {
  emit_update "{\"sessionUpdate\":\"$1\",\"content\":{\"type\":\"text\",\"text\":\"$(json_escape "$2")\"}}"
}

S="$(json_escape "$SESSION")"
N="$(json_escape "$NAME")"

case "$VERB" in
  sessions)
    case "$POS1" in
      ensure)
        log_entry ensure "$NAME" ""
        case "$NAME" in
          *fresh*) printf '{"action":"session_ensured","name":"%s","created":false}\n' "$N" ;;
          *) printf '{"action":"session_ensured","acpxRecordId":"rec-%s","acpxSessionId":"sid-%s","agentSessionId":"inner-%s","name":"%s","created":true}\n' "$N" "$N" "$N" "$N" ;;
        esac
        exit 0
        ;;
      new)
        log_entry new "$NAME" ""
        printf '{"action":"session_created","acpxRecordId":"rec-%s","acpxSessionId":"sid-%s","agentSessionId":"inner-%s","name":"%s"}\n' "$N" "$N" "$N" "$N"
        exit 0
        ;;
      close)
        log_entry close "$SESSION" ""
        case "$SESSION" in
          *missing*) printf '{"type":"error","code":"NO_SESSION","message":"no session named %s"}\n' "$S"; exit 1 ;;
        esac
        printf '{"action":"session_closed","acpxRecordId":"rec-%s","acpxSessionId":"sid-%s","name":"%s"}\n' "$S" "$S" "$S"
        exit 0
        ;;
    esac
    ;;
  cancel)
    log_entry cancel "$SESSION" ""
    case "$SESSION" in
      *missing*) printf '{"type":"error","code":"NO_SESSION","message":"no session named %s"}\n' "$S"; exit 1 ;;
    esac
    printf '{"acpxSessionId":"sid-%s","cancelled":true}\n' "$S"
    exit 0
    ;;
  set-mode)
    log_entry set-mode "$SESSION" ",\"mode\":\"$(json_escape "$POS1")\""
    case "$POS1" in
      bogus) printf '{"type":"error","code":"INVALID_MODE","message":"unsupported mode bogus"}\n'; exit 1 ;;
    esac
    printf '{"action":"mode_set","acpxSessionId":"sid-%s","mode":"%s"}\n' "$S" "$(json_escape "$POS1")"
    exit 0
    ;;
  set)
    log_entry set "$SESSION" ",\"key\":\"$(json_escape "$POS1")\",\"value\":\"$(json_escape "$POS2")\""
    printf '{"action":"config_set","acpxSessionId":"sid-%s","key":"%s","value":"%s"}\n' "$S" "$(json_escape "$POS1")" "$(json_escape "$POS2")"
    exit 0
    ;;
  status)
    log_entry status "$SESSION" ""
    case "$SESSION" in
      *crash*) echo "status backend crashed" >&2; exit 3 ;;
      *silent*) exit 0 ;;
    esac
    printf '{"acpxRecordId":"rec-%s","acpxSessionId":"sid-%s","agentSessionId":"inner-%s","status":"alive","pid":4242,"uptime":120}\n' "$S" "$S" "$S"
    exit 0
    ;;
  prompt)
    STDIN_TEXT="$(cat)"
    log_entry prompt "$SESSION" ",\"stdinText\":\"$(json_escape "$STDIN_TEXT")\""
    printf '{"jsonrpc":"2.0","id":0,"method":"session/load","params":{"sessionId":"%s","cwd":"%s","mcpServers":[]}}\n' "$S" "$(json_escape "$(pwd)")"
    printf '{"jsonrpc":"2.0","id":0,"error":{"code":-32002,"message":"Resource not found"}}\n'
    printf '{"jsonrpc":"2.0","id":"req-1","method":"session/prompt","params":{"sessionId":"%s","prompt":[{"type":"text","text":"%s"}]}}\n' "$S" "$(json_escape "$STDIN_TEXT")"
    case "$STDIN_TEXT" in
      *trigger-error*)
        printf '{"type":"error","code":"-32000","message":"mock failure"}\n'
        exit 1
        ;;
      *split-spacing*)
        chunk agent_message_chunk "alpha"
        chunk agent_message_chunk " beta"
        chunk agent_message_chunk " gamma"
        printf '{"type":"done","stopReason":"end_turn"}\n'
        exit 0
        ;;
      *double-done*)
        chunk agent_message_chunk "ok"
        printf '{"type":"done","stopReason":"end_turn"}\n'
        printf '{"type":"done","stopReason":"end_turn"}\n'
        exit 0
        ;;
      *exit-without-done*)
        chunk agent_message_chunk "partial"
        exit 0
        ;;
      *crash-turn*)
        chunk agent_message_chunk "partial"
        echo "agent crashed" >&2
        exit 4
        ;;
      *hold-open*)
        chunk agent_message_chunk "waiting"
        exec sleep 30
        ;;
    esac
    chunk agent_thought_chunk "thinking"
    emit_update '{"sessionUpdate":"tool_call","toolCallId":"tool-1","title":"run-tests","status":"in_progress","kind":"command"}'
    chunk agent_message_chunk "echo:$STDIN_TEXT"
    printf '{"type":"done","stopReason":"end_turn"}\n'
    exit 0
    ;;
esac

log_entry unknown "" ""
printf '{"type":"error","code":"USAGE","message":"unknown command"}\n'
exit 2
"##;

/// A mock acpx executable living in its own temp dir.
///
/// The directory doubles as the default session cwd and is removed on drop.
pub struct MockAcpx {
    dir: TempDir,
    command: PathBuf,
}

impl MockAcpx {
    /// Write the script and mark it executable.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir for mock acpx");
        let command = dir.path().join("mock-acpx");
        std::fs::write(&command, MOCK_ACPX_SCRIPT).expect("failed to write mock acpx script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&command, std::fs::Permissions::from_mode(0o755))
                .expect("failed to chmod mock acpx script");
        }

        Self { dir, command }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    /// Config pointing at the script, approving all permissions.
    pub fn config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(self.command.to_string_lossy(), self.dir.path());
        config.permission_mode = PermissionMode::ApproveAll;
        config.install_command = "n/a".to_string();
        config
    }

    pub fn log_entries(&self) -> Vec<Value> {
        read_log_entries(&self.log_path())
    }

    /// Log entries of one kind (`ensure`, `prompt`, `cancel`, ...).
    pub fn entries_of(&self, kind: &str) -> Vec<Value> {
        self.log_entries()
            .into_iter()
            .filter(|e| e.get("kind").and_then(Value::as_str) == Some(kind))
            .collect()
    }
}

impl Default for MockAcpx {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a JSON-lines log. A missing file reads as empty.
pub fn read_log_entries(path: &Path) -> Vec<Value> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("mock acpx wrote an invalid log line {line:?}: {e}"))
        })
        .collect()
}

/// Argument following `flag` in a logged `args` array.
pub fn flag_value(entry: &Value, flag: &str) -> Option<String> {
    let args = entry.get("args")?.as_array()?;
    let idx = args.iter().position(|a| a.as_str() == Some(flag))?;
    args.get(idx + 1)?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_reports_pinned_version() {
        assert!(MOCK_ACPX_SCRIPT.contains(&format!("mock-acpx {MOCK_ACPX_VERSION}")));
        assert!(MOCK_ACPX_SCRIPT.starts_with("#!/bin/sh\n"));
    }

    #[test]
    fn missing_log_reads_empty() {
        assert!(read_log_entries(Path::new("/definitely/missing/calls.log")).is_empty());
    }

    #[test]
    fn flag_value_finds_following_arg() {
        let entry = serde_json::json!({ "args": ["--ttl", "0.1", "codex", "prompt"] });
        assert_eq!(flag_value(&entry, "--ttl").as_deref(), Some("0.1"));
        assert_eq!(flag_value(&entry, "--session"), None);
    }

    #[cfg(unix)]
    #[test]
    fn mock_is_executable_and_config_points_at_it() {
        use std::os::unix::fs::PermissionsExt;
        let mock = MockAcpx::new();
        let mode = std::fs::metadata(mock.command()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        let config = mock.config();
        assert_eq!(Path::new(&config.command), mock.command());
        assert_eq!(config.cwd, mock.dir());
        assert_eq!(config.permission_mode, PermissionMode::ApproveAll);
    }
}
