//! Session commands: `ensure`, `prompt`, `status` and the control verbs.
//!
//! Every command after `ensure` takes the handle token `ensure` printed; the
//! token alone is enough to address the session from a fresh process.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use acpx_runtime::{
    AcpRuntime, EnsureSessionInput, RunTurnInput, RuntimeEvent, SessionHandle, SessionMode,
    TurnMode,
};

/// Decode a handle token given on the command line.
pub fn parse_handle(token: &str) -> Result<SessionHandle> {
    SessionHandle::from_token(token.trim())
        .context("not an acpx session token (expected `acpx:v1:<hex>` from `acpx-host ensure`)")
}

/// Create or reattach a session and print its token and ids.
pub async fn run_ensure(
    runtime: &dyn AcpRuntime,
    session_key: &str,
    agent: &str,
    oneshot: bool,
    cwd: Option<PathBuf>,
) -> Result<()> {
    let handle = runtime
        .ensure_session(EnsureSessionInput {
            session_key: session_key.to_string(),
            agent: agent.to_string(),
            mode: if oneshot {
                SessionMode::Oneshot
            } else {
                SessionMode::Persistent
            },
            cwd,
        })
        .await?;

    println!("Session: {}", handle.session_key);
    println!("Token: {}", handle.runtime_session_name);
    println!("Cwd: {}", handle.cwd.display());
    println!("acpx record: {}", or_dash(&handle.acpx_record_id));
    println!("acpx session: {}", or_dash(&handle.backend_session_id));
    println!("agent session: {}", or_dash(&handle.agent_session_id));
    Ok(())
}

/// Options for `acpx-host prompt`.
#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub token: String,
    /// Prompt text; read from stdin when absent.
    pub text: Option<String>,
    pub ttl_seconds: Option<f64>,
    pub steer: bool,
}

/// Run one turn, printing events as JSON lines. Ctrl-C cancels the turn.
pub async fn run_prompt(runtime: &dyn AcpRuntime, options: PromptOptions) -> Result<()> {
    let handle = parse_handle(&options.token)?;
    let text = match options.text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read prompt from stdin")?;
            buf
        }
    };
    if text.trim().is_empty() {
        bail!("prompt text is empty");
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling turn");
                cancel.cancel();
            }
        })
    };

    let input = RunTurnInput {
        handle,
        text,
        mode: if options.steer {
            TurnMode::Steer
        } else {
            TurnMode::Prompt
        },
        request_id: Uuid::new_v4().to_string(),
        ttl_seconds: options.ttl_seconds,
        cancel: Some(cancel.clone()),
    };
    let outcome = drive_turn(runtime, input, &mut std::io::stdout()).await;
    interrupt.abort();

    match outcome? {
        TurnOutcome::Done => Ok(()),
        TurnOutcome::Failed(message) => bail!("turn failed: {message}"),
        TurnOutcome::Cancelled => bail!("turn cancelled"),
    }
}

/// How a driven turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Done,
    Failed(String),
    /// The stream ended with no terminal event.
    Cancelled,
}

/// Stream a turn's events to `out`, one JSON object per line.
pub async fn drive_turn(
    runtime: &dyn AcpRuntime,
    input: RunTurnInput,
    out: &mut (dyn Write + Send),
) -> Result<TurnOutcome> {
    let mut events = runtime.run_turn(input);
    let mut outcome = TurnOutcome::Cancelled;
    while let Some(event) = events.next().await {
        let line = serde_json::to_string(&event).context("failed to encode event")?;
        writeln!(out, "{line}").context("failed to write event")?;
        match event {
            RuntimeEvent::Done { .. } => outcome = TurnOutcome::Done,
            RuntimeEvent::Error { message, code, .. } => {
                outcome = TurnOutcome::Failed(match code {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                });
            }
            _ => {}
        }
    }
    out.flush().ok();
    Ok(outcome)
}

pub async fn run_status(runtime: &dyn AcpRuntime, token: &str) -> Result<()> {
    let handle = parse_handle(token)?;
    let status = runtime.get_status(&handle).await?;
    println!("{}", status.summary);
    println!("acpx record: {}", or_dash(&status.acpx_record_id));
    println!("acpx session: {}", or_dash(&status.backend_session_id));
    println!("agent session: {}", or_dash(&status.agent_session_id));
    if let Some(details) = &status.details {
        println!("details: {details}");
    }
    Ok(())
}

pub async fn run_set_mode(runtime: &dyn AcpRuntime, token: &str, mode: &str) -> Result<()> {
    let handle = parse_handle(token)?;
    runtime.set_mode(&handle, mode).await?;
    println!("Mode set to {mode} for {}.", handle.session_key);
    Ok(())
}

pub async fn run_set(runtime: &dyn AcpRuntime, token: &str, key: &str, value: &str) -> Result<()> {
    let handle = parse_handle(token)?;
    runtime.set_config_option(&handle, key, value).await?;
    println!("Set {key}={value} for {}.", handle.session_key);
    Ok(())
}

pub async fn run_cancel(runtime: &dyn AcpRuntime, token: &str, reason: Option<&str>) -> Result<()> {
    let handle = parse_handle(token)?;
    runtime.cancel(&handle, reason).await?;
    println!("Cancel requested for {}.", handle.session_key);
    Ok(())
}

pub async fn run_close(runtime: &dyn AcpRuntime, token: &str, reason: Option<&str>) -> Result<()> {
    let handle = parse_handle(token)?;
    runtime.close(&handle, reason).await?;
    println!("Session {} closed.", handle.session_key);
    Ok(())
}

fn or_dash(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}
