mod config;
mod health_cmd;
mod session_cmds;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use acpx_runtime::{AcpRuntime, AcpxRuntime};

use config::Overrides;

#[derive(Parser)]
#[command(
    name = "acpx-host",
    about = "Drive the acpx agent CLI through the session runtime adapter"
)]
struct Cli {
    /// Config file (overrides ACPX_HOST_CONFIG and the XDG config file)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// acpx executable to run (overrides the config file)
    #[arg(long = "command", global = true, value_name = "PATH")]
    acpx_command: Option<String>,

    /// Default working directory for sessions (overrides the config file)
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the acpx binary is installed and responding
    Probe,
    /// Explain backend health, with an install hint when it is unavailable
    Doctor,
    /// Create or reattach a named session and print its handle token
    Ensure {
        /// Session key (also the acpx session name)
        session_key: String,
        /// Agent id passed to acpx (e.g. codex, claude)
        #[arg(long, default_value = "codex")]
        agent: String,
        /// Mark the session as one-shot
        #[arg(long)]
        oneshot: bool,
        /// Working directory for this session only
        #[arg(long = "session-cwd")]
        session_cwd: Option<PathBuf>,
    },
    /// Run one prompt turn and stream events as JSON lines
    Prompt {
        /// Handle token printed by `ensure`
        token: String,
        /// Prompt text (read from stdin when omitted)
        text: Option<String>,
        /// Queue-owner TTL in seconds for this turn
        #[arg(long)]
        ttl: Option<f64>,
        /// Submit as a steering follow-up rather than a fresh prompt
        #[arg(long)]
        steer: bool,
    },
    /// Show backend status for a session
    Status {
        /// Handle token printed by `ensure`
        token: String,
    },
    /// Change the session's agent mode
    SetMode {
        /// Handle token printed by `ensure`
        token: String,
        /// Mode name understood by the agent (e.g. plan)
        mode: String,
    },
    /// Set a session config option
    Set {
        /// Handle token printed by `ensure`
        token: String,
        key: String,
        value: String,
    },
    /// Cancel the in-flight turn, if any
    Cancel {
        /// Handle token printed by `ensure`
        token: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Close the session
    Close {
        /// Handle token printed by `ensure`
        token: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = Overrides {
        config: cli.config,
        command: cli.acpx_command,
        cwd: cli.cwd,
    };
    let (runtime_config, source) = config::resolve(&overrides)?;
    debug!(%source, command = %runtime_config.command, "resolved acpx-host config");

    let adapter = AcpxRuntime::new(runtime_config);
    let runtime: &dyn AcpRuntime = &adapter;

    match cli.command {
        Commands::Probe => health_cmd::run_probe(runtime).await,
        Commands::Doctor => health_cmd::run_doctor(runtime).await,
        Commands::Ensure {
            session_key,
            agent,
            oneshot,
            session_cwd,
        } => session_cmds::run_ensure(runtime, &session_key, &agent, oneshot, session_cwd).await,
        Commands::Prompt {
            token,
            text,
            ttl,
            steer,
        } => {
            let options = session_cmds::PromptOptions {
                token,
                text,
                ttl_seconds: ttl,
                steer,
            };
            session_cmds::run_prompt(runtime, options).await
        }
        Commands::Status { token } => session_cmds::run_status(runtime, &token).await,
        Commands::SetMode { token, mode } => {
            session_cmds::run_set_mode(runtime, &token, &mode).await
        }
        Commands::Set { token, key, value } => {
            session_cmds::run_set(runtime, &token, &key, &value).await
        }
        Commands::Cancel { token, reason } => {
            session_cmds::run_cancel(runtime, &token, reason.as_deref()).await
        }
        Commands::Close { token, reason } => {
            session_cmds::run_close(runtime, &token, reason.as_deref()).await
        }
    }
}
