//! Exec stream client.
//!
//! Run with: cargo run -p exec-client -- [--tty] <url> [command]...
//!
//! Connects stdin, stdout and stderr to a process on an exec server. With
//! `--tty` the local terminal is put in raw mode and its size follows the
//! window.

use anyhow::{Context, bail};
use clap::Parser;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use exec_stream_core::{CallerEndpoint, SessionConfig, TermSize};
use exec_stream_session::{SessionController, SessionHandle, SessionState};
use exec_stream_transport::dial;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Run a command on an exec server", version)]
struct Args {
    /// Allocate a terminal and put the local one in raw mode
    #[arg(long, short = 't')]
    tty: bool,

    /// Exec socket URL (http, https, ws or wss)
    url: String,

    /// Command and arguments to run; empty runs the server's shell
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

/// Puts the terminal in raw mode until dropped.
struct RawMode;

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; keep them quiet unless asked.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    // Exit directly: the stdin reader thread would hold up runtime shutdown.
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let transport = dial(&args.url, &args.command, args.tty)
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;

    let mut endpoint = CallerEndpoint::new()
        .stdin(tokio::io::stdin())
        .stdout(tokio::io::stdout())
        .stderr(tokio::io::stderr());
    if args.tty {
        if let Ok((cols, rows)) = terminal::size() {
            endpoint = endpoint.initial_size(TermSize::new(cols, rows));
        }
    }

    let controller = SessionController::new(SessionConfig::default())?;
    let raw_mode = if args.tty { Some(RawMode::enable()?) } else { None };
    let resizes = args.tty.then(|| tokio::spawn(follow_window_size(controller.handle())));

    let state = controller.attach(transport, endpoint).await;
    if let Some(task) = resizes {
        task.abort();
    }
    drop(raw_mode);

    match state {
        SessionState::Stopped(status) => Ok(i32::from(status.code)),
        SessionState::Shutdown { reason } => {
            eprintln!("Session shut down: {}", reason.as_deref().unwrap_or("no reason given"));
            Ok(1)
        }
        SessionState::Errored { message } => bail!("Session failed: {message}"),
        SessionState::Running => Ok(0),
    }
}

#[cfg(unix)]
async fn follow_window_size(handle: SessionHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        tracing::warn!("Cannot watch window size");
        return;
    };
    while winch.recv().await.is_some() {
        let Ok((cols, rows)) = terminal::size() else {
            continue;
        };
        if !handle.resize(TermSize::new(cols, rows)) {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn follow_window_size(_handle: SessionHandle) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_flag_after_url() {
        let args = Args::parse_from(["exec-client", "ws://h/shell.sock", "--tty"]);
        assert!(args.tty);
        assert_eq!(args.url, "ws://h/shell.sock");
        assert!(args.command.is_empty());
    }

    #[test]
    fn test_args_command_keeps_its_flags() {
        let args = Args::parse_from(["exec-client", "-t", "http://h/shell.sock", "sh", "-c", "ls -l"]);
        assert!(args.tty);
        assert_eq!(args.command, vec!["sh", "-c", "ls -l"]);
    }

    #[test]
    fn test_args_require_url() {
        assert!(Args::try_parse_from(["exec-client"]).is_err());
    }
}
