//! Spawning the controlled process.
//!
//! A command runs either on a pseudo-terminal (stdout and stderr merged,
//! resizable) or on plain pipes in its own process group.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    thread,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use exec_stream_core::{
    ExitStatus, ProcessEndpoint, ProcessError, ProcessHandle, TermSize, TerminalResizer,
};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    runtime::Handle,
    sync::oneshot,
};

use crate::shell::{UnixShell, resolve_executable_path, split_command_line};

/// Capacity of the in-memory pipe between a PTY thread and the runtime.
const BRIDGE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

/// Spawn error.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Command not found: {0}")]
    NotFound(String),
    #[error("Invalid command line: {0}")]
    InvalidCommand(String),
    #[error("PTY error: {0}")]
    Pty(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program and arguments. Empty runs the user's shell.
    pub argv: Vec<String>,
    /// Run on a pseudo-terminal.
    pub tty: bool,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Initial terminal size, used with `tty`.
    pub size: TermSize,
}

impl CommandSpec {
    #[must_use]
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a shell-quoted command line.
    ///
    /// # Errors
    /// Returns `InvalidCommand` if the quoting is unbalanced.
    pub fn parse(line: &str) -> Result<Self, SpawnError> {
        split_command_line(line)
            .map(Self::new)
            .ok_or_else(|| SpawnError::InvalidCommand(line.to_string()))
    }

    #[must_use]
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    #[must_use]
    pub fn size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }
}

/// Start the command and return its endpoint.
///
/// # Errors
/// Returns error if the program cannot be found or started.
pub async fn spawn(spec: &CommandSpec) -> Result<ProcessEndpoint, SpawnError> {
    let (program, args) = resolve(spec).await?;
    tracing::info!(program = %program.display(), ?args, tty = spec.tty, "Spawning process");
    if spec.tty {
        spawn_pty(&program, &args, spec)
    } else {
        spawn_piped(&program, &args, spec)
    }
}

async fn resolve(spec: &CommandSpec) -> Result<(PathBuf, Vec<String>), SpawnError> {
    let Some((program, args)) = spec.argv.split_first() else {
        let shell = UnixShell::current_shell();
        let args = shell.login_args().iter().map(|a| (*a).to_string()).collect();
        return Ok((shell.path().to_path_buf(), args));
    };
    let path = resolve_executable_path(program)
        .await
        .ok_or_else(|| SpawnError::NotFound(program.clone()))?;
    Ok((path, args.to_vec()))
}

fn spawn_pty(program: &Path, args: &[String], spec: &CommandSpec) -> Result<ProcessEndpoint, SpawnError> {
    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.cwd(cwd);
    }

    let pair = native_pty_system()
        .openpty(pty_size(spec.size))
        .map_err(|e| SpawnError::Pty(e.to_string()))?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SpawnError::Pty(e.to_string()))?;
    // The master only sees end of file once every slave handle is closed.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SpawnError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SpawnError::Pty(e.to_string()))?;
    tracing::debug!(pid = ?child.process_id(), size = %spec.size, "PTY process started");

    let runtime = Handle::current();
    Ok(ProcessEndpoint::new(PtyProcess::start(child))
        .stdout(bridge_reader(reader, runtime.clone()))
        .stdin(bridge_writer(writer, runtime))
        .resizer(Arc::new(PtyResizer(Mutex::new(pair.master)))))
}

fn spawn_piped(program: &Path, args: &[String], spec: &CommandSpec) -> Result<ProcessEndpoint, SpawnError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.group_spawn()?;
    let inner = child.inner();
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (inner.stdin.take(), inner.stdout.take(), inner.stderr.take())
    else {
        return Err(SpawnError::Io(std::io::Error::other("Child pipes missing")));
    };
    tracing::debug!(pid = ?inner.id(), "Piped process started");

    Ok(ProcessEndpoint::new(GroupProcess { child })
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr))
}

const fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Copy a blocking PTY reader into an async pipe on its own thread.
fn bridge_reader(mut reader: Box<dyn Read + Send>, runtime: Handle) -> DuplexStream {
    let (mut tx, rx) = duplex(BRIDGE_CAPACITY);
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                // Linux reports EIO once the child side is gone.
                Err(e) => {
                    tracing::debug!(error = %e, "PTY read ended");
                    break;
                }
            };
            if runtime.block_on(tx.write_all(&buf[..n])).is_err() {
                break;
            }
        }
    });
    rx
}

/// Copy an async pipe into a blocking PTY writer on its own thread.
fn bridge_writer(mut writer: Box<dyn Write + Send>, runtime: Handle) -> DuplexStream {
    let (tx, mut rx) = duplex(BRIDGE_CAPACITY);
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match runtime.block_on(rx.read(&mut buf)) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Err(e) = writer.write_all(&buf[..n]).and_then(|()| writer.flush()) {
                tracing::debug!(error = %e, "PTY write failed");
                break;
            }
        }
    });
    tx
}

struct PtyResizer(Mutex<Box<dyn MasterPty + Send>>);

impl TerminalResizer for PtyResizer {
    fn resize(&self, size: TermSize) -> Result<(), ProcessError> {
        let master = self
            .0
            .lock()
            .map_err(|_| ProcessError::Other("PTY lock poisoned".to_string()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| ProcessError::Other(e.to_string()))
    }
}

/// A PTY child. Waiting blocks, so it happens on a dedicated thread.
struct PtyProcess {
    killer: Box<dyn ChildKiller + Send + Sync>,
    exit: Option<oneshot::Receiver<std::io::Result<portable_pty::ExitStatus>>>,
    status: Option<ExitStatus>,
}

impl PtyProcess {
    fn start(mut child: Box<dyn portable_pty::Child + Send + Sync>) -> Self {
        let killer = child.clone_killer();
        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait());
        });
        Self {
            killer,
            exit: Some(rx),
            status: None,
        }
    }
}

#[async_trait]
impl ProcessHandle for PtyProcess {
    async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let Some(exit) = self.exit.as_mut() else {
            return Err(ProcessError::Other("Wait already failed".to_string()));
        };
        let received = exit.await;
        self.exit = None;
        let raw = received.map_err(|_| ProcessError::Other("Wait thread stopped".to_string()))??;

        let status = match raw.signal().and_then(signal_number) {
            Some(signal) => ExitStatus::from_signal(signal),
            None => ExitStatus::from_code(u8::try_from(raw.exit_code()).unwrap_or(u8::MAX)),
        };
        self.status = Some(status);
        Ok(status)
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        if self.status.is_some() {
            return Ok(());
        }
        self.killer.kill()?;
        Ok(())
    }
}

/// A piped child running in its own process group.
struct GroupProcess {
    child: AsyncGroupChild,
}

#[async_trait]
impl ProcessHandle for GroupProcess {
    async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.child.wait().await?;
        Ok(exit_status(status))
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        self.child.start_kill()?;
        Ok(())
    }
}

/// portable-pty reports signals by their `strsignal` description, e.g.
/// "Killed" on Linux or "Killed: 9" on macOS.
fn signal_number(description: &str) -> Option<u8> {
    let trailing: Option<u8> = description
        .rsplit(&[' ', ':'][..])
        .next()
        .and_then(|n| n.parse().ok());
    if trailing.is_some() {
        return trailing;
    }
    let number = match description {
        "Hangup" => 1,
        "Interrupt" => 2,
        "Quit" => 3,
        "Illegal instruction" => 4,
        "Trace/breakpoint trap" => 5,
        "Aborted" | "Abort trap" => 6,
        "Floating point exception" => 8,
        "Killed" => 9,
        "Segmentation fault" => 11,
        "Broken pipe" => 13,
        "Alarm clock" => 14,
        "Terminated" => 15,
        _ => return None,
    };
    Some(number)
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return ExitStatus::from_signal(u8::try_from(signal).unwrap_or(u8::MAX));
        }
    }
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitStatus::from_code(u8::MAX), ExitStatus::from_code)
}
