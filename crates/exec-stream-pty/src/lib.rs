//! Process adapters for exec stream sessions.
//!
//! Provides:
//! - `spawn` - Start a command on a PTY or on pipes
//! - Shell detection and executable lookup

pub mod shell;
pub mod spawn;

pub use shell::{UnixShell, resolve_executable_path, split_command_line};
pub use spawn::{CommandSpec, SpawnError, spawn};
