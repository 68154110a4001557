//! Shell and executable lookup.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Resolve an executable by name.
///
/// Explicit paths (absolute, or containing a separator) are used as they are
/// when they point at a file; bare names are looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

/// Split a command line into argv using shell quoting rules.
#[must_use]
pub fn split_command_line(line: &str) -> Option<Vec<String>> {
    shlex::split(line)
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Arguments that make the shell behave as a login shell.
    #[must_use]
    pub fn login_args(&self) -> &'static [&'static str] {
        match self {
            Self::Zsh(_) | Self::Bash(_) => &["-l"],
            Self::Sh(_) | Self::Other(_) => &[],
        }
    }

    /// Shell named by `$SHELL` when it is an existing absolute path,
    /// `/bin/sh` otherwise.
    #[must_use]
    pub fn current_shell() -> Self {
        std::env::var_os("SHELL")
            .and_then(|shell| Self::from_path(Path::new(&shell)))
            .unwrap_or_else(|| Self::Sh(PathBuf::from("/bin/sh")))
    }

    /// Create from a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        Some(match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_line() {
        assert_eq!(
            split_command_line("echo 'hello world' \"a b\"").unwrap(),
            vec!["echo", "hello world", "a b"]
        );
        assert!(split_command_line("echo 'unterminated").is_none());
    }

    #[test]
    fn test_from_path_rejects_relative() {
        assert!(UnixShell::from_path(Path::new("bin/sh")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_from_path_classifies() {
        let shell = UnixShell::from_path(Path::new("/bin/sh")).unwrap();
        assert_eq!(shell, UnixShell::Sh(PathBuf::from("/bin/sh")));
        assert!(shell.login_args().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_executable_path() {
        let sh = resolve_executable_path("sh").await.unwrap();
        assert!(sh.is_absolute());
        assert_eq!(resolve_executable_path("/bin/sh").await, Some(PathBuf::from("/bin/sh")));
        assert!(resolve_executable_path("").await.is_none());
        assert!(resolve_executable_path("./definitely-not-here").await.is_none());
        assert!(
            resolve_executable_path("exec-stream-no-such-binary")
                .await
                .is_none()
        );
    }
}
