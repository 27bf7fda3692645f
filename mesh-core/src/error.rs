use std::process::ExitStatus;

use thiserror::Error;

/// Errors surfaced by the reconciler and the components it drives.
///
/// Matches the error kinds described for this controller: configuration and
/// environment errors are fatal at startup, a failed shell command carries
/// enough context for the caller to decide whether it's transient (apply) or
/// must bubble (prune), and `NotFound` covers lookups against in-memory
/// state (the peer table) rather than the kernel.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("command '{label}' failed (exit {status:?}): {command}\n{stderr}")]
    CommandFailed {
        label: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn command_failed(label: &str, command: &str, status: ExitStatus, stderr: &[u8]) -> Self {
        Error::CommandFailed {
            label: label.to_string(),
            command: command.to_string(),
            status: status.code(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
