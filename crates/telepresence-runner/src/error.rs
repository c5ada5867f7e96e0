use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("command exited with code {code}: {command}")]
    CommandFailed {
        command: String,
        code: i32,
        /// Captured stdout/stderr, for surfacing cluster errors verbatim.
        output: String,
    },
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },
    #[error("{count} background process(es) crashed")]
    BackgroundCrash { count: usize, details: String },
    /// A user-facing failure: shown as a one-line message, exit code 1.
    #[error("{0}")]
    Fatal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// The captured output of a failed command, if any.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            RunnerError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}
