//! Reload actions applied after a configuration write

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::writer::WriteError;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("Invalid reload command '{0}'")]
    InvalidCommand(String),

    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("'{command}' did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Makes the running proxy pick up the freshly written configuration
#[async_trait]
pub trait ReloadAction: Send + Sync {
    async fn apply(&self) -> Result<(), ReloadError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Runs an external command; exit status 0 means the reload took effect
#[derive(Debug, Clone)]
pub struct CommandReload {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandReload {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self, ReloadError> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(ReloadError::InvalidCommand(argv.join(" ")));
        }
        Ok(Self { argv, timeout })
    }

    /// Split a command line with shell quoting rules (no shell is involved
    /// when running it)
    pub fn parse(command_line: &str, timeout: Duration) -> Result<Self, ReloadError> {
        let argv = shell_words::split(command_line)
            .map_err(|_| ReloadError::InvalidCommand(command_line.to_string()))?;
        Self::new(argv, timeout)
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl ReloadAction for CommandReload {
    async fn apply(&self) -> Result<(), ReloadError> {
        let command = self.describe();
        debug!("Running reload command: {}", command);

        let run = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ReloadError::Spawn { command, source }),
            Err(_) => {
                return Err(ReloadError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ReloadError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    fn describe(&self) -> String {
        shell_words::join(&self.argv)
    }
}
