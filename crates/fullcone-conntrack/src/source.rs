//! The `conntrack` userspace tool as an event source

use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to launch {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{bin} exited with {status}: {stderr}")]
    Exited {
        bin: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{0} did not expose a stdout pipe")]
    MissingStdout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wrapper around the `conntrack` binary
#[derive(Debug, Clone)]
pub struct ConntrackCli {
    bin_path: PathBuf,
}

impl ConntrackCli {
    pub fn new(bin_path: impl Into<PathBuf>) -> Self {
        Self {
            bin_path: bin_path.into(),
        }
    }

    pub fn bin_path(&self) -> &Path {
        &self.bin_path
    }

    fn bin_name(&self) -> String {
        self.bin_path.display().to_string()
    }

    /// List the current TCP entries of the kernel table
    ///
    /// Fails when the binary is missing, lacks privilege, or the kernel module
    /// is not loaded; all of those make conntrack exit non-zero.
    pub async fn dump(&self) -> Result<Vec<String>, SourceError> {
        let output = Command::new(&self.bin_path)
            .args(["-L", "-p", "tcp", "-o", "id"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SourceError::Spawn {
                bin: self.bin_name(),
                source,
            })?;

        if !output.status.success() {
            return Err(SourceError::Exited {
                bin: self.bin_name(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Start streaming TCP events from the kernel
    pub fn subscribe(&self) -> Result<EventStream, SourceError> {
        let mut child = Command::new(&self.bin_path)
            .args(["-E", "-p", "tcp", "-o", "id"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                bin: self.bin_name(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::MissingStdout(self.bin_name()))?;

        debug!(
            "Subscribed to conntrack events via {} (pid {:?})",
            self.bin_name(),
            child.id()
        );

        Ok(EventStream {
            child,
            lines: BufReader::new(stdout).lines(),
        })
    }
}

/// A running `conntrack -E` process
pub struct EventStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl EventStream {
    /// Next raw line, or `None` once the process closed its stdout
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Terminate the child and reap it
    pub async fn stop(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("conntrack child already gone: {}", e);
        }
        let _ = self.child.wait().await;
    }
}
