//! Atomic configuration file writes
//!
//! The document is written to `<path>.tmp` in the same directory, synced,
//! and renamed over the target so the proxy never reads a partial file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AtomicWriter {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl AtomicWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp: OsString = path.clone().into_os_string();
        tmp.push(".tmp");

        Self {
            path,
            tmp_path: PathBuf::from(tmp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: std::io::Error) -> WriteError {
        WriteError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Check that the target directory accepts new files
    ///
    /// Creates and removes the temporary file without touching the target.
    pub async fn probe(&self) -> Result<(), WriteError> {
        tokio::fs::File::create(&self.tmp_path)
            .await
            .map_err(|e| Self::io_error(&self.tmp_path, e))?;
        tokio::fs::remove_file(&self.tmp_path)
            .await
            .map_err(|e| Self::io_error(&self.tmp_path, e))?;
        Ok(())
    }

    pub async fn write(&self, contents: &str) -> Result<(), WriteError> {
        let mut file = tokio::fs::File::create(&self.tmp_path)
            .await
            .map_err(|e| Self::io_error(&self.tmp_path, e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| Self::io_error(&self.tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::io_error(&self.tmp_path, e))?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fullcone.conf");
        std::fs::write(&path, "old").unwrap();

        let writer = AtomicWriter::new(&path);
        writer.write("new contents\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new contents\n");
        assert!(!dir.path().join("fullcone.conf.tmp").exists());
    }

    #[tokio::test]
    async fn test_probe_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let writer = AtomicWriter::new(dir.path().join("fullcone.conf"));

        writer.probe().await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let writer = AtomicWriter::new(dir.path().join("missing").join("fullcone.conf"));

        assert!(matches!(writer.probe().await, Err(WriteError::Io { .. })));
        assert!(writer.write("x").await.is_err());
    }
}
