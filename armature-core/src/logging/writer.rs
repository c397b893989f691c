//! Log sinks
//!
//! Three sinks: nothing, stdout, and a size-rotating file. Rotation renames
//! the live file with a timestamped suffix and reopens a fresh one.

use anyhow::{Context as _, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sink the queue consumer writes formatted entries into.
pub trait LogWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Discards everything.
pub struct NilWriter;

impl LogWriter for NilWriter {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes to standard output.
pub struct StdoutWriter;

impl LogWriter for StdoutWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        std::io::stdout().write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// Appends to a file, rotating once it reaches `max_size` bytes. A
/// `max_size` of zero disables rotation.
pub struct FileWriter {
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
}

impl FileWriter {
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = Self::append(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, file, size, max_size })
    }

    fn append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))
    }

    fn check_size(&mut self) -> Result<()> {
        if self.max_size == 0 || self.size < self.max_size {
            return Ok(());
        }
        self.file.flush()?;

        let ext = self.path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let stem = self.path.with_extension("");
        let now = Utc::now();
        let rotated = format!(
            "{}_{}_{}{}{}",
            stem.display(),
            now.format("%d-%b-%Y"),
            now.timestamp_nanos_opt().unwrap_or_default(),
            if ext.is_empty() { "" } else { "." },
            ext,
        );
        std::fs::rename(&self.path, &rotated)
            .with_context(|| format!("error rotating log file to {}", rotated))?;

        self.file = Self::append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

impl LogWriter for FileWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_size()?;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
