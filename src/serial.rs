//! Offset-based tailing of the SUT's serial log.
//!
//! The hypervisor appends to the serial file; the engine never writes
//! it. All reads are `[offset, EOF)` snapshots, so `wait_serial` can
//! poll the same window repeatedly without consuming anything until it
//! decides to advance.

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub struct SerialTail {
    path: PathBuf,
    offset: u64,
}

impl SerialTail {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current size of the serial file; 0 if it does not exist yet.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Move the offset to the current end of file and return it.
    pub fn set_offset_to_end(&mut self) -> u64 {
        self.offset = self.file_size();
        self.offset
    }

    /// Read `[offset, EOF)` without advancing the offset. A missing
    /// file reads as empty (the SUT may not have opened it yet).
    pub fn text(&self) -> Result<String> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(String::new()),
        };
        file.seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("failed to seek {}", self.path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn text_returns_bytes_after_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial0");
        std::fs::write(&path, "boot line one\n").unwrap();

        let mut tail = SerialTail::new(&path);
        assert_eq!(tail.text().unwrap(), "boot line one\n");

        tail.set_offset_to_end();
        assert_eq!(tail.text().unwrap(), "");

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "BOOT OK\n").unwrap();
        assert_eq!(tail.text().unwrap(), "BOOT OK\n");
        // text() does not advance
        assert_eq!(tail.text().unwrap(), "BOOT OK\n");
    }

    #[test]
    fn set_offset_returns_new_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial0");
        std::fs::write(&path, "12345").unwrap();

        let mut tail = SerialTail::new(&path);
        assert_eq!(tail.set_offset_to_end(), 5);
        assert_eq!(tail.offset(), 5);
    }

    #[test]
    fn missing_file_reads_empty() {
        let tail = SerialTail::new("/nonexistent/serial0");
        assert_eq!(tail.file_size(), 0);
        assert_eq!(tail.text().unwrap(), "");
    }
}
