//! On-disk spill for step records that could not be persisted.
//!
//! Append-only file of length-prefixed records: `u32` little-endian payload
//! length followed by the serde_json bytes of one [`StepRecord`]. The file is
//! truncated only after a successful drain, so records survive a process
//! crash between buffering and store write.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::record::StepRecord;

pub struct SpillFile {
    path: PathBuf,
    // guards the append/read/truncate window; the file handle itself is
    // opened per operation
    lock: Mutex<()>,
}

impl SpillFile {
    /// Open (creating parent directories) a spill file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records. Each record is fully serialized before any byte is
    /// written, so a failure here leaves the file unchanged.
    pub fn append(&self, records: &[StepRecord]) -> std::io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::new();
        for record in records {
            let payload = serde_json::to_vec(record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            encoded.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            encoded.extend_from_slice(&payload);
        }

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&encoded)?;
        file.sync_data()
    }

    /// Read every intact record currently in the file.
    ///
    /// A truncated tail record (crash mid-write) is skipped; everything
    /// before it is returned.
    pub fn read_all(&self) -> std::io::Result<Vec<StepRecord>> {
        let _guard = self.lock.lock();
        let mut bytes = Vec::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= bytes.len() {
            let len = u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]) as usize;
            offset += 4;
            if offset + len > bytes.len() {
                tracing::warn!(path = %self.path.display(), "truncated spill tail, dropping partial record");
                break;
            }
            match serde_json::from_slice::<StepRecord>(&bytes[offset..offset + len]) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "corrupt spill record skipped");
                }
            }
            offset += len;
        }
        Ok(records)
    }

    /// Truncate the file after a successful drain.
    pub fn truncate(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        match OpenOptions::new().write(true).truncate(true).open(&self.path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_empty(&self) -> bool {
        fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample(n: u32) -> StepRecord {
        StepRecord::error(Uuid::new_v4(), n, "store_error", "unreachable")
    }

    #[test]
    fn test_append_read_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::open(dir.path().join("steps.spill")).unwrap();
        assert!(spill.is_empty());

        spill.append(&[sample(1), sample(2)]).unwrap();
        spill.append(&[sample(3)]).unwrap();
        assert!(!spill.is_empty());

        let records = spill.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].step_number, 1);
        assert_eq!(records[2].step_number, 3);

        spill.truncate().unwrap();
        assert!(spill.is_empty());
        assert!(spill.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.spill");
        {
            let spill = SpillFile::open(&path).unwrap();
            spill.append(&[sample(7)]).unwrap();
        }
        // a fresh handle sees what the previous process wrote
        let spill = SpillFile::open(&path).unwrap();
        let records = spill.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step_number, 7);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.spill");
        let spill = SpillFile::open(&path).unwrap();
        spill.append(&[sample(1)]).unwrap();

        // simulate a crash mid-write of the second record
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&1000u32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let records = spill.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step_number, 1);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::open(dir.path().join("never-written.spill")).unwrap();
        assert!(spill.read_all().unwrap().is_empty());
        spill.truncate().unwrap();
    }
}
