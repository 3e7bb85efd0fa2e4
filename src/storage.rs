//! Storage Log
//!
//! The authoritative flat file of fixed-size records. Callers must hold the
//! log lock around every method here; the log itself does no locking.
//!
//! Lookups are a linear scan. An in-memory key to offset index would be the
//! next step if the log ever grows beyond a few thousand records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{KvError, Result};
use crate::record::{validate_key, validate_value, Record, RECORD_SIZE};

// == Storage Log ==
#[derive(Debug, Clone)]
pub struct StorageLog {
    path: PathBuf,
}

impl StorageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // == Scan ==
    /// Returns the live record for `key`, if any.
    ///
    /// A missing log file is an empty log.
    pub fn scan_for(&self, key: &str) -> Result<Option<Record>> {
        let Some(file) = self.open_existing()? else {
            return Ok(None);
        };
        match self.find(&file, key)? {
            Some((offset, raw)) => Record::decode(&raw, offset).map(Some),
            None => Ok(None),
        }
    }

    // == Upsert ==
    /// Overwrites the record for `key` in place, or appends a new one.
    ///
    /// Returns the record as stored.
    pub fn upsert(&self, key: &str, value: &str, now: NaiveDateTime) -> Result<Record> {
        validate_key(key)?;
        validate_value(value)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        let (offset, record) = match self.find(&file, key)? {
            Some((offset, raw)) => {
                let mut record = Record::decode(&raw, offset)?;
                record.overwrite(value, now);
                debug!("Overwriting '{}' at offset {}", key, offset);
                (offset, record)
            }
            None => {
                let record = Record::new(key, value, now)?;
                // Land on a record boundary even if a torn write left a tail
                let len = file.metadata().map_err(|e| self.io_error(e))?.len();
                let offset = len - len % RECORD_SIZE as u64;
                debug!("Appending '{}' at offset {}", key, offset);
                (offset, record)
            }
        };

        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&record.encode()))
            .map_err(|e| self.io_error(e))?;
        Ok(record)
    }

    // == Delete ==
    /// Removes the record for `key` by rewriting the log without it.
    ///
    /// Survivors are written to a temporary file in the same directory,
    /// synced, then renamed over the log in one step. Any failure before
    /// the rename leaves the original untouched. Returns false without
    /// rewriting when no record matches.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let Some(file) = self.open_existing()? else {
            return Ok(false);
        };
        let Some((skip, _)) = self.find(&file, key)? else {
            debug!("No record for '{}', skipping rewrite", key);
            return Ok(false);
        };

        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_error(e))?;
        let kept = self.copy_except(&file, tmp.as_file_mut(), skip)?;

        let permissions = file
            .metadata()
            .map_err(|e| self.io_error(e))?
            .permissions();
        fs::set_permissions(tmp.path(), permissions).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        drop(file);

        tmp.persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;
        info!("Deleted '{}', {} records remain", key, kept);
        Ok(true)
    }

    // == Records ==
    /// Every complete record in file order.
    pub fn records(&self) -> Result<Vec<Record>> {
        let Some(file) = self.open_existing()? else {
            return Ok(Vec::new());
        };
        let mut reader = BufReader::new(&file);
        let mut raw = [0u8; RECORD_SIZE];
        let mut records = Vec::new();
        let mut offset = 0u64;
        while read_record(&mut reader, &mut raw).map_err(|e| self.io_error(e))? {
            records.push(Record::decode(&raw, offset)?);
            offset += RECORD_SIZE as u64;
        }
        Ok(records)
    }

    // == Internal ==
    fn open_existing(&self) -> Result<Option<File>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Offset and raw bytes of the first record whose key is `key`.
    fn find(&self, file: &File, key: &str) -> Result<Option<(u64, [u8; RECORD_SIZE])>> {
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| self.io_error(e))?;

        let mut raw = [0u8; RECORD_SIZE];
        let mut offset = 0u64;
        while read_record(&mut reader, &mut raw).map_err(|e| self.io_error(e))? {
            if Record::key_matches(&raw, key) {
                return Ok(Some((offset, raw)));
            }
            offset += RECORD_SIZE as u64;
        }
        Ok(None)
    }

    fn copy_except(&self, src: &File, dst: &mut File, skip: u64) -> Result<usize> {
        let mut reader = BufReader::new(src);
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| self.io_error(e))?;
        let mut writer = BufWriter::new(dst);

        let mut raw = [0u8; RECORD_SIZE];
        let mut offset = 0u64;
        let mut kept = 0;
        while read_record(&mut reader, &mut raw).map_err(|e| self.io_error(e))? {
            if offset != skip {
                writer.write_all(&raw).map_err(|e| self.io_error(e))?;
                kept += 1;
            }
            offset += RECORD_SIZE as u64;
        }
        writer.flush().map_err(|e| self.io_error(e))?;
        Ok(kept)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn io_error(&self, e: io::Error) -> KvError {
        KvError::storage(&self.path, e)
    }
}

/// Fills `buf` with the next record. Returns false at end of file,
/// including when only a partial record remains.
fn read_record(reader: &mut impl Read, buf: &mut [u8; RECORD_SIZE]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < RECORD_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn log_in(dir: &Path) -> StorageLog {
        StorageLog::new(dir.join("kvdb.dat"))
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        assert!(log.scan_for("apple").unwrap().is_none());
        assert!(log.records().unwrap().is_empty());
        assert!(!log.delete("apple").unwrap());
        assert!(!log.path().exists());
    }

    #[test]
    fn test_append_then_scan() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        log.upsert("apple", "1", at(1)).unwrap();
        log.upsert("pear", "2", at(2)).unwrap();

        let found = log.scan_for("pear").unwrap().unwrap();
        assert_eq!(found.value, "2");
        assert_eq!(found.first_set, at(2));
        assert_eq!(
            fs::metadata(log.path()).unwrap().len(),
            2 * RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_upsert_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        log.upsert("apple", "1", at(1)).unwrap();
        log.upsert("pear", "x", at(1)).unwrap();
        let updated = log.upsert("apple", "2", at(3)).unwrap();

        assert_eq!(updated.first_set, at(1));
        assert_eq!(updated.last_set, at(3));

        let records = log.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "apple");
        assert_eq!(records[0].value, "2");
        assert_eq!(records[1].key, "pear");
    }

    #[test]
    fn test_upsert_rejects_oversized_value_before_io() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        let value = "v".repeat(300);
        let result = log.upsert("apple", &value, at(1));
        assert!(matches!(result, Err(KvError::RecordTooLarge { .. })));
        assert!(!log.path().exists());
    }

    #[test]
    fn test_delete_rewrites_without_key() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
            log.upsert(key, value, at(1)).unwrap();
        }
        assert!(log.delete("b").unwrap());

        let keys: Vec<String> = log.records().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert!(log.scan_for("b").unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_key_leaves_file_alone() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.upsert("a", "1", at(1)).unwrap();
        let before = fs::read(log.path()).unwrap();

        assert!(!log.delete("zzz").unwrap());
        assert_eq!(fs::read(log.path()).unwrap(), before);
    }

    #[test]
    fn test_delete_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.upsert("a", "1", at(1)).unwrap();
        log.delete("a").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("kvdb.dat")]);
    }

    #[test]
    fn test_partial_tail_ends_scan_and_is_overwritten() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.upsert("a", "1", at(1)).unwrap();

        // Torn append
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(&[7u8; 100]).unwrap();
        drop(file);

        assert_eq!(log.records().unwrap().len(), 1);
        log.upsert("b", "2", at(2)).unwrap();
        assert_eq!(log.records().unwrap().len(), 2);
        assert_eq!(
            fs::metadata(log.path()).unwrap().len(),
            2 * RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_relative_path_uses_current_dir() {
        let log = StorageLog::new("kvdb.dat");
        assert_eq!(log.dir(), Path::new("."));
    }

    #[test]
    fn test_log_path_that_is_a_directory_is_unavailable() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        fs::create_dir(log.path()).unwrap();

        assert!(matches!(
            log.upsert("a", "1", at(1)),
            Err(KvError::StorageUnavailable { .. })
        ));
        assert!(matches!(
            log.scan_for("a"),
            Err(KvError::StorageUnavailable { .. })
        ));
        assert!(matches!(
            log.records(),
            Err(KvError::StorageUnavailable { .. })
        ));
    }
}
