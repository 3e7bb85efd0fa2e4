//! Record Codec
//!
//! Fixed-width layout shared by the storage log and the cache segment:
//!
//! ```text
//! | key (256) | value (256) | first_set (24) | last_set (24) |
//! ```
//!
//! Text fields are NUL-padded. Timestamps are `YYYY-MM-DD HH:MM:SS` in local
//! time. Record boundaries are implicit from [`RECORD_SIZE`].

use chrono::{Local, NaiveDateTime, SubsecRound};

use crate::error::{KvError, Result};

// == Layout Constants ==
pub const KEY_FIELD: usize = 256;
pub const VALUE_FIELD: usize = 256;
pub const TIMESTAMP_FIELD: usize = 24;

/// Size in bytes of one encoded record
pub const RECORD_SIZE: usize = KEY_FIELD + VALUE_FIELD + 2 * TIMESTAMP_FIELD;

/// Longest key accepted (one byte of the field is reserved for the terminator)
pub const MAX_KEY_LENGTH: usize = KEY_FIELD - 1;

/// Longest value accepted
pub const MAX_VALUE_LENGTH: usize = VALUE_FIELD - 1;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const VALUE_OFFSET: usize = KEY_FIELD;
const FIRST_OFFSET: usize = VALUE_OFFSET + VALUE_FIELD;
const LAST_OFFSET: usize = FIRST_OFFSET + TIMESTAMP_FIELD;

// == Record ==
/// One key/value pair with its creation and last-modification times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: String,
    /// Set when the key is first written, never changed afterwards
    pub first_set: NaiveDateTime,
    /// Updated on every overwrite
    pub last_set: NaiveDateTime,
}

impl Record {
    // == Constructor ==
    /// Creates a fresh record with both timestamps set to `now`.
    ///
    /// Rejects keys and values that do not fit the layout before any I/O.
    pub fn new(key: &str, value: &str, now: NaiveDateTime) -> Result<Self> {
        validate_key(key)?;
        validate_value(value)?;
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
            first_set: now,
            last_set: now,
        })
    }

    // == Overwrite ==
    /// Replaces the value and bumps `last_set`, keeping `first_set <= last_set`.
    pub fn overwrite(&mut self, value: &str, now: NaiveDateTime) {
        self.value = value.to_string();
        self.last_set = now.max(self.first_set);
    }

    // == Encode ==
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Writes the record into the first [`RECORD_SIZE`] bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let buf = &mut buf[..RECORD_SIZE];
        buf.fill(0);
        put_field(&mut buf[..VALUE_OFFSET], self.key.as_bytes());
        put_field(&mut buf[VALUE_OFFSET..FIRST_OFFSET], self.value.as_bytes());
        put_field(
            &mut buf[FIRST_OFFSET..LAST_OFFSET],
            format_timestamp(&self.first_set).as_bytes(),
        );
        put_field(
            &mut buf[LAST_OFFSET..],
            format_timestamp(&self.last_set).as_bytes(),
        );
    }

    // == Decode ==
    /// Decodes one record; `offset` is only used to locate errors.
    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < RECORD_SIZE {
            return Err(corrupt(offset, format!("short record of {} bytes", buf.len())));
        }
        Ok(Self {
            key: text_field(&buf[..VALUE_OFFSET], offset, "key")?.to_string(),
            value: text_field(&buf[VALUE_OFFSET..FIRST_OFFSET], offset, "value")?.to_string(),
            first_set: timestamp_field(&buf[FIRST_OFFSET..LAST_OFFSET], offset, "first_set")?,
            last_set: timestamp_field(&buf[LAST_OFFSET..RECORD_SIZE], offset, "last_set")?,
        })
    }

    // == Key Match ==
    /// Compares the encoded key field against `key` without a full decode.
    pub fn key_matches(buf: &[u8], key: &str) -> bool {
        buf.len() >= KEY_FIELD && trim_field(&buf[..KEY_FIELD]) == key.as_bytes()
    }

    /// Borrows the raw key bytes of an encoded record.
    pub fn raw_key(buf: &[u8]) -> &[u8] {
        trim_field(&buf[..KEY_FIELD])
    }
}

// == Validation ==
/// Checks a key against the layout bounds.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(KvError::RecordTooLarge {
            field: "key",
            len: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    if key.as_bytes().contains(&0) {
        return Err(KvError::InvalidKey("key contains a NUL byte".to_string()));
    }
    Ok(())
}

/// Checks a value against the layout bounds.
pub fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_LENGTH {
        return Err(KvError::RecordTooLarge {
            field: "value",
            len: value.len(),
            max: MAX_VALUE_LENGTH,
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(KvError::InvalidValue("value contains a NUL byte".to_string()));
    }
    Ok(())
}

// == Timestamps ==
/// Current local time at second resolution, matching the stored format.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

// == Field Helpers ==
fn put_field(field: &mut [u8], bytes: &[u8]) {
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

fn trim_field(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

fn text_field<'a>(field: &'a [u8], offset: u64, name: &str) -> Result<&'a str> {
    std::str::from_utf8(trim_field(field))
        .map_err(|e| corrupt(offset, format!("{} is not UTF-8: {}", name, e)))
}

fn timestamp_field(field: &[u8], offset: u64, name: &str) -> Result<NaiveDateTime> {
    let raw = text_field(field, offset, name)?;
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| corrupt(offset, format!("{} '{}': {}", name, raw, e)))
}

fn corrupt(offset: u64, reason: String) -> KvError {
    KvError::CorruptRecord { offset, reason }
}
