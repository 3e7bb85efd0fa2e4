//! Segment Layout Module
//!
//! The shared cache lives in one flat byte region so that every process can
//! map it. The region is laid out as:
//!
//! ```text
//! | header (72) | buckets (u32 x B) | slots (576 x capacity) |
//! slot = | prev | next | chain | hash | record (560) |
//! ```
//!
//! Recency is an intrusive doubly-linked list threaded through the slots
//! (`head` = most recent, `tail` = least recent). Lookup goes through a
//! chained hash index keyed on the CRC32 of the key. Unused slots sit on a
//! free list linked through `next`. All integers are little-endian.
//!
//! The header also carries an invalidation generation. A segment whose
//! generation is behind the one recorded next to the log may hold entries
//! the log no longer agrees with, and is cleared before use.
//!
//! A [`Segment`] borrows the region and assumes the caller holds the
//! segment's lock for as long as the borrow lives.

use tracing::{debug, warn};

use crate::cache::CacheStats;
use crate::record::{Record, RECORD_SIZE};

// == Layout Constants ==
const MAGIC: u64 = u64::from_le_bytes(*b"KVDBLRU\0");
const VERSION: u32 = 2;
const NIL: u32 = u32::MAX;

pub const HEADER_SIZE: usize = 72;
const SLOT_HEADER: usize = 16;
pub const SLOT_SIZE: usize = SLOT_HEADER + RECORD_SIZE;

// Header fields
const H_MAGIC: usize = 0;
const H_VERSION: usize = 8;
const H_CAPACITY: usize = 12;
const H_LEN: usize = 16;
const H_HEAD: usize = 20;
const H_TAIL: usize = 24;
const H_FREE: usize = 28;
const H_DIRTY: usize = 32;
const H_BUCKETS: usize = 36;
const H_HITS: usize = 40;
const H_MISSES: usize = 48;
const H_EVICTIONS: usize = 56;
const H_GENERATION: usize = 64;

// Slot fields
const S_PREV: usize = 0;
const S_NEXT: usize = 4;
const S_CHAIN: usize = 8;
const S_HASH: usize = 12;

/// Number of hash buckets for a given capacity (always a power of two).
fn bucket_count(capacity: usize) -> usize {
    (capacity * 2).next_power_of_two()
}

/// Bytes needed for a segment holding `capacity` entries.
pub fn segment_size(capacity: usize) -> usize {
    HEADER_SIZE + bucket_count(capacity) * 4 + capacity * SLOT_SIZE
}

fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

// == Segment ==
/// A view over a formatted cache region.
#[derive(Debug)]
pub struct Segment<'a> {
    buf: &'a mut [u8],
    capacity: usize,
    mask: u32,
    slots_at: usize,
}

impl<'a> Segment<'a> {
    // == Format ==
    /// Writes an empty cache of `capacity` entries into `buf`.
    ///
    /// Returns None if `buf` is too small or `capacity` is zero.
    pub fn format(buf: &'a mut [u8], capacity: usize) -> Option<Self> {
        if capacity == 0 || capacity >= NIL as usize || buf.len() < segment_size(capacity) {
            return None;
        }
        let buckets = bucket_count(capacity);
        buf[..HEADER_SIZE].fill(0);
        put_u64(buf, H_MAGIC, MAGIC);
        put_u32(buf, H_VERSION, VERSION);
        put_u32(buf, H_CAPACITY, capacity as u32);
        put_u32(buf, H_BUCKETS, buckets as u32);

        let mut segment = Self::view(buf, capacity, buckets);
        segment.clear();
        Some(segment)
    }

    // == Open ==
    /// Attaches to an already formatted region.
    ///
    /// Returns None if the header is missing or inconsistent with `buf`.
    pub fn open(buf: &'a mut [u8]) -> Option<Self> {
        let capacity = Self::stored_capacity(buf)?;
        let buckets = get_u32(buf, H_BUCKETS) as usize;
        Some(Self::view(buf, capacity, buckets))
    }

    /// Capacity recorded in a valid header, if any.
    pub fn stored_capacity(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_SIZE
            || get_u64(buf, H_MAGIC) != MAGIC
            || get_u32(buf, H_VERSION) != VERSION
        {
            return None;
        }
        let capacity = get_u32(buf, H_CAPACITY) as usize;
        let buckets = get_u32(buf, H_BUCKETS) as usize;
        if capacity == 0 || buckets != bucket_count(capacity) || buf.len() < segment_size(capacity)
        {
            return None;
        }
        Some(capacity)
    }

    fn view(buf: &'a mut [u8], capacity: usize, buckets: usize) -> Self {
        Self {
            buf,
            capacity,
            mask: (buckets - 1) as u32,
            slots_at: HEADER_SIZE + buckets * 4,
        }
    }

    // == Clear ==
    /// Drops every entry and zeroes the counters, keeping the layout.
    pub fn clear(&mut self) {
        for field in [H_LEN, H_DIRTY] {
            self.set(field, 0);
        }
        for field in [H_HITS, H_MISSES, H_EVICTIONS] {
            put_u64(self.buf, field, 0);
        }
        self.set(H_HEAD, NIL);
        self.set(H_TAIL, NIL);

        for bucket in 0..=self.mask {
            self.set_bucket(bucket, NIL);
        }
        // Thread every slot onto the free list
        for idx in 0..self.capacity as u32 {
            let next = if idx + 1 < self.capacity as u32 { idx + 1 } else { NIL };
            self.set_slot(idx, S_NEXT, next);
        }
        self.set(H_FREE, 0);
    }

    // == Accessors ==
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.get(H_LEN) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a mutation was interrupted before it finished.
    pub fn is_dirty(&self) -> bool {
        self.get(H_DIRTY) != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.set(H_DIRTY, dirty as u32);
    }

    /// Invalidation generation the entries were cached under. Survives
    /// [`Segment::clear`].
    pub fn generation(&self) -> u64 {
        get_u64(self.buf, H_GENERATION)
    }

    pub fn set_generation(&mut self, generation: u64) {
        put_u64(self.buf, H_GENERATION, generation);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::new(
            get_u64(self.buf, H_HITS),
            get_u64(self.buf, H_MISSES),
            get_u64(self.buf, H_EVICTIONS),
            self.len(),
            self.capacity,
        )
    }

    // == Lookup ==
    /// Returns a copy of the entry for `key` and promotes it to the front.
    pub fn lookup(&mut self, key: &str) -> Option<Record> {
        let Some(idx) = self.find(key.as_bytes()) else {
            self.bump(H_MISSES);
            return None;
        };

        let at = self.record_at(idx);
        match Record::decode(&self.buf[at..at + RECORD_SIZE], at as u64) {
            Ok(record) => {
                self.promote(idx);
                self.bump(H_HITS);
                Some(record)
            }
            Err(e) => {
                warn!("Dropping unreadable cache entry for '{}': {}", key, e);
                self.discard(idx);
                self.bump(H_MISSES);
                None
            }
        }
    }

    // == Touch Or Insert ==
    /// Stores `record` as the most recent entry.
    ///
    /// An existing entry for the key is overwritten in place. Otherwise the
    /// least recently used entry is evicted when the cache is full. Returns
    /// the evicted key, if any.
    pub fn touch_or_insert(&mut self, record: &Record) -> Option<String> {
        if let Some(idx) = self.find(record.key.as_bytes()) {
            self.write_record(idx, record);
            self.promote(idx);
            return None;
        }

        let mut evicted = None;
        if self.len() >= self.capacity {
            let victim = self.get(H_TAIL);
            if victim != NIL {
                let at = self.record_at(victim);
                let key = String::from_utf8_lossy(Record::raw_key(&self.buf[at..])).into_owned();
                debug!("Evicting '{}' from cache", key);
                self.discard(victim);
                self.bump(H_EVICTIONS);
                evicted = Some(key);
            }
        }

        let idx = self.get(H_FREE);
        if idx == NIL {
            // Unreachable with a consistent free list; the entry is optional
            warn!("Cache free list exhausted, not caching '{}'", record.key);
            return evicted;
        }
        self.set(H_FREE, self.slot(idx, S_NEXT));

        self.write_record(idx, record);
        self.index_insert(idx, key_hash(record.key.as_bytes()));
        self.push_front(idx);
        self.set(H_LEN, self.get(H_LEN) + 1);
        evicted
    }

    // == Remove ==
    /// Drops the entry for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.find(key.as_bytes()) {
            Some(idx) => {
                self.discard(idx);
                true
            }
            None => false,
        }
    }

    // == Recency Order ==
    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut idx = self.get(H_HEAD);
        while idx != NIL && keys.len() < self.capacity {
            let at = self.record_at(idx);
            keys.push(String::from_utf8_lossy(Record::raw_key(&self.buf[at..])).into_owned());
            idx = self.slot(idx, S_NEXT);
        }
        keys
    }

    // == Internal: Index ==
    fn find(&self, key: &[u8]) -> Option<u32> {
        let hash = key_hash(key);
        let mut idx = self.bucket(hash & self.mask);
        // Bounded walk: a chain can never be longer than the slot count
        for _ in 0..self.capacity {
            if idx == NIL || idx as usize >= self.capacity {
                return None;
            }
            if self.slot(idx, S_HASH) == hash {
                let at = self.record_at(idx);
                if Record::raw_key(&self.buf[at..]) == key {
                    return Some(idx);
                }
            }
            idx = self.slot(idx, S_CHAIN);
        }
        None
    }

    fn index_insert(&mut self, idx: u32, hash: u32) {
        let bucket = hash & self.mask;
        self.set_slot(idx, S_HASH, hash);
        self.set_slot(idx, S_CHAIN, self.bucket(bucket));
        self.set_bucket(bucket, idx);
    }

    fn index_remove(&mut self, idx: u32) {
        let bucket = self.slot(idx, S_HASH) & self.mask;
        let chain = self.slot(idx, S_CHAIN);
        let mut cur = self.bucket(bucket);
        if cur == idx {
            self.set_bucket(bucket, chain);
            return;
        }
        for _ in 0..self.capacity {
            if cur == NIL {
                return;
            }
            let next = self.slot(cur, S_CHAIN);
            if next == idx {
                self.set_slot(cur, S_CHAIN, chain);
                return;
            }
            cur = next;
        }
    }

    // == Internal: Recency List ==
    fn unlink(&mut self, idx: u32) {
        let prev = self.slot(idx, S_PREV);
        let next = self.slot(idx, S_NEXT);
        if prev == NIL {
            self.set(H_HEAD, next);
        } else {
            self.set_slot(prev, S_NEXT, next);
        }
        if next == NIL {
            self.set(H_TAIL, prev);
        } else {
            self.set_slot(next, S_PREV, prev);
        }
    }

    fn push_front(&mut self, idx: u32) {
        let head = self.get(H_HEAD);
        self.set_slot(idx, S_PREV, NIL);
        self.set_slot(idx, S_NEXT, head);
        if head == NIL {
            self.set(H_TAIL, idx);
        } else {
            self.set_slot(head, S_PREV, idx);
        }
        self.set(H_HEAD, idx);
    }

    fn promote(&mut self, idx: u32) {
        if self.get(H_HEAD) != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// Unlinks a live slot from both structures and frees it.
    fn discard(&mut self, idx: u32) {
        self.unlink(idx);
        self.index_remove(idx);
        self.set_slot(idx, S_NEXT, self.get(H_FREE));
        self.set(H_FREE, idx);
        self.set(H_LEN, self.get(H_LEN).saturating_sub(1));
    }

    // == Internal: Raw Access ==
    fn write_record(&mut self, idx: u32, record: &Record) {
        let at = self.record_at(idx);
        record.encode_into(&mut self.buf[at..at + RECORD_SIZE]);
    }

    fn slot_at(&self, idx: u32) -> usize {
        self.slots_at + idx as usize * SLOT_SIZE
    }

    fn record_at(&self, idx: u32) -> usize {
        self.slot_at(idx) + SLOT_HEADER
    }

    fn slot(&self, idx: u32, field: usize) -> u32 {
        get_u32(self.buf, self.slot_at(idx) + field)
    }

    fn set_slot(&mut self, idx: u32, field: usize, value: u32) {
        let at = self.slot_at(idx) + field;
        put_u32(self.buf, at, value);
    }

    fn bucket(&self, bucket: u32) -> u32 {
        get_u32(self.buf, HEADER_SIZE + bucket as usize * 4)
    }

    fn set_bucket(&mut self, bucket: u32, value: u32) {
        put_u32(self.buf, HEADER_SIZE + bucket as usize * 4, value);
    }

    fn get(&self, field: usize) -> u32 {
        get_u32(self.buf, field)
    }

    fn set(&mut self, field: usize, value: u32) {
        put_u32(self.buf, field, value);
    }

    fn bump(&mut self, field: usize) {
        let value = get_u64(self.buf, field).wrapping_add(1);
        put_u64(self.buf, field, value);
    }
}

// == Byte Helpers ==
fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
