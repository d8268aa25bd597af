//! The on-disk key/value store behind each indexed cache.
//!
//! A store is a single append-only log file: a short header, then a
//! sequence of checksummed records.  Each record either sets a key to
//! a value, or removes a key.  Opening a store scans the log once to
//! rebuild an in-memory index from key to the latest record; reads
//! then cost one positioned read.  Dead records accumulate until the
//! store is compacted, which rewrites live records to a fresh file and
//! atomically renames it over the log.
//!
//! Any inconsistency (bad header, checksum mismatch, truncated record)
//! makes the whole log untrustworthy: the store logs a warning and
//! discards its contents.  The cache it backs only ever holds
//! recomputable data, and the lock file's dirty bit already covers
//! interrupted writes.
use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;

use extendhash::sha256;
use tempfile::NamedTempFile;

use crate::error::Error;
use crate::error::Result;

const MAGIC: &[u8; 6] = b"PCLOG\0";
const FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 8;

const RECORD_PUT: u8 = 1;
const RECORD_REMOVE: u8 = 2;
/// kind, key length, value length, checksum.
const RECORD_HEADER_SIZE: usize = 1 + 4 + 4 + 8;

/// Compact on close once dead records are at least this large and make
/// up half of the log.
const COMPACTION_MIN_GARBAGE: u64 = 64 * 1024;

fn header() -> [u8; HEADER_SIZE as usize] {
    let mut out = [0u8; HEADER_SIZE as usize];
    out[..6].copy_from_slice(MAGIC);
    out[6..].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    out
}

/// First 8 bytes of the SHA-256 of the record's kind, key and value.
fn checksum(kind: u8, key: &[u8], value: &[u8]) -> u64 {
    let mut input = Vec::with_capacity(1 + key.len() + value.len());
    input.push(kind);
    input.extend_from_slice(key);
    input.extend_from_slice(value);

    let hash = sha256::compute_hash(&input);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(prefix)
}

fn encode_record(kind: u8, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    let too_large = || Error::Serialization("entry is too large for the store".to_owned());
    let key_len = u32::try_from(key.len()).map_err(|_| too_large())?;
    let value_len = u32::try_from(value.len()).map_err(|_| too_large())?;

    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
    out.push(kind);
    out.extend_from_slice(&key_len.to_be_bytes());
    out.extend_from_slice(&value_len.to_be_bytes());
    out.extend_from_slice(&checksum(kind, key, value).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    Ok(out)
}

/// A decoded record, borrowing from the scan buffer.
struct Record<'a> {
    kind: u8,
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> Record<'a> {
    fn size(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.key.len() + self.value.len()) as u64
    }
}

/// Decodes the record at the start of `buf`, or describes why it is
/// invalid.
fn decode_record(buf: &[u8]) -> std::result::Result<Record<'_>, String> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err("truncated record header".to_owned());
    }

    let kind = buf[0];
    if kind != RECORD_PUT && kind != RECORD_REMOVE {
        return Err(format!("unknown record kind {}", kind));
    }

    let read_u32 = |at: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[at..at + 4]);
        u32::from_be_bytes(raw) as usize
    };
    let key_len = read_u32(1);
    let value_len = read_u32(5);
    let mut raw_checksum = [0u8; 8];
    raw_checksum.copy_from_slice(&buf[9..17]);
    let expected = u64::from_be_bytes(raw_checksum);

    let end = RECORD_HEADER_SIZE
        .checked_add(key_len)
        .and_then(|x| x.checked_add(value_len))
        .ok_or_else(|| "record size overflows".to_owned())?;
    if buf.len() < end {
        return Err("truncated record".to_owned());
    }

    let key = &buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len];
    let value = &buf[RECORD_HEADER_SIZE + key_len..end];
    if checksum(kind, key, value) != expected {
        return Err("checksum mismatch".to_owned());
    }

    Ok(Record { kind, key, value })
}

/// Where the latest live record for a key lives.
#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    file: File,
    index: HashMap<Vec<u8>, Slot>,
    /// End of the last valid record.
    end: u64,
    /// Bytes taken by records that are no longer live.
    garbage: u64,
}

impl Store {
    /// Opens the log at `path`, creating it (and its parent directory)
    /// if needed.  A corrupt log is discarded.
    pub fn open(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut store = Store {
            path: path.to_owned(),
            file,
            index: HashMap::new(),
            end: HEADER_SIZE,
            garbage: 0,
        };

        match store.scan() {
            Ok(()) => {}
            Err(Error::CorruptStore(_, reason)) => store.discard(&reason)?,
            Err(e) => return Err(e),
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn corrupt(&self, reason: impl Into<String>) -> Error {
        Error::CorruptStore(self.path.clone(), reason.into())
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        let len = self.file.metadata()?.len();
        let mut contents = vec![0u8; len as usize];
        self.file.read_exact_at(&mut contents, 0)?;
        Ok(contents)
    }

    /// Rebuilds the index from the log.
    fn scan(&mut self) -> Result<()> {
        let contents = self.read_all()?;

        self.index.clear();
        self.garbage = 0;
        if contents.is_empty() {
            self.file.write_all_at(&header(), 0)?;
            self.end = HEADER_SIZE;
            return Ok(());
        }

        if contents.len() < HEADER_SIZE as usize || contents[..HEADER_SIZE as usize] != header() {
            return Err(self.corrupt("unexpected file header"));
        }

        let mut pos = HEADER_SIZE;
        while (pos as usize) < contents.len() {
            let record = decode_record(&contents[pos as usize..])
                .map_err(|reason| self.corrupt(format!("{} at offset {}", reason, pos)))?;
            let size = record.size();

            let previous = if record.kind == RECORD_PUT {
                self.index.insert(record.key.to_vec(), Slot { offset: pos, size })
            } else {
                self.garbage += size;
                self.index.remove(record.key)
            };

            if let Some(previous) = previous {
                self.garbage += previous.size;
            }

            pos += size;
        }

        self.end = pos;
        Ok(())
    }

    /// Drops every entry after finding corruption.
    fn discard(&mut self, reason: &str) -> Result<()> {
        tracing::warn!(
            path = %self.path.display(),
            reason,
            "{} is corrupt. Discarding.",
            self.path.display()
        );
        self.reset()
    }

    /// Removes every entry.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.write_all_at(&header(), 0)?;
        self.index.clear();
        self.end = HEADER_SIZE;
        self.garbage = 0;
        Ok(())
    }

    fn read_slot(&self, slot: Slot) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; slot.size as usize];
        self.file.read_exact_at(&mut buf, slot.offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                self.corrupt("record extends past end of file")
            } else {
                e.into()
            }
        })?;

        match decode_record(&buf) {
            Ok(record) if record.kind == RECORD_PUT => Ok(record.value.to_vec()),
            Ok(_) => Err(self.corrupt(format!("index points to a removal at {}", slot.offset))),
            Err(reason) => Err(self.corrupt(format!("{} at offset {}", reason, slot.offset))),
        }
    }

    /// Returns the value for `key`.  Corruption discards the store and
    /// reads as a miss.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = match self.index.get(key) {
            Some(slot) => *slot,
            None => return Ok(None),
        };

        match self.read_slot(slot) {
            Ok(value) => Ok(Some(value)),
            Err(Error::CorruptStore(_, reason)) => {
                self.discard(&reason)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    fn append(&mut self, record: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.file.write_all_at(record, offset)?;
        self.end += record.len() as u64;
        Ok(offset)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let record = encode_record(RECORD_PUT, key, value)?;
        let offset = self.append(&record)?;
        let slot = Slot {
            offset,
            size: record.len() as u64,
        };

        if let Some(previous) = self.index.insert(key.to_vec(), slot) {
            self.garbage += previous.size;
        }

        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let previous = match self.index.remove(key) {
            Some(previous) => previous,
            None => return Ok(()),
        };

        let record = encode_record(RECORD_REMOVE, key, &[])?;
        self.append(&record)?;
        self.garbage += previous.size + record.len() as u64;
        Ok(())
    }

    /// Checks every record's checksum.
    pub fn verify(&self) -> Result<()> {
        let contents = self.read_all()?;

        if contents.len() < HEADER_SIZE as usize || contents[..HEADER_SIZE as usize] != header() {
            return Err(self.corrupt("unexpected file header"));
        }

        let mut pos = HEADER_SIZE as usize;
        while pos < contents.len() {
            let record = decode_record(&contents[pos..])
                .map_err(|reason| self.corrupt(format!("{} at offset {}", reason, pos)))?;
            pos += record.size() as usize;
        }

        Ok(())
    }

    /// Rewrites the log with only live records.
    pub fn compact(&mut self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::illegal_state("store path has no parent directory"))?;
        let tmp = NamedTempFile::new_in(dir)?;

        let mut entries: Vec<(&Vec<u8>, &Slot)> = self.index.iter().collect();
        entries.sort_by_key(|(_, slot)| slot.offset);

        let mut index = HashMap::with_capacity(entries.len());
        let mut pos = HEADER_SIZE;
        tmp.as_file().write_all_at(&header(), 0)?;
        for (key, slot) in entries {
            let mut record = vec![0u8; slot.size as usize];
            self.file.read_exact_at(&mut record, slot.offset)?;
            tmp.as_file().write_all_at(&record, pos)?;
            index.insert(key.clone(), Slot { offset: pos, size: slot.size });
            pos += slot.size;
        }

        tmp.as_file().sync_all()?;
        let file = tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::debug!(
            path = %self.path.display(),
            reclaimed = self.garbage,
            "compacted store"
        );
        self.file = file;
        self.index = index;
        self.end = pos;
        self.garbage = 0;
        Ok(())
    }

    /// Flushes the log, compacting it first when mostly garbage.
    pub fn close(mut self) -> Result<()> {
        if self.garbage >= COMPACTION_MIN_GARBAGE && self.garbage * 2 >= self.end {
            self.compact()?;
        }

        self.file.sync_all()?;
        Ok(())
    }
}

#[test]
fn test_put_get_remove() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let mut store = Store::open(&temp.path().join("entries.bin")).expect("open must succeed");

    assert_eq!(store.get(b"a").expect("get must succeed"), None);
    store.put(b"a", b"1").expect("put must succeed");
    store.put(b"b", b"2").expect("put must succeed");
    store.put(b"a", b"3").expect("put must succeed");
    assert_eq!(store.get(b"a").expect("get must succeed"), Some(b"3".to_vec()));
    assert_eq!(store.len(), 2);

    store.remove(b"b").expect("remove must succeed");
    store.remove(b"missing").expect("remove must succeed");
    assert_eq!(store.get(b"b").expect("get must succeed"), None);
    assert!(!store.contains_key(b"b"));
    store.verify().expect("store must be valid");
}

/// Entries survive close and reopen, including removals.
#[test]
fn test_reopen() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("entries.bin");

    let mut store = Store::open(&path).expect("open must succeed");
    store.put(b"kept", b"value").expect("put must succeed");
    store.put(b"gone", b"value").expect("put must succeed");
    store.remove(b"gone").expect("remove must succeed");
    store.close().expect("close must succeed");

    let mut store = Store::open(&path).expect("open must succeed");
    assert_eq!(store.get(b"kept").expect("get must succeed"), Some(b"value".to_vec()));
    assert_eq!(store.get(b"gone").expect("get must succeed"), None);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_compaction_keeps_live_entries() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("entries.bin");

    let mut store = Store::open(&path).expect("open must succeed");
    for i in 0..100u32 {
        store
            .put(&(i % 10).to_be_bytes(), &i.to_be_bytes())
            .expect("put must succeed");
    }
    store.remove(&0u32.to_be_bytes()).expect("remove must succeed");

    let before = std::fs::metadata(&path).expect("stat must succeed").len();
    store.compact().expect("compaction must succeed");
    let after = std::fs::metadata(&path).expect("stat must succeed").len();
    assert!(after < before);

    assert_eq!(store.get(&0u32.to_be_bytes()).expect("get must succeed"), None);
    for i in 1..10u32 {
        assert_eq!(
            store.get(&i.to_be_bytes()).expect("get must succeed"),
            Some((90 + i).to_be_bytes().to_vec())
        );
    }

    store.verify().expect("store must be valid");
    store.close().expect("close must succeed");
    assert_eq!(Store::open(&path).expect("open must succeed").len(), 9);
}

/// A flipped byte is detected on open, and the log is discarded.
#[test]
fn test_corruption_on_open_discards() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("entries.bin");

    let mut store = Store::open(&path).expect("open must succeed");
    store.put(b"key", b"value").expect("put must succeed");
    store.close().expect("close must succeed");

    let mut bytes = std::fs::read(&path).expect("read must succeed");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, &bytes).expect("write must succeed");

    let mut store = Store::open(&path).expect("open must succeed");
    assert!(store.is_empty());
    assert_eq!(store.get(b"key").expect("get must succeed"), None);
    store.verify().expect("discarded store is valid");
}

/// Corruption behind an open store's back reads as a miss.
#[test]
fn test_corruption_on_read_discards() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("entries.bin");

    let mut store = Store::open(&path).expect("open must succeed");
    store.put(b"key", b"value").expect("put must succeed");
    store.put(b"other", b"value").expect("put must succeed");

    let writer = OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open must succeed");
    writer
        .write_all_at(b"X", HEADER_SIZE + RECORD_HEADER_SIZE as u64)
        .expect("write must succeed");
    assert!(store.verify().is_err());

    assert_eq!(store.get(b"key").expect("get must succeed"), None);
    assert!(store.is_empty());
    assert_eq!(store.get(b"other").expect("get must succeed"), None);
}

#[test]
fn test_foreign_file_is_discarded() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("entries.bin", FileType::RandomFile(100));
    let store = Store::open(&temp.path("entries.bin")).expect("open must succeed");
    assert!(store.is_empty());
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    /// Keys and values come from small ranges so that operations
    /// collide often.
    #[derive(Arbitrary, Clone, Copy, Debug)]
    enum Op {
        Put(#[proptest(strategy = "0..8u8")] u8, u8),
        Remove(#[proptest(strategy = "0..8u8")] u8),
        Compact,
        Reopen,
    }

    proptest! {
        /// A store behaves like a map, across compactions and reopens.
        #[test]
        fn test_store_matches_map(ops in vec(any::<Op>(), 0..50usize)) {
            let temp = tempfile::tempdir().expect("tempdir must succeed");
            let path = temp.path().join("entries.bin");
            let mut store = Store::open(&path).expect("open must succeed");
            let mut model: HashMap<u8, u8> = HashMap::new();

            for op in ops {
                match op {
                    Op::Put(key, value) => {
                        store.put(&[key], &[value]).expect("put must succeed");
                        model.insert(key, value);
                    }
                    Op::Remove(key) => {
                        store.remove(&[key]).expect("remove must succeed");
                        model.remove(&key);
                    }
                    Op::Compact => store.compact().expect("compact must succeed"),
                    Op::Reopen => {
                        store.close().expect("close must succeed");
                        store = Store::open(&path).expect("open must succeed");
                    }
                }
            }

            prop_assert_eq!(store.len(), model.len());
            for key in 0..8u8 {
                let expected = model.get(&key).map(|value| vec![*value]);
                prop_assert_eq!(store.get(&[key]).expect("get must succeed"), expected);
            }
            store.verify().expect("store must be valid");
        }
    }
}
