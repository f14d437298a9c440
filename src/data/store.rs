//! Sequential record storage.
//!
//! The reader body pulls one serialized record at a time through a cursor;
//! which engine stands behind the cursor is the storage collaborator's
//! business. [`MemStore`] serves tests and demos, [`FlatFileStore`] is a
//! minimal file-backed store with a write path for building fixtures.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::utils::error::{Result, TreeSyncError};

/// Iteration state over a store's records.
pub trait Cursor: Send {
    fn seek_to_first(&mut self);
    fn next(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn valid(&self) -> bool;
}

/// A record store readable through a sequential cursor. One cursor is opened
/// per reader body, however many consumers share it.
pub trait RecordStore: Send + Sync {
    fn open(&self) -> Result<Box<dyn Cursor>>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemStore {
    records: Arc<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Vec<u8>, value: Vec<u8>) {
        Arc::get_mut(&mut self.records)
            .expect("push after a cursor was opened")
            .push((key, value));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for MemStore {
    fn open(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MemCursor {
            records: self.records.clone(),
            pos: 0,
        }))
    }
}

struct MemCursor {
    records: Arc<Vec<(Vec<u8>, Vec<u8>)>>,
    pos: usize,
}

impl Cursor for MemCursor {
    fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    fn next(&mut self) {
        self.pos += 1;
    }

    fn key(&self) -> &[u8] {
        &self.records[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.records[self.pos].1
    }

    fn valid(&self) -> bool {
        self.pos < self.records.len()
    }
}

/// File-backed store of length-prefixed records: `[key_len u32][key]
/// [value_len u32][value]` repeated, little endian. Records are loaded once
/// at open, so cursors never touch the file afterwards.
pub struct FlatFileStore {
    path: PathBuf,
}

impl FlatFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Start writing a new store file at `path`.
    pub fn writer(path: impl AsRef<Path>) -> Result<FlatFileWriter> {
        Ok(FlatFileWriter {
            out: BufWriter::new(File::create(path)?),
        })
    }
}

impl RecordStore for FlatFileStore {
    fn open(&self) -> Result<Box<dyn Cursor>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let key = read_chunk(&bytes, &mut pos, &self.path)?;
            let value = read_chunk(&bytes, &mut pos, &self.path)?;
            records.push((key, value));
        }
        Ok(Box::new(MemCursor {
            records: Arc::new(records),
            pos: 0,
        }))
    }
}

fn read_chunk(bytes: &[u8], pos: &mut usize, path: &Path) -> Result<Vec<u8>> {
    let corrupt = || {
        TreeSyncError::Config(format!(
            "truncated record in store file {}",
            path.display()
        ))
    };
    let end = pos.checked_add(4).filter(|&e| e <= bytes.len()).ok_or_else(corrupt)?;
    let len = u32::from_le_bytes(bytes[*pos..end].try_into().unwrap()) as usize;
    *pos = end;
    let end = pos.checked_add(len).filter(|&e| e <= bytes.len()).ok_or_else(corrupt)?;
    let chunk = bytes[*pos..end].to_vec();
    *pos = end;
    Ok(chunk)
}

/// Write half of [`FlatFileStore`]: stage records with [`put`](Self::put),
/// persist with [`commit`](Self::commit).
pub struct FlatFileWriter {
    out: BufWriter<File>,
}

impl FlatFileWriter {
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.out.write_all(&(key.len() as u32).to_le_bytes())?;
        self.out.write_all(key)?;
        self.out.write_all(&(value.len() as u32).to_le_bytes())?;
        self.out.write_all(value)?;
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_cursor_walks_and_reseeks() {
        let mut store = MemStore::new();
        store.push(b"a".to_vec(), vec![1]);
        store.push(b"b".to_vec(), vec![2]);
        let mut cursor = store.open().unwrap();
        cursor.seek_to_first();
        assert!(cursor.valid());
        assert_eq!(cursor.key(), b"a");
        cursor.next();
        assert_eq!(cursor.value(), &[2]);
        cursor.next();
        assert!(!cursor.valid());
        cursor.seek_to_first();
        assert_eq!(cursor.key(), b"a");
    }

    #[test]
    fn flat_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");

        let mut writer = FlatFileStore::writer(&path).unwrap();
        writer.put(b"k0", b"hello").unwrap();
        writer.put(b"k1", b"").unwrap();
        writer.commit().unwrap();

        let store = FlatFileStore::new(&path);
        let mut cursor = store.open().unwrap();
        cursor.seek_to_first();
        assert_eq!((cursor.key(), cursor.value()), (&b"k0"[..], &b"hello"[..]));
        cursor.next();
        assert_eq!((cursor.key(), cursor.value()), (&b"k1"[..], &b""[..]));
        cursor.next();
        assert!(!cursor.valid());
    }

    #[test]
    fn truncated_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [5u8, 0, 0, 0, b'x']).unwrap();
        match FlatFileStore::new(&path).open() {
            Err(TreeSyncError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }
}
