use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use accord_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DataError, DataResult};
use crate::format;
use crate::memory::MemoryStore;
use crate::reference::{Ref, RefStatus};
use crate::traits::Store;

/// One log record.
///
/// On-disk framing:
/// ```text
/// [4 bytes: record length (little-endian u32)]
/// [4 bytes: CRC32 of record (little-endian u32)]
/// [N bytes: bincode-serialized StoreRecord]
/// ```
///
/// An empty `encoding` records a status raise for a cell written earlier.
#[derive(Debug, Serialize, Deserialize)]
struct StoreRecord {
    hash: Hash,
    status: RefStatus,
    encoding: Vec<u8>,
}

const HEADER_SIZE: usize = 8;

/// Append-only, file-backed cell store.
///
/// Every new cell and every status raise is appended to a single log file.
/// On open the log is replayed into an in-memory index. Replay stops at the
/// first torn, corrupt or rejected record and the log is cut there, so a
/// record is only ever replayed if every record before it was.
/// A cell is written to the log before the index learns of it.
pub struct FileStore {
    path: PathBuf,
    index: MemoryStore,
    writer: Mutex<BufWriter<File>>,
}

impl FileStore {
    /// Open (or create) the store log at `path`.
    pub fn open(path: &Path) -> DataResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let index = MemoryStore::new();
        let (replayed, valid_len) = replay(path, &index)?;
        if valid_len < file.metadata()?.len() {
            warn!(path = %path.display(), valid_len, "discarding store log after last good record");
            file.set_len(valid_len)?;
        }
        debug!(path = %path.display(), replayed, cells = index.len(), "opened file store");

        Ok(Self {
            path: path.to_path_buf(),
            index,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct cells held.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn append(writer: &mut BufWriter<File>, record: &StoreRecord) -> DataResult<()> {
        let payload =
            bincode::serialize(record).map_err(|e| DataError::InvalidData(e.to_string()))?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(())
    }
}

/// Replay the log into `index`. Returns the number of records applied and
/// the length of the log up to the end of the last good record.
///
/// Persisted parents are logged after their children, so stopping at the
/// first bad record never leaves a parent restored without its children.
fn replay(path: &Path, index: &MemoryStore) -> DataResult<(usize, u64)> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut offset = 0usize;
    let mut applied = 0usize;
    while offset + HEADER_SIZE <= data.len() {
        let length = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let expected_crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let start = offset + HEADER_SIZE;
        if length == 0 || start + length > data.len() {
            warn!(offset, length, "truncated store record; stopping replay");
            break;
        }
        let payload = &data[start..start + length];

        if crc32fast::hash(payload) != expected_crc {
            warn!(offset, "CRC mismatch; stopping replay");
            break;
        }
        let record: StoreRecord = match bincode::deserialize(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(offset, error = %e, "undecodable store record; stopping replay");
                break;
            }
        };
        if let Err(e) = apply(index, record) {
            warn!(offset, error = %e, "rejected store record; stopping replay");
            break;
        }
        applied += 1;
        offset = start + length;
    }
    Ok((applied, offset as u64))
}

fn apply(index: &MemoryStore, record: StoreRecord) -> DataResult<()> {
    if record.encoding.is_empty() {
        index.put(&Ref::for_hash(record.hash), record.status)?;
        return Ok(());
    }
    let r = format::decode_ref(&record.encoding)?;
    if r.hash() != &record.hash {
        return Err(DataError::InvalidData(format!(
            "record hash {} does not match contents",
            record.hash.short_hex()
        )));
    }
    index.put(&r, record.status)?;
    Ok(())
}

impl Store for FileStore {
    fn get(&self, hash: &Hash) -> DataResult<Option<Ref>> {
        self.index.get(hash)
    }

    fn put(&self, r: &Ref, status: RefStatus) -> DataResult<(Ref, bool)> {
        // Held across append and index update so the log order matches.
        let mut writer = self.writer.lock().expect("store writer poisoned");
        let status = status.min(RefStatus::Persisted);
        let hash = *r.hash();

        match self.index.get(&hash)? {
            None => {
                let encoding = r
                    .direct_value()
                    .map(|cell| cell.encode())
                    .ok_or(DataError::MissingData(hash))?;
                Self::append(
                    &mut writer,
                    &StoreRecord {
                        hash,
                        status,
                        encoding,
                    },
                )?;
            }
            Some(existing) if status > existing.status() => {
                Self::append(
                    &mut writer,
                    &StoreRecord {
                        hash,
                        status,
                        encoding: Vec::new(),
                    },
                )?;
            }
            Some(_) => {}
        }
        self.index.put(r, status)
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("cell_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::persist::{persist, persist_shallow};
    use std::io::{Seek, SeekFrom};

    fn big(seed: u8) -> Ref {
        Ref::new(Cell::blob(&[seed; 1000]).unwrap())
    }

    #[test]
    fn reopen_recovers_cells_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.log");

        let shallow = big(1);
        let deep = Ref::new(Cell::Vector(vec![big(2), big(3)]));
        {
            let store = FileStore::open(&path).unwrap();
            persist_shallow(&store, &shallow).unwrap();
            persist(&store, &deep, &mut |_: &Ref| {}).unwrap();
            assert_eq!(store.len(), 4);
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.status_of(shallow.hash()).unwrap(), RefStatus::Stored);
        assert_eq!(store.status_of(deep.hash()).unwrap(), RefStatus::Persisted);
        let value = Ref::for_hash(*big(2).hash()).value(&store).unwrap();
        assert_eq!(value.blob_bytes(&store).unwrap(), vec![2u8; 1000]);
    }

    #[test]
    fn status_raise_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raise.log");
        let r = big(4);
        {
            let store = FileStore::open(&path).unwrap();
            store.put(&r, RefStatus::Stored).unwrap();
            store.put(&r, RefStatus::Persisted).unwrap();
            // No-op puts do not grow the log.
            let len = fs::metadata(&path).unwrap().len();
            store.put(&r, RefStatus::Stored).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), len);
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.status_of(r.hash()).unwrap(), RefStatus::Persisted);
    }

    fn flip_byte(path: &Path, at: u64) {
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(at)).unwrap();
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf).unwrap();
        buf[0] ^= 0xff;
        file.seek(SeekFrom::Start(at)).unwrap();
        file.write_all(&buf).unwrap();
    }

    #[test]
    fn corrupt_record_ends_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.log");
        let first = big(5);
        let second = big(6);
        {
            let store = FileStore::open(&path).unwrap();
            store.put(&first, RefStatus::Stored).unwrap();
            store.put(&second, RefStatus::Stored).unwrap();
        }
        flip_byte(&path, HEADER_SIZE as u64 + 40);

        let store = FileStore::open(&path).unwrap();
        assert!(store.is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        // The cut log takes new records and replays them.
        store.put(&second, RefStatus::Stored).unwrap();
        drop(store);
        let store = FileStore::open(&path).unwrap();
        assert!(store.contains(second.hash()).unwrap());
    }

    #[test]
    fn persisted_parent_is_not_restored_without_child() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parent.log");
        let child = big(10);
        let parent = Ref::new(Cell::Vector(vec![child.clone()]));
        {
            let store = FileStore::open(&path).unwrap();
            persist(&store, &parent, &mut |_: &Ref| {}).unwrap();
        }
        // The child is logged first.
        flip_byte(&path, HEADER_SIZE as u64 + 40);

        let store = FileStore::open(&path).unwrap();
        assert!(!store.contains(child.hash()).unwrap());
        assert_eq!(store.status_of(parent.hash()).unwrap(), RefStatus::Unknown);
    }

    #[test]
    fn failed_append_leaves_index_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly.log");
        File::create(&path).unwrap();
        let store = FileStore {
            path: path.clone(),
            index: MemoryStore::new(),
            writer: Mutex::new(BufWriter::new(File::open(&path).unwrap())),
        };

        let r = big(11);
        assert!(matches!(
            store.put(&r, RefStatus::Stored),
            Err(DataError::Io(_))
        ));
        assert!(!store.contains(r.hash()).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn torn_tail_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.log");
        let first = big(7);
        {
            let store = FileStore::open(&path).unwrap();
            store.put(&first, RefStatus::Stored).unwrap();
            store.put(&big(8), RefStatus::Stored).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 4)
            .unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(first.hash()).unwrap());
        // The torn bytes are dropped, so later appends replay cleanly.
        store.put(&big(9), RefStatus::Stored).unwrap();
        drop(store);
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains(big(9).hash()).unwrap());
    }

    #[test]
    fn hash_only_put_of_unknown_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("m.log")).unwrap();
        assert!(matches!(
            store.put(&Ref::for_hash(Hash::ZERO), RefStatus::Stored),
            Err(DataError::MissingData(_))
        ));
        assert!(store.is_empty());
    }
}
