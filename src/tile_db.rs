//! Persistent tile database.
//!
//! Stores compiled tiles keyed by worldspace, tile position and agent-bounds
//! bucket, so a cold start can skip rebuilding tiles nothing has changed
//! since the last run. Two implementations: [`MemoryTileDb`] (a plain
//! in-process map, used by embedders that don't want on-disk persistence
//! and by tests) and [`FileTileDb`] (an append-only binary log with an
//! in-memory index, for everyone else).
//!
//! `FileTileDb`'s on-disk layout is grounded on the teacher's `pack.rs`:
//! a fixed-size magic+version header, followed by fixed-size index entries
//! (here, one per row key) pointing at variable-length payloads appended to
//! the end of the file. Unlike the teacher's read-only, pre-built pack
//! format, rows here are appended incrementally as tiles are built, so the
//! index lives in memory and is rewritten to disk on `flush()` rather than
//! being a one-shot `pack_dzsave_tiles`-style conversion.

use crate::error::{NavigatorError, NavResult};
use crate::shape::AgentBounds;
use crate::tiles::{TilePosition, WorldspaceId};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"TNAVDB1\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;

/// Uniquely identifies one stored tile build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub worldspace: WorldspaceId,
    pub tile: TilePosition,
    pub agent_bucket: (u8, [i64; 3]),
}

impl RowKey {
    pub fn new(worldspace: WorldspaceId, tile: TilePosition, agent_bounds: &AgentBounds) -> Self {
        Self {
            worldspace,
            tile,
            agent_bucket: agent_bounds.bucket_key(),
        }
    }
}

/// One stored row: the version the payload was built at plus the compiled
/// tile bytes (compressed on disk, plain in memory once read back).
#[derive(Debug, Clone)]
pub struct RowValue {
    pub revision: u64,
    pub data: bytes::Bytes,
}

/// Storage backend for built tiles. Implementations need not be
/// thread-safe on their own; callers serialize writes through the job
/// scheduler's per-tile exclusivity.
pub trait PersistentDb: Send + Sync {
    fn get(&self, key: &RowKey) -> NavResult<Option<RowValue>>;
    fn put(&self, key: RowKey, value: RowValue) -> NavResult<()>;
    fn remove_worldspace(&self, worldspace: WorldspaceId) -> NavResult<()>;
    fn total_bytes(&self) -> u64;
}

/// Plain in-memory backend: no persistence across process restarts, used
/// by embedders who only want the in-process caching layer and by tests
/// that want a deterministic, fast stand-in for `FileTileDb`.
#[derive(Default)]
pub struct MemoryTileDb {
    rows: parking_lot::RwLock<HashMap<RowKey, RowValue>>,
}

impl MemoryTileDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentDb for MemoryTileDb {
    fn get(&self, key: &RowKey) -> NavResult<Option<RowValue>> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn put(&self, key: RowKey, value: RowValue) -> NavResult<()> {
        self.rows.write().insert(key, value);
        Ok(())
    }

    fn remove_worldspace(&self, worldspace: WorldspaceId) -> NavResult<()> {
        self.rows.write().retain(|k, _| k.worldspace != worldspace);
        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        self.rows
            .read()
            .values()
            .map(|v| v.data.len() as u64)
            .sum()
    }
}

struct IndexEntry {
    key: RowKey,
    revision: u64,
    offset: u64,
    compressed_len: u32,
    raw_len: u32,
    /// Insertion order, used to evict the oldest rows first when the file
    /// grows past `max_size`.
    sequence: u64,
}

/// Append-only, size-bounded binary tile DB.
///
/// Writes are append-only: updating a key does not reclaim the old row's
/// space immediately. A `compact()` pass (invoked automatically once the
/// file crosses `max_size`, as well as being callable directly) rewrites
/// the file keeping only the live rows, oldest first, dropping rows until
/// the file fits back under budget.
pub struct FileTileDb {
    path: PathBuf,
    file: parking_lot::Mutex<File>,
    index: parking_lot::RwLock<HashMap<RowKey, IndexEntry>>,
    next_sequence: std::sync::atomic::AtomicU64,
    max_size: u64,
    compress: bool,
}

impl FileTileDb {
    pub fn open(path: impl AsRef<Path>, max_size: u64, compress: bool) -> NavResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let index = if len >= HEADER_SIZE {
            Self::load_index(&mut file)?
        } else {
            Self::write_header(&mut file)?;
            HashMap::new()
        };

        let next_sequence = index.values().map(|e| e.sequence).max().map(|m| m + 1).unwrap_or(0);

        Ok(Self {
            path,
            file: parking_lot::Mutex::new(file),
            index: parking_lot::RwLock::new(index),
            next_sequence: std::sync::atomic::AtomicU64::new(next_sequence),
            max_size,
            compress,
        })
    }

    fn write_header(file: &mut File) -> NavResult<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&0u32.to_le_bytes())?; // row count placeholder, unused on read
        file.flush()?;
        Ok(())
    }

    /// Re-reads the whole file sequentially to rebuild the in-memory index.
    /// Simple log replay, same shape as the teacher's `LevelPack::parse`
    /// validating its header before trusting the entries that follow.
    fn load_index(file: &mut File) -> NavResult<HashMap<RowKey, IndexEntry>> {
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..8] != MAGIC {
            return Err(NavigatorError::Corrupt("bad magic".into()));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(NavigatorError::Corrupt(format!(
                "unsupported tile DB version {version}"
            )));
        }

        let mut index = HashMap::new();
        let mut sequence = 0u64;
        let mut offset = HEADER_SIZE;
        let file_len = file.metadata()?.len();

        loop {
            if offset + 8 > file_len {
                break;
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut record_header = [0u8; 8];
            if file.read_exact(&mut record_header).is_err() {
                break;
            }
            let key_len = u32::from_le_bytes(record_header[0..4].try_into().unwrap()) as u64;
            let payload_len = u32::from_le_bytes(record_header[4..8].try_into().unwrap()) as u64;

            let mut key_bytes = vec![0u8; key_len as usize];
            if file.read_exact(&mut key_bytes).is_err() {
                break;
            }
            let Some((key, revision, raw_len)) = decode_key(&key_bytes) else {
                break;
            };

            let payload_offset = offset + 8 + key_len;
            if payload_offset + payload_len > file_len {
                break;
            }

            index.insert(
                key,
                IndexEntry {
                    key,
                    revision,
                    offset: payload_offset,
                    compressed_len: payload_len as u32,
                    raw_len,
                    sequence,
                },
            );
            sequence += 1;
            offset = payload_offset + payload_len;
        }

        Ok(index)
    }

    fn compact_if_needed(&self) -> NavResult<()> {
        let current_len = self.file.lock().metadata()?.len();
        if self.max_size == 0 || current_len <= self.max_size {
            return Ok(());
        }
        self.compact()
    }

    /// Rewrite the file keeping only live rows, dropping the oldest first
    /// until the result fits under `max_size`.
    pub fn compact(&self) -> NavResult<()> {
        let mut entries: Vec<_> = {
            let index = self.index.read();
            index.values().map(|e| (e.key, e.sequence)).collect()
        };
        entries.sort_by_key(|(_, seq)| *seq);

        // Drop oldest rows until projected size fits, if bounded.
        let mut rows: Vec<(RowKey, IndexEntry)> = Vec::new();
        {
            let mut index = self.index.write();
            for (key, _) in entries {
                if let Some(entry) = index.remove(&key) {
                    rows.push((key, entry));
                }
            }
        }

        if self.max_size > 0 {
            let mut total: u64 = rows
                .iter()
                .map(|(_, e)| 8 + encoded_key_len(&e.key) as u64 + e.compressed_len as u64)
                .sum();
            total += HEADER_SIZE;
            while total > self.max_size && !rows.is_empty() {
                let (_, e) = rows.remove(0);
                total -= 8 + encoded_key_len(&e.key) as u64 + e.compressed_len as u64;
            }
        }

        let tmp_path = self.path.with_extension("compacting");
        let new_index = {
            let mut tmp = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            Self::write_header(&mut tmp)?;

            let mut file = self.file.lock();
            let mut new_index = HashMap::new();
            let mut offset = HEADER_SIZE;
            for (seq, (key, entry)) in rows.into_iter().enumerate() {
                file.seek(SeekFrom::Start(entry.offset))?;
                let mut payload = vec![0u8; entry.compressed_len as usize];
                file.read_exact(&mut payload)?;

                let key_bytes = encode_key(&key, entry.revision, entry.raw_len);
                tmp.seek(SeekFrom::Start(offset))?;
                tmp.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
                tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
                tmp.write_all(&key_bytes)?;
                tmp.write_all(&payload)?;

                let payload_offset = offset + 8 + key_bytes.len() as u64;
                new_index.insert(
                    key,
                    IndexEntry {
                        key,
                        revision: entry.revision,
                        offset: payload_offset,
                        compressed_len: entry.compressed_len,
                        raw_len: entry.raw_len,
                        sequence: seq as u64,
                    },
                );
                offset = payload_offset + entry.compressed_len as u64;
            }
            tmp.flush()?;
            *file = tmp;
            new_index
        };
        std::fs::rename(&tmp_path, &self.path)?;
        *self.index.write() = new_index;
        Ok(())
    }

    fn compress(&self, data: &[u8]) -> NavResult<(Vec<u8>, u32)> {
        if !self.compress {
            return Ok((data.to_vec(), data.len() as u32));
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        Ok((compressed, data.len() as u32))
    }

    fn decompress(&self, data: &[u8], raw_len: u32) -> NavResult<Vec<u8>> {
        if !self.compress {
            return Ok(data.to_vec());
        }
        let mut decoder = DeflateDecoder::new(data);
        let mut out = Vec::with_capacity(raw_len as usize);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

fn encoded_key_len(key: &RowKey) -> usize {
    encode_key(key, 0, 0).len()
}

fn encode_key(key: &RowKey, revision: u64, raw_len: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&key.worldspace.0.to_le_bytes());
    buf.extend_from_slice(&key.tile.x.to_le_bytes());
    buf.extend_from_slice(&key.tile.y.to_le_bytes());
    buf.push(key.agent_bucket.0);
    for v in key.agent_bucket.1 {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend_from_slice(&revision.to_le_bytes());
    buf.extend_from_slice(&raw_len.to_le_bytes());
    buf
}

fn decode_key(buf: &[u8]) -> Option<(RowKey, u64, u32)> {
    if buf.len() < 8 + 4 + 4 + 1 + 24 + 8 + 4 {
        return None;
    }
    let mut pos = 0;
    let worldspace = WorldspaceId(u64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?));
    pos += 8;
    let x = i32::from_le_bytes(buf[pos..pos + 4].try_into().ok()?);
    pos += 4;
    let y = i32::from_le_bytes(buf[pos..pos + 4].try_into().ok()?);
    pos += 4;
    let kind = buf[pos];
    pos += 1;
    let mut extents = [0i64; 3];
    for e in extents.iter_mut() {
        *e = i64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?);
        pos += 8;
    }
    let revision = u64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?);
    pos += 8;
    let raw_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().ok()?);

    Some((
        RowKey {
            worldspace,
            tile: TilePosition::new(x, y),
            agent_bucket: (kind, extents),
        },
        revision,
        raw_len,
    ))
}

impl PersistentDb for FileTileDb {
    fn get(&self, key: &RowKey) -> NavResult<Option<RowValue>> {
        let entry = {
            let index = self.index.read();
            match index.get(key) {
                Some(e) => (e.offset, e.compressed_len, e.raw_len, e.revision),
                None => return Ok(None),
            }
        };
        let (offset, compressed_len, raw_len, revision) = entry;
        let mut buf = vec![0u8; compressed_len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        let data = self.decompress(&buf, raw_len)?;
        Ok(Some(RowValue {
            revision,
            data: bytes::Bytes::from(data),
        }))
    }

    fn put(&self, key: RowKey, value: RowValue) -> NavResult<()> {
        let (compressed, raw_len) = self.compress(&value.data)?;
        let key_bytes = encode_key(&key, value.revision, raw_len);
        let sequence = self
            .next_sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let offset = {
            let mut file = self.file.lock();
            let offset = file.seek(SeekFrom::End(0))?;
            file.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
            file.write_all(&(compressed.len() as u32).to_le_bytes())?;
            file.write_all(&key_bytes)?;
            file.write_all(&compressed)?;
            file.flush()?;
            offset + 8 + key_bytes.len() as u64
        };

        self.index.write().insert(
            key,
            IndexEntry {
                key,
                revision: value.revision,
                offset,
                compressed_len: compressed.len() as u32,
                raw_len,
                sequence,
            },
        );

        self.compact_if_needed()
    }

    fn remove_worldspace(&self, worldspace: WorldspaceId) -> NavResult<()> {
        self.index.write().retain(|k, _| k.worldspace != worldspace);
        self.compact()
    }

    fn total_bytes(&self) -> u64 {
        self.file.lock().metadata().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::CollisionShapeKind;

    fn bounds() -> AgentBounds {
        AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9])
    }

    #[test]
    fn memory_db_roundtrip() {
        let db = MemoryTileDb::new();
        let key = RowKey::new(WorldspaceId(1), TilePosition::new(0, 0), &bounds());
        db.put(
            key,
            RowValue {
                revision: 3,
                data: bytes::Bytes::from_static(&[1, 2, 3, 4]),
            },
        )
        .unwrap();
        let got = db.get(&key).unwrap().unwrap();
        assert_eq!(got.revision, 3);
        assert_eq!(&got.data[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn file_db_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.db");
        let key = RowKey::new(WorldspaceId(7), TilePosition::new(3, -2), &bounds());

        {
            let db = FileTileDb::open(&path, 0, true).unwrap();
            db.put(
                key,
                RowValue {
                    revision: 1,
                    data: bytes::Bytes::from(vec![9u8; 500]),
                },
            )
            .unwrap();
        }

        let db = FileTileDb::open(&path, 0, true).unwrap();
        let got = db.get(&key).unwrap().unwrap();
        assert_eq!(got.revision, 1);
        assert_eq!(got.data.len(), 500);
    }

    #[test]
    fn remove_worldspace_drops_its_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.db");
        let db = FileTileDb::open(&path, 0, false).unwrap();

        let key_a = RowKey::new(WorldspaceId(1), TilePosition::new(0, 0), &bounds());
        let key_b = RowKey::new(WorldspaceId(2), TilePosition::new(0, 0), &bounds());
        db.put(key_a, RowValue { revision: 1, data: bytes::Bytes::from_static(&[1]) }).unwrap();
        db.put(key_b, RowValue { revision: 1, data: bytes::Bytes::from_static(&[2]) }).unwrap();

        db.remove_worldspace(WorldspaceId(1)).unwrap();
        assert!(db.get(&key_a).unwrap().is_none());
        assert!(db.get(&key_b).unwrap().is_some());
    }
}
