//! Content-addressed chunk storage with reference accounting
//!
//! Chunk bodies live on disk keyed by their SHA-256; an in-memory index
//! carries the reference count each body holds. A body is removed only
//! when its count reaches zero.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// SHA-256 digest identifying a chunk
pub type ChunkHash = [u8; 32];

/// Hash arbitrary bytes with SHA-256
pub fn content_hash(data: &[u8]) -> ChunkHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Serde helpers rendering a `ChunkHash` as a hex string
pub mod hash_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ChunkHash;

    pub fn serialize<S: Serializer>(hash: &ChunkHash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ChunkHash, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected a 32-byte hex digest"))
    }
}

/// Parse a hex digest into a `ChunkHash`
pub fn parse_hash(text: &str) -> Result<ChunkHash> {
    let bytes =
        hex::decode(text).map_err(|_| Error::InvalidRequest(format!("bad chunk hash: {}", text)))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidRequest(format!("bad chunk hash length: {}", text)))
}

/// Number of chunk bodies kept in the in-memory read cache
const READ_CACHE_CAPACITY: usize = 128;

struct CachedChunk {
    data: Vec<u8>,
    last_used: u64,
}

/// Small LRU cache over recently read chunk bodies
struct ReadCache {
    entries: HashMap<ChunkHash, CachedChunk>,
    tick: u64,
}

impl ReadCache {
    fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(READ_CACHE_CAPACITY),
            tick: 0,
        }
    }

    fn get(&mut self, hash: &ChunkHash) -> Option<Vec<u8>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(hash).map(|entry| {
            entry.last_used = tick;
            entry.data.clone()
        })
    }

    fn insert(&mut self, hash: ChunkHash, data: Vec<u8>) {
        self.tick += 1;
        if self.entries.len() >= READ_CACHE_CAPACITY && !self.entries.contains_key(&hash) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(hash, _)| *hash)
            {
                self.entries.remove(&oldest);
            }
        }
        let tick = self.tick;
        self.entries.insert(
            hash,
            CachedChunk {
                data,
                last_used: tick,
            },
        );
    }

    fn remove(&mut self, hash: &ChunkHash) {
        self.entries.remove(hash);
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkMeta {
    refcount: u64,
    size: u64,
}

/// Content-addressed chunk store
pub struct ChunkStore {
    /// Base directory for chunk bodies
    base_dir: PathBuf,

    /// hash -> refcount and size
    index: Mutex<HashMap<ChunkHash, ChunkMeta>>,

    /// Read cache over chunk bodies
    read_cache: Mutex<ReadCache>,
}

impl ChunkStore {
    /// Create or open a chunk store rooted at `base_dir`
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            index: Mutex::new(HashMap::new()),
            read_cache: Mutex::new(ReadCache::new()),
        })
    }

    /// Seed reference counts from persisted version metadata.
    ///
    /// Bodies already on disk that receive no reference are dropped, so a
    /// crash between body write and version commit cannot leak storage.
    pub fn preload_refcounts(&self, refs: impl IntoIterator<Item = (ChunkHash, u64)>) -> Result<()> {
        let mut index = self.index.lock().expect("chunk index poisoned");
        for (hash, count) in refs {
            let path = self.chunk_path(&hash);
            let size = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    return Err(Error::Storage(format!(
                        "chunk {} referenced by metadata but missing on disk",
                        hex::encode(hash)
                    )))
                }
            };
            index.insert(
                hash,
                ChunkMeta {
                    refcount: count,
                    size,
                },
            );
        }
        Ok(())
    }

    fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        let hex = hex::encode(hash);
        // Two-character fan-out keeps directories small
        self.base_dir.join(&hex[0..2]).join(&hex[2..])
    }

    /// Store a chunk body and take one reference on it.
    ///
    /// Idempotent for identical bytes: a body already present only has
    /// its reference count incremented.
    pub fn put(&self, data: &[u8]) -> Result<ChunkHash> {
        let hash = content_hash(data);
        self.put_verified(hash, data)
    }

    /// Store a chunk body whose hash the sender declared.
    /// The declared hash is verified before anything is written.
    pub fn put_with_hash(&self, declared: &ChunkHash, data: &[u8]) -> Result<ChunkHash> {
        let actual = content_hash(data);
        if actual != *declared {
            return Err(Error::InvalidRequest(format!(
                "chunk body does not hash to declared {}",
                hex::encode(declared)
            )));
        }
        self.put_verified(actual, data)
    }

    fn put_verified(&self, hash: ChunkHash, data: &[u8]) -> Result<ChunkHash> {
        let mut index = self.index.lock().expect("chunk index poisoned");

        if let Some(meta) = index.get_mut(&hash) {
            meta.refcount += 1;
            debug!(
                "chunk {} deduplicated (refcount {})",
                hex::encode(hash),
                meta.refcount
            );
            return Ok(hash);
        }

        let path = self.chunk_path(&hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(data)?;

        index.insert(
            hash,
            ChunkMeta {
                refcount: 1,
                size: data.len() as u64,
            },
        );
        drop(index);

        if let Ok(mut cache) = self.read_cache.lock() {
            cache.insert(hash, data.to_vec());
        }

        debug!("stored chunk {} ({} bytes)", hex::encode(hash), data.len());
        Ok(hash)
    }

    /// Retrieve a chunk body
    pub fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        {
            let index = self.index.lock().expect("chunk index poisoned");
            if !index.contains_key(hash) {
                return Err(Error::ChunkNotFound(hex::encode(hash)));
            }
        }

        if let Ok(mut cache) = self.read_cache.lock() {
            if let Some(data) = cache.get(hash) {
                return Ok(data);
            }
        }

        let path = self.chunk_path(hash);
        let mut file =
            File::open(&path).map_err(|_| Error::ChunkNotFound(hex::encode(hash)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if let Ok(mut cache) = self.read_cache.lock() {
            cache.insert(*hash, data.clone());
        }

        Ok(data)
    }

    /// Check whether a chunk body is present
    pub fn has(&self, hash: &ChunkHash) -> bool {
        self.index
            .lock()
            .expect("chunk index poisoned")
            .contains_key(hash)
    }

    /// Take an additional reference on an existing chunk
    pub fn ref_chunk(&self, hash: &ChunkHash) -> Result<()> {
        let mut index = self.index.lock().expect("chunk index poisoned");
        match index.get_mut(hash) {
            Some(meta) => {
                meta.refcount += 1;
                Ok(())
            }
            None => Err(Error::ChunkNotFound(hex::encode(hash))),
        }
    }

    /// Release one reference; the body is removed when the count hits zero.
    /// Returns true when the body was removed.
    pub fn unref_chunk(&self, hash: &ChunkHash) -> Result<bool> {
        let mut index = self.index.lock().expect("chunk index poisoned");
        let meta = index
            .get_mut(hash)
            .ok_or_else(|| Error::ChunkNotFound(hex::encode(hash)))?;

        meta.refcount = meta.refcount.saturating_sub(1);
        if meta.refcount > 0 {
            return Ok(false);
        }

        index.remove(hash);
        drop(index);

        if let Ok(mut cache) = self.read_cache.lock() {
            cache.remove(hash);
        }

        let path = self.chunk_path(hash);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        debug!("removed chunk {} (refcount reached zero)", hex::encode(hash));
        Ok(true)
    }

    /// Current reference count for a chunk (0 if unknown)
    pub fn refcount(&self, hash: &ChunkHash) -> u64 {
        self.index
            .lock()
            .expect("chunk index poisoned")
            .get(hash)
            .map(|meta| meta.refcount)
            .unwrap_or(0)
    }

    /// Number of chunk bodies and their total size in bytes
    pub fn stats(&self) -> (usize, u64) {
        let index = self.index.lock().expect("chunk index poisoned");
        let total = index.values().map(|meta| meta.size).sum();
        (index.len(), total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();

        let data = b"some chunk body";
        let hash = store.put(data).unwrap();

        assert_eq!(hash, content_hash(data));
        assert_eq!(store.get(&hash).unwrap(), data);
        assert!(store.has(&hash));
    }

    #[test]
    fn test_repeated_put_increments_refcount() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();

        let data = b"duplicate content";
        let first = store.put(data).unwrap();
        let second = store.put(data).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.refcount(&first), 2);
        let (count, _) = store.stats();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unref_to_zero_removes_body() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();

        let hash = store.put(b"short-lived").unwrap();
        store.ref_chunk(&hash).unwrap();

        assert!(!store.unref_chunk(&hash).unwrap());
        assert!(store.has(&hash));

        assert!(store.unref_chunk(&hash).unwrap());
        assert!(!store.has(&hash));
        assert!(store.get(&hash).is_err());
    }

    #[test]
    fn test_put_with_hash_verifies() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();

        let data = b"verified body";
        let good = content_hash(data);
        assert!(store.put_with_hash(&good, data).is_ok());

        let bad = content_hash(b"other body");
        assert!(store.put_with_hash(&bad, data).is_err());
    }

    #[test]
    fn test_ref_unknown_chunk_fails() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();

        let missing = content_hash(b"never stored");
        assert!(store.ref_chunk(&missing).is_err());
        assert!(matches!(
            store.get(&missing),
            Err(Error::ChunkNotFound(_))
        ));
    }

    #[test]
    fn test_preload_refcounts() {
        let dir = tempdir().unwrap();
        let hash;
        {
            let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();
            hash = store.put(b"survives restart").unwrap();
        }

        let store = ChunkStore::new(dir.path().to_path_buf()).unwrap();
        assert!(!store.has(&hash));

        store.preload_refcounts([(hash, 3)]).unwrap();
        assert_eq!(store.refcount(&hash), 3);
        assert_eq!(store.get(&hash).unwrap(), b"survives restart");
    }
}
