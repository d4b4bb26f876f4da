//! Durable storage for rendezvous snapshots.

use crate::error::{Result, StreamError};
use crate::types::StreamId;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use super::types::StreamSnapshot;

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"RVZ\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Lock file guarding a snapshot directory.
const LOCK_FILE: &str = "LOCK";

/// Magic, version, length and checksum around the payload.
const SNAPSHOT_FRAMING_BYTES: u64 = 4 + 1 + 8 + 4;

/// Storage collaborator of the subscription registry.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, stream: &StreamId) -> Result<Option<StreamSnapshot>>;
    fn save(&self, stream: &StreamId, snapshot: &StreamSnapshot) -> Result<()>;
    fn clear(&self, stream: &StreamId) -> Result<()>;
}

/// In-memory store. Snapshots are kept MessagePack-encoded, as they would be
/// on disk.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams with stored state.
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, stream: &StreamId) -> bool {
        self.snapshots.read().contains_key(&stream.storage_key())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, stream: &StreamId) -> Result<Option<StreamSnapshot>> {
        match self.snapshots.read().get(&stream.storage_key()) {
            Some(encoded) => Ok(Some(rmp_serde::from_slice(encoded)?)),
            None => Ok(None),
        }
    }

    fn save(&self, stream: &StreamId, snapshot: &StreamSnapshot) -> Result<()> {
        let encoded = rmp_serde::to_vec(snapshot)?;
        self.snapshots.write().insert(stream.storage_key(), encoded);
        Ok(())
    }

    fn clear(&self, stream: &StreamId) -> Result<()> {
        self.snapshots.write().remove(&stream.storage_key());
        Ok(())
    }
}

/// One file per stream, named by the SHA-256 of the stream key and sharded
/// into directories by its first byte.
///
/// File layout: magic, version, payload length (u64 LE), MessagePack
/// payload, CRC32 of the payload (u32 LE). Files are replaced atomically via
/// rename. The directory is locked exclusively for the lifetime of the store.
pub struct FileSnapshotStore {
    /// Base directory.
    path: PathBuf,

    /// Held for exclusive access.
    _lock_file: File,

    /// Recently loaded or saved snapshots.
    cache: Mutex<LruCache<String, StreamSnapshot>>,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a snapshot directory.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| StreamError::Locked)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    fn digest(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        let digest = Self::digest(key);
        self.path.join(&digest[..2]).join(format!("{}.snap", digest))
    }

    fn write_file(path: &Path, snapshot: &StreamSnapshot) -> Result<()> {
        let encoded = rmp_serde::to_vec(snapshot)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;

        file.write_all(SNAPSHOT_MAGIC)?;
        file.write_all(&[SNAPSHOT_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<StreamSnapshot> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StreamError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StreamError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let available = file.metadata()?.len().saturating_sub(SNAPSHOT_FRAMING_BYTES);
        if len > available {
            return Err(StreamError::Corruption(format!(
                "Snapshot length {} exceeds file ({} payload bytes available)",
                len, available
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => StreamError::Corruption("Truncated snapshot".into()),
            _ => StreamError::Io(e),
        })?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StreamError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, stream: &StreamId) -> Result<Option<StreamSnapshot>> {
        let key = stream.storage_key();
        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            return Ok(Some(cached));
        }

        let path = self.snapshot_path(&key);
        if !path.exists() {
            return Ok(None);
        }
        let snapshot = Self::read_file(&path)?;
        self.cache.lock().put(key, snapshot.clone());
        Ok(Some(snapshot))
    }

    fn save(&self, stream: &StreamId, snapshot: &StreamSnapshot) -> Result<()> {
        let key = stream.storage_key();
        Self::write_file(&self.snapshot_path(&key), snapshot)?;
        self.cache.lock().put(key, snapshot.clone());
        Ok(())
    }

    fn clear(&self, stream: &StreamId) -> Result<()> {
        let key = stream.storage_key();
        self.cache.lock().pop(&key);
        match fs::remove_file(self.snapshot_path(&key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
