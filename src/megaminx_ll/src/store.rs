//! Loads, builds, persists, and caches pruning tables.
//!
//! Every table lives in one file directly inside the data directory, named
//! `<faces>_<metric>_<shape>_d<depth>_<complete|partial>.mllt`. A file is a
//! fixed 32 byte little endian header followed by the LZ4 block compressed
//! distance bytes:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic `MLLT` |
//! | 4 | 1 | format version |
//! | 5 | 1 | flags, bit 0 set when complete |
//! | 6 | 1 | depth reached |
//! | 7 | 1 | reserved |
//! | 8 | 8 | coordinate count |
//! | 16 | 8 | `FxHash` of the uncompressed bytes |
//! | 24 | 8 | compressed length |

use crate::{
    engine::{CancellationToken, EngineConfig, Host},
    moves::{AllowedFaceSet, Metric},
    pruning::{BuildError, PruningTable, PruningTableBuilder, TableKey, UNVISITED},
};
use fxhash::FxHashMap;
use log::{debug, info, warn};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"MLLT";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 32;
const EXTENSION: &str = "mllt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    Disk,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Memory => "memory",
            Resource::Disk => "disk space",
        })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("The {key} table needs {needed} bytes of {resource} but only {available} are available")]
    ResourceExhausted {
        key: TableKey,
        resource: Resource,
        needed: u64,
        available: u64,
    },
    #[error("Building the {0} table was cancelled")]
    Cancelled(TableKey),
    #[error("`{0}` is not a pruning table file")]
    NotATableFile(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons a persisted table is unusable. These never reach callers: the
/// file is removed and the table treated as absent.
#[derive(Error, Debug)]
enum TableReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Bad magic number")]
    BadMagic,
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("Expected {expected} coordinates but the header declares {found}")]
    CoordinateCountMismatch { expected: u64, found: u64 },
    #[error("The header does not match the file name")]
    HeaderMismatch,
    #[error("Expected {expected} compressed bytes but found {found}")]
    CompressedLengthMismatch { expected: u64, found: u64 },
    #[error(transparent)]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Distance {0} exceeds the recorded depth")]
    DistanceOutOfRange(u8),
}

/// A persisted table as seen by storage management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFileInfo {
    pub file_name: String,
    pub key: TableKey,
    pub depth: u8,
    pub complete: bool,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

impl TableFileInfo {
    /// A human readable name such as `RU QTM corners-perm-ori (depth 14,
    /// complete)`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!(
            "{} (depth {}, {})",
            self.key,
            self.depth,
            if self.complete { "complete" } else { "partial" }
        )
    }
}

#[must_use]
pub fn table_file_name(key: TableKey, depth: u8, complete: bool) -> String {
    format!(
        "{}_{}_{}_d{}_{}.{EXTENSION}",
        key.allowed_faces.name().to_ascii_lowercase(),
        key.metric.name().to_ascii_lowercase(),
        key.shape,
        depth,
        if complete { "complete" } else { "partial" }
    )
}

/// Recover the key, depth, and completeness from a table file name.
#[must_use]
pub fn parse_table_file_name(file_name: &str) -> Option<(TableKey, u8, bool)> {
    let stem = file_name.strip_suffix(&format!(".{EXTENSION}"))?;
    let mut parts = stem.split('_');
    let allowed_faces = parts.next()?.parse::<AllowedFaceSet>().ok()?;
    let metric = parts.next()?.parse::<Metric>().ok()?;
    let shape = parts.next()?.parse().ok()?;
    let depth = parts.next()?.strip_prefix('d')?.parse().ok()?;
    let complete = match parts.next()? {
        "complete" => true,
        "partial" => false,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    let key = TableKey {
        allowed_faces,
        metric,
        shape,
    };
    // Names must round trip so that nothing else in the directory matches
    (table_file_name(key, depth, complete) == file_name).then_some((key, depth, complete))
}

fn encode_table(key: TableKey, depth: u8, complete: bool, bytes: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::block::compress(bytes);
    let mut encoded = Vec::with_capacity(HEADER_LEN + compressed.len());
    encoded.extend_from_slice(MAGIC);
    encoded.push(FORMAT_VERSION);
    encoded.push(u8::from(complete));
    encoded.push(depth);
    encoded.push(0);
    encoded.extend_from_slice(&(key.coordinate_count() as u64).to_le_bytes());
    encoded.extend_from_slice(&fxhash::hash64(bytes).to_le_bytes());
    encoded.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    encoded.extend_from_slice(&compressed);
    encoded
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn decode_table(
    key: TableKey,
    depth: u8,
    complete: bool,
    encoded: &[u8],
) -> Result<PruningTable, TableReadError> {
    if encoded.len() < HEADER_LEN || &encoded[..4] != MAGIC {
        return Err(TableReadError::BadMagic);
    }
    if encoded[4] != FORMAT_VERSION {
        return Err(TableReadError::UnsupportedVersion(encoded[4]));
    }
    if (encoded[5] & 1 == 1) != complete || encoded[6] != depth {
        return Err(TableReadError::HeaderMismatch);
    }
    let expected = key.coordinate_count() as u64;
    let found = read_u64(encoded, 8);
    if found != expected {
        return Err(TableReadError::CoordinateCountMismatch { expected, found });
    }
    let checksum = read_u64(encoded, 16);
    let compressed = &encoded[HEADER_LEN..];
    let compressed_len = read_u64(encoded, 24);
    if compressed_len != compressed.len() as u64 {
        return Err(TableReadError::CompressedLengthMismatch {
            expected: compressed_len,
            found: compressed.len() as u64,
        });
    }
    // The output size is fixed by the key, which bounds the work done on a
    // corrupt block
    let data = lz4_flex::block::decompress(compressed, key.coordinate_count())?;
    if data.len() != key.coordinate_count() || fxhash::hash64(&data[..]) != checksum {
        return Err(TableReadError::ChecksumMismatch);
    }
    if let Some(&distance) = data.iter().find(|&&d| d > depth && d != UNVISITED) {
        return Err(TableReadError::DistanceOutOfRange(distance));
    }
    Ok(PruningTable::from_parts(key, data, depth, complete))
}

struct CachedTable {
    table: Arc<PruningTable>,
    last_used: u64,
}

#[derive(Default)]
struct StoreInner {
    tables: FxHashMap<TableKey, CachedTable>,
    memory_used: u64,
    clock: u64,
}

/// Counters for telemetry and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub builds: u64,
    pub disk_loads: u64,
    pub evictions: u64,
    pub loaded_tables: usize,
    pub memory_used: u64,
}

pub struct TableStore {
    directory: PathBuf,
    memory_ceiling: u64,
    max_table_depth: u8,
    checkpoint_interval: Duration,
    host: Arc<dyn Host>,
    pool: Option<rayon::ThreadPool>,
    inner: Mutex<StoreInner>,
    // At most one materialization per key; taken outside `inner`
    key_locks: Mutex<FxHashMap<TableKey, Arc<Mutex<()>>>>,
    builds: AtomicU64,
    disk_loads: AtomicU64,
    evictions: AtomicU64,
}

impl TableStore {
    /// Create a store over the host's data directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if the data directory cannot be created.
    pub fn new(
        host: Arc<dyn Host>,
        config: &EngineConfig,
        pool: Option<rayon::ThreadPool>,
    ) -> io::Result<Self> {
        let directory = host.data_directory();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            memory_ceiling: config.memory_ceiling_bytes,
            max_table_depth: config.max_table_depth,
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_secs),
            host,
            pool,
            inner: Mutex::default(),
            key_locks: Mutex::default(),
            builds: AtomicU64::new(0),
            disk_loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Get the table for `key`, from memory if loaded, otherwise from disk,
    /// otherwise by building it. Concurrent loads of one key share a single
    /// materialization.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the table cannot fit in the memory ceiling or
    /// the host lacks the memory or disk to build it, and `Cancelled` if a
    /// build was cancelled through `cancellation`. A cancelled build leaves
    /// a checkpoint that the next load resumes from.
    pub fn load(
        &self,
        key: TableKey,
        cancellation: &CancellationToken,
    ) -> Result<Arc<PruningTable>, StoreError> {
        if let Some(table) = self.cached(key) {
            return Ok(table);
        }

        let key_lock = Arc::clone(
            self.key_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_default(),
        );
        let _materializing = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Someone else may have finished while we waited
        if let Some(table) = self.cached(key) {
            return Ok(table);
        }

        let needed = key.coordinate_count() as u64;
        if needed > self.memory_ceiling {
            return Err(StoreError::ResourceExhausted {
                key,
                resource: Resource::Memory,
                needed,
                available: self.memory_ceiling,
            });
        }

        let table = self.materialize(key, cancellation)?;
        Ok(self.insert(table))
    }

    fn cached(&self, key: TableKey) -> Option<Arc<PruningTable>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.clock += 1;
        let clock = inner.clock;
        inner.tables.get_mut(&key).map(|cached| {
            cached.last_used = clock;
            Arc::clone(&cached.table)
        })
    }

    fn insert(&self, table: PruningTable) -> Arc<PruningTable> {
        let key = table.key();
        let size = table.memory_bytes();
        let table = Arc::new(table);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        while inner.memory_used + size > self.memory_ceiling {
            let Some(lru_key) = inner
                .tables
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(&key, _)| key)
            else {
                break;
            };
            if let Some(evicted) = inner.tables.remove(&lru_key) {
                inner.memory_used -= evicted.table.memory_bytes();
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted the {lru_key} table from memory");
            }
        }
        inner.clock += 1;
        let last_used = inner.clock;
        inner.memory_used += size;
        if let Some(replaced) = inner.tables.insert(
            key,
            CachedTable {
                table: Arc::clone(&table),
                last_used,
            },
        ) {
            inner.memory_used -= replaced.table.memory_bytes();
        }
        table
    }

    fn materialize(
        &self,
        key: TableKey,
        cancellation: &CancellationToken,
    ) -> Result<PruningTable, StoreError> {
        let mut files = self
            .list()?
            .into_iter()
            .filter(|file| file.key == key)
            .collect::<Vec<_>>();
        // Complete tables first, then the deepest checkpoint
        files.sort_by_key(|file| (std::cmp::Reverse(file.complete), std::cmp::Reverse(file.depth)));

        let mut resume = None;
        for file in files {
            let path = self.directory.join(&file.file_name);
            match fs::read(&path)
                .map_err(TableReadError::from)
                .and_then(|encoded| decode_table(key, file.depth, file.complete, &encoded))
            {
                Ok(table) if table.is_complete() || table.depth() >= self.max_table_depth => {
                    self.disk_loads.fetch_add(1, Ordering::Relaxed);
                    info!("Loaded pruning table {} from disk", file.display_name());
                    return Ok(table);
                }
                Ok(table) => {
                    info!("Resuming pruning table {}", file.display_name());
                    resume = Some(table);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Removing unreadable pruning table {}: {e}",
                        path.display()
                    );
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("Failed to remove {}: {e}", path.display());
                    }
                }
            }
        }
        self.build(key, resume, cancellation)
    }

    fn build(
        &self,
        key: TableKey,
        resume: Option<PruningTable>,
        cancellation: &CancellationToken,
    ) -> Result<PruningTable, StoreError> {
        let needed = key.coordinate_count() as u64;
        if let Some(available) = self.host.available_memory() {
            if available < needed {
                return Err(StoreError::ResourceExhausted {
                    key,
                    resource: Resource::Memory,
                    needed,
                    available,
                });
            }
        }
        let disk_needed =
            (HEADER_LEN + lz4_flex::block::get_maximum_output_size(key.coordinate_count())) as u64;
        if let Some(available) = self.host.available_disk_space() {
            if available < disk_needed {
                return Err(StoreError::ResourceExhausted {
                    key,
                    resource: Resource::Disk,
                    needed: disk_needed,
                    available,
                });
            }
        }

        let builder = PruningTableBuilder::new(key, self.max_table_depth, cancellation);
        let mut last_checkpoint = Instant::now();
        let mut on_layer = |depth: u8, bytes: &[u8]| {
            if last_checkpoint.elapsed() >= self.checkpoint_interval {
                if let Err(e) = self.persist(key, depth, false, bytes) {
                    warn!("Failed to checkpoint the {key} table at depth {depth}: {e}");
                }
                last_checkpoint = Instant::now();
            }
        };
        let result = match &self.pool {
            Some(pool) => pool.install(|| builder.build(resume, &mut on_layer)),
            None => builder.build(resume, &mut on_layer),
        };

        match result {
            Ok(table) => {
                self.builds.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.persist(key, table.depth(), table.is_complete(), table.bytes())
                {
                    warn!("Failed to save the {key} table: {e}");
                }
                Ok(table)
            }
            Err(BuildError::Cancelled(partial)) => {
                if partial.depth() > 0 {
                    if let Err(e) = self.persist(key, partial.depth(), false, partial.bytes()) {
                        warn!("Failed to checkpoint the cancelled {key} table: {e}");
                    }
                }
                Err(StoreError::Cancelled(key))
            }
        }
    }

    /// Write a table file atomically, then drop checkpoints it supersedes.
    /// Complete tables are never removed here.
    fn persist(&self, key: TableKey, depth: u8, complete: bool, bytes: &[u8]) -> io::Result<()> {
        let file_name = table_file_name(key, depth, complete);
        let path = self.directory.join(&file_name);
        let tmp_path = self.directory.join(format!(".{file_name}.tmp"));
        fs::write(&tmp_path, encode_table(key, depth, complete, bytes))?;
        fs::rename(&tmp_path, &path)?;
        debug!("Saved {}", path.display());

        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let Some(other_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some((other_key, other_depth, other_complete)) =
                parse_table_file_name(&other_name)
            else {
                continue;
            };
            if other_key == key && !other_complete && other_name != file_name && (complete || other_depth < depth) {
                fs::remove_file(entry.path())?;
                debug!("Removed superseded checkpoint {other_name}");
            }
        }
        Ok(())
    }

    /// Every table file in the data directory, sorted by name.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<TableFileInfo>, StoreError> {
        let mut files = vec![];
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some((key, depth, complete)) = parse_table_file_name(&file_name) else {
                continue;
            };
            let metadata = entry.metadata()?;
            files.push(TableFileInfo {
                file_name,
                key,
                depth,
                complete,
                size_bytes: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    /// Delete a persisted table. In-memory copies stay usable until evicted.
    ///
    /// # Errors
    ///
    /// Refuses names that are not table files, and fails if removal fails.
    pub fn delete(&self, file_name: &str) -> Result<(), StoreError> {
        if parse_table_file_name(file_name).is_none() {
            return Err(StoreError::NotATableFile(file_name.to_owned()));
        }
        fs::remove_file(self.directory.join(file_name))?;
        info!("Deleted pruning table {file_name}");
        Ok(())
    }

    /// Bytes held by tables loaded in memory.
    #[must_use]
    pub fn memory_usage(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .memory_used
    }

    /// Bytes held by table files on disk.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be read.
    pub fn disk_usage(&self) -> Result<u64, StoreError> {
        Ok(self.list()?.iter().map(|file| file.size_bytes).sum())
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        StoreStats {
            builds: self.builds.load(Ordering::Relaxed),
            disk_loads: self.disk_loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            loaded_tables: inner.tables.len(),
            memory_used: inner.memory_used,
        }
    }

    /// Whether a table is currently held in memory.
    #[must_use]
    pub fn is_loaded(&self, key: TableKey) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tables
            .contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::{CoordinateShape, Orbit};

    fn key() -> TableKey {
        TableKey {
            allowed_faces: AllowedFaceSet::RUFBR,
            metric: Metric::Qtm,
            shape: CoordinateShape {
                orbit: Orbit::Edges,
                permutation: false,
                orientation: false,
            },
        }
    }

    #[test]
    fn test_file_names_round_trip() {
        let name = table_file_name(key(), 7, true);
        assert_eq!(name, "rufbr_qtm_edges-place_d7_complete.mllt");
        assert_eq!(parse_table_file_name(&name), Some((key(), 7, true)));
        assert_eq!(parse_table_file_name("rufbr_qtm_edges-place_d7.mllt"), None);
        assert_eq!(parse_table_file_name("notes.txt"), None);
        assert_eq!(
            parse_table_file_name(".rufbr_qtm_edges-place_d7_complete.mllt.tmp"),
            None
        );
    }

    #[test]
    fn test_encoding_round_trips_and_detects_corruption() {
        let key = key();
        let mut bytes = vec![UNVISITED; key.coordinate_count()];
        bytes[0] = 0;
        bytes[1] = 1;
        let encoded = encode_table(key, 1, false, &bytes);
        let decoded = decode_table(key, 1, false, &encoded).unwrap();
        assert_eq!(decoded.bytes(), &bytes[..]);

        assert!(decode_table(key, 2, false, &encoded).is_err());
        let mut truncated = encoded.clone();
        truncated.truncate(encoded.len() - 1);
        assert!(decode_table(key, 1, false, &truncated).is_err());
        let mut flipped = encoded;
        let last = flipped.len() - 1;
        flipped[last] ^= 0xFF;
        assert!(decode_table(key, 1, false, &flipped).is_err());
    }
}
