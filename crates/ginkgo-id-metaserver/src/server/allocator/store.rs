//! Allocation records and where they live.
//!
//! A [`RecordStore`] holds one [`SnowflakeNode`] and one [`SegmentMeta`] per
//! biz tag and offers exactly what the optimistic allocation protocol needs:
//! point lookup, insert with a unique biz tag, and a conditional update that
//! only applies while the stored value still matches the caller's read.
//!
//! - [`MemoryStore`] keeps the tables behind a `parking_lot` mutex. Records
//!   are lost on restart, so it suits tests and throwaway deployments.
//! - [`JsonFileStore`] wraps the same tables and writes an atomic JSON
//!   snapshot after every mutation, reloading it on startup.

use chrono::NaiveDateTime;
use ginkgo_id_meta_core::datetime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Machine-id lease state of one biz tag: the last machine id handed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowflakeNode {
    pub id: i64,
    pub biz_tag: String,
    pub machine_id: i64,
    #[serde(with = "datetime")]
    pub create_time: NaiveDateTime,
    #[serde(with = "datetime")]
    pub update_time: NaiveDateTime,
}

/// Segment lease state of one biz tag: `next_id` is the first id not yet
/// leased to anyone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub id: i64,
    pub biz_tag: String,
    pub next_id: i64,
    #[serde(with = "datetime")]
    pub create_time: NaiveDateTime,
    #[serde(with = "datetime")]
    pub update_time: NaiveDateTime,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Another writer inserted the record first. Callers re-read and retry.
    #[error("record for biz tag `{biz_tag}` already exists")]
    Duplicate { biz_tag: String },

    #[error("failed to persist snapshot {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {path} is not valid JSON")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for allocation records.
///
/// Conditional updates return the number of affected records (0 or 1) so the
/// caller can tell a lost race from success.
pub trait RecordStore: Send + Sync {
    fn find_node(&self, biz_tag: &str) -> StoreResult<Option<SnowflakeNode>>;

    /// # Errors
    ///
    /// [`StoreError::Duplicate`] if `biz_tag` already has a node.
    fn insert_node(&self, biz_tag: &str, machine_id: i64, now: NaiveDateTime) -> StoreResult<SnowflakeNode>;

    /// Sets `machine_id` to `new` if it is still `expected`.
    fn update_machine_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize>;

    fn find_segment(&self, biz_tag: &str) -> StoreResult<Option<SegmentMeta>>;

    /// # Errors
    ///
    /// [`StoreError::Duplicate`] if `biz_tag` already has a segment record.
    fn insert_segment(&self, biz_tag: &str, next_id: i64, now: NaiveDateTime) -> StoreResult<SegmentMeta>;

    /// Sets `next_id` to `new` if it is still `expected`.
    fn update_next_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize>;
}

impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn find_node(&self, biz_tag: &str) -> StoreResult<Option<SnowflakeNode>> {
        (**self).find_node(biz_tag)
    }

    fn insert_node(&self, biz_tag: &str, machine_id: i64, now: NaiveDateTime) -> StoreResult<SnowflakeNode> {
        (**self).insert_node(biz_tag, machine_id, now)
    }

    fn update_machine_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize> {
        (**self).update_machine_id(biz_tag, expected, new, now)
    }

    fn find_segment(&self, biz_tag: &str) -> StoreResult<Option<SegmentMeta>> {
        (**self).find_segment(biz_tag)
    }

    fn insert_segment(&self, biz_tag: &str, next_id: i64, now: NaiveDateTime) -> StoreResult<SegmentMeta> {
        (**self).insert_segment(biz_tag, next_id, now)
    }

    fn update_next_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize> {
        (**self).update_next_id(biz_tag, expected, new, now)
    }
}

/// Both record tables plus their auto-increment counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Tables {
    last_node_id: i64,
    last_segment_id: i64,
    nodes: BTreeMap<String, SnowflakeNode>,
    segments: BTreeMap<String, SegmentMeta>,
}

impl Tables {
    fn insert_node(&mut self, biz_tag: &str, machine_id: i64, now: NaiveDateTime) -> StoreResult<SnowflakeNode> {
        if self.nodes.contains_key(biz_tag) {
            return Err(StoreError::Duplicate {
                biz_tag: biz_tag.to_owned(),
            });
        }
        self.last_node_id += 1;
        let node = SnowflakeNode {
            id: self.last_node_id,
            biz_tag: biz_tag.to_owned(),
            machine_id,
            create_time: now,
            update_time: now,
        };
        self.nodes.insert(biz_tag.to_owned(), node.clone());
        Ok(node)
    }

    fn update_machine_id(&mut self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> usize {
        match self.nodes.get_mut(biz_tag) {
            Some(node) if node.machine_id == expected => {
                node.machine_id = new;
                node.update_time = now;
                1
            }
            _ => 0,
        }
    }

    fn insert_segment(&mut self, biz_tag: &str, next_id: i64, now: NaiveDateTime) -> StoreResult<SegmentMeta> {
        if self.segments.contains_key(biz_tag) {
            return Err(StoreError::Duplicate {
                biz_tag: biz_tag.to_owned(),
            });
        }
        self.last_segment_id += 1;
        let meta = SegmentMeta {
            id: self.last_segment_id,
            biz_tag: biz_tag.to_owned(),
            next_id,
            create_time: now,
            update_time: now,
        };
        self.segments.insert(biz_tag.to_owned(), meta.clone());
        Ok(meta)
    }

    fn update_next_id(&mut self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> usize {
        match self.segments.get_mut(biz_tag) {
            Some(meta) if meta.next_id == expected => {
                meta.next_id = new;
                meta.update_time = now;
                1
            }
            _ => 0,
        }
    }
}

/// In-process record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<R>) -> StoreResult<R> {
        f(&mut self.tables.lock())
    }
}

impl RecordStore for MemoryStore {
    fn find_node(&self, biz_tag: &str) -> StoreResult<Option<SnowflakeNode>> {
        Ok(self.read(|t| t.nodes.get(biz_tag).cloned()))
    }

    fn insert_node(&self, biz_tag: &str, machine_id: i64, now: NaiveDateTime) -> StoreResult<SnowflakeNode> {
        self.write(|t| t.insert_node(biz_tag, machine_id, now))
    }

    fn update_machine_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize> {
        self.write(|t| Ok(t.update_machine_id(biz_tag, expected, new, now)))
    }

    fn find_segment(&self, biz_tag: &str) -> StoreResult<Option<SegmentMeta>> {
        Ok(self.read(|t| t.segments.get(biz_tag).cloned()))
    }

    fn insert_segment(&self, biz_tag: &str, next_id: i64, now: NaiveDateTime) -> StoreResult<SegmentMeta> {
        self.write(|t| t.insert_segment(biz_tag, next_id, now))
    }

    fn update_next_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize> {
        self.write(|t| Ok(t.update_next_id(biz_tag, expected, new, now)))
    }
}

/// [`MemoryStore`] tables mirrored to a JSON file.
///
/// Every mutation is applied to a copy of the tables, written to
/// `<path>.tmp`, synced and renamed over `path`, and only then published in
/// memory. A failed write leaves both the file and the in-memory state
/// untouched.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Opens the snapshot at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Io`] if the file exists but cannot be read
    /// - [`StoreError::Corrupt`] if it is not a valid snapshot
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let tables = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        tracing::info!(
            path = %path.display(),
            nodes = tables.nodes.len(),
            segments = tables.segments.len(),
            "record snapshot loaded"
        );
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.lock())
    }

    /// Applies `f` to a copy and persists it if it changed anything.
    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<R>) -> StoreResult<R> {
        let mut tables = self.tables.lock();
        let mut next = tables.clone();
        let out = f(&mut next)?;
        if next != *tables {
            persist(&self.path, &next)?;
            *tables = next;
        }
        Ok(out)
    }
}

fn persist(path: &Path, tables: &Tables) -> StoreResult<()> {
    let io = |source: std::io::Error| StoreError::Io {
        path: path.to_owned(),
        source,
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let bytes = serde_json::to_vec_pretty(tables).map_err(|e| io(e.into()))?;
    let mut file = fs::File::create(&tmp).map_err(io)?;
    file.write_all(&bytes).map_err(io)?;
    file.sync_all().map_err(io)?;
    fs::rename(&tmp, path).map_err(io)?;
    sync_dir(parent_dir(path)).map_err(io)
}

/// Directory holding `path`; `.` for a bare file name.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

// Directories cannot be opened as files here; renames are durable once the
// call returns.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

impl RecordStore for JsonFileStore {
    fn find_node(&self, biz_tag: &str) -> StoreResult<Option<SnowflakeNode>> {
        Ok(self.read(|t| t.nodes.get(biz_tag).cloned()))
    }

    fn insert_node(&self, biz_tag: &str, machine_id: i64, now: NaiveDateTime) -> StoreResult<SnowflakeNode> {
        self.write(|t| t.insert_node(biz_tag, machine_id, now))
    }

    fn update_machine_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize> {
        self.write(|t| Ok(t.update_machine_id(biz_tag, expected, new, now)))
    }

    fn find_segment(&self, biz_tag: &str) -> StoreResult<Option<SegmentMeta>> {
        Ok(self.read(|t| t.segments.get(biz_tag).cloned()))
    }

    fn insert_segment(&self, biz_tag: &str, next_id: i64, now: NaiveDateTime) -> StoreResult<SegmentMeta> {
        self.write(|t| t.insert_segment(biz_tag, next_id, now))
    }

    fn update_next_id(&self, biz_tag: &str, expected: i64, new: i64, now: NaiveDateTime) -> StoreResult<usize> {
        self.write(|t| Ok(t.update_next_id(biz_tag, expected, new, now)))
    }
}
