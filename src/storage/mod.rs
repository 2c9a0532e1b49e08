//! # Storage Module - Lookup Table and Activity Record Persistence
//!
//! Two small JSON documents live in the data directory:
//!
//! ```text
//! data/
//! ├── lookup_table.json    ← tag UID → task label
//! └── activity_table.json  ← the ActivityRecord
//! ```
//!
//! Both are created with defaults the first time [`Storage::open`] runs: the lookup
//! table holds the debug tag, the activity record is empty. After that the files are
//! loaded verbatim; the last persisted state is authoritative.
//!
//! Writes take an exclusive `fs2` lock on the destination, write a temp file in the
//! same directory and rename it over the destination, so a reader never sees a torn
//! file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::activity::ActivityRecord;
use crate::config::StorageConfig;
use crate::tag::{TagId, DEBUG_TAG};

/// Errors that can arise while loading or persisting the stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The activity record on disk has sequences of different lengths.
    #[error("activity record in {0} is misaligned")]
    Misaligned(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Tag UID → task label.
pub type LookupTable = BTreeMap<TagId, String>;

pub fn default_lookup_table() -> LookupTable {
    let mut table = LookupTable::new();
    if let Some(debug_tag) = TagId::parse(DEBUG_TAG) {
        table.insert(debug_tag, "DEBUG".to_string());
    }
    table
}

/// Persistent tag → label table.
#[derive(Debug)]
pub struct LookupStore {
    path: PathBuf,
    table: LookupTable,
}

impl LookupStore {
    /// Load the table, creating it with the debug tag if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = load_or_init(&path, default_lookup_table)?;
        info!("lookup table {} has {} tag(s)", path.display(), table.len());
        Ok(Self { path, table })
    }

    pub fn get(&self, tag: &TagId) -> Option<&str> {
        self.table.get(tag).map(String::as_str)
    }

    /// Bind `tag` to `label` in memory; call [`LookupStore::persist`] to save.
    pub fn set(&mut self, tag: TagId, label: impl Into<String>) -> Option<String> {
        self.table.insert(tag, label.into())
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        write_json_locked(&self.path, &self.table)
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Persistent home of the [`ActivityRecord`].
#[derive(Debug, Clone)]
pub struct ActivityStore {
    path: PathBuf,
}

impl ActivityStore {
    /// Load the record, creating an empty one if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, ActivityRecord), StoreError> {
        let path = path.into();
        let record: ActivityRecord = load_or_init(&path, ActivityRecord::default)?;
        if !record.is_aligned() {
            return Err(StoreError::Misaligned(path));
        }
        info!(
            "activity record {} has {} entr{}",
            path.display(),
            record.len(),
            if record.len() == 1 { "y" } else { "ies" }
        );
        Ok((Self { path }, record))
    }

    pub fn persist(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        write_json_locked(&self.path, record)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Both stores, opened once at process start.
#[derive(Debug)]
pub struct Storage {
    pub lookup: LookupStore,
    pub activity: ActivityStore,
    pub record: ActivityRecord,
}

impl Storage {
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        let dir = Path::new(&config.data_dir);
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let lookup = LookupStore::open(dir.join(&config.lookup_file))?;
        let (activity, record) = ActivityStore::open(dir.join(&config.activity_file))?;
        Ok(Self {
            lookup,
            activity,
            record,
        })
    }
}

fn load_or_init<T, F>(path: &Path, default: F) -> Result<T, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} missing, writing defaults", path.display());
            let value = default();
            write_json_locked(path, &value)?;
            Ok(value)
        }
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Serialize `value` and atomically replace `path` with it under an exclusive lock.
fn write_json_locked<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_err(path))?;
    lock_file.lock_exclusive().map_err(io_err(path))?;

    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("store.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes()).map_err(io_err(&candidate))?;
                tmp.flush().map_err(io_err(&candidate))?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(io_err(&candidate)(e)),
        }
    };

    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}
