//! Turn-number allocation.
//!
//! Turn numbers are unique per store and strictly increasing, which also
//! makes them monotonic within every session. Both allocators seed from the
//! highest turn directory already present so numbers are never reused after
//! a restart.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use super::TurnStore;
use crate::errors::StoreError;

const COUNTER_FILE: &str = "turn_counter";

pub trait TurnAllocator: Send + Sync {
    /// Reserve the next turn number.
    fn allocate(&self) -> Result<u64, StoreError>;
}

/// Mutex-guarded counter for a single process.
#[derive(Debug)]
pub struct InProcessAllocator {
    last: Mutex<u64>,
}

impl InProcessAllocator {
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    pub fn seeded(store: &TurnStore) -> Result<Self, StoreError> {
        Ok(Self::starting_after(store.max_turn_number()?))
    }
}

impl TurnAllocator for InProcessAllocator {
    fn allocate(&self) -> Result<u64, StoreError> {
        let mut last = self.last.lock().map_err(|_| StoreError::LockPoisoned)?;
        *last += 1;
        Ok(*last)
    }
}

/// Counter file under the store root guarded by an advisory exclusive lock,
/// for several processes sharing one store.
#[derive(Debug, Clone)]
pub struct FileLockAllocator {
    store: TurnStore,
    counter_path: PathBuf,
}

impl FileLockAllocator {
    pub fn new(store: TurnStore) -> Self {
        let counter_path = store.root().join(COUNTER_FILE);
        Self {
            store,
            counter_path,
        }
    }
}

impl TurnAllocator for FileLockAllocator {
    fn allocate(&self) -> Result<u64, StoreError> {
        let path = &self.counter_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(path, e))?;

        let result = (|| -> Result<u64, StoreError> {
            let mut content = String::new();
            file.read_to_string(&mut content)
                .map_err(|e| StoreError::io(path, e))?;
            let last = match content.trim().parse::<u64>() {
                Ok(n) => n,
                Err(_) => self.store.max_turn_number()?,
            };
            let next = last + 1;
            file.set_len(0).map_err(|e| StoreError::io(path, e))?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| StoreError::io(path, e))?;
            file.write_all(next.to_string().as_bytes())
                .map_err(|e| StoreError::io(path, e))?;
            file.sync_all().map_err(|e| StoreError::io(path, e))?;
            Ok(next)
        })();

        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to release turn counter lock");
        }
        result
    }
}
