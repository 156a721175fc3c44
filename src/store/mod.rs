//! Filesystem turn store, the source of truth for every turn.
//!
//! Layout:
//!
//! ```text
//! <root>/users/<user_id>/turns/turn_<NNNNNN>/
//!     document.md
//!     answer.md
//!     metadata.json
//!     attempts/attempt_<n>/{document.md, answer.md}
//! ```
//!
//! `metadata.json` is written last, so a turn directory without it (or with
//! metadata that does not parse) is an incomplete record.

pub mod allocator;
pub mod metadata;

pub use allocator::{FileLockAllocator, InProcessAllocator, TurnAllocator};
pub use metadata::{TurnMetadata, TurnOutcome, TurnRecord};

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::StoreError;

const DOCUMENT_FILE: &str = "document.md";
const ANSWER_FILE: &str = "answer.md";
const METADATA_FILE: &str = "metadata.json";
const ATTEMPTS_DIR: &str = "attempts";
const TURN_PREFIX: &str = "turn_";
const ATTEMPT_PREFIX: &str = "attempt_";

/// Result of scanning the store.
#[derive(Debug, Default)]
pub struct StoreScan {
    pub complete: Vec<TurnMetadata>,
    pub incomplete: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TurnStore {
    root: PathBuf,
}

impl TurnStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    /// Directory of one turn, computed from (user, turn number).
    pub fn turn_dir(&self, user_id: &str, turn: u64) -> PathBuf {
        self.users_dir()
            .join(user_id)
            .join("turns")
            .join(format!("{}{:06}", TURN_PREFIX, turn))
    }

    /// Persist a finished turn. Document and answer first, metadata last.
    pub fn save_turn(&self, record: &TurnRecord) -> Result<PathBuf, StoreError> {
        let meta = &record.metadata;
        validate_id(&meta.user_id)?;
        let dir = self.turn_dir(&meta.user_id, meta.turn_number);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        write_file(&dir.join(DOCUMENT_FILE), &record.document)?;
        write_file(&dir.join(ANSWER_FILE), &record.answer)?;
        self.write_metadata(meta)?;

        tracing::debug!(turn = meta.turn_number, user_id = %meta.user_id, "Saved turn");
        Ok(dir)
    }

    /// Overwrite a turn's `metadata.json` atomically (temp file + rename).
    pub fn write_metadata(&self, meta: &TurnMetadata) -> Result<(), StoreError> {
        validate_id(&meta.user_id)?;
        let dir = self.turn_dir(&meta.user_id, meta.turn_number);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(meta).map_err(|e| StoreError::Metadata {
            path: path.clone(),
            source: e,
        })?;
        let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
        write_file(&tmp, &json)?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))
    }

    /// Archive one attempt's document and answer. Archives are never
    /// overwritten or deleted.
    pub fn archive_attempt(
        &self,
        user_id: &str,
        turn: u64,
        attempt: u32,
        document: &str,
        answer: &str,
    ) -> Result<PathBuf, StoreError> {
        validate_id(user_id)?;
        let dir = self
            .turn_dir(user_id, turn)
            .join(ATTEMPTS_DIR)
            .join(format!("{}{}", ATTEMPT_PREFIX, attempt));
        if dir.exists() {
            return Err(StoreError::AttemptExists { turn, attempt });
        }
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        write_file(&dir.join(DOCUMENT_FILE), document)?;
        write_file(&dir.join(ANSWER_FILE), answer)?;

        tracing::debug!(turn, attempt, "Archived attempt");
        Ok(dir)
    }

    pub fn load_metadata(&self, user_id: &str, turn: u64) -> Result<TurnMetadata, StoreError> {
        validate_id(user_id)?;
        let path = self.turn_dir(user_id, turn).join(METADATA_FILE);
        read_metadata(&path)?.ok_or_else(|| StoreError::TurnNotFound {
            user_id: user_id.to_string(),
            turn,
        })
    }

    pub fn load_answer(&self, user_id: &str, turn: u64) -> Result<String, StoreError> {
        self.load_metadata(user_id, turn)?;
        read_file(&self.turn_dir(user_id, turn).join(ANSWER_FILE))
    }

    pub fn load_turn(&self, user_id: &str, turn: u64) -> Result<TurnRecord, StoreError> {
        let metadata = self.load_metadata(user_id, turn)?;
        let dir = self.turn_dir(user_id, turn);
        Ok(TurnRecord {
            metadata,
            document: read_file(&dir.join(DOCUMENT_FILE))?,
            answer: read_file(&dir.join(ANSWER_FILE))?,
        })
    }

    /// Complete turn numbers of one user, ascending.
    pub fn list_turns(&self, user_id: &str) -> Result<Vec<u64>, StoreError> {
        validate_id(user_id)?;
        let mut turns: Vec<u64> = self
            .scan(Some(user_id))?
            .complete
            .iter()
            .map(|m| m.turn_number)
            .collect();
        turns.sort_unstable();
        Ok(turns)
    }

    /// Archived attempt numbers of one turn, ascending.
    pub fn list_attempts(&self, user_id: &str, turn: u64) -> Result<Vec<u32>, StoreError> {
        validate_id(user_id)?;
        let dir = self.turn_dir(user_id, turn).join(ATTEMPTS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut attempts = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(ATTEMPT_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                attempts.push(n);
            }
        }
        attempts.sort_unstable();
        Ok(attempts)
    }

    /// Scan turn directories, for every user or just one. Records whose
    /// metadata is missing, malformed, or disagrees with its location are
    /// reported as incomplete.
    pub fn scan(&self, user_id: Option<&str>) -> Result<StoreScan, StoreError> {
        let mut scan = StoreScan::default();
        for (dir, dir_user, turn) in self.turn_dirs(user_id)? {
            match read_metadata(&dir.join(METADATA_FILE)) {
                Ok(Some(meta))
                    if meta.turn_number == turn
                        && meta.user_id == dir_user
                        && dir.join(DOCUMENT_FILE).is_file() =>
                {
                    scan.complete.push(meta);
                }
                Ok(_) => scan.incomplete.push(dir),
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Skipping unreadable turn record");
                    scan.incomplete.push(dir);
                }
            }
        }
        scan.complete.sort_by_key(|m| m.turn_number);
        Ok(scan)
    }

    /// Highest turn number with a directory in the store, complete or not.
    pub fn max_turn_number(&self) -> Result<u64, StoreError> {
        Ok(self
            .turn_dirs(None)?
            .into_iter()
            .map(|(_, _, turn)| turn)
            .max()
            .unwrap_or(0))
    }

    /// `(dir, user_id, turn)` for every `turn_<N>` directory.
    fn turn_dirs(&self, user_id: Option<&str>) -> Result<Vec<(PathBuf, String, u64)>, StoreError> {
        let base = match user_id {
            Some(user) => self.users_dir().join(user),
            None => self.users_dir(),
        };
        if !base.exists() {
            return Ok(Vec::new());
        }
        // users/<user>/turns/turn_N
        let depth = if user_id.is_some() { 2 } else { 3 };

        let mut dirs = Vec::new();
        for entry in WalkDir::new(&base).min_depth(depth).max_depth(depth) {
            let entry = entry.map_err(|e| StoreError::io(&base, e.into()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            let Some(turn) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(TURN_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            let Some(user) = path
                .parent()
                .and_then(|turns| turns.parent())
                .and_then(|u| u.file_name())
                .and_then(|n| n.to_str())
            else {
                continue;
            };
            dirs.push((path.to_path_buf(), user.to_string(), turn));
        }
        Ok(dirs)
    }
}

/// Reject identifiers that would escape the store layout.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let bad = id.trim().is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        Err(StoreError::InvalidId(id.to_string()))
    } else {
        Ok(())
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), StoreError> {
    std::fs::write(path, content).map_err(|e| StoreError::io(path, e))
}

fn read_file(path: &Path) -> Result<String, StoreError> {
    std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))
}

/// `Ok(None)` when the file does not exist.
fn read_metadata(path: &Path) -> Result<Option<TurnMetadata>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Metadata {
            path: path.to_path_buf(),
            source: e,
        })
}
