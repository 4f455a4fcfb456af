use crate::source::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("cursor store {path} unreadable: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cursor store {path} unwritable: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cursor store: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Read position in one physical log file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub fingerprint: Option<Fingerprint>,
    /// Byte offset just past the last shipped line
    pub offset: u64,
    /// Number of lines consumed, so line numbers continue across runs
    pub line: u64,
}

impl Cursor {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.offset == 0 && self.line == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCursor {
    #[serde(flatten)]
    cursor: Cursor,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorFile {
    version: u32,
    cursors: BTreeMap<String, StoredCursor>,
}

impl Default for CursorFile {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cursors: BTreeMap::new(),
        }
    }
}

/// Durable map of log path to cursor, replaced atomically on every write
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted cursor for `log_path`, or the zero cursor.
    pub fn load(&self, log_path: &Path) -> Result<Cursor> {
        let file = self.read_file()?;
        match file.cursors.get(&key(log_path)) {
            Some(stored) => {
                tracing::debug!(
                    log = %log_path.display(),
                    offset = stored.cursor.offset,
                    line = stored.cursor.line,
                    updated_at = %stored.updated_at,
                    "Loaded cursor"
                );
                Ok(stored.cursor.clone())
            }
            None => {
                tracing::info!(log = %log_path.display(), "No cursor stored, starting from the beginning");
                Ok(Cursor::zero())
            }
        }
    }

    /// Persist `cursor` for `log_path` with write-then-rename.
    pub fn advance(&self, log_path: &Path, cursor: &Cursor) -> Result<()> {
        let mut file = self.read_file()?;
        file.cursors.insert(
            key(log_path),
            StoredCursor {
                cursor: cursor.clone(),
                updated_at: Utc::now(),
            },
        );

        let bytes = serde_json::to_vec_pretty(&file)?;
        self.replace(&bytes).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(
            log = %log_path.display(),
            offset = cursor.offset,
            line = cursor.line,
            "Cursor persisted"
        );
        Ok(())
    }

    fn read_file(&self) -> Result<CursorFile> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CursorFile::default()),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if bytes.is_empty() {
            return Ok(CursorFile::default());
        }

        match serde_json::from_slice::<CursorFile>(&bytes) {
            Ok(file) if file.version == CURRENT_VERSION => Ok(file),
            Ok(file) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Cursor store version mismatch: {} vs {}, ignoring stored cursors",
                    file.version,
                    CURRENT_VERSION
                );
                Ok(CursorFile::default())
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Cursor store is corrupt, ignoring stored cursors"
                );
                Ok(CursorFile::default())
            }
        }
    }

    fn replace(&self, bytes: &[u8]) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // Make the rename itself durable; not every platform can open a directory
        if let Ok(dir) = File::open(&dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

fn key(log_path: &Path) -> String {
    log_path.to_string_lossy().into_owned()
}
