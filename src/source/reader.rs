use crate::source::fingerprint::{file_identity, Fingerprint};
use crate::storage::cursor::Cursor;
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("log file {0} not found")]
    NotFound(PathBuf),

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One complete line of the log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// 1-based, continues across runs via the cursor
    pub line_number: u64,
    pub text: String,
    /// Offset just past this line's newline
    pub end_offset: u64,
}

/// Why the stored cursor no longer applies to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discontinuity {
    /// A different physical file now lives at the path
    Rotated { previous_offset: u64 },
    /// Same file, but shorter than the cursor or rewritten from the start
    Truncated { previous_offset: u64 },
}

/// Bounded, forward-only pass over the complete lines of a log file.
///
/// Reads from the cursor up to the size the file had when opened. A trailing
/// line without a newline is left for the next run.
pub struct LineReader {
    path: PathBuf,
    reader: BufReader<File>,
    fingerprint: Fingerprint,
    discontinuity: Option<Discontinuity>,
    modified: Option<DateTime<Utc>>,
    start_offset: u64,
    start_line: u64,
    offset: u64,
    line: u64,
    limit: u64,
    done: bool,
}

impl LineReader {
    /// Open `path` and position it according to `cursor`.
    ///
    /// If the cursor's fingerprint does not match the file the reader starts
    /// from offset 0 and reports the discontinuity.
    pub fn open(path: &Path, cursor: &Cursor) -> Result<Self, ReaderError> {
        let io_err = |source: std::io::Error| ReaderError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReaderError::NotFound(path.to_path_buf())
            } else {
                io_err(e)
            }
        })?;
        let metadata = file.metadata().map_err(io_err)?;
        let size = metadata.len();
        let (device, inode) = file_identity(&metadata);

        let previous_offset = cursor.offset;
        let discontinuity = match &cursor.fingerprint {
            Some(fp) if !fp.same_identity(device, inode) => {
                Some(Discontinuity::Rotated { previous_offset })
            }
            _ if previous_offset > size => Some(Discontinuity::Truncated { previous_offset }),
            Some(fp) if !fp.head_matches(&mut file, size).map_err(io_err)? => {
                Some(Discontinuity::Truncated { previous_offset })
            }
            _ => None,
        };

        let fingerprint = Fingerprint::compute(&mut file, &metadata).map_err(io_err)?;

        let (start_offset, line) = match discontinuity {
            Some(kind) => {
                tracing::warn!(
                    path = %path.display(),
                    previous_offset,
                    current_size = size,
                    kind = ?kind,
                    "Log file rotated or truncated since last run, restarting from offset 0; \
                     lines written to the old file after the last run may be missing"
                );
                (0, 0)
            }
            None => (cursor.offset, cursor.line),
        };

        file.seek(SeekFrom::Start(start_offset)).map_err(io_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            fingerprint,
            discontinuity,
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            start_offset,
            start_line: line,
            offset: start_offset,
            line,
            limit: size,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn discontinuity(&self) -> Option<Discontinuity> {
        self.discontinuity
    }

    /// Modification time of the file when it was opened
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Cursor for where this pass started, after any discontinuity reset
    pub fn start_cursor(&self) -> Cursor {
        Cursor {
            fingerprint: Some(self.fingerprint.clone()),
            offset: self.start_offset,
            line: self.start_line,
        }
    }

    /// Cursor positioned after the last line yielded so far
    pub fn cursor(&self) -> Cursor {
        Cursor {
            fingerprint: Some(self.fingerprint.clone()),
            offset: self.offset,
            line: self.line,
        }
    }

    /// Read the next complete line
    pub fn next_line(&mut self) -> Result<Option<RawLine>, ReaderError> {
        if self.done || self.offset >= self.limit {
            self.done = true;
            return Ok(None);
        }

        let mut buf = Vec::new();
        let bytes_read = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(|source| ReaderError::Io {
                path: self.path.clone(),
                source,
            })?;

        if bytes_read == 0 || buf.last() != Some(&b'\n') {
            // EOF, or a line still being written
            self.done = true;
            return Ok(None);
        }

        self.offset += bytes_read as u64;
        self.line += 1;

        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }

        Ok(Some(RawLine {
            line_number: self.line,
            text: String::from_utf8_lossy(&buf).into_owned(),
            end_offset: self.offset,
        }))
    }
}

impl Iterator for LineReader {
    type Item = Result<RawLine, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Find the file a rotation renamed `path`'s old incarnation to.
///
/// Candidates are siblings named `<name><suffix>`, where the suffix starts
/// with the literal text leading `suffix_format` (`.` for `.%Y-%m-%d`, `-`
/// for `-%Y%m%d`). The one whose device/inode match `fingerprint` wins.
pub fn find_rotated_sibling(
    path: &Path,
    suffix_format: &str,
    fingerprint: &Fingerprint,
) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let prefix = format!("{}{}", name, literal_prefix(suffix_format));
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Cannot scan for rotated files");
            return None;
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let candidate = entry.file_name().to_string_lossy().into_owned();
            candidate.len() > prefix.len() && candidate.starts_with(&prefix)
        })
        .find(|entry| {
            entry
                .metadata()
                .map(|metadata| {
                    metadata.is_file() && {
                        let (device, inode) = file_identity(&metadata);
                        fingerprint.same_identity(device, inode)
                    }
                })
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
}

/// Date encoded in a rotated file's name, `<name><suffix_format>`
pub fn rotated_suffix_date(path: &Path, rotated: &Path, suffix_format: &str) -> Option<NaiveDate> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let rotated_name = rotated.file_name()?.to_string_lossy().into_owned();
    let suffix = rotated_name.strip_prefix(name.as_str())?;
    NaiveDate::parse_from_str(suffix, suffix_format).ok()
}

/// Text before the first chrono specifier, with `%%` unescaped
fn literal_prefix(format: &str) -> String {
    let mut prefix = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            prefix.push(c);
        } else if chars.peek() == Some(&'%') {
            chars.next();
            prefix.push('%');
        } else {
            break;
        }
    }
    prefix
}
