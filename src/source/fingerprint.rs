use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};

/// Bytes at the start of the file covered by the head digest
pub const HEAD_BYTES: u64 = 1024;

/// Identifies one physical file instance.
///
/// Device and inode catch rotation by rename; the head digest catches a file
/// truncated in place that has grown back past the old offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub device: u64,
    pub inode: u64,
    pub head_len: u64,
    pub head_digest: String,
}

impl Fingerprint {
    /// Fingerprint an open file. Leaves the file position unspecified.
    pub fn compute(file: &mut File, metadata: &Metadata) -> std::io::Result<Self> {
        let head_len = metadata.len().min(HEAD_BYTES);
        let (device, inode) = file_identity(metadata);
        Ok(Self {
            device,
            inode,
            head_len,
            head_digest: head_digest(file, head_len)?,
        })
    }

    pub fn same_identity(&self, device: u64, inode: u64) -> bool {
        self.device == device && self.inode == inode
    }

    /// True if `file` still starts with the bytes this fingerprint was taken over.
    pub fn head_matches(&self, file: &mut File, size: u64) -> std::io::Result<bool> {
        if size < self.head_len {
            return Ok(false);
        }
        Ok(head_digest(file, self.head_len)? == self.head_digest)
    }
}

fn head_digest(file: &mut File, len: u64) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut head = Vec::with_capacity(len as usize);
    file.by_ref().take(len).read_to_end(&mut head)?;
    Ok(format!("{:x}", Sha256::digest(&head)))
}

// Platform-specific identity retrieval
#[cfg(unix)]
pub fn file_identity(metadata: &Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
pub fn file_identity(metadata: &Metadata) -> (u64, u64) {
    // No inode here; creation time is the closest stable proxy
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Ok(created) = metadata.created() {
        created.hash(&mut hasher);
    }
    (0, hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fingerprint_of(temp: &NamedTempFile) -> Fingerprint {
        let mut file = File::open(temp.path()).unwrap();
        let metadata = file.metadata().unwrap();
        Fingerprint::compute(&mut file, &metadata).unwrap()
    }

    #[test]
    fn test_head_is_stable_while_appending() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "00:00:00,000 INFO first").unwrap();
        temp.flush().unwrap();
        let before = fingerprint_of(&temp);

        writeln!(temp, "00:00:01,000 INFO second").unwrap();
        temp.flush().unwrap();

        let mut file = File::open(temp.path()).unwrap();
        let size = file.metadata().unwrap().len();
        assert!(before.head_matches(&mut file, size).unwrap());
    }

    #[test]
    fn test_rewritten_head_detected() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "00:00:00,000 INFO first").unwrap();
        temp.flush().unwrap();
        let before = fingerprint_of(&temp);

        std::fs::write(temp.path(), "11:11:11,111 WARN other content entirely\n").unwrap();

        let mut file = File::open(temp.path()).unwrap();
        let size = file.metadata().unwrap().len();
        assert!(!before.head_matches(&mut file, size).unwrap());
    }

    #[test]
    fn test_head_len_capped() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&vec![b'x'; 4096]).unwrap();
        temp.flush().unwrap();

        assert_eq!(fingerprint_of(&temp).head_len, HEAD_BYTES);
    }
}
