//! Local mirror scanning and content hashing.

use crate::paths::remote_path_for;
use crate::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub hash: String,
    pub size: u64,
    pub local_path: PathBuf,
}

/// Lowercase hex SHA-256, the form blobbers report as `actual_hash`.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hashes a file without loading it into memory at once.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Regular-file test used before downloading into the mirror.
pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

/// Walks `root` and returns `remote path -> LocalFile` for every regular
/// file. Entries whose file name equals one of `filters` are skipped along
/// with everything below them.
pub fn scan_local_tree(root: &Path, filters: &[String]) -> Result<BTreeMap<String, LocalFile>> {
    let metadata = std::fs::metadata(root)
        .map_err(|error| SyncError::Path(format!("local root {:?}: {}", root, error)))?;
    if !metadata.is_dir() {
        return Err(SyncError::Path(format!(
            "local root {:?} is not a directory",
            root
        )));
    }

    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !filters
                    .iter()
                    .any(|filter| entry.file_name().to_string_lossy() == filter.as_str())
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|error| SyncError::Internal(format!("walk escaped root: {}", error)))?;
        let (hash, size) = hash_file(entry.path())?;
        files.insert(
            remote_path_for(relative),
            LocalFile {
                hash,
                size,
                local_path: entry.path().to_path_buf(),
            },
        );
    }

    tracing::debug!("scanned {} local files under {:?}", files.len(), root);
    Ok(files)
}
