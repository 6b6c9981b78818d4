use crate::consensus::{ConsensusReader, RemoteTree};
use crate::paths::normalize_remote_path;
use crate::{Result, SnapshotCache, SyncError, scan_local_tree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Upload,
    Download,
    Delete,
    Update,
    Conflict,
    Exception,
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
            Self::Update => "update",
            Self::Conflict => "conflict",
            Self::Exception => "exception",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    #[serde(rename = "operation")]
    pub op: DiffOp,
}

impl FileDiff {
    pub fn new(path: impl Into<String>, op: DiffOp) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }
}

#[derive(Clone)]
pub struct GetAllocationDiffOperation {
    reader: ConsensusReader,
}

#[derive(Debug, Clone)]
pub struct GetAllocationDiffOperationRequest {
    pub snapshot_path: PathBuf,
    pub local_root: PathBuf,
    /// File names skipped, with their subtrees, during the local walk.
    pub local_filters: Vec<String>,
    /// Remote prefixes dropped from the consensus tree.
    pub remote_excludes: Vec<String>,
}

impl GetAllocationDiffOperation {
    pub fn new(reader: ConsensusReader) -> Self {
        Self { reader }
    }

    /// Compares snapshot, local mirror and consensus remote state. Input
    /// errors surface before any blobber is contacted.
    pub async fn run(&self, request: GetAllocationDiffOperationRequest) -> Result<Vec<FileDiff>> {
        let GetAllocationDiffOperationRequest {
            snapshot_path,
            local_root,
            local_filters,
            remote_excludes,
        } = request;

        let snapshot = SnapshotCache::load(&snapshot_path).await?;
        let excludes = normalize_excludes(&remote_excludes)?;

        let local = tokio::task::spawn_blocking(move || scan_local_tree(&local_root, &local_filters))
            .await
            .map_err(|error| SyncError::Internal(format!("local scan task failed: {}", error)))??;
        let local_hashes: BTreeMap<String, String> = local
            .into_iter()
            .map(|(path, file)| (path, file.hash))
            .collect();

        let mut remote = self.reader.remote_tree("/").await?;
        remote.exclude(&excludes);

        let diffs = categorize(&snapshot.file_hashes(), &local_hashes, &remote);
        tracing::info!(
            "allocation diff computed. cached={} local={} remote={} unresolved={} diffs={}",
            snapshot.len(),
            local_hashes.len(),
            remote.files.len(),
            remote.unresolved.len(),
            diffs.len()
        );
        Ok(diffs)
    }
}

pub(crate) fn normalize_excludes(excludes: &[String]) -> Result<Vec<String>> {
    excludes
        .iter()
        .map(|exclude| normalize_remote_path(exclude))
        .collect()
}

/// Partitions every path seen in `cached`, `local` or `remote` into at most
/// one diff. Output is sorted by path.
pub fn categorize(
    cached: &BTreeMap<String, String>,
    local: &BTreeMap<String, String>,
    remote: &RemoteTree,
) -> Vec<FileDiff> {
    let paths: BTreeSet<&String> = cached
        .keys()
        .chain(local.keys())
        .chain(remote.files.keys())
        .chain(remote.unresolved.iter())
        .collect();

    paths
        .into_iter()
        .filter_map(|path| {
            if remote.is_unresolved(path) {
                return Some(FileDiff::new(path.as_str(), DiffOp::Exception));
            }
            let op = classify(
                local.get(path).map(String::as_str),
                remote.files.get(path).map(|file| file.hash.as_str()),
                cached.get(path).map(String::as_str),
            )?;
            Some(FileDiff::new(path.as_str(), op))
        })
        .collect()
}

fn classify(local: Option<&str>, remote: Option<&str>, cached: Option<&str>) -> Option<DiffOp> {
    match (local, remote, cached) {
        (Some(_), None, None) => Some(DiffOp::Upload),
        (None, Some(_), None) => Some(DiffOp::Download),
        (None, Some(remote), Some(cached)) if remote == cached => Some(DiffOp::Delete),
        // deleted locally, changed remotely
        (None, Some(_), Some(_)) => Some(DiffOp::Conflict),
        (Some(_), None, Some(_)) => Some(DiffOp::Exception),
        (None, None, _) => None,
        (Some(local), Some(remote), _) if local == remote => None,
        (Some(_), Some(remote), Some(cached)) if remote == cached => Some(DiffOp::Update),
        (Some(local), Some(_), Some(cached)) if local == cached => Some(DiffOp::Download),
        (Some(_), Some(_), _) => Some(DiffOp::Conflict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::RemoteFile;
    use crate::consensus::testing::{MemoryBlobbers, blobbers};
    use crate::{BlobberRef, compute_hash};
    use std::sync::Arc;

    fn tree(files: &[(&str, &str)]) -> RemoteTree {
        let mut tree = RemoteTree::default();
        for (path, hash) in files {
            tree.files.insert(
                path.to_string(),
                RemoteFile {
                    hash: hash.to_string(),
                    size: 1,
                },
            );
        }
        tree
    }

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(path, hash)| (path.to_string(), hash.to_string()))
            .collect()
    }

    #[test]
    fn test_categorize_covers_every_case() {
        let cached = map(&[
            ("/delete", "c"),
            ("/conflict-deleted", "c"),
            ("/update", "c"),
            ("/download-changed", "c"),
            ("/both-changed", "c"),
            ("/exception", "c"),
            ("/same", "c"),
            ("/gone", "c"),
        ]);
        let local = map(&[
            ("/upload", "l"),
            ("/update", "l"),
            ("/download-changed", "c"),
            ("/both-changed", "l"),
            ("/new-both", "l"),
            ("/exception", "l"),
            ("/same", "c"),
        ]);
        let remote = tree(&[
            ("/download", "r"),
            ("/delete", "c"),
            ("/conflict-deleted", "r"),
            ("/update", "c"),
            ("/download-changed", "r"),
            ("/both-changed", "r"),
            ("/new-both", "r"),
            ("/same", "c"),
        ]);

        let diffs = categorize(&cached, &local, &remote);
        let expected = vec![
            FileDiff::new("/both-changed", DiffOp::Conflict),
            FileDiff::new("/conflict-deleted", DiffOp::Conflict),
            FileDiff::new("/delete", DiffOp::Delete),
            FileDiff::new("/download", DiffOp::Download),
            FileDiff::new("/download-changed", DiffOp::Download),
            FileDiff::new("/exception", DiffOp::Exception),
            FileDiff::new("/new-both", DiffOp::Conflict),
            FileDiff::new("/update", DiffOp::Update),
            FileDiff::new("/upload", DiffOp::Upload),
        ];
        assert_eq!(diffs, expected);
    }

    #[test]
    fn test_converged_paths_are_not_emitted() {
        let cached = map(&[("/a", "old")]);
        let local = map(&[("/a", "new")]);
        let remote = tree(&[("/a", "new")]);
        assert!(categorize(&cached, &local, &remote).is_empty());
    }

    #[test]
    fn test_unresolved_subtree_is_exception() {
        let local = map(&[("/docs/a.txt", "l"), ("/b.txt", "b")]);
        let mut remote = tree(&[("/b.txt", "b")]);
        remote.unresolved.insert("/docs".to_string());

        let diffs = categorize(&BTreeMap::new(), &local, &remote);
        assert_eq!(
            diffs,
            vec![
                FileDiff::new("/docs", DiffOp::Exception),
                FileDiff::new("/docs/a.txt", DiffOp::Exception),
            ]
        );
    }

    struct Scenario {
        operation: GetAllocationDiffOperation,
        memory: Arc<MemoryBlobbers>,
        refs: Vec<BlobberRef>,
        dir: tempfile::TempDir,
    }

    impl Scenario {
        fn new() -> Self {
            let refs = blobbers(4);
            let memory = Arc::new(MemoryBlobbers::default());
            let reader = ConsensusReader::new(memory.clone(), refs.clone(), 2);
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("local")).unwrap();
            Self {
                operation: GetAllocationDiffOperation::new(reader),
                memory,
                refs,
                dir,
            }
        }

        fn write_local(&self, path: &str, content: &[u8]) {
            let local = self.dir.path().join("local").join(path.trim_start_matches('/'));
            std::fs::create_dir_all(local.parent().unwrap()).unwrap();
            std::fs::write(local, content).unwrap();
        }

        fn request(&self) -> GetAllocationDiffOperationRequest {
            GetAllocationDiffOperationRequest {
                snapshot_path: self.dir.path().join("snapshot.json"),
                local_root: self.dir.path().join("local"),
                local_filters: vec![".DS_Store".to_string(), ".git".to_string()],
                remote_excludes: Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_partial_remote_file_is_not_downloaded() {
        let scenario = Scenario::new();
        // /1.txt on one blobber only: below the threshold of two
        scenario
            .memory
            .put(&scenario.refs[0].id, "/1.txt", &compute_hash(b"one"), 3);
        scenario.write_local("/2.txt", b"two");

        let diffs = scenario.operation.run(scenario.request()).await.unwrap();
        assert_eq!(diffs, vec![FileDiff::new("/2.txt", DiffOp::Upload)]);
    }

    #[tokio::test]
    async fn test_file_on_data_shards_blobbers_is_in_sync() {
        let scenario = Scenario::new();
        let one = compute_hash(b"one");
        scenario.memory.put_all(&scenario.refs[..2], "/1.txt", &one, 3);
        scenario
            .memory
            .put_all(&scenario.refs[2..], "/docs/b.txt", &compute_hash(b"bravo"), 5);
        scenario.write_local("/1.txt", b"one");
        scenario.write_local("/docs/b.txt", b"bravo");

        let mut snapshot = SnapshotCache::new();
        snapshot.insert(crate::SnapshotEntry {
            path: "/1.txt".to_string(),
            hash: one,
            size: 3,
            kind: crate::EntryKind::File,
        });
        snapshot.save(&scenario.request().snapshot_path).await.unwrap();

        let diffs = scenario.operation.run(scenario.request()).await.unwrap();
        assert!(diffs.is_empty(), "unexpected diffs: {:?}", diffs);
    }

    #[tokio::test]
    async fn test_local_modification_is_update() {
        let scenario = Scenario::new();
        let original = compute_hash(b"three");
        scenario.memory.put_all(&scenario.refs, "/3.txt", &original, 5);
        scenario.write_local("/3.txt", b"three, edited");

        let mut snapshot = SnapshotCache::new();
        snapshot.insert(crate::SnapshotEntry {
            path: "/3.txt".to_string(),
            hash: original,
            size: 5,
            kind: crate::EntryKind::File,
        });
        snapshot.save(&scenario.request().snapshot_path).await.unwrap();

        let diffs = scenario.operation.run(scenario.request()).await.unwrap();
        assert_eq!(diffs, vec![FileDiff::new("/3.txt", DiffOp::Update)]);
    }

    #[tokio::test]
    async fn test_filters_and_excludes_hide_paths() {
        let scenario = Scenario::new();
        scenario.write_local("/.DS_Store", b"junk");
        scenario.write_local("/.git/HEAD", b"ref");
        scenario.write_local("/keep.txt", b"keep");
        scenario
            .memory
            .put_all(&scenario.refs, "/archive/old.txt", &compute_hash(b"old"), 3);

        let mut request = scenario.request();
        request.remote_excludes = vec!["/archive".to_string()];
        let diffs = scenario.operation.run(request).await.unwrap();
        assert_eq!(diffs, vec![FileDiff::new("/keep.txt", DiffOp::Upload)]);
    }

    #[tokio::test]
    async fn test_fatal_inputs_fail_before_listing() {
        let scenario = Scenario::new();

        let mut request = scenario.request();
        request.local_root = scenario.dir.path().join("some_failed_path");
        let error = scenario.operation.run(request).await.unwrap_err();
        assert!(matches!(error, SyncError::Path(_)));

        let mut request = scenario.request();
        request.snapshot_path = scenario.dir.path().to_path_buf();
        let error = scenario.operation.run(request).await.unwrap_err();
        assert!(matches!(error, SyncError::CacheFormat(_)));

        assert_eq!(*scenario.memory.list_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_root_without_quorum_fails() {
        let scenario = Scenario::new();
        for blobber in &scenario.refs[..3] {
            scenario.memory.set_offline(&blobber.id);
        }
        let error = scenario.operation.run(scenario.request()).await.unwrap_err();
        assert!(matches!(error, SyncError::Consensus { .. }));
    }
}
