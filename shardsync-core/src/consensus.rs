//! Threshold agreement over per-blobber answers.
//!
//! Every blobber is asked the same question. A value is accepted only when
//! at least `threshold` blobbers (the allocation's data shard count) gave it
//! verbatim and no other value has as many votes. Blobbers that fail to
//! answer cast no vote. Blobbers that list a directory without a child vote
//! "absent" for it; absences only drop a child that no present value carries
//! to the threshold. Anything else leaves the path unresolved, which callers
//! report instead of guessing.

use crate::paths::{is_under, normalize_remote_path};
use crate::{BlobberClient, BlobberRef, EntryKind, ListResult, Result, SyncError};
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Vote {
    Absent,
    Directory,
    File { hash: String, size: u64 },
}

impl Vote {
    fn of(kind: EntryKind, hash: &str, size: u64) -> Self {
        match kind {
            EntryKind::Directory => Self::Directory,
            EntryKind::File => Self::File {
                hash: hash.to_string(),
                size,
            },
        }
    }
}

/// Vote counts kept in first-seen order.
#[derive(Debug)]
struct Tally<K> {
    entries: Vec<(K, usize)>,
}

impl<K: PartialEq + Debug> Tally<K> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn add(&mut self, key: K) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((key, 1)),
        }
    }

    fn agreed(&self, threshold: usize) -> Option<&K> {
        let max = self.entries.iter().map(|(_, count)| *count).max()?;
        if max < threshold.max(1) {
            return None;
        }

        let mut top = self.entries.iter().filter(|(_, count)| *count == max);
        let winner = top.next()?;
        if top.next().is_some() {
            return None;
        }
        Some(&winner.0)
    }

    fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|(key, count)| format!("{:?}x{}", key, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Tally<Vote> {
    /// Agreement on a directory child. Up to `parity_shards` blobbers may
    /// lack a copy without outvoting the blobbers that hold it.
    fn agreed_child(&self, threshold: usize) -> Option<Vote> {
        let mut present = Tally::new();
        let mut absent = 0;
        for (vote, count) in &self.entries {
            match vote {
                Vote::Absent => absent += count,
                _ => present.entries.push((vote, *count)),
            }
        }

        let threshold = threshold.max(1);
        match present.agreed(threshold) {
            Some(vote) => Some((*vote).clone()),
            None if present.entries.iter().any(|(_, count)| *count >= threshold) => None,
            None if absent >= threshold => Some(Vote::Absent),
            None => None,
        }
    }
}

/// Agreed listing of one directory.
#[derive(Debug, Clone)]
pub struct DirConsensus {
    pub listing: ListResult,
    /// Children the blobbers could not agree on. An entry is a directory
    /// when any blobber reported one at that path, otherwise a file
    /// without hash.
    pub unresolved: Vec<ListResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub hash: String,
    pub size: u64,
}

/// Consensus view of a whole remote subtree.
#[derive(Debug, Clone, Default)]
pub struct RemoteTree {
    pub files: BTreeMap<String, RemoteFile>,
    pub directories: BTreeSet<String>,
    /// Paths (files or whole directories) without agreement.
    pub unresolved: BTreeSet<String>,
}

impl RemoteTree {
    pub fn exclude(&mut self, excludes: &[String]) {
        if excludes.is_empty() {
            return;
        }
        let excluded = |path: &str| excludes.iter().any(|prefix| is_under(path, prefix));
        self.files.retain(|path, _| !excluded(path));
        self.directories.retain(|path| !excluded(path));
        self.unresolved.retain(|path| !excluded(path));
    }

    /// True when the path or one of its ancestors has no agreed state.
    pub fn is_unresolved(&self, path: &str) -> bool {
        self.unresolved.iter().any(|prefix| is_under(path, prefix))
    }
}

/// Result of checking one file's redundancy.
#[derive(Debug, Clone)]
pub struct RepairCheck {
    /// Per blobber, in allocation order: holds the agreed copy.
    pub found: Vec<bool>,
    pub required: bool,
    pub file: ListResult,
}

impl RepairCheck {
    pub fn holders(&self) -> usize {
        self.found.iter().filter(|found| **found).count()
    }
}

#[derive(Clone)]
pub struct ConsensusReader {
    client: Arc<dyn BlobberClient>,
    blobbers: Vec<BlobberRef>,
    threshold: usize,
}

impl ConsensusReader {
    pub fn new(client: Arc<dyn BlobberClient>, blobbers: Vec<BlobberRef>, threshold: usize) -> Self {
        Self {
            client,
            blobbers,
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub async fn list_dir(&self, path: &str) -> Result<DirConsensus> {
        let path = normalize_remote_path(path)?;

        let responses = join_all(self.blobbers.iter().map(|blobber| {
            let path = path.as_str();
            async move { (blobber, self.client.list_dir(blobber, path).await) }
        }))
        .await;

        let mut listings = Vec::with_capacity(responses.len());
        for (blobber, response) in responses {
            match response {
                Ok(listing) => listings.push(listing),
                Err(error) => {
                    tracing::warn!(
                        "list_dir failed. blobber={} path={} error={}",
                        blobber.id,
                        path,
                        error
                    );
                }
            }
        }

        if listings.len() < self.threshold {
            return Err(SyncError::consensus(
                &path,
                format!(
                    "only {} of {} blobbers answered, need {}",
                    listings.len(),
                    self.blobbers.len(),
                    self.threshold
                ),
            ));
        }

        let mut node_tally = Tally::new();
        for listing in &listings {
            node_tally.add(Vote::of(listing.kind, &listing.hash, listing.size));
        }
        match node_tally.agreed(self.threshold).cloned() {
            Some(Vote::Directory) => {}
            Some(Vote::File { hash, size }) => {
                return Ok(DirConsensus {
                    listing: ListResult::file(&path, hash, size),
                    unresolved: Vec::new(),
                });
            }
            _ => {
                return Err(SyncError::consensus(
                    &path,
                    format!("no agreed entry type: {}", node_tally.describe()),
                ));
            }
        }

        let mut order: Vec<String> = Vec::new();
        let mut views: Vec<HashMap<String, Vote>> = Vec::with_capacity(listings.len());
        for listing in &listings {
            let mut view = HashMap::with_capacity(listing.children.len());
            for child in &listing.children {
                let Some(child_path) = child_path(&path, child) else {
                    tracing::warn!(
                        "skipping malformed child entry. dir={} path={} name={}",
                        path,
                        child.path,
                        child.name
                    );
                    continue;
                };
                if !view.contains_key(&child_path) && !order.contains(&child_path) {
                    order.push(child_path.clone());
                }
                view.insert(child_path, Vote::of(child.kind, &child.hash, child.size));
            }
            views.push(view);
        }

        let mut children = Vec::with_capacity(order.len());
        let mut unresolved = Vec::new();
        for child_path in order {
            let mut tally = Tally::new();
            for view in &views {
                tally.add(view.get(&child_path).cloned().unwrap_or(Vote::Absent));
            }

            match tally.agreed_child(self.threshold) {
                Some(Vote::Directory) => children.push(ListResult::directory(&child_path)),
                Some(Vote::File { hash, size }) => {
                    children.push(ListResult::file(&child_path, hash, size))
                }
                Some(Vote::Absent) => {
                    tracing::debug!("dropping path held by a minority of blobbers: {}", child_path);
                }
                None => {
                    tracing::warn!(
                        "no consensus for path={} votes=[{}]",
                        child_path,
                        tally.describe()
                    );
                    let any_directory = views
                        .iter()
                        .any(|view| view.get(&child_path) == Some(&Vote::Directory));
                    unresolved.push(if any_directory {
                        ListResult::directory(&child_path)
                    } else {
                        ListResult::file(&child_path, String::new(), 0)
                    });
                }
            }
        }

        Ok(DirConsensus {
            listing: ListResult::directory(&path).with_children(children),
            unresolved,
        })
    }

    /// Walks the subtree below `root` with an explicit stack. A root
    /// without consensus fails the walk; deeper directories without
    /// consensus are recorded as unresolved.
    pub async fn remote_tree(&self, root: &str) -> Result<RemoteTree> {
        let root = normalize_remote_path(root)?;
        let mut tree = RemoteTree::default();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let DirConsensus {
                listing,
                unresolved,
            } = match self.list_dir(&dir).await {
                Ok(consensus) => consensus,
                Err(error @ SyncError::Consensus { .. }) if dir == root => return Err(error),
                Err(SyncError::Consensus { path, detail }) => {
                    tracing::warn!("subtree without consensus. path={} detail={}", path, detail);
                    tree.unresolved.insert(path);
                    continue;
                }
                Err(error) => return Err(error),
            };

            if !listing.is_dir() {
                tree.files.insert(
                    listing.path.clone(),
                    RemoteFile {
                        hash: listing.hash,
                        size: listing.size,
                    },
                );
                continue;
            }

            if listing.path != "/" {
                tree.directories.insert(listing.path.clone());
            }
            tree.unresolved
                .extend(unresolved.into_iter().map(|entry| entry.path));

            for child in listing.children.into_iter().rev() {
                match child.kind {
                    EntryKind::Directory => pending.push(child.path),
                    EntryKind::File => {
                        tree.files.insert(
                            child.path,
                            RemoteFile {
                                hash: child.hash,
                                size: child.size,
                            },
                        );
                    }
                }
            }
        }

        Ok(tree)
    }

    /// Fails unless at least `threshold` blobbers hold one identical copy.
    pub async fn repair_required(&self, path: &str) -> Result<RepairCheck> {
        let path = normalize_remote_path(path)?;

        let responses = join_all(self.blobbers.iter().map(|blobber| {
            let path = path.as_str();
            async move { (blobber, self.client.file_meta(blobber, path).await) }
        }))
        .await;

        let mut votes: Vec<Option<Vote>> = Vec::with_capacity(responses.len());
        let mut tally = Tally::new();
        for (blobber, response) in responses {
            let vote = match response {
                Ok(Some(meta)) => Some(Vote::of(meta.kind, &meta.hash, meta.size)),
                Ok(None) => Some(Vote::Absent),
                Err(error) => {
                    tracing::warn!(
                        "file_meta failed. blobber={} path={} error={}",
                        blobber.id,
                        path,
                        error
                    );
                    None
                }
            };
            // missing copies are what repair restores, so they do not compete
            if let Some(vote @ Vote::File { .. }) = &vote {
                tally.add(vote.clone());
            }
            votes.push(vote);
        }

        let agreed = match tally.agreed(self.threshold) {
            Some(vote) => vote.clone(),
            None => {
                return Err(SyncError::consensus(
                    &path,
                    format!("no agreed file copy: [{}]", tally.describe()),
                ));
            }
        };

        let found: Vec<bool> = votes
            .iter()
            .map(|vote| vote.as_ref() == Some(&agreed))
            .collect();
        let required = found.iter().any(|found| !found);

        let Vote::File { hash, size } = agreed else {
            return Err(SyncError::Internal("agreed vote is not a file".to_string()));
        };

        Ok(RepairCheck {
            found,
            required,
            file: ListResult::file(&path, hash, size),
        })
    }
}

fn child_path(parent: &str, child: &ListResult) -> Option<String> {
    let raw = if child.path.is_empty() {
        if child.name.is_empty() {
            return None;
        }
        format!("{}/{}", parent.trim_end_matches('/'), child.name)
    } else {
        child.path.clone()
    };

    let normalized = normalize_remote_path(&raw).ok()?;
    if normalized == "/" || normalized == parent {
        return None;
    }
    Some(normalized)
}


#[cfg(test)]
mod tests {
    use super::testing::{MemoryBlobbers, blobbers};
    use super::*;

    fn reader(memory: Arc<MemoryBlobbers>, refs: &[BlobberRef]) -> ConsensusReader {
        ConsensusReader::new(memory, refs.to_vec(), 2)
    }

    #[test]
    fn test_tally_requires_unique_winner() {
        let mut tally = Tally::new();
        for key in ["a", "b", "a", "b"] {
            tally.add(key);
        }
        assert_eq!(tally.agreed(2), None);

        tally.add("a");
        assert_eq!(tally.agreed(2), Some(&"a"));
        assert_eq!(tally.agreed(4), None);
    }

    #[tokio::test]
    async fn test_list_dir_accepts_threshold_agreement() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs, "/1.txt", "h1", 8);
        memory.put(&refs[0].id, "/2.txt", "h2", 8);
        memory.put(&refs[1].id, "/2.txt", "h2", 8);
        memory.put(&refs[2].id, "/2.txt", "other", 8);

        let consensus = reader(memory, &refs).list_dir("/").await.unwrap();
        let paths: Vec<_> = consensus
            .listing
            .children
            .iter()
            .map(|child| child.path.as_str())
            .collect();
        assert_eq!(paths, vec!["/1.txt", "/2.txt"]);
        assert_eq!(consensus.listing.children[1].hash, "h2");
        assert!(consensus.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_list_dir_reports_divergent_paths() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        for (blobber, hash) in refs.iter().zip(["a", "b", "c", "d"]) {
            memory.put(&blobber.id, "/x.txt", hash, 1);
        }

        let consensus = reader(memory, &refs).list_dir("/").await.unwrap();
        assert!(consensus.listing.children.is_empty());
        assert_eq!(
            consensus.unresolved,
            vec![ListResult::file("/x.txt", String::new(), 0)]
        );
    }

    #[tokio::test]
    async fn test_list_dir_keeps_entries_held_by_data_shards() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs[..2], "/1.txt", "h1", 8);
        memory.put_all(&refs[2..], "/docs/b.txt", "hb", 5);
        memory.put(&refs[3].id, "/stray.txt", "hs", 1);

        let consensus = reader(memory, &refs).list_dir("/").await.unwrap();
        assert_eq!(
            consensus.listing.children,
            vec![
                ListResult::file("/1.txt", "h1", 8),
                ListResult::directory("/docs"),
            ]
        );
        assert!(consensus.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_list_dir_split_between_two_copies_is_unresolved() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs[..2], "/x.txt", "a", 1);
        memory.put_all(&refs[2..], "/x.txt", "b", 1);

        let consensus = reader(memory, &refs).list_dir("/").await.unwrap();
        assert!(consensus.listing.children.is_empty());
        assert_eq!(consensus.unresolved.len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_entry_is_a_directory_when_any_blobber_lists_one() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs[..2], "/mixed/inner.txt", "hi", 2);
        memory.put_all(&refs[2..], "/mixed", "hm", 3);

        let consensus = reader(memory, &refs).list_dir("/").await.unwrap();
        assert_eq!(consensus.unresolved, vec![ListResult::directory("/mixed")]);
    }

    #[tokio::test]
    async fn test_list_dir_fails_below_threshold_responses() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs, "/1.txt", "h1", 8);
        memory.set_offline(&refs[0].id);
        memory.set_offline(&refs[1].id);
        memory.set_offline(&refs[2].id);

        let error = reader(memory, &refs).list_dir("/").await.unwrap_err();
        assert!(matches!(error, SyncError::Consensus { .. }));
    }

    #[tokio::test]
    async fn test_remote_tree_walks_nested_directories() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs, "/a/b/c.txt", "hc", 3);
        memory.put_all(&refs, "/root.txt", "hr", 1);

        let tree = reader(memory, &refs).remote_tree("/").await.unwrap();
        assert_eq!(tree.files.len(), 2);
        assert!(tree.files.contains_key("/a/b/c.txt"));
        assert!(tree.directories.contains("/a"));
        assert!(tree.directories.contains("/a/b"));
        assert!(tree.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_repair_required_marks_missing_holders() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put(&refs[0].id, "/f.txt", "h", 4);
        memory.put(&refs[1].id, "/f.txt", "h", 4);
        memory.put(&refs[2].id, "/f.txt", "h", 4);

        let check = reader(memory.clone(), &refs)
            .repair_required("/f.txt")
            .await
            .unwrap();
        assert!(check.required);
        assert_eq!(check.found, vec![true, true, true, false]);
        assert_eq!(check.holders(), 3);

        memory.put(&refs[3].id, "/f.txt", "h", 4);
        let check = reader(memory, &refs).repair_required("/f.txt").await.unwrap();
        assert!(!check.required);
    }

    #[tokio::test]
    async fn test_repair_required_with_half_the_blobbers_missing() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put_all(&refs[..2], "/f.txt", "h", 4);

        let check = reader(memory, &refs).repair_required("/f.txt").await.unwrap();
        assert!(check.required);
        assert_eq!(check.found, vec![true, true, false, false]);
    }

    #[tokio::test]
    async fn test_repair_required_without_agreed_copy_fails() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.put(&refs[0].id, "/f.txt", "h", 4);

        let error = reader(memory, &refs)
            .repair_required("/f.txt")
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Consensus { .. }));
    }

    #[test]
    fn test_remote_tree_exclude_and_unresolved() {
        let mut tree = RemoteTree::default();
        tree.files.insert(
            "/3.txt".to_string(),
            RemoteFile {
                hash: "h".to_string(),
                size: 1,
            },
        );
        tree.unresolved.insert("/bad".to_string());
        assert!(tree.is_unresolved("/bad/inner.txt"));

        tree.exclude(&["/3.txt".to_string(), "/bad".to_string()]);
        assert!(tree.files.is_empty());
        assert!(!tree.is_unresolved("/bad/inner.txt"));
    }
}
