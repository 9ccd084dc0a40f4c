//!   Repository wrapper: branches, staging and path resolution.
//!
//!  This is the central component of the storage layer. It owns the
//!  `git2::Repository`, the staged index of the current branch and the
//!  per-branch cache of indexes that were set aside by `switch_branch`.
//!
//! The store never checks files out: HEAD, refs and the on-disk index are
//! kept consistent, the working directory is left alone.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::storage::commit::{self, CommitBuilder, CommitInfo, CommitMessage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::index::{IndexMode, StagedIndex};
use crate::storage::refs::RefManager;
use crate::storage::tree::{self, ResolvedObject};
use crate::storage::types::{BranchName, CommitId, EntryKind, GitSignature, TagName, TreeId};

/// What a merge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// a merge commit was created on the target
    Merged(CommitId),
    /// the source was already contained in the target
    UpToDate,
}

impl MergeOutcome {
    pub fn commit_id(&self) -> Option<CommitId> {
        match self {
            MergeOutcome::Merged(id) => Some(*id),
            MergeOutcome::UpToDate => None,
        }
    }
}

/// The repository wrapper.
pub struct Repository {
    repo: git2::Repository,
    path: PathBuf,
    default_branch: BranchName,
    current: BranchName,
    staging: Option<StagedIndex>,
    /// indexes set aside by `switch_branch`, keyed by the branch they belong to
    saved_stages: HashMap<BranchName, StagedIndex>,
}

impl Repository {
    /// Check whether `path` holds a repository.
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().join(".git").exists()
    }

    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>, default_branch: BranchName) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = git2::Repository::open(path)
            .map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        let current = RefManager::head_branch(&repo)?.unwrap_or_else(|| default_branch.clone());

        Ok(Self {
            repo,
            path: path.to_path_buf(),
            default_branch,
            current,
            staging: None,
            saved_stages: HashMap::new(),
        })
    }

    /// Initialize a new repository with HEAD on the (unborn) default branch.
    pub fn init(path: impl AsRef<Path>, default_branch: BranchName) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = git2::Repository::init(path)?;
        RefManager::set_head(&repo, &default_branch)?;
        info!(path = %path.display(), branch = %default_branch, "initialized repository");

        Ok(Self {
            repo,
            path: path.to_path_buf(),
            current: default_branch.clone(),
            default_branch,
            staging: None,
            saved_stages: HashMap::new(),
        })
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// raw git2 handle (config access, tests)
    pub(crate) fn git(&self) -> &git2::Repository {
        &self.repo
    }

    pub fn default_branch(&self) -> &BranchName {
        &self.default_branch
    }

    pub fn current_branch(&self) -> &BranchName {
        &self.current
    }

    // ==================== Commits ====================

    /// Tip of the current branch, `None` before the first commit.
    pub fn tip(&self) -> StorageResult<Option<CommitId>> {
        RefManager::branch_tip(&self.repo, &self.current)
    }

    /// Tip of any branch.
    pub fn head_commit(&self, branch: &BranchName) -> StorageResult<Option<CommitId>> {
        RefManager::branch_tip(&self.repo, branch)
    }

    pub fn get_commit(&self, id: CommitId) -> StorageResult<CommitInfo> {
        commit::get_commit(&self.repo, id)
    }

    /// Most recent commits on the current branch, newest first.
    pub fn history(&self, limit: usize) -> StorageResult<Vec<CommitInfo>> {
        match self.tip()? {
            Some(tip) => commit::history(&self.repo, tip)?.take(limit).collect(),
            None => Ok(Vec::new()),
        }
    }

    fn tip_tree(&self) -> StorageResult<Option<TreeId>> {
        self.tip()?
            .map(|id| commit::tree_of(&self.repo, id))
            .transpose()
    }

    /// Reset the on-disk index to the tip of the current branch.
    fn reset_disk_index(&self) -> StorageResult<()> {
        match self.tip_tree()? {
            Some(tree) => StagedIndex::publish(&self.repo, tree),
            None => {
                let mut disk = self.repo.index()?;
                disk.clear()?;
                disk.write()?;
                Ok(())
            }
        }
    }

    // ==================== Staging ====================

    /// The active staged index, created (disk-synced) on first use.
    pub fn staging(&mut self) -> StorageResult<&mut StagedIndex> {
        if self.staging.is_none() {
            let parent = self.tip()?;
            self.staging = Some(StagedIndex::read(&self.repo, parent, IndexMode::Synced)?);
        }
        self.staging
            .as_mut()
            .ok_or_else(|| StorageError::Internal("staging index vanished".to_string()))
    }

    pub fn is_staging(&self) -> bool {
        self.staging.is_some()
    }

    pub fn staging_ref(&self) -> Option<&StagedIndex> {
        self.staging.as_ref()
    }

    /// Replace the active index, returning the previous one.
    pub fn set_staging(&mut self, staging: Option<StagedIndex>) -> Option<StagedIndex> {
        std::mem::replace(&mut self.staging, staging)
    }

    pub fn take_staging(&mut self) -> Option<StagedIndex> {
        self.staging.take()
    }

    /// Put back a previously captured index and make the disk index match it.
    pub fn restore_staging(&mut self, staging: Option<StagedIndex>) -> StorageResult<()> {
        self.staging = staging;
        match &self.staging {
            Some(stage) if stage.mode() == IndexMode::Synced => {
                stage.force_sync(&self.repo)?;
            }
            Some(_) => {}
            None => self.reset_disk_index()?,
        }
        Ok(())
    }

    pub fn add(&mut self, path: &str, data: impl Into<Vec<u8>>) -> StorageResult<()> {
        self.staging()?.add(path, data)
    }

    pub fn delete(&mut self, path: &str) -> StorageResult<()> {
        self.staging()?.delete(path)
    }

    /// Build the active index (publishes a synced index to disk).
    pub fn build_staging(&self) -> StorageResult<()> {
        if let Some(stage) = &self.staging {
            stage.build(&self.repo)?;
        }
        Ok(())
    }

    /// Commit the active index onto the current branch. The index stays active.
    pub fn commit_staging(&mut self, message: &str, author: &GitSignature) -> StorageResult<Option<CommitId>> {
        let branch = self.current.clone();
        match self.staging.as_mut() {
            Some(stage) => stage.commit(&self.repo, &branch, message, author),
            None => Ok(None),
        }
    }

    /// Drop the active index and every cached one.
    pub fn purge_stages(&mut self) -> StorageResult<()> {
        self.saved_stages.clear();
        self.staging = None;
        self.reset_disk_index()
    }

    // ==================== Batch ====================

    /// Flush the active index to disk and install an in-memory copy of it.
    /// Returns the index that was active, for `end_batch`.
    pub fn begin_batch(&mut self) -> StorageResult<Option<StagedIndex>> {
        let previous = self.staging.take();
        let mem = match &previous {
            Some(stage) => {
                stage.force_sync(&self.repo)?;
                let mut mem = stage.clone();
                mem.set_mode(IndexMode::InMemory);
                mem
            }
            None => StagedIndex::read(&self.repo, self.tip()?, IndexMode::InMemory)?,
        };
        self.staging = Some(mem);
        debug!(branch = %self.current, "entered batch mode");
        Ok(previous)
    }

    /// Leave batch mode.
    ///
    /// On success the in-memory index is published once and stays active as
    /// a synced index (it already contains everything the previous one held).
    /// On failure it is dropped and `previous` comes back unchanged.
    pub fn end_batch(&mut self, previous: Option<StagedIndex>, success: bool) -> StorageResult<()> {
        let mem = self.staging.take();
        if !success {
            debug!(branch = %self.current, "abandoned batch");
            return self.restore_staging(previous);
        }

        if let Some(mut mem) = mem {
            mem.force_sync(&self.repo)?;
            if mem.is_dirty() || previous.is_some() {
                mem.set_mode(IndexMode::Synced);
                self.staging = Some(mem);
            }
        }
        debug!(branch = %self.current, "left batch mode");
        Ok(())
    }

    // ==================== Branches ====================

    /// Create (or move) a branch at `at`, defaulting to the tip of the
    /// default branch. Returns the sanitized name.
    pub fn create_branch(&mut self, name: &str, at: Option<CommitId>) -> StorageResult<BranchName> {
        let branch = BranchName::new(name)?;
        let target = match at {
            Some(id) => id,
            None => RefManager::branch_tip(&self.repo, &self.default_branch)?
                .ok_or(StorageError::EmptyRepository)?,
        };
        RefManager::create_branch(&self.repo, &branch, target, true)?;
        info!(branch = %branch, at = %target.short(), "created branch");
        Ok(branch)
    }

    pub fn branches(&self) -> StorageResult<Vec<BranchName>> {
        RefManager::list_branches(&self.repo)
    }

    pub fn delete_branch(&mut self, name: &str) -> StorageResult<()> {
        let branch = BranchName::new(name)?;
        self.saved_stages.remove(&branch);
        RefManager::delete_branch(&self.repo, &branch)
    }

    /// Make `name` the current branch.
    ///
    /// The current index is set aside under the old branch and the target's
    /// cached index, if any, comes back. A missing branch is created from the
    /// default branch tip.
    pub fn switch_branch(&mut self, name: &str) -> StorageResult<BranchName> {
        let branch = BranchName::new(name)?;
        if branch == self.current {
            return Ok(branch);
        }
        if !RefManager::branch_exists(&self.repo, &branch) {
            self.create_branch(branch.as_str(), None)?;
        }

        if let Some(stage) = self.staging.take() {
            self.saved_stages.insert(self.current.clone(), stage);
        }
        RefManager::set_head(&self.repo, &branch)?;
        self.current = branch.clone();

        let mut restored = self.saved_stages.remove(&branch);
        if let (Some(stage), Some(tip)) = (restored.as_mut(), self.tip()?) {
            if stage.parent() != Some(tip) {
                stage.rebase(&self.repo, tip, commit::tree_of(&self.repo, tip)?)?;
            }
        }
        self.restore_staging(restored)?;

        debug!(branch = %branch, "switched branch");
        Ok(branch)
    }

    /// Merge `name` into `into` (default branch if omitted) with an explicit
    /// merge commit. Leaves `into` as the current branch.
    ///
    /// A conflicting merge returns `MergeConflict` and leaves the target ref
    /// untouched.
    pub fn merge_branch(
        &mut self,
        name: &str,
        into: Option<&str>,
        author: &GitSignature,
    ) -> StorageResult<MergeOutcome> {
        let source = BranchName::new(name)?;
        let target = match into {
            Some(into) => BranchName::new(into)?,
            None => self.default_branch.clone(),
        };
        self.switch_branch(target.as_str())?;
        if self.staging.as_ref().is_some_and(StagedIndex::is_dirty) {
            self.commit_staging(CommitMessage::DEFAULT, author)?;
        }

        let theirs = RefManager::resolve_branch(&self.repo, &source)?;
        let ours = self.tip()?.ok_or(StorageError::EmptyRepository)?;
        if commit::find_merge_base(&self.repo, ours, theirs)? == Some(theirs) {
            debug!(source = %source, target = %target, "merge is up to date");
            return Ok(MergeOutcome::UpToDate);
        }

        let our_commit = self.repo.find_commit(ours.raw())?;
        let their_commit = self.repo.find_commit(theirs.raw())?;
        let mut merged = self.repo.merge_commits(&our_commit, &their_commit, None)?;

        if merged.has_conflicts() {
            let conflicting_paths: Vec<PathBuf> = merged
                .conflicts()?
                .filter_map(Result::ok)
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .map(|entry| PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned()))
                .collect();
            warn!(source = %source, target = %target, paths = ?conflicting_paths, "merge conflict");
            return Err(StorageError::MergeConflict {
                branch: source.to_string(),
                conflicting_paths,
            });
        }

        let tree = TreeId::new(merged.write_tree_to(&self.repo)?);
        let id = CommitBuilder::new(&self.repo)
            .tree(tree)
            .parents(vec![ours, theirs])
            .message(CommitMessage::merge(&source, &target))
            .signature(author.clone())
            .commit()?;
        RefManager::set_branch_target(&self.repo, &target, id)?;

        match self.staging.as_mut() {
            Some(stage) => {
                stage.rebase(&self.repo, id, tree)?;
                stage.force_sync(&self.repo)?;
            }
            None => self.reset_disk_index()?,
        }

        info!(source = %source, target = %target, commit = %id.short(), "merged branch");
        Ok(MergeOutcome::Merged(id))
    }

    // ==================== Tags ====================

    /// Tag the tip of the current branch. The tag name is the sanitized message.
    pub fn mark(&self, message: &str) -> StorageResult<TagName> {
        let tag = TagName::new(message)?;
        let tip = self.tip()?.ok_or(StorageError::EmptyRepository)?;
        RefManager::create_tag(&self.repo, &tag, tip)?;
        info!(tag = %tag, commit = %tip.short(), "marked commit");
        Ok(tag)
    }

    pub fn tags(&self) -> StorageResult<Vec<TagName>> {
        RefManager::list_tags(&self.repo)
    }

    /// Commit a mark points at. `message` is sanitized the same way `mark` does.
    pub fn tag_commit(&self, message: &str) -> StorageResult<CommitId> {
        RefManager::resolve_tag(&self.repo, &TagName::new(message)?)
    }

    // ==================== Paths ====================

    /// Resolve a path, consulting the active index before the branch tip.
    pub fn resolve(&self, path: &str) -> StorageResult<Option<ResolvedObject>> {
        if let Some(stage) = &self.staging {
            return stage.resolve(&self.repo, path);
        }
        let Some(parts) = tree::read_components(path) else {
            return Ok(None);
        };
        match self.tip_tree()? {
            Some(tree) => {
                let root = self.repo.find_tree(tree.raw())?;
                tree::resolve_in(&self.repo, &root, &parts)
            }
            None if parts.is_empty() => Ok(Some(ResolvedObject::Tree(BTreeMap::new()))),
            None => Ok(None),
        }
    }

    pub fn include(&self, path: &str) -> StorageResult<bool> {
        Ok(self.resolve(path)?.is_some())
    }

    /// blob content at `path`; `None` for trees and missing paths
    pub fn object_data(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.resolve(path)?.and_then(ResolvedObject::into_blob))
    }

    /// direct children of the tree at `path`, sorted by name
    pub fn list(&self, path: &str) -> StorageResult<BTreeMap<String, EntryKind>> {
        Ok(self
            .resolve(path)?
            .map(ResolvedObject::into_listing)
            .unwrap_or_default())
    }

    pub fn list_blobs(&self, path: &str) -> StorageResult<Vec<String>> {
        self.list_kind(path, EntryKind::Blob)
    }

    pub fn list_trees(&self, path: &str) -> StorageResult<Vec<String>> {
        self.list_kind(path, EntryKind::Tree)
    }

    fn list_kind(&self, path: &str, kind: EntryKind) -> StorageResult<Vec<String>> {
        Ok(self
            .list(path)?
            .into_iter()
            .filter(|(_, k)| *k == kind)
            .map(|(name, _)| name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn author() -> GitSignature {
        GitSignature::new("Tester", "tester@example.com")
    }

    /// repository with one commit holding a small tree
    fn setup() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(dir.path(), BranchName::master()).unwrap();
        repo.add("class a/instance a/data", "1").unwrap();
        repo.add("class a/instance b/data", "2").unwrap();
        repo.add("class b/instance a/data", "3").unwrap();
        repo.add("class c/instance a/x", "4").unwrap();
        repo.add("class c/instance a/y", "5").unwrap();
        repo.add("class c/instance a/sub/z", "6").unwrap();
        repo.commit_staging("setup", &author()).unwrap();
        repo.set_staging(None);
        (dir, repo)
    }

    #[test]
    fn test_list_and_resolve() {
        let (_dir, repo) = setup();

        assert!(repo.include("class a").unwrap());
        assert!(repo.include("class a/instance a/data").unwrap());
        assert_eq!(repo.object_data("class a").unwrap(), None);
        assert_eq!(repo.object_data("class a/instance b/data").unwrap(), Some(b"2".to_vec()));

        let root: Vec<_> = repo.list("").unwrap().into_keys().collect();
        assert_eq!(root, vec!["class a", "class b", "class c"]);
        let instances: Vec<_> = repo.list("class a").unwrap().into_keys().collect();
        assert_eq!(instances, vec!["instance a", "instance b"]);

        assert!(repo.list_blobs("").unwrap().is_empty());
        assert_eq!(repo.list_trees("").unwrap().len(), 3);
        assert_eq!(repo.list_blobs("class c/instance a").unwrap(), vec!["x", "y"]);
        assert_eq!(repo.list_trees("class c/instance a").unwrap(), vec!["sub"]);
    }

    #[test]
    fn test_resolve_consults_staging_first() {
        let (_dir, mut repo) = setup();
        repo.add("class d/new", "staged").unwrap();
        repo.delete("class a/instance a").unwrap();

        assert_eq!(repo.object_data("class d/new").unwrap(), Some(b"staged".to_vec()));
        assert!(!repo.include("class a/instance a/data").unwrap());
        assert_eq!(repo.list("").unwrap().len(), 4);

        // nothing committed yet
        repo.set_staging(None);
        assert!(!repo.include("class d/new").unwrap());
        assert!(repo.include("class a/instance a/data").unwrap());
    }

    #[test]
    fn test_branch_and_tag() {
        let (dir, mut repo) = setup();
        assert!(repo.tags().unwrap().is_empty());

        let tag = repo.mark("1 2 3 4 5 6 7 8 9 0 ").unwrap();
        assert_eq!(tag.as_str(), "1_2_3_4_5_6_7_8_9_0_");
        repo.mark("the tag is").unwrap();
        assert_eq!(repo.tags().unwrap().len(), 2);
        assert_eq!(Some(repo.tag_commit("the tag is").unwrap()), repo.tip().unwrap());
        assert!(repo.tag_commit("never marked").unwrap_err().is_not_found());

        assert_eq!(repo.current_branch(), &BranchName::master());
        assert_eq!(repo.branches().unwrap().len(), 1);
        let branch = repo.create_branch("v01", None).unwrap();
        assert_eq!(repo.branches().unwrap().len(), 2);
        assert_eq!(repo.head_commit(&branch).unwrap(), repo.tip().unwrap());

        // switching keeps each branch's uncommitted index
        repo.switch_branch("v01").unwrap();
        assert_eq!(repo.current_branch().as_str(), "v01");
        repo.add("v01 only", "data").unwrap();
        let staged = repo.staging_ref().unwrap().clone();

        repo.switch_branch("master").unwrap();
        assert!(!repo.is_staging());
        assert!(!repo.include("v01 only").unwrap());

        repo.switch_branch("v01").unwrap();
        assert!(repo.is_staging());
        assert_eq!(repo.staging_ref().unwrap().base_tree(), staged.base_tree());
        assert_eq!(repo.object_data("v01 only").unwrap(), Some(b"data".to_vec()));

        // HEAD on disk follows the switch
        let reopened = Repository::open(dir.path(), BranchName::master()).unwrap();
        assert_eq!(reopened.current_branch().as_str(), "v01");
    }

    #[test]
    fn test_merge_creates_merge_commit() {
        let (_dir, mut repo) = setup();
        let before = repo.tip().unwrap().unwrap();

        repo.switch_branch("feature").unwrap();
        repo.add("feature/file", "data").unwrap();
        repo.commit_staging("feature work", &author()).unwrap();

        let outcome = repo.merge_branch("feature", None, &author()).unwrap();
        let merge = outcome.commit_id().unwrap();
        assert_eq!(repo.current_branch(), &BranchName::master());

        let info = repo.get_commit(merge).unwrap();
        assert!(info.is_merge());
        assert_eq!(info.first_parent(), Some(before));
        assert_eq!(repo.object_data("feature/file").unwrap(), Some(b"data".to_vec()));

        // merging again is a no-op
        assert_eq!(repo.merge_branch("feature", None, &author()).unwrap(), MergeOutcome::UpToDate);
    }

    #[test]
    fn test_conflicting_merge_leaves_target_alone() {
        let (_dir, mut repo) = setup();
        let base = repo.tip().unwrap();

        for (branch, value) in [("left", "L"), ("right", "R")] {
            repo.create_branch(branch, base).unwrap();
            repo.switch_branch(branch).unwrap();
            repo.add("class a/instance a/data", value).unwrap();
            repo.commit_staging(branch, &author()).unwrap();
            repo.set_staging(None);
        }

        repo.merge_branch("left", None, &author()).unwrap();
        let after_left = repo.tip().unwrap();

        let err = repo.merge_branch("right", None, &author()).unwrap_err();
        match err {
            StorageError::MergeConflict { branch, conflicting_paths } => {
                assert_eq!(branch, "right");
                assert_eq!(conflicting_paths, vec![PathBuf::from("class a/instance a/data")]);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(repo.tip().unwrap(), after_left);
        assert_eq!(repo.object_data("class a/instance a/data").unwrap(), Some(b"L".to_vec()));
    }

    #[test]
    fn test_batch_round_trip() {
        let (_dir, mut repo) = setup();
        repo.add("before", "1").unwrap();

        let previous = repo.begin_batch().unwrap();
        assert!(previous.is_some());
        assert_eq!(repo.staging_ref().unwrap().mode(), IndexMode::InMemory);
        repo.add("during", "2").unwrap();
        assert!(repo.include("before").unwrap());
        repo.end_batch(previous, true).unwrap();

        let stage = repo.staging_ref().unwrap();
        assert_eq!(stage.mode(), IndexMode::Synced);
        assert!(repo.include("before").unwrap());
        assert!(repo.include("during").unwrap());
        assert_eq!(repo.git().index().unwrap().len(), 8);
    }

    #[test]
    fn test_batch_keeps_staged_changes_dirty_through_merge() {
        let (_dir, mut repo) = setup();
        let base = repo.tip().unwrap();
        repo.create_branch("side", base).unwrap();
        repo.switch_branch("side").unwrap();
        repo.add("side/file", "s").unwrap();
        repo.commit_staging("side work", &author()).unwrap();
        repo.switch_branch("master").unwrap();

        repo.add("staged", "x").unwrap();
        let previous = repo.begin_batch().unwrap();
        repo.end_batch(previous, true).unwrap();
        assert!(repo.staging_ref().unwrap().is_dirty());

        let merge = repo.merge_branch("side", None, &author()).unwrap().commit_id().unwrap();
        assert_eq!(repo.object_data("staged").unwrap(), Some(b"x".to_vec()));
        assert_eq!(repo.object_data("side/file").unwrap(), Some(b"s".to_vec()));

        // the staged change went into the pre-merge commit
        let info = repo.get_commit(merge).unwrap();
        let pre_merge = info.first_parent().unwrap();
        assert_ne!(Some(pre_merge), base);
        repo.set_staging(None);
        assert!(repo.include("staged").unwrap());
    }

    #[test]
    fn test_failed_batch_restores_previous_index() {
        let (_dir, mut repo) = setup();
        repo.add("before", "1").unwrap();

        let previous = repo.begin_batch().unwrap();
        repo.add("during", "2").unwrap();
        repo.end_batch(previous, false).unwrap();

        assert!(repo.include("before").unwrap());
        assert!(!repo.include("during").unwrap());
    }
}
