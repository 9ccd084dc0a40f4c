//! The staged index: pending path mutations over a base tree.
//!
//! ```text
//!   add / delete ──► PendingTree ─┐
//!                                 ├─ write() ──► TreeId ──► commit()
//!   base tree (parent commit) ────┘
//! ```
//!
//! Two materializations exist. A `Synced` index mirrors its tree into the
//! repository's on-disk index whenever it is built, so `git status` and
//! friends see the staged state without a commit. An `InMemory` index skips
//! that step until `force_sync`; batch mode uses it to turn N staged
//! mutations into one disk write.

use std::collections::BTreeMap;

use git2::{Delta, Repository};
use tracing::debug;

use crate::storage::commit::{self, CommitBuilder};
use crate::storage::error::StorageResult;
use crate::storage::refs::RefManager;
use crate::storage::tree::{self, Overlay, PendingTree, ResolvedObject};
use crate::storage::types::{BranchName, CommitId, EntryKind, GitSignature, TreeId};

/// How an index publishes its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// mirror into the on-disk git index on every build
    Synced,
    /// stay in memory until `force_sync`
    InMemory,
}

#[derive(Debug, Clone)]
pub struct StagedIndex {
    mode: IndexMode,
    parent: Option<CommitId>,
    /// tree of `parent` (or the seed tree when there is no parent)
    origin: TreeId,
    base: TreeId,
    pending: PendingTree,
}

impl StagedIndex {
    /// Seed an index from the repository's on-disk index.
    ///
    /// An empty disk index on a repository with history falls back to the
    /// parent's tree.
    pub fn read(repo: &Repository, parent: Option<CommitId>, mode: IndexMode) -> StorageResult<Self> {
        let mut disk = repo.index()?;
        let origin = match parent {
            Some(id) => Some(commit::tree_of(repo, id)?),
            None => None,
        };
        let base = match origin {
            Some(tree) if disk.is_empty() => tree,
            _ => TreeId::new(disk.write_tree()?),
        };
        Ok(Self {
            mode,
            parent,
            origin: origin.unwrap_or(base),
            base,
            pending: PendingTree::new(),
        })
    }

    /// Seed an index from a known tree.
    pub fn from_tree(parent: Option<CommitId>, base: TreeId, mode: IndexMode) -> Self {
        Self {
            mode,
            parent,
            origin: base,
            base,
            pending: PendingTree::new(),
        }
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: IndexMode) {
        self.mode = mode;
    }

    /// commit the next `commit` will use as parent
    pub fn parent(&self) -> Option<CommitId> {
        self.parent
    }

    pub fn base_tree(&self) -> TreeId {
        self.base
    }

    /// True when the staged tree may differ from the parent's tree, either
    /// through pending mutations or a base seeded from the disk index.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty() || self.base != self.origin
    }

    // ==================== Mutations ====================

    /// Stage `data` at `path`. Invalid paths are rejected before anything is
    /// written.
    pub fn add(&mut self, path: &str, data: impl Into<Vec<u8>>) -> StorageResult<()> {
        let parts = tree::split_path(path)?;
        self.pending.set(&parts, data.into());
        Ok(())
    }

    /// Stage removal of `path`. Deleting a path that does not exist is a no-op.
    pub fn delete(&mut self, path: &str) -> StorageResult<()> {
        let parts = tree::split_path(path)?;
        self.pending.remove(&parts);
        Ok(())
    }

    // ==================== Reads ====================

    /// Resolve a path against the pending map first, then the base tree.
    pub fn resolve(&self, repo: &Repository, path: &str) -> StorageResult<Option<ResolvedObject>> {
        let Some(parts) = tree::read_components(path) else {
            return Ok(None);
        };
        let base = repo.find_tree(self.base.raw())?;

        match self.pending.overlay(&parts) {
            Overlay::Blob(data) => Ok(Some(ResolvedObject::Blob(data.to_vec()))),
            Overlay::Deleted => Ok(None),
            Overlay::Base => tree::resolve_in(repo, &base, &parts),
            Overlay::Tree(node) => {
                let base_subtree = tree::subtree_at(repo, &base, &parts)?;
                let listing = tree::merged_listing(repo, node, base_subtree.as_ref())?;
                if listing.is_empty() && !parts.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(ResolvedObject::Tree(listing)))
                }
            }
        }
    }

    pub fn includes(&self, repo: &Repository, path: &str) -> StorageResult<bool> {
        Ok(self.resolve(repo, path)?.is_some())
    }

    /// blob content at `path`
    pub fn object(&self, repo: &Repository, path: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.resolve(repo, path)?.and_then(ResolvedObject::into_blob))
    }

    /// direct children of the tree at `path`
    pub fn list(&self, repo: &Repository, path: &str) -> StorageResult<BTreeMap<String, EntryKind>> {
        Ok(self
            .resolve(repo, path)?
            .map(ResolvedObject::into_listing)
            .unwrap_or_default())
    }

    // ==================== Materialization ====================

    /// Write the staged tree to the object store.
    pub fn write(&self, repo: &Repository) -> StorageResult<TreeId> {
        if self.pending.is_empty() {
            return Ok(self.base);
        }
        let base = repo.find_tree(self.base.raw())?;
        self.pending.write(repo, Some(&base))
    }

    /// Write the tree and, for a synced index, publish it to the disk index.
    pub fn build(&self, repo: &Repository) -> StorageResult<TreeId> {
        let tree = self.write(repo)?;
        if self.mode == IndexMode::Synced {
            Self::publish(repo, tree)?;
        }
        Ok(tree)
    }

    /// Same as `build`.
    pub fn sync(&self, repo: &Repository) -> StorageResult<TreeId> {
        self.build(repo)
    }

    /// Publish to the disk index regardless of mode.
    pub fn force_sync(&self, repo: &Repository) -> StorageResult<TreeId> {
        let tree = self.write(repo)?;
        Self::publish(repo, tree)?;
        Ok(tree)
    }

    /// Replace the on-disk index contents with `tree`.
    pub(crate) fn publish(repo: &Repository, tree: TreeId) -> StorageResult<()> {
        let tree = repo.find_tree(tree.raw())?;
        let mut disk = repo.index()?;
        disk.read_tree(&tree)?;
        disk.write()?;
        debug!(tree = %tree.id(), "published tree to disk index");
        Ok(())
    }

    /// Commit the staged tree onto `branch`.
    ///
    /// Returns `None` without committing when the tree equals the parent's.
    /// After a commit the index is clean and based on the new commit.
    pub fn commit(
        &mut self,
        repo: &Repository,
        branch: &BranchName,
        message: &str,
        author: &GitSignature,
    ) -> StorageResult<Option<CommitId>> {
        let tree = self.write(repo)?;
        if let Some(parent) = self.parent {
            if commit::tree_of(repo, parent)? == tree {
                self.pending = PendingTree::new();
                self.base = tree;
                self.origin = tree;
                if self.mode == IndexMode::Synced {
                    Self::publish(repo, tree)?;
                }
                return Ok(None);
            }
        }

        let mut builder = CommitBuilder::new(repo)
            .tree(tree)
            .message(message)
            .signature(author.clone());
        if let Some(parent) = self.parent {
            builder = builder.parent(parent);
        }
        let id = builder.commit()?;
        RefManager::set_branch_target(repo, branch, id)?;

        self.parent = Some(id);
        self.origin = tree;
        self.base = tree;
        self.pending = PendingTree::new();
        if self.mode == IndexMode::Synced {
            Self::publish(repo, tree)?;
        }

        debug!(commit = %id.short(), branch = %branch, "committed staged index");
        Ok(Some(id))
    }

    /// Move the index onto a new parent without dropping staged edits.
    ///
    /// Everything staged relative to the old parent, including a base seeded
    /// from the disk index, is replayed as pending edits over `tree`.
    pub fn rebase(&mut self, repo: &Repository, parent: CommitId, tree: TreeId) -> StorageResult<()> {
        let pending = if self.is_dirty() {
            let staged = self.write(repo)?;
            Self::changes_between(repo, self.origin, staged)?
        } else {
            PendingTree::new()
        };
        self.parent = Some(parent);
        self.origin = tree;
        self.base = tree;
        self.pending = pending;
        Ok(())
    }

    /// Pending edits that turn tree `from` into tree `to`.
    fn changes_between(repo: &Repository, from: TreeId, to: TreeId) -> StorageResult<PendingTree> {
        let mut pending = PendingTree::new();
        if from == to {
            return Ok(pending);
        }
        let old = repo.find_tree(from.raw())?;
        let new = repo.find_tree(to.raw())?;
        let diff = repo.diff_tree_to_tree(Some(&old), Some(&new), None)?;

        // removals first so a blob replaced by a tree (or the reverse) ends
        // up as the new entry
        let mut writes = Vec::new();
        for delta in diff.deltas() {
            if delta.status() == Delta::Deleted {
                if let Some(path) = delta.old_file().path().and_then(|p| p.to_str()) {
                    pending.remove(&tree::split_path(path)?);
                }
            } else if let Some(path) = delta.new_file().path().and_then(|p| p.to_str()) {
                writes.push((path.to_string(), delta.new_file().id()));
            }
        }
        for (path, blob) in writes {
            let blob = repo.find_blob(blob)?;
            pending.set(&tree::split_path(&path)?, blob.content().to_vec());
        }
        Ok(pending)
    }

    /// Drop staged edits and go back to the parent's tree. A synced index
    /// also resets the disk index.
    pub fn discard(&mut self, repo: &Repository) -> StorageResult<()> {
        self.pending = PendingTree::new();
        self.base = self.origin;
        if self.mode == IndexMode::Synced {
            Self::publish(repo, self.base)?;
        }
        Ok(())
    }
}
