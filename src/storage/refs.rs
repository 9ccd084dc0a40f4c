//!  Branch, tag and HEAD management.
//!
//!  Git refs are pointers to commits. This module handles:
//! - branch lifecycle (create, move, delete, list)
//! - lightweight tags used as human-readable checkpoints
//! - HEAD attachment, including an unborn HEAD on a fresh repository
//!
//! Names arrive here already sanitized (see `BranchName` / `TagName`).

use git2::{BranchType, ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BranchName, CommitId, TagName};

/// Manages Git references.
pub struct RefManager;

impl RefManager {
    /// Resolve a branch name to its current commit ID.
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> StorageResult<CommitId> {
        let reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        let commit = reference
            .peel_to_commit()
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        Ok(CommitId::new(commit.id()))
    }

    /// Tip of a branch, `None` while the branch is unborn.
    pub fn branch_tip(repo: &Repository, branch: &BranchName) -> StorageResult<Option<CommitId>> {
        match repo.find_reference(&branch.as_ref_path()) {
            Ok(reference) => Ok(Some(CommitId::new(reference.peel_to_commit()?.id()))),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// Branch HEAD is attached to. Works on an unborn HEAD too.
    pub fn head_branch(repo: &Repository) -> StorageResult<Option<BranchName>> {
        let head = repo.find_reference("HEAD")?;
        Ok(head.symbolic_target().and_then(BranchName::from_ref_path))
    }

    /// Attach HEAD to a branch (which may not exist yet).
    pub fn set_head(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
        repo.set_head(&branch.as_ref_path())?;
        Ok(())
    }

    /// Check if a branch exists.
    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    /// Create a branch pointing to the given commit.
    ///
    /// With `force` an existing branch of that name is moved instead.
    pub fn create_branch(
        repo: &Repository,
        branch: &BranchName,
        target: CommitId,
        force: bool,
    ) -> StorageResult<()> {
        let commit = repo.find_commit(target.raw())?;
        repo.branch(branch.as_str(), &commit, force)?;
        Ok(())
    }

    /// Point a branch at a commit, creating it if needed.
    pub fn set_branch_target(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        repo.reference(
            &branch.as_ref_path(),
            target.raw(),
            true,
            &format!("gitds: move {} to {}", branch, target.short()),
        )?;
        Ok(())
    }

    /// Delete a branch.
    pub fn delete_branch(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
        let mut git_branch = repo
            .find_branch(branch.as_str(), BranchType::Local)
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        git_branch.delete()?;
        Ok(())
    }

    /// List all local branches, sorted by name.
    pub fn list_branches(repo: &Repository) -> StorageResult<Vec<BranchName>> {
        let mut result = Vec::new();
        for branch_result in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch_result?;
            if let Some(name) = branch.name()? {
                if let Ok(branch_name) = BranchName::new(name) {
                    result.push(branch_name);
                }
            }
        }
        result.sort();
        Ok(result)
    }

    /// Create (or move) a lightweight tag.
    pub fn create_tag(repo: &Repository, tag: &TagName, target: CommitId) -> StorageResult<()> {
        repo.reference(&tag.as_ref_path(), target.raw(), true, &format!("gitds: tag {}", tag))?;
        Ok(())
    }

    /// Commit a tag points at.
    pub fn resolve_tag(repo: &Repository, tag: &TagName) -> StorageResult<CommitId> {
        let reference = repo
            .find_reference(&tag.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(tag.to_string()))?;
        Ok(CommitId::new(reference.peel_to_commit()?.id()))
    }

    /// List all tags, sorted by name.
    pub fn list_tags(repo: &Repository) -> StorageResult<Vec<TagName>> {
        let names = repo.tag_names(None)?;
        let mut tags: Vec<TagName> = names
            .iter()
            .flatten()
            .filter_map(|name| TagName::new(name).ok())
            .collect();
        tags.sort();
        Ok(tags)
    }
}
