//! pending tree overlay and the diffed tree writer.
//!
//! A staged change set is kept as a nested map that mirrors the shape of a
//! git tree:
//!
//! ```text
//! PendingTree
//!   "widget" => Tree
//!       "w1" => Tree
//!           "color" => Blob("blue\n")
//!           "size"  => Tombstone
//! ```
//!
//! Writing walks that map against a base tree. Entries the map does not
//! mention are carried over from the base untouched, so unchanged subtrees
//! keep their ids and are never rewritten. git stores no empty trees, so a
//! subtree that loses its last entry disappears from its parent.

use std::collections::BTreeMap;
use std::path::Path;

use git2::{FileMode, ObjectType, Oid, Repository, Tree};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, EntryKind, TreeId};

/// One pending change at a single name.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEntry {
    Blob(Vec<u8>),
    Tree(PendingTree),
    Tombstone,
}

/// Nested map of pending changes layered over a base tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTree {
    entries: BTreeMap<String, PendingEntry>,
    /// base contents below this node are hidden (it replaced a blob or a
    /// deleted subtree)
    replaces_base: bool,
}

/// What the overlay says about a path before the base is consulted.
#[derive(Debug)]
pub(crate) enum Overlay<'a> {
    Blob(&'a [u8]),
    Tree(&'a PendingTree),
    Deleted,
    /// the overlay does not mention the path
    Base,
}

/// A resolved object: blob content or a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedObject {
    Blob(Vec<u8>),
    Tree(BTreeMap<String, EntryKind>),
}

impl ResolvedObject {
    pub fn into_blob(self) -> Option<Vec<u8>> {
        match self {
            ResolvedObject::Blob(data) => Some(data),
            ResolvedObject::Tree(_) => None,
        }
    }

    pub fn into_listing(self) -> BTreeMap<String, EntryKind> {
        match self {
            ResolvedObject::Tree(listing) => listing,
            ResolvedObject::Blob(_) => BTreeMap::new(),
        }
    }
}

// ==================== Paths ====================

/// Split a write path into its components.
///
/// Rejects empty paths, null bytes and empty or relative components before
/// anything reaches the object store.
pub(crate) fn split_path(path: &str) -> StorageResult<Vec<&str>> {
    if path.is_empty() {
        return Err(StorageError::invalid_path(path, "path is empty"));
    }
    if path.contains('\0') {
        return Err(StorageError::invalid_path(path, "path contains a null byte"));
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StorageError::invalid_path(path, "path has an empty component"));
    }
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(StorageError::invalid_path(path, "path has a relative component"));
    }
    Ok(parts)
}

/// Lenient split for reads. `""` and `"/"` name the root; a path that could
/// never have been written yields `None`.
pub(crate) fn read_components(path: &str) -> Option<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    split_path(trimmed).ok()
}

// ==================== Pending map ====================

impl PendingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.replaces_base
    }

    /// Stage blob content at `parts`, turning intermediate blobs into trees.
    pub(crate) fn set(&mut self, parts: &[&str], data: Vec<u8>) {
        let Some((name, rest)) = parts.split_first() else {
            return;
        };
        if rest.is_empty() {
            self.entries.insert(name.to_string(), PendingEntry::Blob(data));
            return;
        }

        let inherit = self.replaces_base;
        let entry = self.entries.entry(name.to_string()).or_insert_with(|| {
            PendingEntry::Tree(PendingTree {
                entries: BTreeMap::new(),
                replaces_base: inherit,
            })
        });
        if !matches!(entry, PendingEntry::Tree(_)) {
            *entry = PendingEntry::Tree(PendingTree {
                entries: BTreeMap::new(),
                replaces_base: true,
            });
        }
        if let PendingEntry::Tree(child) = entry {
            child.set(rest, data);
        }
    }

    /// Stage removal of whatever lives at `parts`. Removing a path that does
    /// not exist leaves nothing behind once written.
    pub(crate) fn remove(&mut self, parts: &[&str]) {
        let Some((name, rest)) = parts.split_first() else {
            return;
        };
        if rest.is_empty() {
            if self.replaces_base {
                self.entries.remove(*name);
            } else {
                self.entries.insert(name.to_string(), PendingEntry::Tombstone);
            }
            return;
        }

        match self.entries.get_mut(*name) {
            Some(PendingEntry::Tree(child)) => child.remove(rest),
            // nothing can live below a blob or a tombstone
            Some(_) => {}
            None => {
                if self.replaces_base {
                    return;
                }
                let mut child = PendingTree::new();
                child.remove(rest);
                self.entries.insert(name.to_string(), PendingEntry::Tree(child));
            }
        }
    }

    pub(crate) fn overlay(&self, parts: &[&str]) -> Overlay<'_> {
        let mut node = self;
        for (i, name) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            match node.entries.get(*name) {
                None if node.replaces_base => return Overlay::Deleted,
                None => return Overlay::Base,
                Some(PendingEntry::Tombstone) => return Overlay::Deleted,
                Some(PendingEntry::Blob(data)) if last => return Overlay::Blob(data),
                Some(PendingEntry::Blob(_)) => return Overlay::Deleted,
                Some(PendingEntry::Tree(child)) => node = child,
            }
        }
        Overlay::Tree(node)
    }

    /// Write the pending map over `base` and return the new root tree.
    pub fn write(&self, repo: &Repository, base: Option<&Tree<'_>>) -> StorageResult<TreeId> {
        match self.write_node(repo, base)? {
            Some(oid) => Ok(TreeId::new(oid)),
            None => Ok(TreeId::new(repo.treebuilder(None)?.write()?)),
        }
    }

    /// `None` means the node would be an empty tree.
    fn write_node(&self, repo: &Repository, base: Option<&Tree<'_>>) -> StorageResult<Option<Oid>> {
        let base = if self.replaces_base { None } else { base };
        if self.entries.is_empty() {
            return Ok(base.filter(|t| !t.is_empty()).map(|t| t.id()));
        }

        let mut builder = repo.treebuilder(base)?;
        for (name, entry) in &self.entries {
            match entry {
                PendingEntry::Blob(data) => {
                    let blob = write_blob(repo, data)?;
                    builder.insert(name.as_str(), blob.raw(), FileMode::Blob.into())?;
                }
                PendingEntry::Tombstone => {
                    if builder.get(name.as_str())?.is_some() {
                        builder.remove(name.as_str())?;
                    }
                }
                PendingEntry::Tree(child) => {
                    let child_base = match base.and_then(|t| t.get_name(name)) {
                        Some(entry) if entry.kind() == Some(ObjectType::Tree) => {
                            Some(repo.find_tree(entry.id())?)
                        }
                        _ => None,
                    };
                    match child.write_node(repo, child_base.as_ref())? {
                        Some(oid) => {
                            builder.insert(name.as_str(), oid, FileMode::Tree.into())?;
                        }
                        None => {
                            if builder.get(name.as_str())?.is_some() {
                                builder.remove(name.as_str())?;
                            }
                        }
                    }
                }
            }
        }

        if builder.len() == 0 {
            return Ok(None);
        }
        Ok(Some(builder.write()?))
    }
}

// ==================== Object store ====================

/// write raw bytes as a blob
pub fn write_blob(repo: &Repository, data: &[u8]) -> StorageResult<BlobId> {
    Ok(BlobId::new(repo.blob(data)?))
}

fn entry_at(tree: &Tree<'_>, parts: &[&str]) -> Option<git2::TreeEntry<'static>> {
    if parts.is_empty() {
        return None;
    }
    tree.get_path(Path::new(&parts.join("/"))).ok()
}

/// subtree at `parts`, the root itself for an empty path
pub(crate) fn subtree_at<'r>(
    repo: &'r Repository,
    root: &Tree<'r>,
    parts: &[&str],
) -> StorageResult<Option<Tree<'r>>> {
    if parts.is_empty() {
        return Ok(Some(root.clone()));
    }
    match entry_at(root, parts) {
        Some(entry) if entry.kind() == Some(ObjectType::Tree) => Ok(Some(repo.find_tree(entry.id())?)),
        _ => Ok(None),
    }
}

/// sorted listing of a tree's direct children
pub(crate) fn list_tree(tree: &Tree<'_>) -> BTreeMap<String, EntryKind> {
    tree.iter()
        .filter_map(|entry| {
            let kind = match entry.kind()? {
                ObjectType::Blob => EntryKind::Blob,
                ObjectType::Tree => EntryKind::Tree,
                _ => return None,
            };
            Some((entry.name()?.to_string(), kind))
        })
        .collect()
}

/// resolve a path inside a committed tree
pub(crate) fn resolve_in(
    repo: &Repository,
    root: &Tree<'_>,
    parts: &[&str],
) -> StorageResult<Option<ResolvedObject>> {
    if parts.is_empty() {
        return Ok(Some(ResolvedObject::Tree(list_tree(root))));
    }
    let Some(entry) = entry_at(root, parts) else {
        return Ok(None);
    };
    match entry.kind() {
        Some(ObjectType::Blob) => {
            let blob = repo.find_blob(entry.id())?;
            Ok(Some(ResolvedObject::Blob(blob.content().to_vec())))
        }
        Some(ObjectType::Tree) => {
            let tree = repo.find_tree(entry.id())?;
            Ok(Some(ResolvedObject::Tree(list_tree(&tree))))
        }
        _ => Ok(None),
    }
}

/// listing of a pending node merged over its base subtree
pub(crate) fn merged_listing(
    repo: &Repository,
    pending: &PendingTree,
    base: Option<&Tree<'_>>,
) -> StorageResult<BTreeMap<String, EntryKind>> {
    let base = if pending.replaces_base { None } else { base };
    let mut listing = base.map(list_tree).unwrap_or_default();

    for (name, entry) in &pending.entries {
        match entry {
            PendingEntry::Blob(_) => {
                listing.insert(name.clone(), EntryKind::Blob);
            }
            PendingEntry::Tombstone => {
                listing.remove(name);
            }
            PendingEntry::Tree(child) => {
                let child_base = match base.and_then(|t| t.get_name(name)) {
                    Some(entry) if entry.kind() == Some(ObjectType::Tree) => {
                        Some(repo.find_tree(entry.id())?)
                    }
                    _ => None,
                };
                if merged_listing(repo, child, child_base.as_ref())?.is_empty() {
                    listing.remove(name);
                } else {
                    listing.insert(name.clone(), EntryKind::Tree);
                }
            }
        }
    }

    Ok(listing)
}
