//! storage layer for gitds
//!
//! this module provides the object store, the staged index and the
//! repository wrapper. The upper layers (connection, units of work, model)
//! use this API and never touch git2 directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Repository                            │
//! │  (branches, switch, merge, mark, resolve, batch staging)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ StagedIndex │       │    refs     │       │   commit    │
//!  │  (pending)  │       │ (branches)  │       │  (history)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │
//!         ▼
//!  ┌─────────────┐
//!  │    tree     │
//!  │ (diff write)│
//!  └─────────────┘
//!  ```
//!
//! # Usage
//!
//! ```ignore
//! use gitds::storage::{BranchName, GitSignature, Repository};
//!
//! let mut repo = Repository::init("./store", BranchName::master())?;
//! repo.add("widget/w1/color", "red\n")?;
//! repo.commit_staging("add widget", &GitSignature::default())?;
//!
//! repo.switch_branch("experiment")?;
//! repo.add("widget/w1/color", "blue\n")?;
//! repo.commit_staging("recolor", &GitSignature::default())?;
//! repo.merge_branch("experiment", None, &GitSignature::default())?;
//! ```

mod commit;
mod error;
mod index;
mod refs;
mod repository;
mod tree;
mod types;

// Re-export public API
pub use commit::{CommitInfo, CommitMessage};
pub use error::{StorageError, StorageResult};
pub use index::{IndexMode, StagedIndex};
pub use repository::{MergeOutcome, Repository};
pub use tree::ResolvedObject;
pub use types::{
    sanitize_ref_token, BlobId, BranchName, CommitId, EntryKind, GitSignature, InvalidNameError,
    TagName, TreeId,
};
