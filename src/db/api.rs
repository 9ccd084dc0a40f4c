//! Database API - the connection handle for a gitds store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::info;

use crate::db::config::RepoConfig;
use crate::db::notify::{self, CallbackResult, Subscribers};
use crate::model::ModelError;
use crate::storage::{
    BranchName, CommitId, CommitInfo, CommitMessage, EntryKind, GitSignature, MergeOutcome,
    Repository, StagedIndex, StorageError, TagName,
};
use crate::transaction::UnitFrame;

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Path of the version marker written by the bootstrap commit.
pub const VERSION_PATH: &str = ".git-ds/version";
/// Store format version.
pub const STORE_VERSION: &str = "1.0";

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("model error: {0}")]
    Model(ModelError),

    #[error("database is closed")]
    Closed,

    #[error("database not found: {0}")]
    NotFound(PathBuf),

    #[error("transaction rolled back: {0}")]
    RolledBack(String),

    /// a nested scope failed and took the top-level unit with it
    #[error("unit of work aborted: {0}")]
    Aborted(String),

    #[error("branch-and-merge transactions cannot run inside a unit of work")]
    NestedBranchTransaction,

    #[error("not allowed inside a unit of work: {0}")]
    Busy(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ModelError> for DatabaseError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Database(inner) => *inner,
            other => DatabaseError::Model(other),
        }
    }
}

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the store (the repository root).
    pub path: PathBuf,
    /// Create and bootstrap the store if it doesn't exist.
    pub create_if_missing: bool,
    /// Branch that merges land on.
    pub default_branch: String,
    /// Commit author; resolved from git config when unset.
    pub actor: Option<GitSignature>,
    /// Commit message for units of work that don't set one.
    pub default_message: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".gitds"),
            create_if_missing: true,
            default_branch: BranchName::MASTER.to_string(),
            actor: None,
            default_message: CommitMessage::DEFAULT.to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn default_branch(mut self, name: impl Into<String>) -> Self {
        self.default_branch = name.into();
        self
    }

    pub fn actor(mut self, actor: GitSignature) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn default_message(mut self, message: impl Into<String>) -> Self {
        self.default_message = message.into();
        self
    }
}

/// The connection handle.
///
/// Cheap to clone; clones share the repository, the active unit of work and
/// the subscriber registry. Closing one closes them all.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    config: DatabaseConfig,
    repo: Mutex<Option<Repository>>,
    actor: RwLock<GitSignature>,
    subscribers: Mutex<Subscribers>,
    frame: Mutex<Option<UnitFrame>>,
    batch_depth: AtomicUsize,
}

impl Database {
    // ==================== Lifecycle ====================

    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        Self::open_with_config(DatabaseConfig::new(path.as_ref()))
    }

    /// Open or create a database with custom configuration.
    pub fn open_with_config(config: DatabaseConfig) -> DatabaseResult<Self> {
        let default_branch = BranchName::new(&config.default_branch).map_err(StorageError::from)?;

        let (repo, actor) = if Repository::exists(&config.path) {
            let repo = Repository::open(&config.path, default_branch)?;
            let actor = resolve_actor(&config, &repo);
            (repo, actor)
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            let mut repo = Repository::init(&config.path, default_branch)?;
            let actor = resolve_actor(&config, &repo);
            bootstrap(&mut repo, &actor)?;
            (repo, actor)
        } else {
            return Err(DatabaseError::NotFound(config.path.clone()));
        };

        info!(path = %config.path.display(), actor = %actor, "opened database");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                config,
                repo: Mutex::new(Some(repo)),
                actor: RwLock::new(actor),
                subscribers: Mutex::new(Subscribers::default()),
                frame: Mutex::new(None),
                batch_depth: AtomicUsize::new(0),
            }),
        })
    }

    /// Open the store at `path`, creating it if `create` is set.
    ///
    /// A missing store with `create` off is `Ok(None)`, not an error.
    pub fn connect(path: impl AsRef<Path>, create: bool) -> DatabaseResult<Option<Self>> {
        Self::connect_with(DatabaseConfig::new(path.as_ref()).create_if_missing(create))
    }

    /// `connect` with an explicit commit author.
    pub fn connect_as(
        path: impl AsRef<Path>,
        actor: GitSignature,
        create: bool,
    ) -> DatabaseResult<Option<Self>> {
        Self::connect_with(
            DatabaseConfig::new(path.as_ref())
                .create_if_missing(create)
                .actor(actor),
        )
    }

    fn connect_with(config: DatabaseConfig) -> DatabaseResult<Option<Self>> {
        match Self::open_with_config(config) {
            Ok(db) => Ok(Some(db)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Close the connection.
    ///
    /// With `save`, uncommitted staged changes are committed first;
    /// otherwise they are discarded. Closing twice is an error.
    pub fn close(&self, save: bool) -> DatabaseResult<()> {
        if self.in_unit() {
            return Err(DatabaseError::Busy("close"));
        }
        let actor = self.actor();
        let mut guard = self.inner.repo.lock();
        let repo = guard.as_mut().ok_or(DatabaseError::Closed)?;

        if save {
            if repo.staging_ref().is_some_and(StagedIndex::is_dirty) {
                repo.commit_staging(CommitMessage::ON_CLOSE, &actor)?;
            }
        } else {
            repo.purge_stages()?;
        }
        *guard = None;
        info!(path = %self.path().display(), save, "closed database");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.repo.lock().is_some()
    }

    /// Drop every staged index, active and branch-cached.
    pub fn purge(&self) -> DatabaseResult<()> {
        if self.in_unit() {
            return Err(DatabaseError::Busy("purge"));
        }
        self.with_repo(|repo| Ok(repo.purge_stages()?))
    }

    // ==================== Accessors ====================

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Get the options the connection was opened with.
    pub fn options(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Key/value settings stored in the repository's git config.
    pub fn config(&self) -> RepoConfig {
        RepoConfig::new(self.clone(), RepoConfig::DEFAULT_SECTION)
    }

    /// Current commit author.
    pub fn actor(&self) -> GitSignature {
        self.inner.actor.read().clone()
    }

    pub fn set_actor(&self, actor: GitSignature) {
        *self.inner.actor.write() = actor;
    }

    /// true while a unit of work is running on this connection
    pub fn in_unit(&self) -> bool {
        self.inner.frame.lock().is_some()
    }

    /// true when a staged index is active (uncommitted state may exist)
    pub fn is_staging(&self) -> bool {
        self.inner
            .repo
            .lock()
            .as_ref()
            .is_some_and(Repository::is_staging)
    }

    pub(crate) fn ensure_open(&self) -> DatabaseResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DatabaseError::Closed)
        }
    }

    /// Run `f` against the repository. Fails with `Closed` after `close`.
    ///
    /// The repository lock is held for the duration of `f`, so `f` must not
    /// call back into the connection.
    pub(crate) fn with_repo<T>(
        &self,
        f: impl FnOnce(&mut Repository) -> DatabaseResult<T>,
    ) -> DatabaseResult<T> {
        let mut guard = self.inner.repo.lock();
        let repo = guard.as_mut().ok_or(DatabaseError::Closed)?;
        f(repo)
    }

    pub(crate) fn frame(&self) -> &Mutex<Option<UnitFrame>> {
        &self.inner.frame
    }

    pub(crate) fn batch_depth(&self) -> &AtomicUsize {
        &self.inner.batch_depth
    }

    // ==================== Subscriptions ====================

    /// Call `callback(&payload)` after every completed top-level unit of
    /// work. Subscribing an existing id replaces its callback in place.
    pub fn subscribe<P, F>(&self, id: impl Into<String>, payload: P, callback: F) -> DatabaseResult<()>
    where
        P: Send + Sync + 'static,
        F: Fn(&P) -> CallbackResult + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.inner
            .subscribers
            .lock()
            .insert(id.into(), Arc::new(move || callback(&payload)));
        Ok(())
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.subscribers.lock().remove(id)
    }

    pub(crate) fn notify(&self) {
        let snapshot = self.inner.subscribers.lock().snapshot();
        notify::dispatch(&snapshot);
    }

    // ==================== Store ====================

    /// Write `data` at `path` as its own Command (or as part of the active unit).
    pub fn add(&self, path: &str, data: impl Into<Vec<u8>>) -> DatabaseResult<()> {
        let data = data.into();
        self.exec(|cmd| cmd.add(path, data))
    }

    /// Stage `data` at `path` without running a unit of work. Nothing is
    /// committed until the next unit (or `close(true)`); meant for bulk loads
    /// inside `batch`.
    pub fn fast_add(&self, path: &str, data: impl Into<Vec<u8>>) -> DatabaseResult<()> {
        self.with_repo(|repo| Ok(repo.add(path, data)?))
    }

    pub fn delete(&self, path: &str) -> DatabaseResult<()> {
        self.exec(|cmd| cmd.delete(path))
    }

    pub fn object_data(&self, path: &str) -> DatabaseResult<Option<Vec<u8>>> {
        self.with_repo(|repo| Ok(repo.object_data(path)?))
    }

    pub fn include(&self, path: &str) -> DatabaseResult<bool> {
        self.with_repo(|repo| Ok(repo.include(path)?))
    }

    pub fn list(&self, path: &str) -> DatabaseResult<BTreeMap<String, EntryKind>> {
        self.with_repo(|repo| Ok(repo.list(path)?))
    }

    pub fn list_blobs(&self, path: &str) -> DatabaseResult<Vec<String>> {
        self.with_repo(|repo| Ok(repo.list_blobs(path)?))
    }

    pub fn list_trees(&self, path: &str) -> DatabaseResult<Vec<String>> {
        self.with_repo(|repo| Ok(repo.list_trees(path)?))
    }

    // ==================== Branches ====================

    /// Create or move a branch; defaults to the tip of the default branch.
    pub fn create_branch(&self, name: &str, at: Option<CommitId>) -> DatabaseResult<BranchName> {
        self.with_repo(|repo| Ok(repo.create_branch(name, at)?))
    }

    /// Make `name` the current branch, creating it if needed.
    pub fn set_branch(&self, name: &str) -> DatabaseResult<BranchName> {
        if self.in_unit() {
            return Err(DatabaseError::Busy("switching branches"));
        }
        self.with_repo(|repo| Ok(repo.switch_branch(name)?))
    }

    /// Merge `name` into `into` (the default branch if `None`).
    pub fn merge_branch(&self, name: &str, into: Option<&str>) -> DatabaseResult<MergeOutcome> {
        if self.in_unit() {
            return Err(DatabaseError::Busy("merging branches"));
        }
        let actor = self.actor();
        self.with_repo(|repo| Ok(repo.merge_branch(name, into, &actor)?))
    }

    pub fn current_branch(&self) -> DatabaseResult<BranchName> {
        self.with_repo(|repo| Ok(repo.current_branch().clone()))
    }

    pub fn default_branch(&self) -> DatabaseResult<BranchName> {
        self.with_repo(|repo| Ok(repo.default_branch().clone()))
    }

    pub fn branches(&self) -> DatabaseResult<Vec<BranchName>> {
        self.with_repo(|repo| Ok(repo.branches()?))
    }

    // ==================== History ====================

    /// Tip of the current branch.
    pub fn tip(&self) -> DatabaseResult<Option<CommitId>> {
        self.with_repo(|repo| Ok(repo.tip()?))
    }

    /// Up to `limit` commits walked back from the current tip.
    pub fn history(&self, limit: usize) -> DatabaseResult<Vec<CommitInfo>> {
        self.with_repo(|repo| Ok(repo.history(limit)?))
    }

    /// Tag the current tip with a name derived from `message`.
    pub fn mark(&self, message: &str) -> DatabaseResult<TagName> {
        self.with_repo(|repo| Ok(repo.mark(message)?))
    }

    pub fn tags(&self) -> DatabaseResult<Vec<TagName>> {
        self.with_repo(|repo| Ok(repo.tags()?))
    }

    /// Commit recorded by `mark(message)`.
    pub fn tag_commit(&self, message: &str) -> DatabaseResult<CommitId> {
        self.with_repo(|repo| Ok(repo.tag_commit(message)?))
    }
}

fn resolve_actor(config: &DatabaseConfig, repo: &Repository) -> GitSignature {
    config
        .actor
        .clone()
        .or_else(|| {
            repo.git()
                .config()
                .ok()
                .and_then(|cfg| GitSignature::from_git_config(&cfg))
        })
        .unwrap_or_default()
}

fn bootstrap(repo: &mut Repository, actor: &GitSignature) -> DatabaseResult<()> {
    repo.add(VERSION_PATH, format!("{}\n", STORE_VERSION))?;
    repo.commit_staging(CommitMessage::INITIALIZED, actor)?;
    repo.set_staging(None);
    info!(path = %repo.path().display(), version = STORE_VERSION, "bootstrapped store");
    Ok(())
}
