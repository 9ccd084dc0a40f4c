//! Unit-of-work context: the shared frame and the handles bodies receive.
//!
//! One frame exists per connection while a unit of work runs. The outermost
//! unit creates it; nested units only bump its depth and share it. Anything
//! a nested scope needs to tell the outermost one (a rollback, a failure, a
//! request to propagate errors) is recorded on the frame, so it survives
//! even when an intermediate body swallows the returned error.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::db::{Database, DatabaseError, DatabaseResult};
use crate::storage::{EntryKind, GitSignature, StagedIndex};
use crate::transaction::outcome::Abort;

/// Sticky abort recorded by a nested scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Poison {
    Rollback(String),
    Fail(String),
}

impl Poison {
    pub(crate) fn into_abort(self) -> Abort {
        match self {
            Poison::Rollback(reason) => Abort::Rollback(reason),
            Poison::Fail(message) => Abort::Fail(DatabaseError::Aborted(message)),
        }
    }
}

/// State shared by every scope of one top-level unit of work.
#[derive(Debug)]
pub(crate) struct UnitFrame {
    depth: usize,
    propagate: bool,
    poison: Option<Poison>,
    message: String,
    author: Option<GitSignature>,
}

impl UnitFrame {
    fn new(message: String) -> Self {
        Self {
            depth: 1,
            propagate: false,
            poison: None,
            message,
            author: None,
        }
    }
}

/// Scoped membership in the connection's unit-of-work frame.
///
/// Dropping a top-level scope that was not completed restores the index
/// that was active before the unit began; this runs on every exit path,
/// panics included.
pub(crate) struct UnitScope<'db> {
    db: &'db Database,
    nested: bool,
    /// index active before a top-level unit began
    prior: Option<StagedIndex>,
    completed: bool,
}

impl<'db> UnitScope<'db> {
    pub(crate) fn enter(db: &'db Database) -> DatabaseResult<Self> {
        db.ensure_open()?;
        let nested = {
            let mut frame = db.frame().lock();
            match frame.as_mut() {
                Some(active) => {
                    active.depth += 1;
                    true
                }
                None => {
                    *frame = Some(UnitFrame::new(db.options().default_message.clone()));
                    false
                }
            }
        };

        let mut scope = Self {
            db,
            nested,
            prior: None,
            completed: false,
        };
        if !nested {
            // the scope already owns the frame; an error here releases it on drop
            scope.prior = db.with_repo(|repo| Ok(repo.staging_ref().cloned()))?;
            debug!(path = %db.path().display(), "unit of work started");
        }
        Ok(scope)
    }

    pub(crate) fn is_nested(&self) -> bool {
        self.nested
    }

    /// Record an abort so the outermost scope unwinds too.
    pub(crate) fn poison(&self, abort: &Abort) {
        let poison = match abort {
            Abort::Rollback(reason) => Poison::Rollback(reason.clone()),
            Abort::Fail(err) => Poison::Fail(err.to_string()),
        };
        mark_poison(self.db, poison);
    }

    pub(crate) fn take_poison(&self) -> Option<Poison> {
        self.db.frame().lock().as_mut().and_then(|f| f.poison.take())
    }

    pub(crate) fn propagate(&self) -> bool {
        self.db.frame().lock().as_ref().is_some_and(|f| f.propagate)
    }

    /// Commit message and author for the unit's single commit.
    pub(crate) fn commit_metadata(&self) -> (String, GitSignature) {
        let frame = self.db.frame().lock();
        let message = frame
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| self.db.options().default_message.clone());
        let author = frame.as_ref().and_then(|f| f.author.clone());
        drop(frame);
        (message, author.unwrap_or_else(|| self.db.actor()))
    }

    /// Mark a top-level unit as finished. An index the unit created itself is
    /// released; one that was active before stays.
    pub(crate) fn complete(mut self) -> DatabaseResult<()> {
        self.completed = true;
        if !self.nested && self.prior.is_none() {
            self.db.with_repo(|repo| {
                repo.set_staging(None);
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl Drop for UnitScope<'_> {
    fn drop(&mut self) {
        if self.nested {
            if let Some(frame) = self.db.frame().lock().as_mut() {
                frame.depth -= 1;
            }
            return;
        }

        if !self.completed {
            let prior = self.prior.take();
            let restored = self.db.with_repo(|repo| Ok(repo.restore_staging(prior)?));
            match restored {
                Ok(()) => debug!("unit of work abandoned, staged changes discarded"),
                Err(DatabaseError::Closed) => {}
                Err(e) => warn!(error = %e, "failed to restore index after abandoned unit of work"),
            }
        }
        *self.db.frame().lock() = None;
    }
}

fn mark_poison(db: &Database, poison: Poison) {
    if let Some(frame) = db.frame().lock().as_mut() {
        // the first abort wins
        if frame.poison.is_none() {
            frame.poison = Some(poison);
        }
    }
}

/// Handle passed to the body of `Database::exec`.
pub struct Command<'db> {
    db: &'db Database,
    nested: bool,
}

impl<'db> Command<'db> {
    pub(crate) fn new(db: &'db Database, nested: bool) -> Self {
        Self { db, nested }
    }

    pub fn database(&self) -> &'db Database {
        self.db
    }

    /// true when an enclosing unit of work will do the commit
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn add(&mut self, path: &str, data: impl Into<Vec<u8>>) -> DatabaseResult<()> {
        self.db.with_repo(|repo| Ok(repo.add(path, data)?))
    }

    pub fn delete(&mut self, path: &str) -> DatabaseResult<()> {
        self.db.with_repo(|repo| Ok(repo.delete(path)?))
    }

    pub fn object_data(&self, path: &str) -> DatabaseResult<Option<Vec<u8>>> {
        self.db.object_data(path)
    }

    pub fn include(&self, path: &str) -> DatabaseResult<bool> {
        self.db.include(path)
    }

    pub fn list(&self, path: &str) -> DatabaseResult<BTreeMap<String, EntryKind>> {
        self.db.list(path)
    }

    /// Message for the unit's commit.
    pub fn set_message(&mut self, message: impl Into<String>) {
        if let Some(frame) = self.db.frame().lock().as_mut() {
            frame.message = message.into();
        }
    }

    /// Author for the unit's commit; defaults to the connection actor.
    pub fn set_author(&mut self, author: GitSignature) {
        if let Some(frame) = self.db.frame().lock().as_mut() {
            frame.author = Some(author);
        }
    }
}

/// Handle passed to the body of `Database::transaction`.
///
/// Everything a `Command` can do, plus rollback and error propagation.
pub struct Transaction<'db> {
    cmd: Command<'db>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, nested: bool) -> Self {
        Self {
            cmd: Command::new(db, nested),
        }
    }

    /// Abort the whole top-level transaction.
    ///
    /// Return the value from the body. The rollback is also recorded on the
    /// shared frame, so it takes effect even if the value is dropped.
    pub fn rollback(&mut self, reason: impl Into<String>) -> Abort {
        let reason = reason.into();
        mark_poison(self.cmd.db, Poison::Rollback(reason.clone()));
        Abort::Rollback(reason)
    }

    /// Re-raise non-rollback failures to the caller instead of reporting them
    /// as a failed outcome. Applies to the whole chain of nested scopes.
    pub fn propagate(&mut self) {
        if let Some(frame) = self.cmd.db.frame().lock().as_mut() {
            frame.propagate = true;
        }
    }
}

impl<'db> Deref for Transaction<'db> {
    type Target = Command<'db>;

    fn deref(&self) -> &Self::Target {
        &self.cmd
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cmd
    }
}
