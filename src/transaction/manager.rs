//! Unit-of-work runners on `Database`.
//!
//! - `exec` runs a Command: commit on completion when top-level.
//! - `transaction` adds rollback; a top-level transaction runs in batch mode.
//! - `branch_and_merge` runs a transaction on a fresh branch and merges it
//!   back into the default branch.
//!
//! However deeply units nest, only the outermost one commits, and it makes
//! at most one commit.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::db::{Database, DatabaseError, DatabaseResult};
use crate::storage::{BranchName, CommitId, CommitMessage, GitSignature, StagedIndex};
use crate::transaction::context::{Command, Transaction, UnitScope};
use crate::transaction::outcome::{Abort, BranchOutcome, Outcome};

impl Database {
    // ==================== Commands ====================

    /// Run `body` as a Command.
    ///
    /// Top-level: the staged changes are committed once the body returns
    /// `Ok` and subscribers are notified; an `Err` discards them. Nested:
    /// the enclosing unit does the commit.
    pub fn exec<T, F>(&self, body: F) -> DatabaseResult<T>
    where
        F: FnOnce(&mut Command<'_>) -> DatabaseResult<T>,
    {
        let scope = UnitScope::enter(self)?;
        let mut cmd = Command::new(self, scope.is_nested());
        let value = body(&mut cmd)?;
        self.with_repo(|repo| Ok(repo.build_staging()?))?;

        if scope.is_nested() {
            return Ok(value);
        }
        if let Some(poison) = scope.take_poison() {
            return Err(poison.into_abort().into());
        }

        let commit = self.commit_unit(&scope)?;
        scope.complete()?;
        debug!(commit = ?commit.map(|id| id.short()), "command completed");
        self.notify();
        Ok(value)
    }

    // ==================== Transactions ====================

    /// Run `body` as a Transaction. Returns `true` when it committed.
    ///
    /// Rollbacks and (unless `propagate` was requested) failures are
    /// reported as `false`.
    pub fn transaction<F>(&self, body: F) -> DatabaseResult<bool>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        Ok(self.transaction_outcome(body)?.is_commit())
    }

    /// Like `transaction`, but reports what happened.
    ///
    /// A nested transaction never commits: it returns `Commit(None)` on
    /// success, and on rollback or failure marks the enclosing unit and
    /// returns the abort as an error so `?` carries it outwards.
    pub fn transaction_outcome<F>(&self, body: F) -> DatabaseResult<Outcome>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        let scope = UnitScope::enter(self)?;
        let mut tx = Transaction::new(self, scope.is_nested());

        if scope.is_nested() {
            return match body(&mut tx) {
                Ok(()) => {
                    self.with_repo(|repo| Ok(repo.build_staging()?))?;
                    Ok(Outcome::Commit(None))
                }
                Err(abort) => {
                    scope.poison(&abort);
                    Err(abort.into())
                }
            };
        }

        let result = self.run_batched(|| -> Result<Option<CommitId>, Abort> {
            body(&mut tx)?;
            if let Some(poison) = scope.take_poison() {
                return Err(poison.into_abort());
            }
            Ok(self.commit_unit(&scope)?)
        });

        match result {
            Ok(commit) => {
                scope.complete()?;
                debug!(commit = ?commit.map(|id| id.short()), "transaction committed");
                self.notify();
                Ok(Outcome::Commit(commit))
            }
            Err(Abort::Rollback(reason)) => {
                drop(scope);
                debug!(reason = %reason, "transaction rolled back");
                Ok(Outcome::Rollback(reason))
            }
            Err(Abort::Fail(err)) => {
                let propagate = scope.propagate();
                drop(scope);
                debug!(error = %err, propagate, "transaction failed");
                if propagate {
                    Err(err)
                } else {
                    Ok(Outcome::Fail(err))
                }
            }
        }
    }

    fn commit_unit(&self, scope: &UnitScope<'_>) -> DatabaseResult<Option<CommitId>> {
        let (message, author) = scope.commit_metadata();
        self.with_repo(|repo| Ok(repo.commit_staging(&message, &author)?))
    }

    // ==================== Batch ====================

    /// Run `f` with an in-memory index, syncing to disk once at the end.
    ///
    /// On error the index that was active before comes back unchanged.
    /// Nested batches just run their block.
    pub fn batch<T, F>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce() -> DatabaseResult<T>,
    {
        self.ensure_open()?;
        self.run_batched(f)
    }

    fn run_batched<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<DatabaseError>,
        F: FnOnce() -> Result<T, E>,
    {
        if self.batch_depth().load(Ordering::SeqCst) > 0 {
            return f();
        }

        let previous = self.with_repo(|repo| Ok(repo.begin_batch()?))?;
        let mut scope = BatchScope::new(self, previous);
        let value = f()?;
        scope.finish()?;
        Ok(value)
    }

    // ==================== Branch and merge ====================

    /// Run `body` as a transaction on its own branch and merge it into the
    /// default branch. Returns `false` if anything went wrong; the default
    /// branch is then unchanged.
    pub fn branch_and_merge<F>(
        &self,
        name: Option<&str>,
        actor: Option<GitSignature>,
        body: F,
    ) -> DatabaseResult<bool>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        Ok(self.try_branch_and_merge(name, actor, body)?.is_merged())
    }

    /// Like `branch_and_merge`, but keeps the cause of a failure.
    ///
    /// Errors are returned only for misuse (closed handle, call inside a
    /// unit of work) or when the original branch cannot be restored.
    pub fn try_branch_and_merge<F>(
        &self,
        name: Option<&str>,
        actor: Option<GitSignature>,
        body: F,
    ) -> DatabaseResult<BranchOutcome>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        self.ensure_open()?;
        if self.in_unit() {
            return Err(DatabaseError::NestedBranchTransaction);
        }
        let _actor = actor.map(|actor| ActorGuard::swap(self, actor));
        let author = self.actor();

        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("tx-{}", Ulid::new().to_string().to_lowercase()));
        let (original, branch) = self.with_repo(|repo| {
            if repo.staging_ref().is_some_and(StagedIndex::is_dirty) {
                repo.commit_staging(CommitMessage::CHECKPOINT, &author)?;
            }
            let original = repo.current_branch().clone();
            let tip = repo.tip()?;
            let branch = repo.create_branch(&name, tip)?;
            repo.switch_branch(branch.as_str())?;
            Ok((original, branch))
        })?;

        let result = self.merge_after(&branch, &author, body);
        self.with_repo(|repo| Ok(repo.switch_branch(original.as_str()).map(drop)?))?;

        Ok(match result {
            Ok(commit) => {
                info!(branch = %branch, commit = ?commit.map(|id| id.short()), "branch transaction merged");
                BranchOutcome::Merged {
                    branch: branch.to_string(),
                    commit,
                }
            }
            Err(cause) => {
                warn!(branch = %branch, error = %cause, "branch transaction failed");
                BranchOutcome::Failed {
                    branch: branch.to_string(),
                    cause,
                }
            }
        })
    }

    fn merge_after<F>(
        &self,
        branch: &BranchName,
        author: &GitSignature,
        body: F,
    ) -> DatabaseResult<Option<CommitId>>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        self.transaction_outcome(body)?.into_result()?;
        let merged = self.with_repo(|repo| Ok(repo.merge_branch(branch.as_str(), None, author)?))?;
        Ok(merged.commit_id())
    }
}

/// Batch mode held for the duration of one block.
///
/// Dropped unfinished (error or panic), it puts the previous index back.
struct BatchScope<'db> {
    db: &'db Database,
    previous: Option<StagedIndex>,
    finished: bool,
}

impl<'db> BatchScope<'db> {
    fn new(db: &'db Database, previous: Option<StagedIndex>) -> Self {
        db.batch_depth().fetch_add(1, Ordering::SeqCst);
        Self {
            db,
            previous,
            finished: false,
        }
    }

    fn finish(&mut self) -> DatabaseResult<()> {
        self.finished = true;
        let previous = self.previous.take();
        self.db.with_repo(|repo| Ok(repo.end_batch(previous, true)?))
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        self.db.batch_depth().fetch_sub(1, Ordering::SeqCst);
        if self.finished {
            return;
        }
        let previous = self.previous.take();
        match self.db.with_repo(|repo| Ok(repo.end_batch(previous, false)?)) {
            Ok(()) | Err(DatabaseError::Closed) => {}
            Err(e) => warn!(error = %e, "failed to unwind batch"),
        }
    }
}

/// Swaps the connection actor for one call.
struct ActorGuard<'db> {
    db: &'db Database,
    previous: GitSignature,
}

impl<'db> ActorGuard<'db> {
    fn swap(db: &'db Database, actor: GitSignature) -> Self {
        let previous = db.actor();
        db.set_actor(actor);
        Self { db, previous }
    }
}

impl Drop for ActorGuard<'_> {
    fn drop(&mut self) {
        self.db.set_actor(self.previous.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, db)
    }

    fn commit_count(db: &Database) -> usize {
        db.history(usize::MAX).unwrap().len()
    }

    #[test]
    fn test_exec_commits_once() {
        let (_dir, db) = setup();
        let before = commit_count(&db);

        db.exec(|cmd| {
            cmd.add("a/x", "1\n")?;
            cmd.add("a/y", "2\n")
        })
        .unwrap();

        assert_eq!(commit_count(&db), before + 1);
        assert_eq!(db.object_data("a/x").unwrap(), Some(b"1\n".to_vec()));
        assert!(!db.is_staging());
    }

    #[test]
    fn test_exec_error_discards_changes() {
        let (_dir, db) = setup();
        let tip = db.tip().unwrap();

        let result: DatabaseResult<()> = db.exec(|cmd| {
            cmd.add("a/x", "1\n")?;
            Err(DatabaseError::InvalidConfig("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(db.tip().unwrap(), tip);
        assert!(!db.include("a/x").unwrap());
    }

    #[test]
    fn test_nested_units_make_one_commit() {
        let (_dir, db) = setup();
        let before = commit_count(&db);

        db.exec(|cmd| {
            cmd.add("one", "1\n")?;
            cmd.database().exec(|inner| {
                assert!(inner.is_nested());
                inner.add("two", "2\n")
            })?;
            cmd.database()
                .transaction(|tx| {
                    tx.add("three", "3\n")?;
                    Ok(())
                })
                .map(drop)
        })
        .unwrap();

        assert_eq!(commit_count(&db), before + 1);
        for path in ["one", "two", "three"] {
            assert!(db.include(path).unwrap(), "missing {}", path);
        }
    }

    #[test]
    fn test_rollback_leaves_no_change() {
        let (_dir, db) = setup();
        let tip = db.tip().unwrap();

        let committed = db
            .transaction(|tx| {
                tx.add("gone", "x\n")?;
                Err(tx.rollback("changed my mind"))
            })
            .unwrap();

        assert!(!committed);
        assert_eq!(db.tip().unwrap(), tip);
        assert!(!db.include("gone").unwrap());
    }

    #[test]
    fn test_nested_rollback_aborts_top_level_even_if_swallowed() {
        let (_dir, db) = setup();
        let tip = db.tip().unwrap();

        let outcome = db
            .transaction_outcome(|tx| {
                tx.add("outer", "1\n")?;
                let inner = tx.database().transaction(|inner| {
                    inner.add("inner", "2\n")?;
                    Err(inner.rollback("inner says no"))
                });
                assert!(inner.is_err());
                Ok(())
            })
            .unwrap();

        assert!(matches!(outcome, Outcome::Rollback(ref r) if r == "inner says no"));
        assert_eq!(db.tip().unwrap(), tip);
        assert!(!db.include("outer").unwrap());
    }

    #[test]
    fn test_failure_is_reported_unless_propagated() {
        let (_dir, db) = setup();

        let outcome = db
            .transaction_outcome(|_tx| Err(Abort::Fail(DatabaseError::InvalidConfig("bad".into()))))
            .unwrap();
        assert!(matches!(outcome, Outcome::Fail(DatabaseError::InvalidConfig(_))));

        let err = db
            .transaction(|tx| {
                tx.propagate();
                Err(Abort::Fail(DatabaseError::InvalidConfig("bad".into())))
            })
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidConfig(_)));
        assert!(!db.in_unit());
    }

    #[test]
    fn test_commit_message_and_author() {
        let (_dir, db) = setup();
        db.exec(|cmd| {
            cmd.set_message("custom message");
            cmd.set_author(GitSignature::new("Ann", "ann@example.com"));
            cmd.add("m", "1\n")
        })
        .unwrap();

        let last = &db.history(1).unwrap()[0];
        assert_eq!(last.message, "custom message");
        assert_eq!(last.author_name, "Ann");
    }

    #[test]
    fn test_empty_unit_makes_no_commit() {
        let (_dir, db) = setup();
        let tip = db.tip().unwrap();
        assert!(db.transaction(|_tx| Ok(())).unwrap());
        assert_eq!(db.tip().unwrap(), tip);
    }

    #[test]
    fn test_batch_failure_restores_previous_state() {
        let (_dir, db) = setup();
        let result: DatabaseResult<()> = db.batch(|| {
            db.exec(|cmd| cmd.add("kept", "1\n"))?;
            Err(DatabaseError::InvalidConfig("stop".into()))
        });
        assert!(result.is_err());
        // the inner exec committed before the failure
        assert!(db.include("kept").unwrap());
    }

    #[test]
    fn test_branch_and_merge_success() {
        let (_dir, db) = setup();
        let merged = db
            .try_branch_and_merge(Some("feature"), None, |tx| {
                tx.add("feature/flag", "on\n")?;
                Ok(())
            })
            .unwrap();

        assert!(merged.is_merged());
        assert_eq!(merged.branch(), "feature");
        assert_eq!(db.current_branch().unwrap().as_str(), "master");
        assert_eq!(db.object_data("feature/flag").unwrap(), Some(b"on\n".to_vec()));
    }

    #[test]
    fn test_branch_and_merge_failure_leaves_default_branch() {
        let (_dir, db) = setup();
        let tip = db.tip().unwrap();

        let ok = db
            .branch_and_merge(None, None, |tx| {
                tx.add("junk", "x\n")?;
                Err(Abort::Fail(DatabaseError::InvalidConfig("fail".into())))
            })
            .unwrap();

        assert!(!ok);
        assert_eq!(db.tip().unwrap(), tip);
        assert_eq!(db.current_branch().unwrap().as_str(), "master");
        assert!(!db.include("junk").unwrap());
    }

    #[test]
    fn test_branch_and_merge_rejects_nesting() {
        let (_dir, db) = setup();
        let err = db
            .exec(|cmd| cmd.database().branch_and_merge(None, None, |_tx| Ok(())))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NestedBranchTransaction));
    }

    #[test]
    fn test_branch_and_merge_restores_actor() {
        let (_dir, db) = setup();
        let before = db.actor();
        db.branch_and_merge(None, Some(GitSignature::new("Bob", "bob@example.com")), |tx| {
            assert_eq!(tx.database().actor().name, "Bob");
            tx.add("b", "1\n")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.actor(), before);
    }
}
