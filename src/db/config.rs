//! Key/value settings kept in the repository's own git config.
//!
//! Each consumer gets a section: `git-ds` for the connection and
//! `model-<name>` for a model. Keys are cleaned so any string can be used.

use git2::ErrorCode;

use crate::db::{Database, DatabaseResult};
use crate::storage::StorageError;

/// A namespaced view of the repository git config.
#[derive(Clone)]
pub struct RepoConfig {
    db: Database,
    section: String,
}

impl RepoConfig {
    pub const DEFAULT_SECTION: &'static str = "git-ds";

    pub fn new(db: Database, section: impl AsRef<str>) -> Self {
        Self {
            db,
            section: clean_key(section.as_ref()),
        }
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    /// Value of `key`, or `""` when it is not set.
    pub fn get(&self, key: &str) -> DatabaseResult<String> {
        self.get_or(key, "")
    }

    pub fn get_or(&self, key: &str, default: &str) -> DatabaseResult<String> {
        let name = self.full_key(key);
        self.db.with_repo(|repo| {
            let config = repo.git().config().map_err(StorageError::from)?;
            match config.get_string(&name) {
                Ok(value) => Ok(value),
                Err(e) if e.code() == ErrorCode::NotFound => Ok(default.to_string()),
                Err(e) => Err(StorageError::from(e).into()),
            }
        })
    }

    pub fn set(&self, key: &str, value: &str) -> DatabaseResult<()> {
        let name = self.full_key(key);
        self.db.with_repo(|repo| {
            let mut config = repo.git().config().map_err(StorageError::from)?;
            config.set_str(&name, value).map_err(StorageError::from)?;
            Ok(())
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}.{}", self.section, clean_key(key))
    }
}

/// Replace every character outside `[A-Za-z0-9-]` with `-`.
pub fn clean_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clean_key() {
        assert_eq!(clean_key("user name"), "user-name");
        assert_eq!(clean_key("a.b_c/d"), "a-b-c-d");
        assert_eq!(clean_key("ok-123"), "ok-123");
    }

    #[test]
    fn test_get_set() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let config = db.config();

        assert_eq!(config.get("missing").unwrap(), "");
        assert_eq!(config.get_or("missing", "fallback").unwrap(), "fallback");

        config.set("owner", "alice").unwrap();
        assert_eq!(config.get("owner").unwrap(), "alice");
    }

    #[test]
    fn test_sections_are_separate() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let a = RepoConfig::new(db.clone(), "model-a");
        let b = RepoConfig::new(db, "model-b");

        a.set("k", "1").unwrap();
        assert_eq!(a.get("k").unwrap(), "1");
        assert_eq!(b.get("k").unwrap(), "");
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.config().set("answer", "42").unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.config().get("answer").unwrap(), "42");
    }
}
