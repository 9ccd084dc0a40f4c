//! Typed references and link collections.
//!
//! A link is stored as the target's path followed by `"\n"`. A proxy
//! collection keeps one such link per member at `<owner>/<class>/<ident>`,
//! so removing a member never touches the member itself.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::class::ModelClass;
use crate::model::error::{ModelError, ModelResult};
use crate::model::item::ModelItem;
use crate::model::model::Model;

/// Reference to an instance: its class and path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub class: String,
    pub path: String,
}

impl ItemRef {
    pub fn new(class: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            path: path.into(),
        }
    }

    pub fn ident(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.path)
    }
}

/// Links to instances of one class, keyed by the member's identifier.
pub struct ProxyItemList {
    model: Model,
    class: Arc<ModelClass>,
    base: String,
}

impl ProxyItemList {
    /// Collection stored under `<owner>/<class name>`.
    pub fn new(model: Model, class: Arc<ModelClass>, owner: &str) -> Self {
        let base = if owner.is_empty() {
            class.name().to_string()
        } else {
            format!("{}/{}", owner, class.name())
        };
        Self { model, class, base }
    }

    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// Member identifiers, sorted.
    pub fn keys(&self) -> ModelResult<Vec<String>> {
        Ok(self.model.db().list_blobs(&self.base)?)
    }

    pub fn count(&self) -> ModelResult<usize> {
        Ok(self.keys()?.len())
    }

    pub fn contains(&self, ident: &str) -> ModelResult<bool> {
        Ok(self.model.get_item(&self.entry_path(ident))?.is_some())
    }

    /// Resolve the member `ident`. A link that no longer resolves is `BrokenLink`.
    pub fn get(&self, ident: &str) -> ModelResult<Option<ModelItem>> {
        let entry = self.entry_path(ident);
        let Some(raw) = self.model.get_item(&entry)? else {
            return Ok(None);
        };
        let target = String::from_utf8_lossy(&raw).trim_end_matches('\n').to_string();
        let broken = || ModelError::BrokenLink {
            property: entry.clone(),
            path: target.clone(),
        };
        if target.is_empty() {
            return Err(broken());
        }
        self.class
            .open(&self.model, &target)
            .map(Some)
            .map_err(|e| match e {
                ModelError::InvalidPath(_) | ModelError::InvalidInstance(_) => broken(),
                other => other,
            })
    }

    /// Link `item` into the collection under its identifier. The item must
    /// still exist.
    pub fn add(&self, item: &ModelItem) -> ModelResult<()> {
        item.check_valid()?;
        if item.class().name() != self.class.name() {
            return Err(ModelError::ClassMismatch {
                expected: self.class.name().to_string(),
                found: item.class().name().to_string(),
            });
        }
        let entry = self.entry_path(item.ident());
        let link = format!("{}\n", item.path());
        self.model.exec(|cmd| cmd.add(&entry, link))
    }

    /// Remove the link to `ident`. Returns false if there was none.
    pub fn delete(&self, ident: &str) -> ModelResult<bool> {
        if !self.contains(ident)? {
            return Ok(false);
        }
        let entry = self.entry_path(ident);
        self.model.exec(|cmd| cmd.delete(&entry))?;
        Ok(true)
    }

    fn entry_path(&self, ident: &str) -> String {
        format!("{}/{}", self.base, ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::model::{Fields, Schema};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Model) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let user = ModelClass::builder("user").text("email").build().unwrap();
        let team = ModelClass::builder("team").text("title").build().unwrap();
        let schema = Schema::new().with(user).unwrap().with(team).unwrap();
        (dir, Model::new(db, "dir", schema))
    }

    fn make(model: &Model, class: &str, ident: &str) -> ModelItem {
        let class = model.class(class).unwrap();
        let fields = Fields::ident(ident).with("email", format!("{}@example.com", ident)).with("title", ident);
        let path = class.create(&model.root(), &fields).unwrap();
        class.open(model, &path).unwrap()
    }

    #[test]
    fn test_item_ref_serde() {
        let r = ItemRef::new("user", "user/ann");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(serde_json::from_str::<ItemRef>(&json).unwrap(), r);
        assert_eq!(r.ident(), "ann");
    }

    #[test]
    fn test_links_resolve_and_break() {
        let (_dir, model) = setup();
        let mut team = make(&model, "team", "core");
        let ann = make(&model, "user", "ann");
        let mut bob = make(&model, "user", "bob");

        let members = team.proxies("user").unwrap();
        members.add(&bob).unwrap();
        members.add(&ann).unwrap();
        assert_eq!(members.base_path(), "team/core/user");
        assert_eq!(members.keys().unwrap(), vec!["ann", "bob"]);
        assert_eq!(model.get_item("team/core/user/ann").unwrap(), Some(b"user/ann\n".to_vec()));

        let mut resolved = members.get("ann").unwrap().unwrap();
        assert_eq!(resolved.property("email").unwrap().as_deref(), Some("ann@example.com"));
        assert!(members.get("carol").unwrap().is_none());

        bob.delete().unwrap();
        assert!(matches!(members.get("bob"), Err(ModelError::BrokenLink { .. })));

        assert!(members.delete("bob").unwrap());
        assert!(!members.contains("bob").unwrap());
        assert_eq!(members.count().unwrap(), 1);
    }

    #[test]
    fn test_add_rejects_other_classes() {
        let (_dir, model) = setup();
        let mut team = make(&model, "team", "core");
        let other = make(&model, "team", "other");
        let members = team.proxies("user").unwrap();
        assert!(matches!(members.add(&other), Err(ModelError::ClassMismatch { .. })));
    }

    #[test]
    fn test_add_rejects_deleted_items() {
        let (_dir, model) = setup();
        let mut team = make(&model, "team", "core");
        let mut gone = make(&model, "user", "gone");
        let stale = gone.clone();
        gone.delete().unwrap();

        let members = team.proxies("user").unwrap();
        assert!(matches!(members.add(&gone), Err(ModelError::InvalidInstance(_))));
        assert!(matches!(members.add(&stale), Err(ModelError::InvalidInstance(_))));
        assert!(!members.contains("gone").unwrap());
        assert_eq!(members.count().unwrap(), 0);
    }
}
