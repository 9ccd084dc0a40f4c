//! A model: a connection, a schema and a name.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{Database, DatabaseError, DatabaseResult, RepoConfig};
use crate::model::class::{ModelClass, Schema};
use crate::model::error::{ModelError, ModelResult};
use crate::model::item::{ModelItem, Node};
use crate::model::proxy::ItemRef;
use crate::storage::{EntryKind, GitSignature};
use crate::transaction::{Abort, Command, Transaction};

/// Entry point of the schema layer. Cheap to clone.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

struct ModelInner {
    db: Database,
    name: String,
    schema: Arc<Schema>,
}

impl Model {
    pub fn new(db: Database, name: impl Into<String>, schema: impl Into<Arc<Schema>>) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                db,
                name: name.into(),
                schema: schema.into(),
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn class(&self, name: &str) -> ModelResult<Arc<ModelClass>> {
        self.inner.schema.class(name)
    }

    /// Parent for top-level instances.
    pub fn root(&self) -> Node {
        Node::new(self.clone(), "")
    }

    /// Settings in the `model-<name>` section of the repository config.
    pub fn config(&self) -> RepoConfig {
        RepoConfig::new(self.inner.db.clone(), format!("model-{}", self.inner.name))
    }

    // ==================== Store ====================

    pub fn include(&self, path: &str) -> ModelResult<bool> {
        Ok(self.inner.db.include(path)?)
    }

    /// Names of the subtrees under `path`, sorted.
    pub fn list_children(&self, path: &str) -> ModelResult<Vec<String>> {
        Ok(self
            .inner
            .db
            .list(path)?
            .into_iter()
            .filter(|(_, kind)| *kind == EntryKind::Tree)
            .map(|(name, _)| name)
            .collect())
    }

    pub fn add_item(&self, path: &str, data: impl Into<Vec<u8>>) -> ModelResult<()> {
        Ok(self.inner.db.add(path, data)?)
    }

    pub fn get_item(&self, path: &str) -> ModelResult<Option<Vec<u8>>> {
        Ok(self.inner.db.object_data(path)?)
    }

    pub fn delete_item(&self, path: &str) -> ModelResult<()> {
        Ok(self.inner.db.delete(path)?)
    }

    // ==================== Units of work ====================

    pub fn exec<T, F>(&self, body: F) -> ModelResult<T>
    where
        F: FnOnce(&mut Command<'_>) -> DatabaseResult<T>,
    {
        Ok(self.inner.db.exec(body)?)
    }

    pub fn transaction<F>(&self, body: F) -> ModelResult<bool>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        Ok(self.inner.db.transaction(body)?)
    }

    /// Transaction on its own branch, merged into the default branch.
    pub fn branched_transaction<F>(
        &self,
        name: Option<&str>,
        actor: Option<GitSignature>,
        body: F,
    ) -> ModelResult<bool>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), Abort>,
    {
        Ok(self.inner.db.branch_and_merge(name, actor, body)?)
    }

    pub fn batch<T, F>(&self, f: F) -> ModelResult<T>
    where
        F: FnOnce() -> ModelResult<T>,
    {
        Ok(self.inner.db.batch(|| f().map_err(DatabaseError::from))?)
    }

    /// Handle for the instance a reference points at.
    pub fn resolve(&self, target: &ItemRef) -> ModelResult<ModelItem> {
        self.class(&target.class)?
            .open(self, &target.path)
            .map_err(|e| match e {
                ModelError::InvalidPath(_) | ModelError::InvalidInstance(_) => ModelError::BrokenLink {
                    property: target.class.clone(),
                    path: target.path.clone(),
                },
                other => other,
            })
    }

    /// Every instance path of `class` under the root, keyed by identifier.
    pub fn instances(&self, class: &str) -> ModelResult<BTreeMap<String, String>> {
        let class = self.class(class)?;
        let root = self.root();
        class
            .list(&root)?
            .into_iter()
            .map(|ident| {
                let path = class.instance_path(&root, &ident)?;
                Ok((ident, path))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Fields, ModelClass};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Model) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let note = ModelClass::builder("note").text("body").build().unwrap();
        (dir, Model::new(db, "notes", Schema::new().with(note).unwrap()))
    }

    #[test]
    fn test_raw_items() {
        let (_dir, model) = setup();
        model.add_item("misc/a", "1\n").unwrap();
        assert!(model.include("misc/a").unwrap());
        assert_eq!(model.get_item("misc/a").unwrap(), Some(b"1\n".to_vec()));
        model.delete_item("misc/a").unwrap();
        assert!(!model.include("misc/a").unwrap());
    }

    #[test]
    fn test_config_section() {
        let (_dir, model) = setup();
        let config = model.config();
        assert_eq!(config.section(), "model-notes");
        config.set("owner", "ann").unwrap();
        assert_eq!(model.config().get("owner").unwrap(), "ann");
        assert_eq!(model.db().config().get("owner").unwrap(), "");
    }

    #[test]
    fn test_resolve() {
        let (_dir, model) = setup();
        let notes = model.class("note").unwrap();
        notes
            .create(&model.root(), &Fields::ident("n1").with("body", "hello"))
            .unwrap();

        let mut item = model.resolve(&ItemRef::new("note", "note/n1")).unwrap();
        assert_eq!(item.property("body").unwrap().as_deref(), Some("hello"));
        assert!(matches!(
            model.resolve(&ItemRef::new("note", "note/none")),
            Err(ModelError::BrokenLink { .. })
        ));
        assert!(matches!(
            model.resolve(&ItemRef::new("ghost", "ghost/1")),
            Err(ModelError::UnknownClass(_))
        ));
        assert_eq!(model.instances("note").unwrap().get("n1").map(String::as_str), Some("note/n1"));
    }

    #[test]
    fn test_batch_surfaces_model_error() {
        let (_dir, model) = setup();
        let err = model
            .batch(|| -> ModelResult<()> { Err(ModelError::UnknownClass("x".into())) })
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownClass(_)));
    }

    #[test]
    fn test_branched_transaction_rejects_nesting() {
        let (_dir, model) = setup();
        let inner = model.clone();
        let err = model
            .exec(|_cmd| {
                inner.branched_transaction(None, None, |_tx| Ok(()))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::Database(ref e) if matches!(**e, DatabaseError::NestedBranchTransaction)
        ));
    }
}
