//! Typed child collections.

use std::sync::Arc;

use crate::model::class::{Fields, ModelClass};
use crate::model::error::ModelResult;
use crate::model::item::{ModelItem, Node, Parent};

/// The instances of one class under one parent, ordered by identifier.
pub struct ItemList {
    class: Arc<ModelClass>,
    parent: Node,
}

impl ItemList {
    pub fn new(class: Arc<ModelClass>, parent: Node) -> Self {
        Self { class, parent }
    }

    pub fn class(&self) -> &Arc<ModelClass> {
        &self.class
    }

    pub fn keys(&self) -> ModelResult<Vec<String>> {
        self.class.list(&self.parent)
    }

    pub fn count(&self) -> ModelResult<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> ModelResult<bool> {
        Ok(self.keys()?.is_empty())
    }

    pub fn get(&self, ident: &str) -> ModelResult<Option<ModelItem>> {
        self.class.instance(&self.parent, ident)
    }

    pub fn first(&self) -> ModelResult<Option<ModelItem>> {
        match self.keys()?.first() {
            Some(ident) => self.get(ident),
            None => Ok(None),
        }
    }

    pub fn last(&self) -> ModelResult<Option<ModelItem>> {
        match self.keys()?.last() {
            Some(ident) => self.get(ident),
            None => Ok(None),
        }
    }

    /// Call `f` with every member, in identifier order. Stops at the first error.
    pub fn each<F>(&self, mut f: F) -> ModelResult<()>
    where
        F: FnMut(ModelItem) -> ModelResult<()>,
    {
        for ident in self.keys()? {
            if let Some(item) = self.get(&ident)? {
                f(item)?;
            }
        }
        Ok(())
    }

    /// Create a new member through the class's create protocol.
    pub fn add(&self, fields: &Fields) -> ModelResult<ModelItem> {
        let path = self.class.create(&self.parent, fields)?;
        self.class.open(self.parent.model(), &path)
    }

    /// Delete a member. Returns false if there was none.
    pub fn delete(&self, ident: &str) -> ModelResult<bool> {
        match self.get(ident)? {
            Some(mut item) => {
                item.delete()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
