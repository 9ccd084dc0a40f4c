//! Instance handles.
//!
//! A `ModelItem` is valid while its backing path exists. Once it has been
//! deleted (through this handle or any other way) the handle stays invalid
//! for good, even if something is later stored at the same path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::model::class::ModelClass;
use crate::model::error::{ModelError, ModelResult};
use crate::model::list::ItemList;
use crate::model::model::Model;
use crate::model::property::{self, PropertyDef, PropertyValue};
use crate::model::proxy::{ItemRef, ProxyItemList};

/// Something instances can be created under: the root or another instance.
pub trait Parent {
    fn model(&self) -> &Model;

    /// path children are placed under; empty at the root
    fn base_path(&self) -> ModelResult<String>;
}

/// A plain location in the store used as a parent.
#[derive(Clone)]
pub struct Node {
    model: Model,
    path: String,
}

impl Node {
    pub fn new(model: Model, path: impl Into<String>) -> Self {
        Self {
            model,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Parent for Node {
    fn model(&self) -> &Model {
        &self.model
    }

    fn base_path(&self) -> ModelResult<String> {
        Ok(self.path.clone())
    }
}

/// Handle to one stored instance.
#[derive(Clone)]
pub struct ModelItem {
    model: Model,
    class: Arc<ModelClass>,
    path: String,
    /// stored text, exactly as read or written
    text_cache: HashMap<String, String>,
    /// decoded values from typed reads and writes
    value_cache: HashMap<String, PropertyValue>,
    deleted: bool,
}

impl ModelItem {
    pub(crate) fn new(model: Model, class: Arc<ModelClass>, path: String) -> Self {
        Self {
            model,
            class,
            path,
            text_cache: HashMap::new(),
            value_cache: HashMap::new(),
            deleted: false,
        }
    }

    pub fn ident(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn class(&self) -> &Arc<ModelClass> {
        &self.class
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.class.name(), &self.path)
    }

    /// false once the backing entity is gone
    pub fn is_valid(&mut self) -> bool {
        self.ensure_valid().is_ok()
    }

    fn ensure_valid(&mut self) -> ModelResult<()> {
        if !self.deleted && !self.model.include(&self.path)? {
            self.deleted = true;
            self.clear_cache();
        }
        if self.deleted {
            return Err(ModelError::InvalidInstance(self.path.clone()));
        }
        Ok(())
    }

    /// Validity check for shared handles; does not latch the deleted state.
    pub(crate) fn check_valid(&self) -> ModelResult<()> {
        if self.deleted || !self.model.include(&self.path)? {
            return Err(ModelError::InvalidInstance(self.path.clone()));
        }
        Ok(())
    }

    fn property_path(&self, name: &str) -> String {
        format!("{}/{}", self.path, name)
    }

    // ==================== Reads ====================

    /// Raw text of a property, without its trailing newline.
    pub fn property(&mut self, name: &str) -> ModelResult<Option<String>> {
        self.ensure_valid()?;
        self.text(name)
    }

    fn text(&mut self, name: &str) -> ModelResult<Option<String>> {
        if let Some(cached) = self.text_cache.get(name) {
            return Ok(Some(cached.clone()));
        }
        let def = self.class.property(name)?.clone();
        let Some(raw) = self.model.get_item(&self.property_path(name))? else {
            return Ok(None);
        };
        let text = def.decode_text(raw).map_err(|raw| ModelError::Decode {
            property: name.to_string(),
            value: String::from_utf8_lossy(&raw).into_owned(),
            expected: "UTF-8 text",
        })?;
        self.text_cache.insert(name.to_string(), text.clone());
        Ok(Some(text))
    }

    /// Property bytes: raw for binary properties, minus the newline otherwise.
    pub fn binary_property(&mut self, name: &str) -> ModelResult<Option<Vec<u8>>> {
        self.ensure_valid()?;
        if let Some(PropertyValue::Bytes(bytes)) = self.value_cache.get(name) {
            return Ok(Some(bytes.clone()));
        }
        let def = self.class.property(name)?.clone();
        let Some(raw) = self.model.get_item(&self.property_path(name))? else {
            return Ok(None);
        };
        let bytes = def.decode_bytes(raw);
        if def.is_binary() {
            self.value_cache
                .insert(name.to_string(), PropertyValue::Bytes(bytes.clone()));
        }
        Ok(Some(bytes))
    }

    fn typed<T>(
        &mut self,
        name: &str,
        expected: &'static str,
        cached: impl Fn(&PropertyValue) -> Option<T>,
        parse: impl Fn(&str) -> Option<T>,
        wrap: impl Fn(&T) -> PropertyValue,
    ) -> ModelResult<Option<T>> {
        self.ensure_valid()?;
        if let Some(value) = self.value_cache.get(name).and_then(&cached) {
            return Ok(Some(value));
        }
        let Some(text) = self.text(name)? else {
            return Ok(None);
        };
        let value = parse(&text).ok_or_else(|| ModelError::Decode {
            property: name.to_string(),
            value: text,
            expected,
        })?;
        self.value_cache.insert(name.to_string(), wrap(&value));
        Ok(Some(value))
    }

    pub fn integer_property(&mut self, name: &str) -> ModelResult<Option<i64>> {
        self.typed(
            name,
            "integer",
            |v| match v {
                PropertyValue::Int(i) => Some(*i),
                _ => None,
            },
            property::parse_int,
            |i| PropertyValue::Int(*i),
        )
    }

    pub fn float_property(&mut self, name: &str) -> ModelResult<Option<f64>> {
        self.typed(
            name,
            "float",
            |v| match v {
                PropertyValue::Float(f) => Some(*f),
                _ => None,
            },
            property::parse_float,
            |f| PropertyValue::Float(*f),
        )
    }

    pub fn bool_property(&mut self, name: &str) -> ModelResult<Option<bool>> {
        self.typed(
            name,
            "boolean",
            |v| match v {
                PropertyValue::Bool(b) => Some(*b),
                _ => None,
            },
            property::parse_bool,
            |b| PropertyValue::Bool(*b),
        )
    }

    pub fn ts_property(&mut self, name: &str) -> ModelResult<Option<DateTime<Utc>>> {
        self.typed(
            name,
            "RFC 3339 timestamp",
            |v| match v {
                PropertyValue::Timestamp(ts) => Some(*ts),
                _ => None,
            },
            property::parse_timestamp,
            |ts| PropertyValue::Timestamp(*ts),
        )
    }

    pub fn array_property(&mut self, name: &str) -> ModelResult<Option<Vec<String>>> {
        self.typed(
            name,
            "array",
            |v| match v {
                PropertyValue::Array(items) => Some(items.clone()),
                _ => None,
            },
            |text| Some(property::parse_array(text)),
            |items| PropertyValue::Array(items.clone()),
        )
    }

    pub fn map_property(&mut self, name: &str) -> ModelResult<Option<BTreeMap<String, String>>> {
        self.typed(
            name,
            "JSON object",
            |v| match v {
                PropertyValue::Map(map) => Some(map.clone()),
                _ => None,
            },
            property::parse_map,
            |map| PropertyValue::Map(map.clone()),
        )
    }

    /// The instance a link property points at.
    ///
    /// A missing, empty or unreadable target is `BrokenLink`.
    pub fn link_property(&mut self, name: &str) -> ModelResult<ModelItem> {
        self.ensure_valid()?;
        let def = self.class.property(name)?;
        let class_name = def.link_class().map(str::to_string).ok_or_else(|| ModelError::Decode {
            property: name.to_string(),
            value: String::new(),
            expected: "link",
        })?;
        let target = self.text(name)?.unwrap_or_default();
        let broken = || ModelError::BrokenLink {
            property: name.to_string(),
            path: target.clone(),
        };
        if target.is_empty() {
            return Err(broken());
        }
        let class = self.model.class(&class_name)?;
        class.open(&self.model, &target).map_err(|e| match e {
            ModelError::InvalidPath(_) | ModelError::InvalidInstance(_) => broken(),
            other => other,
        })
    }

    /// Names of the declared properties that have a stored value.
    pub fn properties(&mut self) -> ModelResult<Vec<String>> {
        self.ensure_valid()?;
        let present = self.model.db().list_blobs(&self.path)?;
        Ok(self
            .class
            .properties()
            .iter()
            .map(PropertyDef::name)
            .filter(|name| present.iter().any(|p| p == name))
            .map(str::to_string)
            .collect())
    }

    /// Stored text of the properties read or written through this handle.
    pub fn property_cache(&self) -> &HashMap<String, String> {
        &self.text_cache
    }

    pub fn clear_cache(&mut self) {
        self.text_cache.clear();
        self.value_cache.clear();
    }

    // ==================== Writes ====================

    /// Validate, write through a Command and update the cached value.
    pub fn set_property(&mut self, name: &str, value: impl Into<PropertyValue>) -> ModelResult<()> {
        self.ensure_valid()?;
        let value = value.into();
        let def = self.class.property(name)?;
        let bytes = def
            .encode(&value)
            .ok_or_else(|| self.class.invalid_value(def, &value))?;

        let text = if def.is_binary() {
            None
        } else {
            def.decode_text(bytes.clone()).ok()
        };

        let path = self.property_path(name);
        self.model.exec(|cmd| cmd.add(&path, bytes))?;
        match text {
            Some(text) => self.text_cache.insert(name.to_string(), text),
            None => self.text_cache.remove(name),
        };
        self.value_cache.insert(name.to_string(), value);
        Ok(())
    }

    /// Remove the instance's whole subtree. The handle is invalid afterwards.
    pub fn delete(&mut self) -> ModelResult<()> {
        self.ensure_valid()?;
        let path = self.path.clone();
        self.model.exec(|cmd| cmd.delete(&path))?;
        self.deleted = true;
        self.clear_cache();
        Ok(())
    }

    // ==================== Children ====================

    /// Typed children of `class` stored under this instance.
    pub fn children(&mut self, class: &str) -> ModelResult<ItemList> {
        self.ensure_valid()?;
        let class = self.model.class(class)?;
        Ok(ItemList::new(class, Node::new(self.model.clone(), &self.path)))
    }

    /// Links to instances of `class`, stored under `<this>/<class>`.
    pub fn proxies(&mut self, class: &str) -> ModelResult<ProxyItemList> {
        self.ensure_valid()?;
        let class = self.model.class(class)?;
        Ok(ProxyItemList::new(self.model.clone(), class, &self.path))
    }
}

impl Parent for ModelItem {
    fn model(&self) -> &Model {
        &self.model
    }

    fn base_path(&self) -> ModelResult<String> {
        self.check_valid()?;
        Ok(self.path.clone())
    }
}

impl std::fmt::Debug for ModelItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelItem")
            .field("class", &self.class.name())
            .field("path", &self.path)
            .field("deleted", &self.deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::model::{Fields, Schema};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Model) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let record = ModelClass::builder("record")
            .text("name")
            .text("count")
            .text("ratio")
            .text("done")
            .text("when")
            .text("tags")
            .text("attrs")
            .binary("payload")
            .link("owner", "user")
            .build()
            .unwrap();
        let user = ModelClass::builder("user").text("email").build().unwrap();
        let schema = Schema::new().with(record).unwrap().with(user).unwrap();
        (dir, Model::new(db, "items", schema))
    }

    fn create(model: &Model, class: &str, fields: Fields) -> ModelItem {
        let class = model.class(class).unwrap();
        let root = model.root();
        let path = class.create(&root, &fields).unwrap();
        class.open(model, &path).unwrap()
    }

    #[test]
    fn test_typed_properties_round_trip() {
        let (_dir, model) = setup();
        let mut item = create(&model, "record", Fields::ident("r1").with("name", "first"));

        let when = Utc.with_ymd_and_hms(2023, 7, 1, 8, 0, 0).unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert("k".to_string(), "v".to_string());

        item.set_property("count", 7i64).unwrap();
        item.set_property("ratio", 2.5f64).unwrap();
        item.set_property("done", true).unwrap();
        item.set_property("when", when).unwrap();
        item.set_property("tags", vec!["x", "y"]).unwrap();
        item.set_property("attrs", attrs.clone()).unwrap();
        item.set_property("payload", vec![0u8, 255, 10]).unwrap();

        // a fresh handle reads from the store, not the cache
        let mut fresh = model.class("record").unwrap().open(&model, item.path()).unwrap();
        assert_eq!(fresh.property("name").unwrap().as_deref(), Some("first"));
        assert_eq!(fresh.integer_property("count").unwrap(), Some(7));
        assert_eq!(fresh.float_property("ratio").unwrap(), Some(2.5));
        assert_eq!(fresh.bool_property("done").unwrap(), Some(true));
        assert_eq!(fresh.ts_property("when").unwrap(), Some(when));
        assert_eq!(fresh.array_property("tags").unwrap(), Some(vec!["x".to_string(), "y".to_string()]));
        assert_eq!(fresh.map_property("attrs").unwrap(), Some(attrs));
        assert_eq!(fresh.binary_property("payload").unwrap(), Some(vec![0u8, 255, 10]));
        assert_eq!(fresh.property("ratio").unwrap().as_deref(), Some("2.5"));
    }

    #[test]
    fn test_cache_is_per_handle() {
        let (_dir, model) = setup();
        let mut a = create(&model, "record", Fields::ident("r1").with("name", "one"));
        let mut b = model.class("record").unwrap().open(&model, a.path()).unwrap();

        assert_eq!(b.property("name").unwrap().as_deref(), Some("one"));
        a.set_property("name", "two").unwrap();
        assert_eq!(b.property("name").unwrap().as_deref(), Some("one"));

        b.clear_cache();
        assert_eq!(b.property("name").unwrap().as_deref(), Some("two"));
        assert!(b.property_cache().contains_key("name"));
    }

    #[test]
    fn test_typed_reads_keep_stored_text() {
        let (_dir, model) = setup();
        let mut item = create(
            &model,
            "record",
            Fields::ident("r1")
                .with("count", "007")
                .with("when", "2024-01-01T00:00:00+02:00"),
        );

        assert_eq!(item.property("count").unwrap().as_deref(), Some("007"));
        assert_eq!(item.integer_property("count").unwrap(), Some(7));
        assert_eq!(item.property("count").unwrap().as_deref(), Some("007"));

        let when = Utc.with_ymd_and_hms(2023, 12, 31, 22, 0, 0).unwrap();
        assert_eq!(item.ts_property("when").unwrap(), Some(when));
        assert_eq!(
            item.property("when").unwrap().as_deref(),
            Some("2024-01-01T00:00:00+02:00")
        );
        assert_eq!(item.integer_property("count").unwrap(), Some(7));
    }

    #[test]
    fn test_decode_error() {
        let (_dir, model) = setup();
        let mut item = create(&model, "record", Fields::ident("r1").with("count", "lots"));
        assert!(matches!(
            item.integer_property("count"),
            Err(ModelError::Decode { expected: "integer", .. })
        ));
    }

    #[test]
    fn test_unknown_property_and_invalid_value() {
        let (_dir, model) = setup();
        let mut item = create(&model, "record", Fields::ident("r1").with("name", "n"));
        assert!(matches!(item.property("nope"), Err(ModelError::UnknownProperty { .. })));
        assert!(matches!(
            item.set_property("tags", vec!["bad\nvalue"]),
            Err(ModelError::InvalidPropertyValue { .. })
        ));
        assert_eq!(item.properties().unwrap(), vec!["name"]);
    }

    #[test]
    fn test_link_property() {
        let (_dir, model) = setup();
        let user = create(&model, "user", Fields::ident("ann").with("email", "ann@example.com"));
        let mut record = create(&model, "record", Fields::ident("r1").with("name", "n"));

        assert!(matches!(
            record.link_property("owner"),
            Err(ModelError::BrokenLink { .. })
        ));

        record.set_property("owner", user.item_ref()).unwrap();
        let mut owner = record.link_property("owner").unwrap();
        assert_eq!(owner.path(), "user/ann");
        assert_eq!(owner.property("email").unwrap().as_deref(), Some("ann@example.com"));

        record.set_property("owner", "user/ghost").unwrap();
        assert!(matches!(
            record.link_property("owner"),
            Err(ModelError::BrokenLink { ref path, .. }) if path == "user/ghost"
        ));
    }

    #[test]
    fn test_deleted_handle_rejects_everything() {
        let (_dir, model) = setup();
        let mut item = create(&model, "record", Fields::ident("r1").with("name", "n"));
        let mut other = model.class("record").unwrap().open(&model, "record/r1").unwrap();

        item.delete().unwrap();
        assert!(!item.is_valid());
        assert!(matches!(item.property("name"), Err(ModelError::InvalidInstance(_))));
        assert!(matches!(item.set_property("name", "x"), Err(ModelError::InvalidInstance(_))));
        assert!(matches!(item.delete(), Err(ModelError::InvalidInstance(_))));
        assert!(matches!(other.property("name"), Err(ModelError::InvalidInstance(_))));

        // recreating the path does not revive old handles
        create(&model, "record", Fields::ident("r1").with("name", "again"));
        assert!(matches!(item.property("name"), Err(ModelError::InvalidInstance(_))));
        assert!(model.class("record").unwrap().list(&model.root()).unwrap() == vec!["r1"]);
    }
}
