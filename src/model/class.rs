//! Model classes and the schema registry.
//!
//! A `ModelClass` is built once, registered in a `Schema`, and never
//! changes afterwards. Instances live at
//!
//! ```text
//! <parent path>/<class name>/<ident>/<property>
//! ```
//!
//! where the parent path is empty for top-level instances.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::model::error::{ModelError, ModelResult};
use crate::model::item::{ModelItem, Node, Parent};
use crate::model::model::Model;
use crate::model::property::{PropertyDef, PropertyValue};

/// Field values passed to `ModelClass::create`.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    values: BTreeMap<String, PropertyValue>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(name, value);
        self
    }

    /// shorthand for the default identifier field
    pub fn ident(value: impl Into<String>) -> Self {
        let ident: String = value.into();
        Self::new().with(ModelClass::DEFAULT_IDENT_KEY, ident)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// What a fill hook sees while an instance is being created.
pub struct FillContext<'a> {
    pub model: &'a Model,
    pub class: &'a ModelClass,
    /// instance path
    pub path: &'a str,
    pub ident: &'a str,
    pub fields: &'a Fields,
}

impl FillContext<'_> {
    /// The instance being filled, as a parent for child classes.
    pub fn node(&self) -> Node {
        Node::new(self.model.clone(), self.path)
    }
}

pub type FillHook = Arc<dyn Fn(&FillContext<'_>) -> ModelResult<()> + Send + Sync>;
pub type IdentFn = Arc<dyn Fn(&Fields) -> Option<String> + Send + Sync>;

#[derive(Clone)]
enum IdentRule {
    Key(String),
    Custom(IdentFn),
}

/// An entity type: name, ordered properties, identifier rule, fill hooks.
pub struct ModelClass {
    name: String,
    properties: Vec<PropertyDef>,
    ident: IdentRule,
    before_fill: Vec<FillHook>,
    after_fill: Vec<FillHook>,
}

impl fmt::Debug for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelClass")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl ModelClass {
    pub const DEFAULT_IDENT_KEY: &'static str = "ident";

    pub fn builder(name: impl Into<String>) -> ModelClassBuilder {
        ModelClassBuilder {
            name: name.into(),
            properties: Vec::new(),
            ident: IdentRule::Key(Self::DEFAULT_IDENT_KEY.to_string()),
            before_fill: Vec::new(),
            after_fill: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> ModelResult<&PropertyDef> {
        self.properties
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ModelError::UnknownProperty {
                class: self.name.clone(),
                property: name.to_string(),
            })
    }

    // ==================== Paths ====================

    /// `<parent>/<class name>`, or just the class name at the root.
    pub fn class_path(&self, parent: &dyn Parent) -> ModelResult<String> {
        let base = parent.base_path()?;
        Ok(if base.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", base, self.name)
        })
    }

    pub fn instance_path(&self, parent: &dyn Parent, ident: &str) -> ModelResult<String> {
        check_component(ident)?;
        Ok(format!("{}/{}", self.class_path(parent)?, ident))
    }

    /// Identifier of the instance `fields` would create.
    pub fn ident_for(&self, fields: &Fields) -> ModelResult<String> {
        let ident = match &self.ident {
            IdentRule::Key(key) => fields.get(key).and_then(PropertyValue::to_text),
            IdentRule::Custom(f) => f(fields),
        };
        let ident = ident.unwrap_or_default();
        check_component(&ident)?;
        Ok(ident)
    }

    // ==================== Create ====================

    /// Create an instance under `parent` inside a transaction and return its
    /// path. Inside an enclosing unit of work the write joins that unit.
    pub fn create(&self, parent: &dyn Parent, fields: &Fields) -> ModelResult<String> {
        let ident = self.ident_for(fields)?;
        let path = self.instance_path(parent, &ident)?;
        let model = parent.model();
        let ctx = FillContext {
            model,
            class: self,
            path: &path,
            ident: &ident,
            fields,
        };

        model
            .db()
            .transaction_outcome(|tx| {
                tx.propagate();
                self.fill(&ctx)?;
                Ok(())
            })?
            .into_result()?;

        debug!(class = %self.name, path = %path, "created instance");
        Ok(path)
    }

    /// Write every declared property: the supplied value, else the default,
    /// else nothing. Runs the fill hooks around it.
    pub fn fill(&self, ctx: &FillContext<'_>) -> ModelResult<()> {
        for hook in &self.before_fill {
            hook(ctx)?;
        }

        let mut writes = Vec::new();
        for def in &self.properties {
            let Some(value) = ctx.fields.get(def.name()).or_else(|| def.default()) else {
                continue;
            };
            let bytes = def
                .encode(value)
                .ok_or_else(|| self.invalid_value(def, value))?;
            writes.push((format!("{}/{}", ctx.path, def.name()), bytes));
        }
        ctx.model.exec(|cmd| {
            for (path, bytes) in writes {
                cmd.add(&path, bytes)?;
            }
            Ok(())
        })?;

        for hook in &self.after_fill {
            hook(ctx)?;
        }
        Ok(())
    }

    pub(crate) fn invalid_value(&self, def: &PropertyDef, value: &PropertyValue) -> ModelError {
        ModelError::InvalidPropertyValue {
            class: self.name.clone(),
            property: def.name().to_string(),
            value: value.to_string(),
        }
    }

    // ==================== Queries ====================

    pub fn exists(&self, parent: &dyn Parent, ident: &str) -> ModelResult<bool> {
        let path = self.instance_path(parent, ident)?;
        parent.model().include(&path)
    }

    /// Identifiers of the instances under `parent`, sorted.
    pub fn list(&self, parent: &dyn Parent) -> ModelResult<Vec<String>> {
        let path = self.class_path(parent)?;
        parent.model().list_children(&path)
    }

    pub fn instance(self: &Arc<Self>, parent: &dyn Parent, ident: &str) -> ModelResult<Option<ModelItem>> {
        let path = self.instance_path(parent, ident)?;
        let model = parent.model();
        if !model.include(&path)? {
            return Ok(None);
        }
        Ok(Some(ModelItem::new(model.clone(), Arc::clone(self), path)))
    }

    /// Handle for the instance stored at `path`.
    pub fn open(self: &Arc<Self>, model: &Model, path: &str) -> ModelResult<ModelItem> {
        if path.is_empty() || path.contains('\0') {
            return Err(ModelError::InvalidPath(path.to_string()));
        }
        if !model.include(path)? {
            return Err(ModelError::InvalidInstance(path.to_string()));
        }
        Ok(ModelItem::new(model.clone(), Arc::clone(self), path.to_string()))
    }
}

fn check_component(name: &str) -> ModelResult<()> {
    if name.is_empty() || name.contains('\0') || name.contains('/') || name == "." || name == ".." {
        return Err(ModelError::InvalidPath(name.to_string()));
    }
    Ok(())
}

pub struct ModelClassBuilder {
    name: String,
    properties: Vec<PropertyDef>,
    ident: IdentRule,
    before_fill: Vec<FillHook>,
    after_fill: Vec<FillHook>,
}

impl ModelClassBuilder {
    pub fn property(mut self, def: PropertyDef) -> Self {
        self.properties.push(def);
        self
    }

    pub fn text(self, name: impl Into<String>) -> Self {
        self.property(PropertyDef::text(name))
    }

    pub fn binary(self, name: impl Into<String>) -> Self {
        self.property(PropertyDef::binary(name))
    }

    pub fn link(self, name: impl Into<String>, class: impl Into<String>) -> Self {
        self.property(PropertyDef::link(name, class))
    }

    /// Take the identifier from field `key`.
    pub fn ident_key(mut self, key: impl Into<String>) -> Self {
        self.ident = IdentRule::Key(key.into());
        self
    }

    pub fn ident_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Fields) -> Option<String> + Send + Sync + 'static,
    {
        self.ident = IdentRule::Custom(Arc::new(f));
        self
    }

    pub fn before_fill<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FillContext<'_>) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.before_fill.push(Arc::new(hook));
        self
    }

    pub fn after_fill<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FillContext<'_>) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.after_fill.push(Arc::new(hook));
        self
    }

    /// Check the definition: unique, path-safe names and valid defaults.
    pub fn build(self) -> ModelResult<ModelClass> {
        check_component(&self.name)?;
        let mut seen = std::collections::HashSet::new();
        for def in &self.properties {
            check_component(def.name())?;
            if !seen.insert(def.name()) {
                return Err(ModelError::DuplicateProperty {
                    class: self.name.clone(),
                    property: def.name().to_string(),
                });
            }
        }

        let class = ModelClass {
            name: self.name,
            properties: self.properties,
            ident: self.ident,
            before_fill: self.before_fill,
            after_fill: self.after_fill,
        };
        for def in &class.properties {
            if let Some(default) = def.default() {
                if def.encode(default).is_none() {
                    return Err(class.invalid_value(def, default));
                }
            }
        }
        Ok(class)
    }
}

/// Registry of model classes, keyed by name.
#[derive(Debug, Default)]
pub struct Schema {
    classes: BTreeMap<String, Arc<ModelClass>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ModelClass) -> ModelResult<Arc<ModelClass>> {
        if self.classes.contains_key(class.name()) {
            return Err(ModelError::DuplicateClass(class.name().to_string()));
        }
        let class = Arc::new(class);
        self.classes.insert(class.name().to_string(), Arc::clone(&class));
        Ok(class)
    }

    /// builder-style `register`
    pub fn with(mut self, class: ModelClass) -> ModelResult<Self> {
        self.register(class)?;
        Ok(self)
    }

    pub fn class(&self, name: &str) -> ModelResult<Arc<ModelClass>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownClass(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn widget() -> ModelClass {
        ModelClass::builder("widget")
            .property(PropertyDef::text("color").default_value("red"))
            .text("size")
            .build()
            .unwrap()
    }

    fn setup() -> (TempDir, Model) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let schema = Schema::new().with(widget()).unwrap();
        (dir, Model::new(db, "test", schema))
    }

    #[test]
    fn test_duplicate_property_rejected_at_build() {
        let err = ModelClass::builder("widget")
            .text("color")
            .binary("color")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::DuplicateProperty { ref class, ref property } if class == "widget" && property == "color"
        ));
    }

    #[test]
    fn test_invalid_default_rejected_at_build() {
        let err = ModelClass::builder("w")
            .property(PropertyDef::text("n").default_value(0i64).validator(|v| matches!(v, PropertyValue::Int(i) if *i > 0)))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidPropertyValue { .. }));
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let mut schema = Schema::new();
        schema.register(widget()).unwrap();
        assert!(matches!(
            schema.register(widget()),
            Err(ModelError::DuplicateClass(_))
        ));
        assert!(matches!(schema.class("gadget"), Err(ModelError::UnknownClass(_))));
    }

    #[test]
    fn test_paths() {
        let (_dir, model) = setup();
        let class = model.class("widget").unwrap();
        let root = model.root();

        assert_eq!(class.class_path(&root).unwrap(), "widget");
        assert_eq!(class.instance_path(&root, "w1").unwrap(), "widget/w1");

        let nested = Node::new(model.clone(), "group/g1");
        assert_eq!(class.instance_path(&nested, "w1").unwrap(), "group/g1/widget/w1");

        for bad in ["", "a/b", "a\0b", ".."] {
            assert!(matches!(class.instance_path(&root, bad), Err(ModelError::InvalidPath(_))));
        }
    }

    #[test]
    fn test_ident_rules() {
        let by_name = ModelClass::builder("user").ident_key("name").text("name").build().unwrap();
        assert_eq!(by_name.ident_for(&Fields::new().with("name", "ann")).unwrap(), "ann");
        assert!(matches!(by_name.ident_for(&Fields::new()), Err(ModelError::InvalidPath(_))));

        let custom = ModelClass::builder("pair")
            .ident_fn(|f| Some(format!("{}-{}", f.get("a")?, f.get("b")?)))
            .build()
            .unwrap();
        let fields = Fields::new().with("a", 1i64).with("b", 2i64);
        assert_eq!(custom.ident_for(&fields).unwrap(), "1-2");
    }

    #[test]
    fn test_create_writes_defaults_and_values() {
        let (_dir, model) = setup();
        let class = model.class("widget").unwrap();
        let root = model.root();

        let path = class.create(&root, &Fields::ident("w1").with("size", 3i64)).unwrap();
        assert_eq!(path, "widget/w1");
        assert_eq!(model.get_item("widget/w1/color").unwrap(), Some(b"red\n".to_vec()));
        assert_eq!(model.get_item("widget/w1/size").unwrap(), Some(b"3\n".to_vec()));

        assert!(class.exists(&root, "w1").unwrap());
        assert_eq!(class.list(&root).unwrap(), vec!["w1"]);
        assert!(class.instance(&root, "w2").unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_invalid_value_without_writing() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let strict = ModelClass::builder("thing")
            .text("name")
            .property(PropertyDef::text("count").validator(|v| matches!(v, PropertyValue::Int(_))))
            .build()
            .unwrap();
        let model = Model::new(db, "test", Schema::new().with(strict).unwrap());
        let class = model.class("thing").unwrap();
        let tip = model.db().tip().unwrap();

        let err = class
            .create(&model.root(), &Fields::ident("t").with("name", "x").with("count", "many"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidPropertyValue { ref property, .. } if property == "count"));
        assert_eq!(model.db().tip().unwrap(), tip);
        assert!(!model.include("thing/t").unwrap());
    }

    #[test]
    fn test_fill_hooks_create_children() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let suite = ModelClass::builder("suite")
            .text("title")
            .after_fill(|ctx| {
                let case = ctx.model.class("case")?;
                case.create(&ctx.node(), &Fields::ident("default").with("status", "new"))?;
                Ok(())
            })
            .build()
            .unwrap();
        let case = ModelClass::builder("case").text("status").build().unwrap();
        let schema = Schema::new().with(suite).unwrap().with(case).unwrap();
        let model = Model::new(db, "tests", schema);
        let before = model.db().history(usize::MAX).unwrap().len();

        model
            .class("suite")
            .unwrap()
            .create(&model.root(), &Fields::ident("s1").with("title", "Smoke"))
            .unwrap();

        assert_eq!(model.get_item("suite/s1/case/default/status").unwrap(), Some(b"new\n".to_vec()));
        assert_eq!(model.db().history(usize::MAX).unwrap().len(), before + 1);
    }
}
