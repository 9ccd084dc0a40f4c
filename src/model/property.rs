//! Property definitions and their on-disk encoding.
//!
//! Every property is one blob at `<instance>/<property>`:
//!
//! | value       | stored as                                   |
//! |-------------|---------------------------------------------|
//! | text        | the text followed by `"\n"`                 |
//! | integer     | decimal, then `"\n"`                        |
//! | float       | shortest round-trip form, then `"\n"`       |
//! | boolean     | `true` / `false`, then `"\n"`               |
//! | timestamp   | RFC 3339, then `"\n"`                       |
//! | array       | elements joined with `"\n"`, then `"\n"`    |
//! | map         | JSON object, then `"\n"`                    |
//! | binary      | raw bytes                                   |
//! | link        | target instance path, then `"\n"`          |
//!
//! Reads strip exactly one trailing `"\n"`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::proxy::ItemRef;

/// How a property is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Text,
    Binary,
    /// path of an instance of `class`
    Link { class: String },
}

/// A property value as supplied by a caller or decoded from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Array(Vec<String>),
    Map(BTreeMap<String, String>),
    Bytes(Vec<u8>),
    Link(ItemRef),
}

impl PropertyValue {
    /// Text form without the trailing newline.
    ///
    /// `None` for values text cannot hold: non-UTF-8 bytes, and arrays with
    /// an empty element or one containing `"\n"`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            PropertyValue::Str(s) => Some(s.clone()),
            PropertyValue::Int(i) => Some(i.to_string()),
            PropertyValue::Float(f) => Some(f.to_string()),
            PropertyValue::Bool(b) => Some(b.to_string()),
            PropertyValue::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            PropertyValue::Array(items) => {
                if items.iter().any(|item| item.is_empty() || item.contains('\n')) {
                    None
                } else {
                    Some(items.join("\n"))
                }
            }
            PropertyValue::Map(map) => serde_json::to_string(map).ok(),
            PropertyValue::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            PropertyValue::Link(target) => Some(target.path.clone()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.to_text()) {
            (_, Some(text)) => write!(f, "{}", text),
            (PropertyValue::Bytes(bytes), None) => write!(f, "<{} bytes>", bytes.len()),
            (other, None) => write!(f, "{:?}", other),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<i32> for PropertyValue {
    fn from(i: i32) -> Self {
        PropertyValue::Int(i64::from(i))
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(ts: DateTime<Utc>) -> Self {
        PropertyValue::Timestamp(ts)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(items: Vec<String>) -> Self {
        PropertyValue::Array(items)
    }
}

impl From<Vec<&str>> for PropertyValue {
    fn from(items: Vec<&str>) -> Self {
        PropertyValue::Array(items.into_iter().map(str::to_string).collect())
    }
}

impl From<BTreeMap<String, String>> for PropertyValue {
    fn from(map: BTreeMap<String, String>) -> Self {
        PropertyValue::Map(map)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(bytes: Vec<u8>) -> Self {
        PropertyValue::Bytes(bytes)
    }
}

impl From<ItemRef> for PropertyValue {
    fn from(target: ItemRef) -> Self {
        PropertyValue::Link(target)
    }
}

pub type Validator = Arc<dyn Fn(&PropertyValue) -> bool + Send + Sync>;

/// One declared property of a model class.
#[derive(Clone)]
pub struct PropertyDef {
    name: String,
    kind: PropertyKind,
    default: Option<PropertyValue>,
    validator: Option<Validator>,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            validator: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Text)
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Binary)
    }

    pub fn link(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Link { class: class.into() })
    }

    /// Value written by `fill` when the caller supplies none.
    pub fn default_value(mut self, value: impl Into<PropertyValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validator<F>(mut self, check: F) -> Self
    where
        F: Fn(&PropertyValue) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    pub fn default(&self) -> Option<&PropertyValue> {
        self.default.as_ref()
    }

    pub fn is_binary(&self) -> bool {
        self.kind == PropertyKind::Binary
    }

    /// target class of a link property
    pub fn link_class(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Link { class } => Some(class),
            _ => None,
        }
    }

    /// Stored bytes for `value`, if it is encodable and passes the validator.
    pub fn encode(&self, value: &PropertyValue) -> Option<Vec<u8>> {
        if let Some(check) = &self.validator {
            if !check(value) {
                return None;
            }
        }
        match (&self.kind, value) {
            (PropertyKind::Binary, PropertyValue::Bytes(bytes)) => Some(bytes.clone()),
            (PropertyKind::Binary, PropertyValue::Str(s)) => Some(s.clone().into_bytes()),
            (PropertyKind::Binary, _) => None,
            (PropertyKind::Link { class }, PropertyValue::Link(target)) => {
                (target.class == *class && !target.path.is_empty()).then(|| line(&target.path))
            }
            (PropertyKind::Link { .. }, PropertyValue::Str(path)) => {
                (!path.is_empty()).then(|| line(path))
            }
            (PropertyKind::Link { .. }, _) => None,
            (PropertyKind::Text, PropertyValue::Link(_)) => None,
            (PropertyKind::Text, other) => other.to_text().map(|text| line(&text)),
        }
    }

    /// Stored bytes back to text: binary as-is, everything else minus one trailing newline.
    pub(crate) fn decode_text(&self, raw: Vec<u8>) -> Result<String, Vec<u8>> {
        let bytes = if self.is_binary() { raw } else { strip_newline(raw) };
        String::from_utf8(bytes).map_err(|e| e.into_bytes())
    }

    /// Stored bytes minus the text terminator (binary stays raw).
    pub(crate) fn decode_bytes(&self, raw: Vec<u8>) -> Vec<u8> {
        if self.is_binary() {
            raw
        } else {
            strip_newline(raw)
        }
    }
}

impl fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

fn line(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(b'\n');
    bytes
}

fn strip_newline(mut raw: Vec<u8>) -> Vec<u8> {
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    raw
}

// ==================== Decoding ====================

pub(crate) fn parse_int(text: &str) -> Option<i64> {
    text.trim().parse().ok()
}

pub(crate) fn parse_float(text: &str) -> Option<f64> {
    text.trim().parse().ok()
}

pub(crate) fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn parse_array(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n').map(str::to_string).collect()
}

pub(crate) fn parse_map(text: &str) -> Option<BTreeMap<String, String>> {
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn round_trip(def: &PropertyDef, value: PropertyValue) -> String {
        let stored = def.encode(&value).expect("encodable");
        def.decode_text(stored).expect("utf-8")
    }

    #[test]
    fn test_text_values_are_newline_terminated() {
        let def = PropertyDef::text("color");
        assert_eq!(def.encode(&"red".into()), Some(b"red\n".to_vec()));
        assert_eq!(round_trip(&def, "line one\n".into()), "line one\n");
    }

    #[test]
    fn test_typed_round_trips() {
        let def = PropertyDef::text("p");

        assert_eq!(parse_int(&round_trip(&def, (-42i64).into())), Some(-42));
        assert_eq!(parse_float(&round_trip(&def, 0.1f64.into())), Some(0.1));
        assert_eq!(parse_bool(&round_trip(&def, true.into())), Some(true));

        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 5).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(parse_timestamp(&round_trip(&def, ts.into())), Some(ts));

        let items = vec!["a".to_string(), "b c".to_string()];
        assert_eq!(parse_array(&round_trip(&def, items.clone().into())), items);
        assert_eq!(parse_array(&round_trip(&def, Vec::<String>::new().into())), Vec::<String>::new());

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v\nw".to_string());
        assert_eq!(parse_map(&round_trip(&def, map.clone().into())), Some(map));
    }

    #[test]
    fn test_array_rejects_unencodable_elements() {
        let def = PropertyDef::text("tags");
        assert!(def.encode(&vec!["a\nb"].into()).is_none());
        assert!(def.encode(&vec!["a", ""].into()).is_none());
    }

    #[test]
    fn test_binary_is_raw() {
        let def = PropertyDef::binary("blob");
        let data = vec![0u8, 159, 146, 150, b'\n'];
        assert_eq!(def.encode(&data.clone().into()), Some(data.clone()));
        assert_eq!(def.decode_bytes(data.clone()), data);
        assert!(def.encode(&1i64.into()).is_none());
    }

    #[test]
    fn test_link_encoding() {
        let def = PropertyDef::link("owner", "user");
        let target = ItemRef::new("user", "user/alice");
        assert_eq!(def.encode(&target.into()), Some(b"user/alice\n".to_vec()));
        assert!(def.encode(&ItemRef::new("group", "group/x").into()).is_none());
        assert!(def.encode(&"".into()).is_none());
    }

    #[test]
    fn test_validator() {
        let def = PropertyDef::text("size").validator(|v| matches!(v, PropertyValue::Int(i) if *i > 0));
        assert!(def.encode(&5i64.into()).is_some());
        assert!(def.encode(&0i64.into()).is_none());
        assert!(def.encode(&"big".into()).is_none());
    }
}
