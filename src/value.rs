//! Dynamic values for the result tree.
//!
//! A parsing run builds a single-rooted, acyclic tree of [`Value`]s. The
//! interesting variant is [`Object`]: a bag of named slots with a uniform
//! get/set-by-name surface, plus an optional list of *declared accessors* —
//! slot names the rule data promised will exist, exposed through
//! [`Object::view`] as a typed-ish projection without any per-instance
//! method synthesis.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A node in the result tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Object(Object),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Bool(_) => "Bool",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Object(_) => "Object",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Walk a slot path through nested objects.
    ///
    /// ```
    /// use xylem::value::{Object, Value};
    /// let mut inner = Object::new();
    /// inner.set("name", Value::String("x".into()));
    /// let mut root = Object::new();
    /// root.set("field", Value::Object(inner));
    /// let tree = Value::Object(root);
    /// assert_eq!(tree.dig(&["field", "name"]).and_then(Value::as_str), Some("x"));
    /// ```
    pub fn dig(&self, path: &[&str]) -> Option<&Value> {
        let mut current = self;
        for key in path {
            let Value::Object(obj) = current else { return None };
            current = obj.get(key)?;
        }
        Some(current)
    }

    /// Find the entry of a list whose `field` slot equals `wanted`.
    ///
    /// Collections built with positional semantics stay addressable by their
    /// delimiter values through this.
    pub fn entry_by(&self, field: &str, wanted: &str) -> Option<&Value> {
        self.as_list()?.iter().find(|entry| {
            entry
                .as_object()
                .and_then(|o| o.get(field))
                .and_then(Value::as_str)
                .map(|s| s == wanted)
                .unwrap_or(false)
        })
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// A constructed object: named slots plus declared accessors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Object {
    class_name: Option<String>,
    slots: BTreeMap<String, Value>,
    accessors: Vec<String>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// An object tagged with the registered constructor name that built it.
    pub fn with_class(class_name: impl Into<String>) -> Self {
        Self { class_name: Some(class_name.into()), ..Self::default() }
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.slots.get_mut(name)
    }

    /// Set a slot, returning the previous value if any.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.slots.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.slots.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Append into the named collection, creating it if absent.
    ///
    /// An existing scalar slot is promoted to a list so repeated same-name
    /// attachments keep positional document order.
    pub fn push_into(&mut self, name: &str, value: Value) {
        match self.slots.get_mut(name) {
            Some(Value::List(items)) => items.push(value),
            Some(existing) => {
                let prior = std::mem::take(existing);
                *existing = Value::List(vec![prior, value]);
            }
            None => {
                self.slots.insert(name.to_string(), Value::List(vec![value]));
            }
        }
    }

    /// Merge another object's slots into this one; later slots win.
    pub fn merge_from(&mut self, other: Object) {
        for (name, value) in other.slots {
            self.slots.insert(name, value);
        }
        for name in other.accessors {
            self.declare_accessor(&name);
        }
    }

    /// Declare `name` as an accessor. Idempotent across repeats.
    pub fn declare_accessor(&mut self, name: &str) {
        if !self.accessors.iter().any(|a| a == name) {
            self.accessors.push(name.to_string());
        }
    }

    pub fn accessors(&self) -> &[String] {
        &self.accessors
    }

    /// The typed view: declared accessor names with their current values.
    pub fn view(&self) -> impl Iterator<Item = (&str, &Value)> {
        static NIL: Value = Value::Nil;
        self.accessors
            .iter()
            .map(|name| (name.as_str(), self.slots.get(name).unwrap_or(&NIL)))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(obj) => obj.serialize(serializer),
        }
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for (name, value) in &self.slots {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
