//! Per-element cursor state and the attachment machinery.
//!
//! A [`Cursor`] is the live state for one open element: its matched rule,
//! its in-progress object (possibly not yet built), the buffered attributes
//! waiting for a `new`-mode constructor, and the index of its *logical
//! parent* — the nearest enclosing cursor whose object actually participates
//! in attachment. Cursors are linked by stack index rather than by
//! reference, so the stack stays a plain `Vec` with no cycles.

use std::sync::Arc;

use crate::config::HashCollision;
use crate::errors::{Result, XylemError};
use crate::template::{AttachPolicy, Construct, Rule};
use crate::value::{Object, Value};

/// Live state for one open element.
#[derive(Debug)]
pub struct Cursor {
    pub tag: String,
    pub rule: Arc<Rule>,
    /// Attach policy resolved at open from the rule and its ancestors.
    pub policy: AttachPolicy,
    /// The in-progress object. `None` while construction is deferred, and
    /// permanently `None` for transparent elements.
    pub object: Option<Value>,
    /// A `none`-policy element with no explicit class: it owns no object,
    /// and its attribute/text events route to the logical parent.
    pub transparent: bool,
    /// Attributes buffered ahead of a deferred (`new`-mode) constructor.
    pub pending: Vec<(String, String)>,
    /// Value of the delimiter attribute, once seen.
    pub delimiter_value: Option<String>,
    /// Stack index of the nearest participating ancestor.
    pub logical_parent: usize,
}

impl Cursor {
    /// The sentinel occupying stack index 0. It owns the result object for
    /// the whole run and is never popped.
    pub fn sentinel(rule: Arc<Rule>, initial: Value) -> Self {
        Self {
            tag: String::new(),
            rule,
            policy: AttachPolicy::Cursor,
            object: Some(initial),
            transparent: false,
            pending: Vec::new(),
            delimiter_value: None,
            logical_parent: 0,
        }
    }

    /// Whether this cursor's object takes part in attachment — i.e. whether
    /// descendants may use it as their logical parent.
    pub fn participates(&self) -> bool {
        !self.transparent
    }

    /// Whether construction is still deferred.
    pub fn is_deferred(&self) -> bool {
        !self.transparent && self.object.is_none()
    }

    /// The slot name this cursor attaches under.
    pub fn key(&self) -> String {
        self.rule.key_for(&self.tag)
    }
}

/// Build the cursor's object from its construct strategy. Returns the
/// buffered attributes for the caller to replay through normal storage.
pub(crate) fn build_object(cursor: &mut Cursor) -> Vec<(String, String)> {
    if cursor.transparent || cursor.object.is_some() {
        return Vec::new();
    }
    let pending = std::mem::take(&mut cursor.pending);
    let object = match &cursor.rule.construct {
        Construct::Auto => Value::Object(Object::new()),
        Construct::Registered { ctor, .. } => {
            let ctx = crate::template::CtorContext { tag: &cursor.tag, attrs: &pending };
            ctor(&ctx)
        }
    };
    cursor.object = Some(object);
    pending
}

/// Collapse an object holding nothing but text into the bare string.
pub(crate) fn compact_value(value: Value, text_label: &str) -> Value {
    match value {
        Value::Object(mut obj) if obj.len() == 1 && obj.contains(text_label) => {
            obj.remove(text_label).unwrap_or(Value::Nil)
        }
        Value::Object(obj) if obj.is_empty() => Value::Nil,
        other => other,
    }
}

/// Insert into a named keyed map on the parent, honoring the configured
/// collision behavior.
pub(crate) fn hash_insert(
    parent: &mut Object,
    collection: &str,
    key: &str,
    value: Value,
    collisions: HashCollision,
) -> Result<()> {
    if let Some(existing) = parent.get(collection) {
        if existing.as_object().is_none() {
            return Err(XylemError::parse(format!(
                "collection '{collection}' already holds a {}, cannot key by delimiter",
                existing.type_name()
            )));
        }
    } else {
        parent.set(collection, Value::Object(Object::new()));
    }
    if let Some(Value::Object(map)) = parent.get_mut(collection) {
        match value {
            Value::Object(incoming) if collisions == HashCollision::Merge => {
                if let Some(Value::Object(existing)) = map.get_mut(key) {
                    existing.merge_from(incoming);
                } else {
                    map.set(key, Value::Object(incoming));
                }
            }
            other => {
                map.set(key, other);
            }
        }
    }
    Ok(())
}
