//! The handler: drives the cursor stack from adapter events.
//!
//! One handler instance exists per parsing run. It owns the stack, the
//! append-only error record, and the result object (through the sentinel
//! cursor at index 0). Doctype and cdata events are normalized here into
//! synthetic open/attribute/close sequences so cursor logic has one path.
//!
//! Structural problems are *recorded*, not raised: the run continues
//! best-effort unless abort-on-error is configured, and callers can always
//! inspect the error record afterwards, even on a nominally successful
//! parse.

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapter::{Backend, EventSink, Flow, SaxEvent};
use crate::config::Config;
use crate::cursor::{build_object, compact_value, hash_insert, Cursor};
use crate::errors::{ErrorEntry, Result, XylemError};
use crate::template::{
    AccessorScope, AttachPolicy, Construct, CtorContext, CtorMode, Template,
};
use crate::value::{Object, Value};

/// The outcome of a parsing run: the result tree plus the error record.
#[derive(Debug)]
pub struct Document {
    pub root: Value,
    pub errors: Vec<ErrorEntry>,
    /// True when abort-on-error stopped the run early; the tree is partial.
    pub aborted: bool,
}

impl Document {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.aborted
    }

    /// Promote a non-empty error record into a hard failure.
    pub fn into_result(self) -> Result<Value> {
        match self.errors.into_iter().next() {
            None if !self.aborted => Ok(self.root),
            None => Err(XylemError::parse("run aborted before completion")),
            Some(entry) => Err(entry.error),
        }
    }

    /// The embedded protocol result code, if the tree carries one in `slot`.
    pub fn protocol_code(&self, slot: &str) -> Option<i32> {
        self.root.dig(&[slot]).and_then(Value::as_str).and_then(|s| s.trim().parse().ok())
    }

    /// Check the embedded protocol result code against the configured
    /// policy. This never runs automatically during parsing; transport
    /// success and document-level success are deliberately separate.
    pub fn protocol_error(&self, config: &Config) -> Result<()> {
        match self.protocol_code(&config.error_code_slot) {
            None | Some(0) => Ok(()),
            Some(401) if !config.raise_protocol_401 => Ok(()),
            Some(code) => Err(XylemError::Protocol { code }),
        }
    }
}

/// Drives the cursor stack for one run.
pub struct Handler {
    config: Config,
    stack: Vec<Cursor>,
    errors: Vec<ErrorEntry>,
    stopped: bool,
}

impl Handler {
    pub fn new(template: &Template, config: Config) -> Handler {
        let initial = match &template.initial {
            Some(ctor) => ctor(&CtorContext { tag: "", attrs: &[] }),
            None => Value::Object(Object::new()),
        };
        let sentinel = Cursor::sentinel(Arc::clone(&template.root), initial);
        Handler { config, stack: vec![sentinel], errors: Vec::new(), stopped: false }
    }

    /// Run the backend over `input`, consuming this handler.
    ///
    /// Fatal tokenizer failures are recorded like any other parse error;
    /// the partially built tree is always returned alongside the record.
    pub fn run(mut self, input: &mut dyn Read, backend: Backend) -> Document {
        if let Err(error) = backend.run(input, &mut self) {
            self.errors.push(ErrorEntry::new(error, "event source"));
        }
        self.finish()
    }

    fn finish(mut self) -> Document {
        if self.stack.len() > 1 && !self.stopped {
            let open: Vec<&str> = self.stack[1..].iter().map(|c| c.tag.as_str()).collect();
            self.errors.push(ErrorEntry::new(
                XylemError::parse(format!(
                    "premature end of stream; unclosed elements: {}",
                    open.join(" > ")
                )),
                "end of stream",
            ));
        }
        debug!(errors = self.errors.len(), aborted = self.stopped, "parse finished");
        let sentinel = self.stack.swap_remove(0);
        Document {
            root: sentinel.object.unwrap_or(Value::Nil),
            errors: self.errors,
            aborted: self.stopped,
        }
    }

    fn record(&mut self, error: XylemError, context: impl Into<String>) -> Flow {
        let context = context.into();
        warn!(%error, %context, "recorded parse problem");
        self.errors.push(ErrorEntry::new(error, context));
        if self.config.abort_on_error {
            self.stopped = true;
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    /// Find the rule for a child tag: nearest enclosing scope wins, the
    /// wildcard is the fallback.
    fn lookup(&self, tag: &str) -> Arc<crate::template::Rule> {
        for cursor in self.stack.iter().rev() {
            if let Some(rule) = cursor.rule.child(tag) {
                return Arc::clone(rule);
            }
        }
        crate::template::wildcard()
    }

    /// The attach policy for an element: its own rule, else the nearest
    /// ancestor's `attach_elements`, else transparent.
    fn resolve_element_policy(&self, rule: &crate::template::Rule) -> AttachPolicy {
        if let Some(policy) = rule.attach {
            return policy;
        }
        self.stack
            .iter()
            .rev()
            .find_map(|c| c.rule.attach_elements)
            .unwrap_or(AttachPolicy::None)
    }

    /// The attribute policy when the attribute has no rule of its own:
    /// containing element's `attach_attributes`, else the nearest
    /// ancestor's, else private.
    fn resolve_attr_policy(&self, idx: usize) -> AttachPolicy {
        self.stack[..=idx]
            .iter()
            .rev()
            .find_map(|c| c.rule.attach_attributes)
            .unwrap_or(AttachPolicy::Private)
    }

    fn resolve_accessor_scope(&self, idx: usize) -> Option<AccessorScope> {
        self.stack[..=idx].iter().rev().find_map(|c| c.rule.create_accessors)
    }

    /// Build a deferred object now, replaying its buffered attributes.
    fn ensure_built(&mut self, idx: usize) {
        if self.stack[idx].is_deferred() {
            let pending = build_object(&mut self.stack[idx]);
            for (name, value) in pending {
                self.store_attribute_at(idx, &name, value);
            }
        }
    }

    fn open(&mut self, tag: &str) -> Flow {
        let tag = self.config.transform_name(tag);
        // A deferred parent builds at its first child.
        self.ensure_built(self.stack.len() - 1);

        let rule = self.lookup(&tag);
        let policy = self.resolve_element_policy(&rule);
        let transparent = policy == AttachPolicy::None && matches!(rule.construct, Construct::Auto);

        let parent_idx = self.stack.len() - 1;
        let logical_parent = if self.stack[parent_idx].participates() {
            parent_idx
        } else {
            self.stack[parent_idx].logical_parent
        };

        let object = if transparent {
            None
        } else {
            match &rule.construct {
                Construct::Auto => Some(Value::Object(Object::new())),
                Construct::Registered { mode: CtorMode::Allocate, ctor, .. } => {
                    Some(ctor(&CtorContext { tag: &tag, attrs: &[] }))
                }
                Construct::Registered { mode: CtorMode::New, .. } => None,
            }
        };

        self.stack.push(Cursor {
            tag,
            rule,
            policy,
            object,
            transparent,
            pending: Vec::new(),
            delimiter_value: None,
            logical_parent,
        });
        Flow::Continue
    }

    fn attribute(&mut self, name: &str, value: String) -> Flow {
        let name = self.config.transform_name(name);
        let idx = self.stack.len() - 1;
        self.store_attribute_at(idx, &name, value);
        Flow::Continue
    }

    fn text(&mut self, value: String) -> Flow {
        if value.trim().is_empty() {
            return Flow::Continue;
        }
        let label = self.config.text_label.clone();
        let idx = self.stack.len() - 1;
        self.store_attribute_at(idx, &label, value);
        Flow::Continue
    }

    /// Apply an attribute (or the reserved text slot) to the element at
    /// `idx` under the storage-policy precedence rules.
    fn store_attribute_at(&mut self, idx: usize, name: &str, value: String) {
        if self.stack[idx].rule.delimiter.as_deref() == Some(name) {
            self.stack[idx].delimiter_value = Some(value.clone());
        }
        if self.stack[idx].is_deferred() {
            self.stack[idx].pending.push((name.to_string(), value));
            return;
        }

        let (slot_name, own_policy, accessor_override) = match self.stack[idx].rule.attribute(name)
        {
            Some(attr) => (
                attr.as_name.clone().unwrap_or_else(|| name.to_string()),
                attr.attach,
                attr.accessor,
            ),
            None => (name.to_string(), None, None),
        };
        let policy = own_policy.unwrap_or_else(|| self.resolve_attr_policy(idx));
        if policy == AttachPolicy::None {
            return;
        }

        let target_idx = if self.stack[idx].object.is_some() {
            idx
        } else {
            self.stack[idx].logical_parent
        };
        let declare = accessor_override
            .or_else(|| self.resolve_accessor_scope(idx))
            .map(|scope| scope.covers(policy))
            .unwrap_or(false);

        let Some(Value::Object(target)) = self.stack[target_idx].object.as_mut() else {
            debug!(slot = %slot_name, "attribute target holds no object; dropped");
            return;
        };
        match policy {
            AttachPolicy::Shared | AttachPolicy::Array => {
                target.push_into(&slot_name, Value::String(value));
            }
            // Scalars have no delimiter; hash and cursor store directly.
            _ => {
                target.set(slot_name.clone(), Value::String(value));
            }
        }
        if declare {
            target.declare_accessor(&slot_name);
        }
    }

    fn close(&mut self, tag: &str) -> Flow {
        let tag = self.config.transform_name(tag);
        loop {
            if self.stack.len() <= 1 {
                return self.record(
                    XylemError::parse(format!("close tag '</{tag}>' matches no open element")),
                    "structure",
                );
            }
            let top_tag = self.stack[self.stack.len() - 1].tag.clone();
            if top_tag == tag {
                return self.close_top();
            }
            // Mismatch: implicitly close intermediates when the tag is open
            // somewhere below, otherwise drop the stray close.
            if self.stack[1..].iter().any(|c| c.tag == tag) {
                let flow = self.record(
                    XylemError::parse(format!(
                        "unclosed '<{top_tag}>' implicitly closed by '</{tag}>'"
                    )),
                    "structure",
                );
                if flow.is_stop() {
                    return Flow::Stop;
                }
                if self.close_top().is_stop() {
                    return Flow::Stop;
                }
            } else {
                return self.record(
                    XylemError::parse(format!("close tag '</{tag}>' matches no open element")),
                    "structure",
                );
            }
        }
    }

    /// Pop the tail cursor: build if deferred, run the completion callback,
    /// attach per policy.
    fn close_top(&mut self) -> Flow {
        self.ensure_built(self.stack.len() - 1);
        let Some(mut cursor) = self.stack.pop() else {
            return Flow::Continue;
        };
        let lp = cursor.logical_parent;
        let mut flow = Flow::Continue;
        let mut object = cursor.object.take().unwrap_or(Value::Nil);

        if let Some(cb) = cursor.rule.before_close.clone() {
            let mut failure = None;
            {
                let parent = self.stack[lp].object.as_mut();
                let mut ctx = crate::template::CloseContext {
                    tag: &cursor.tag,
                    object: &mut object,
                    parent,
                    delimiter: cursor.delimiter_value.as_deref(),
                    text_label: &self.config.text_label,
                };
                if let Err(error) = (cb.func)(&mut ctx) {
                    failure = Some(error);
                }
            }
            if let Some(error) = failure {
                // Best effort: the cursor still pops and attachment proceeds.
                flow = self.record(error, format!("before_close '{}' on <{}>", cb.name, cursor.tag));
            }
        }

        match cursor.policy {
            AttachPolicy::None | AttachPolicy::Cursor => {}
            policy => {
                let key = cursor.key();
                let value = if cursor.rule.compact {
                    compact_value(object, &self.config.text_label)
                } else {
                    object
                };
                let declare = cursor
                    .rule
                    .create_accessors
                    .or_else(|| self.stack.iter().rev().find_map(|c| c.rule.create_accessors))
                    .map(|scope| scope.covers(policy))
                    .unwrap_or(false);

                let mut attach_failure = None;
                match self.stack[lp].object.as_mut() {
                    Some(Value::Object(parent)) => {
                        match policy {
                            AttachPolicy::Private => {
                                parent.set(key.clone(), value);
                            }
                            AttachPolicy::Shared | AttachPolicy::Array => {
                                parent.push_into(&key, value);
                            }
                            AttachPolicy::Hash => match cursor.delimiter_value.as_deref() {
                                Some(delim) => {
                                    if let Err(e) = hash_insert(
                                        parent,
                                        &key,
                                        delim,
                                        value,
                                        self.config.hash_collisions,
                                    ) {
                                        attach_failure = Some(e);
                                    }
                                }
                                None => {
                                    attach_failure = Some(XylemError::parse(format!(
                                        "hash attach for <{}> without a delimiter value",
                                        cursor.tag
                                    )));
                                }
                            },
                            AttachPolicy::None | AttachPolicy::Cursor => {}
                        }
                        if declare && attach_failure.is_none() {
                            parent.declare_accessor(&key);
                        }
                    }
                    _ => {
                        attach_failure = Some(XylemError::parse(format!(
                            "logical parent of <{}> cannot hold attachments",
                            cursor.tag
                        )));
                    }
                }
                if let Some(error) = attach_failure {
                    let attach_flow = self.record(error, format!("attaching <{}>", cursor.tag));
                    if attach_flow.is_stop() {
                        flow = Flow::Stop;
                    }
                }
            }
        }
        flow
    }
}

impl EventSink for Handler {
    fn event(&mut self, event: SaxEvent) -> Flow {
        if self.stopped {
            return Flow::Stop;
        }
        match event {
            SaxEvent::Open { tag } => self.open(&tag),
            SaxEvent::Attribute { name, value } => self.attribute(&name, value),
            SaxEvent::Text(text) => self.text(text),
            SaxEvent::CData(data) => {
                let label = self.config.text_label.clone();
                let mut flow = self.open("cdata");
                if !flow.is_stop() {
                    flow = self.attribute(&label, data);
                }
                if !flow.is_stop() {
                    flow = self.close("cdata");
                }
                flow
            }
            SaxEvent::Doctype(decl) => {
                let mut flow = self.open("doctype");
                if !flow.is_stop() {
                    flow = self.attribute("value", decl);
                }
                if !flow.is_stop() {
                    flow = self.close("doctype");
                }
                flow
            }
            SaxEvent::Close { tag } => self.close(&tag),
            SaxEvent::Error(message) => self.record(XylemError::parse(message), "event source"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_code(code: &str) -> Document {
        let mut root = Object::new();
        root.set("error", Value::from(code));
        Document { root: Value::Object(root), errors: Vec::new(), aborted: false }
    }

    #[test]
    fn protocol_code_zero_is_success() {
        let doc = doc_with_code("0");
        assert_eq!(doc.protocol_code("error"), Some(0));
        assert!(doc.protocol_error(&Config::default()).is_ok());
    }

    #[test]
    fn protocol_401_is_tolerated_unless_configured() {
        let doc = doc_with_code("401");
        assert!(doc.protocol_error(&Config::default()).is_ok());
        let strict = Config { raise_protocol_401: true, ..Config::default() };
        assert!(matches!(
            doc.protocol_error(&strict),
            Err(XylemError::Protocol { code: 401 })
        ));
    }

    #[test]
    fn nonzero_protocol_code_raises_with_code() {
        let doc = doc_with_code("102");
        match doc.protocol_error(&Config::default()) {
            Err(XylemError::Protocol { code }) => assert_eq!(code, 102),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn missing_code_slot_passes() {
        let doc = Document {
            root: Value::Object(Object::new()),
            errors: Vec::new(),
            aborted: false,
        };
        assert!(doc.protocol_error(&Config::default()).is_ok());
    }

    #[test]
    fn into_result_surfaces_first_recorded_error() {
        let doc = Document {
            root: Value::Nil,
            errors: vec![ErrorEntry::new(XylemError::parse("bad"), "test")],
            aborted: false,
        };
        assert!(doc.into_result().is_err());
    }
}
