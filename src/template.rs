//! Rule data: the declarative description of how a document becomes objects.
//!
//! A template arrives as a nested mapping (YAML, or anything serde can feed
//! into [`RawTemplate`]) and is compiled exactly once per run into an
//! immutable [`Rule`] tree. Compilation resolves every token eagerly —
//! attach policies, constructor names, callback names — so nothing is
//! interpreted during parsing and malformed rule data fails up front with a
//! Configuration error naming the offending tag.
//!
//! Registered names are looked up in an explicit [`Bindings`] value passed
//! to `compile`; the single-source-of-truth registry is built at the
//! entrypoint and handed by reference to everything that needs it.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::errors::{Result, XylemError};
use crate::value::Value;

// ============================================================================
// RAW RULE DATA - the serde view of a template document
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTemplate {
    /// Registered constructor seeding the result object.
    pub initial_object: Option<String>,
    pub name: Option<String>,
    pub attach_elements: Option<RawAttach>,
    pub attach_attributes: Option<RawAttach>,
    pub create_accessors: Option<String>,
    pub compact: Option<bool>,
    pub elements: Option<Vec<RawElement>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawElement {
    pub name: String,
    pub as_name: Option<String>,
    pub attach: Option<RawAttach>,
    pub attach_elements: Option<RawAttach>,
    pub attach_attributes: Option<RawAttach>,
    pub attributes: Option<Vec<RawAttribute>>,
    pub delimiter: Option<String>,
    pub before_close: Option<RawCallback>,
    pub create_accessors: Option<String>,
    pub compact: Option<bool>,
    pub elements: Option<Vec<RawElement>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAttribute {
    pub name: String,
    pub as_name: Option<String>,
    pub attach: Option<RawAttach>,
    pub compact: Option<bool>,
    pub accessor: Option<String>,
}

/// An attach directive: a bare policy token, or the 3-element deferred
/// construction form `[policy, class, ctor]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAttach {
    Token(String),
    Deferred(Vec<String>),
}

/// A completion callback: a registered name, or `[target, name]` where
/// target selects the value the callback primarily operates on.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawCallback {
    Name(String),
    Targeted(Vec<String>),
}

// ============================================================================
// BINDINGS - registered constructors and completion callbacks
// ============================================================================

/// Arguments available to a registered constructor.
pub struct CtorContext<'a> {
    pub tag: &'a str,
    /// The element's buffered attributes, for `new`-mode constructors that
    /// build from attributes gathered at open time.
    pub attrs: &'a [(String, String)],
}

/// Context handed to a completion callback just before attachment.
///
/// `object` is the finished element's value; `parent` reaches the logical
/// parent (and through it, earlier siblings). `parent` is `None` only for a
/// transparent element directly under the sentinel.
pub struct CloseContext<'a> {
    pub tag: &'a str,
    pub object: &'a mut Value,
    pub parent: Option<&'a mut Value>,
    pub delimiter: Option<&'a str>,
    pub text_label: &'a str,
}

pub type Ctor = Arc<dyn Fn(&CtorContext<'_>) -> Value + Send + Sync>;
pub type Callback = Arc<dyn Fn(&mut CloseContext<'_>) -> Result<()> + Send + Sync>;

/// Named constructors and callbacks a template may reference.
#[derive(Clone, Default)]
pub struct Bindings {
    ctors: HashMap<String, Ctor>,
    callbacks: HashMap<String, Callback>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ctor<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CtorContext<'_>) -> Value + Send + Sync + 'static,
    {
        self.ctors.insert(name.into(), Arc::new(f));
        self
    }

    pub fn callback<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut CloseContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get_ctor(&self, name: &str) -> Option<&Ctor> {
        self.ctors.get(name)
    }

    pub fn get_callback(&self, name: &str) -> Option<&Callback> {
        self.callbacks.get(name)
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ctors: Vec<_> = self.ctors.keys().collect();
        ctors.sort();
        let mut callbacks: Vec<_> = self.callbacks.keys().collect();
        callbacks.sort();
        f.debug_struct("Bindings")
            .field("ctors", &ctors)
            .field("callbacks", &callbacks)
            .finish()
    }
}

// ============================================================================
// COMPILED RULES
// ============================================================================

/// How a finished element's object links into its logical parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPolicy {
    /// No attachment. Without an explicit class the element is transparent:
    /// no object is built and attributes/text route to the logical parent.
    None,
    /// On the cursor stack only; children build into it, it never merges
    /// upward.
    Cursor,
    /// Single named slot on the parent.
    Private,
    Shared,
    Array,
    /// Keyed by the delimiter value into a named map on the parent.
    Hash,
}

impl AttachPolicy {
    fn parse(token: &str) -> Option<Option<AttachPolicy>> {
        // "default" defers to the inherited policy, same as omitting the key.
        match token {
            "none" => Some(Some(AttachPolicy::None)),
            "cursor" => Some(Some(AttachPolicy::Cursor)),
            "private" => Some(Some(AttachPolicy::Private)),
            "shared" => Some(Some(AttachPolicy::Shared)),
            "array" => Some(Some(AttachPolicy::Array)),
            "hash" => Some(Some(AttachPolicy::Hash)),
            "default" => Some(None),
            _ => None,
        }
    }
}

/// Which attachments get accessor declarations on the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorScope {
    All,
    None,
    Only(AttachPolicy),
}

impl AccessorScope {
    pub fn covers(self, policy: AttachPolicy) -> bool {
        match self {
            AccessorScope::All => true,
            AccessorScope::None => false,
            AccessorScope::Only(p) => p == policy,
        }
    }
}

/// Construction strategy, resolved once at compile time.
#[derive(Clone)]
pub enum Construct {
    /// A plain object, built when the element has somewhere to put data.
    Auto,
    /// A registered constructor.
    Registered { class: String, mode: CtorMode, ctor: Ctor },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtorMode {
    /// Build empty at element open; attributes apply as they arrive.
    Allocate,
    /// Build at first child or close, with the buffered attributes.
    New,
}

impl std::fmt::Debug for Construct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Construct::Auto => f.write_str("Auto"),
            Construct::Registered { class, mode, .. } => {
                write!(f, "Registered({class}, {mode:?})")
            }
        }
    }
}

/// Which value a completion callback primarily targets. Context always
/// carries both; this records the rule author's intent and is validated at
/// compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackTarget {
    Object,
    Parent,
}

#[derive(Clone)]
pub struct CompiledCallback {
    pub name: String,
    pub target: CallbackTarget,
    pub func: Callback,
}

impl std::fmt::Debug for CompiledCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompiledCallback({}, {:?})", self.name, self.target)
    }
}

/// Per-attribute sub-rule: rename plus storage policy.
#[derive(Debug, Clone)]
pub struct AttrRule {
    pub name: String,
    pub as_name: Option<String>,
    pub attach: Option<AttachPolicy>,
    pub compact: bool,
    pub accessor: Option<AccessorScope>,
}

/// One compiled per-tag rule. Rule trees are finite, acyclic, and immutable
/// for the whole run.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Tag this rule matches; `None` for the template root and the wildcard.
    pub name: Option<String>,
    pub as_name: Option<String>,
    /// `None` inherits the nearest ancestor's `attach_elements`.
    pub attach: Option<AttachPolicy>,
    pub construct: Construct,
    pub attach_elements: Option<AttachPolicy>,
    pub attach_attributes: Option<AttachPolicy>,
    pub attributes: Vec<AttrRule>,
    pub delimiter: Option<String>,
    pub before_close: Option<CompiledCallback>,
    pub create_accessors: Option<AccessorScope>,
    pub compact: bool,
    pub elements: Vec<Arc<Rule>>,
}

impl Rule {
    fn blank() -> Self {
        Self {
            name: None,
            as_name: None,
            attach: None,
            construct: Construct::Auto,
            attach_elements: None,
            attach_attributes: None,
            attributes: Vec::new(),
            delimiter: None,
            before_close: None,
            create_accessors: None,
            compact: false,
            elements: Vec::new(),
        }
    }

    /// Find the child rule for `tag` in this rule's own scope.
    pub fn child(&self, tag: &str) -> Option<&Arc<Rule>> {
        self.elements.iter().find(|r| r.name.as_deref() == Some(tag))
    }

    /// The sub-rule for a named attribute, if declared.
    pub fn attribute(&self, name: &str) -> Option<&AttrRule> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The slot name this rule attaches under.
    pub fn key_for(&self, tag: &str) -> String {
        self.as_name.clone().unwrap_or_else(|| tag.to_string())
    }
}

/// The wildcard rule matched when no tag rule exists anywhere in scope.
/// Everything on it is "inherit".
static WILDCARD: Lazy<Arc<Rule>> = Lazy::new(|| Arc::new(Rule::blank()));

pub fn wildcard() -> Arc<Rule> {
    Arc::clone(&WILDCARD)
}

// ============================================================================
// TEMPLATE - a compiled rule tree plus the result seed
// ============================================================================

#[derive(Clone)]
pub struct Template {
    pub name: Option<String>,
    pub root: Arc<Rule>,
    pub initial: Option<Ctor>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("initial", &self.initial.as_ref().map(|_| "<ctor>"))
            .finish()
    }
}

impl Template {
    /// Compile raw rule data, resolving every registered name in `bindings`.
    pub fn compile(raw: RawTemplate, bindings: &Bindings) -> Result<Template> {
        let scope = raw.name.clone().unwrap_or_else(|| "<root>".to_string());
        let initial = match &raw.initial_object {
            Some(name) => Some(
                bindings
                    .get_ctor(name)
                    .cloned()
                    .ok_or_else(|| bad(&scope, format!("unknown initial_object '{name}'")))?,
            ),
            None => None,
        };

        let mut root = Rule::blank();
        root.attach_elements = compile_policy_only(&raw.attach_elements, &scope)?;
        root.attach_attributes = compile_policy_only(&raw.attach_attributes, &scope)?;
        root.create_accessors = compile_accessors(&raw.create_accessors, &scope)?;
        root.compact = raw.compact.unwrap_or(false);
        root.elements = compile_elements(raw.elements.unwrap_or_default(), bindings)?;

        Ok(Template { name: raw.name, root: Arc::new(root), initial })
    }

    /// Compile a YAML rule-data document.
    pub fn from_yaml(yaml: &str, bindings: &Bindings) -> Result<Template> {
        let raw: RawTemplate = serde_yaml::from_str(yaml)
            .map_err(|e| XylemError::config(format!("unreadable rule data: {e}")))?;
        Template::compile(raw, bindings)
    }

    /// The template used when the caller supplies none: a generic tree of
    /// objects and lists keyed by tag, attributes stored directly.
    pub fn generic() -> Template {
        let mut root = Rule::blank();
        root.attach_elements = Some(AttachPolicy::Shared);
        root.attach_attributes = Some(AttachPolicy::Private);
        Template { name: Some("generic".to_string()), root: Arc::new(root), initial: None }
    }
}

fn bad(tag: &str, message: impl std::fmt::Display) -> XylemError {
    XylemError::config(format!("rule data for '{tag}': {message}"))
}

fn compile_elements(raw: Vec<RawElement>, bindings: &Bindings) -> Result<Vec<Arc<Rule>>> {
    raw.into_iter().map(|e| compile_element(e, bindings).map(Arc::new)).collect()
}

fn compile_element(raw: RawElement, bindings: &Bindings) -> Result<Rule> {
    let tag = raw.name.clone();
    if tag.is_empty() {
        return Err(XylemError::config("rule data: element with empty name"));
    }

    let (attach, construct) = compile_attach(&raw.attach, &tag, bindings)?;
    let attributes = raw
        .attributes
        .unwrap_or_default()
        .into_iter()
        .map(|a| compile_attribute(a, &tag))
        .collect::<Result<Vec<_>>>()?;

    Ok(Rule {
        name: Some(tag.clone()),
        as_name: raw.as_name,
        attach,
        construct,
        attach_elements: compile_policy_only(&raw.attach_elements, &tag)?,
        attach_attributes: compile_policy_only(&raw.attach_attributes, &tag)?,
        attributes,
        delimiter: raw.delimiter,
        before_close: compile_callback(&raw.before_close, &tag, bindings)?,
        create_accessors: compile_accessors(&raw.create_accessors, &tag)?,
        compact: raw.compact.unwrap_or(false),
        elements: compile_elements(raw.elements.unwrap_or_default(), bindings)?,
    })
}

fn compile_attribute(raw: RawAttribute, tag: &str) -> Result<AttrRule> {
    let attach = match &raw.attach {
        None => None,
        Some(RawAttach::Token(token)) => AttachPolicy::parse(token)
            .ok_or_else(|| bad(tag, format!("unknown attribute attach token '{token}'")))?,
        Some(RawAttach::Deferred(_)) => {
            return Err(bad(tag, format!("attribute '{}' cannot use deferred construction", raw.name)));
        }
    };
    Ok(AttrRule {
        name: raw.name,
        as_name: raw.as_name,
        attach,
        compact: raw.compact.unwrap_or(false),
        accessor: compile_accessors(&raw.accessor, tag)?,
    })
}

fn compile_policy_only(raw: &Option<RawAttach>, tag: &str) -> Result<Option<AttachPolicy>> {
    match raw {
        None => Ok(None),
        Some(RawAttach::Token(token)) => AttachPolicy::parse(token)
            .ok_or_else(|| bad(tag, format!("unknown attach token '{token}'"))),
        Some(RawAttach::Deferred(_)) => {
            Err(bad(tag, "deferred construction is only valid on an element's own attach"))
        }
    }
}

fn compile_attach(
    raw: &Option<RawAttach>,
    tag: &str,
    bindings: &Bindings,
) -> Result<(Option<AttachPolicy>, Construct)> {
    match raw {
        None => Ok((None, Construct::Auto)),
        Some(RawAttach::Token(token)) => {
            let policy = AttachPolicy::parse(token)
                .ok_or_else(|| bad(tag, format!("unknown attach token '{token}'")))?;
            Ok((policy, Construct::Auto))
        }
        Some(RawAttach::Deferred(parts)) => {
            if parts.len() < 3 {
                return Err(bad(tag, "deferred attach needs [policy, class, ctor]"));
            }
            let policy = AttachPolicy::parse(&parts[0])
                .ok_or_else(|| bad(tag, format!("unknown attach token '{}'", parts[0])))?;
            let class = parts[1].clone();
            let ctor = bindings
                .get_ctor(&class)
                .cloned()
                .ok_or_else(|| bad(tag, format!("unknown constructor '{class}'")))?;
            let mode = match parts[2].trim_start_matches(':') {
                "allocate" => CtorMode::Allocate,
                "new" => CtorMode::New,
                other => return Err(bad(tag, format!("unknown constructor token '{other}'"))),
            };
            Ok((policy, Construct::Registered { class, mode, ctor }))
        }
    }
}

fn compile_callback(
    raw: &Option<RawCallback>,
    tag: &str,
    bindings: &Bindings,
) -> Result<Option<CompiledCallback>> {
    let (target, name) = match raw {
        None => return Ok(None),
        Some(RawCallback::Name(name)) => (CallbackTarget::Object, name.clone()),
        Some(RawCallback::Targeted(parts)) => {
            if parts.len() < 2 {
                return Err(bad(tag, "before_close list form needs [target, name]"));
            }
            let target = match parts[0].as_str() {
                "object" => CallbackTarget::Object,
                t if t.contains("parent") => CallbackTarget::Parent,
                other => return Err(bad(tag, format!("unknown callback target '{other}'"))),
            };
            (target, parts[1].clone())
        }
    };
    let func = bindings
        .get_callback(&name)
        .cloned()
        .ok_or_else(|| bad(tag, format!("unknown before_close callback '{name}'")))?;
    Ok(Some(CompiledCallback { name, target, func }))
}

fn compile_accessors(raw: &Option<String>, tag: &str) -> Result<Option<AccessorScope>> {
    match raw.as_deref() {
        None => Ok(None),
        Some("all") => Ok(Some(AccessorScope::All)),
        Some("none") => Ok(Some(AccessorScope::None)),
        Some(token) => match AttachPolicy::parse(token) {
            Some(Some(policy)) => Ok(Some(AccessorScope::Only(policy))),
            _ => Err(bad(tag, format!("unknown create_accessors token '{token}'"))),
        },
    }
}
