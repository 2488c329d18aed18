//! Built-in grammar bindings.
//!
//! The server speaks three XML response shapes, distinguished by root tag:
//! the full record grammar, a simple names/rows listing grammar, and a
//! layout-metadata-only grammar. Each is bound here to an embedded
//! rule-data document; the engine itself stays grammar-agnostic and a
//! caller-supplied template overrides these everywhere.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::errors::{Result, XylemError};
use crate::template::{Bindings, Template};
use crate::value::{Object, Value};

/// The server's response grammars. The wire name doubles as the request
/// path component: `<prefix>/<wire-name>.xml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grammar {
    /// Full record sets: metadata, records, portals.
    FmResultset,
    /// Names/rows listings (databases, layouts, scripts).
    FmpXmlResult,
    /// Layout metadata only.
    FmpXmlLayout,
}

impl Grammar {
    pub fn wire_name(self) -> &'static str {
        match self {
            Grammar::FmResultset => "fmresultset",
            Grammar::FmpXmlResult => "FMPXMLRESULT",
            Grammar::FmpXmlLayout => "FMPXMLLAYOUT",
        }
    }

    pub fn parse(name: &str) -> Option<Grammar> {
        match name.to_ascii_lowercase().as_str() {
            "fmresultset" => Some(Grammar::FmResultset),
            "fmpxmlresult" => Some(Grammar::FmpXmlResult),
            "fmpxmllayout" => Some(Grammar::FmpXmlLayout),
            _ => None,
        }
    }
}

impl std::fmt::Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for Grammar {
    type Err = XylemError;

    fn from_str(s: &str) -> Result<Grammar> {
        Grammar::parse(s)
            .ok_or_else(|| XylemError::config(format!("unknown grammar '{s}'")))
    }
}

const FMRESULTSET_RULES: &str = include_str!("grammars/fmresultset.yaml");
const FMPXMLRESULT_RULES: &str = include_str!("grammars/fmpxmlresult.yaml");
const FMPXMLLAYOUT_RULES: &str = include_str!("grammars/fmpxmllayout.yaml");

/// Constructors and callbacks the embedded rule data references.
pub fn builtin_bindings() -> Bindings {
    Bindings::new()
        .ctor("resultset", |_ctx| Value::Object(Object::with_class("resultset")))
        .ctor("record", |_ctx| Value::Object(Object::with_class("record")))
        .ctor("datum", |_ctx| Value::Object(Object::with_class("datum")))
        .callback("store_field_datum", store_field_datum)
}

/// Move a finished `<field>` onto the enclosing record: the delimiter names
/// the slot, the gathered text becomes the value. A single data element
/// stores a scalar; repeating fields keep their list.
fn store_field_datum(ctx: &mut crate::template::CloseContext<'_>) -> Result<()> {
    let Some(name) = ctx.delimiter else {
        return Err(XylemError::parse(format!("<{}> carries no name to store under", ctx.tag)));
    };
    let value = match ctx.object.as_object().and_then(|o| o.get(ctx.text_label)) {
        Some(Value::List(items)) if items.len() == 1 => items[0].clone(),
        Some(other) => other.clone(),
        None => Value::Nil,
    };
    match ctx.parent.as_mut() {
        Some(parent) => match &mut **parent {
            Value::Object(record) => {
                record.set(name.to_string(), value);
                record.declare_accessor(name);
                Ok(())
            }
            other => Err(XylemError::parse(format!(
                "field '{name}' has a {} for a parent, expected an object",
                other.type_name()
            ))),
        },
        None => Err(XylemError::parse(format!("field '{name}' has no enclosing record"))),
    }
}

static TEMPLATES: Lazy<HashMap<Grammar, Arc<Template>>> = Lazy::new(|| {
    let bindings = builtin_bindings();
    let mut table = HashMap::new();
    for (grammar, rules) in [
        (Grammar::FmResultset, FMRESULTSET_RULES),
        (Grammar::FmpXmlResult, FMPXMLRESULT_RULES),
        (Grammar::FmpXmlLayout, FMPXMLLAYOUT_RULES),
    ] {
        let template = Template::from_yaml(rules, &bindings)
            .unwrap_or_else(|e| panic!("embedded rule data for {grammar} failed to compile: {e}"));
        table.insert(grammar, Arc::new(template));
    }
    table
});

/// The compiled built-in template for a grammar. Compiled once per process,
/// shared immutably across runs.
pub fn template_for(grammar: Grammar) -> Arc<Template> {
    Arc::clone(&TEMPLATES[&grammar])
}
