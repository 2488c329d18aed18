//! Xylem: streaming XML into living object trees.
//!
//! A client for database servers that speak an HTTP+XML protocol. Two
//! pieces do the work:
//!
//! - a **declarative streaming parser**: SAX-style events from a pluggable
//!   tokenizer backend drive a cursor stack under compiled, data-driven
//!   rules, building a typed object tree in a single pass — no per-document
//!   code, no intermediate generic tree;
//! - a **streaming transport**: the HTTP response body is produced on a
//!   worker thread into a bounded byte pipe and parsed concurrently as it
//!   arrives.
//!
//! The two form one pipeline with a single ordering contract (bytes and
//! events in exact network order) and a single error-propagation contract
//! (transport errors abort; structural parse errors accumulate in an
//! inspectable record).
//!
//! # Parsing local data
//!
//! ```
//! use xylem::{template::Bindings, Backend, Config, Handler, Template, Value};
//!
//! let rules = r#"
//! elements:
//! - name: row
//!   attach: array
//!   as_name: rows
//!   attributes:
//!   - name: id
//! "#;
//! let template = Template::from_yaml(rules, &Bindings::new()).unwrap();
//! let handler = Handler::new(&template, Config::default());
//! let mut input: &[u8] = br#"<root><row id="1"/><row id="2"/></root>"#;
//! let document = handler.run(&mut input, Backend::FALLBACK);
//! assert!(document.is_clean());
//! let rows = document.root.dig(&["rows"]).and_then(Value::as_list).unwrap();
//! assert_eq!(rows.len(), 2);
//! ```
//!
//! # Talking to a server
//!
//! ```no_run
//! use xylem::{Client, Config, PasswordSource, QueryOptions};
//!
//! let config = Config::new("fm.example.com")
//!     .with_credentials("reports", PasswordSource::Env("FM_PASSWORD".into()))
//!     .with_database("orders")
//!     .with_layout("order_list");
//! let client = Client::new(config);
//! let doc = client.find(&[("status", "open")], &QueryOptions::default())?;
//! # Ok::<(), xylem::XylemError>(())
//! ```

pub mod adapter;
pub mod commands;
pub mod config;
pub mod cursor;
pub mod errors;
pub mod grammars;
pub mod handler;
pub mod pipeline;
pub mod template;
pub mod transport;
pub mod value;

pub use adapter::{Backend, EventSink, Flow, SaxEvent};
pub use commands::{Client, LogicalOperator, QueryOptions, Script};
pub use config::{Config, HashCollision, PasswordSource, TrustPolicy};
pub use errors::{ErrorEntry, Result, StatusClass, XylemError};
pub use grammars::Grammar;
pub use handler::{Document, Handler};
pub use pipeline::Pipeline;
pub use template::{Bindings, Template};
pub use transport::Transport;
pub use value::{Object, Value};
