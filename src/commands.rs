//! High-level command API.
//!
//! Each command translates friendly option names into the server's wire
//! parameters, hands the pipeline an `(action, params, options)` triple,
//! and optionally enforces the embedded protocol result code on the way
//! out. Transport success and document-level success stay separate: a
//! command returns the parsed document even when the server reports a
//! nonzero code, unless protocol checking is on (the default).

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::errors::{Result, XylemError};
use crate::grammars::Grammar;
use crate::handler::Document;
use crate::pipeline::Pipeline;
use crate::template::Template;

/// A script to run server-side, with an optional parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub param: Option<String>,
}

impl Script {
    pub fn named(name: impl Into<String>) -> Script {
        Script { name: name.into(), param: None }
    }

    pub fn with_param(name: impl Into<String>, param: impl Into<String>) -> Script {
        Script { name: name.into(), param: Some(param.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

/// Per-call options. Everything is optional; unset values fall back to the
/// client's configuration.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub max_records: Option<u32>,
    pub skip_records: Option<u32>,
    /// Up to 9 sort fields, in precedence order.
    pub sort_field: Vec<String>,
    pub sort_order: Vec<String>,
    pub post_script: Option<Script>,
    pub pre_find_script: Option<Script>,
    pub pre_sort_script: Option<Script>,
    pub response_layout: Option<String>,
    pub logical_operator: Option<LogicalOperator>,
    pub modification_id: Option<u64>,
    pub max_portal_rows: Option<u32>,
    pub ignore_portals: bool,
    pub database: Option<String>,
    pub layout: Option<String>,
    pub grammar: Option<Grammar>,
    /// Caller-supplied rule data overriding the grammar's built-in template.
    pub template: Option<Arc<Template>>,
    /// Raise on a nonzero embedded result code. On by default.
    pub check_protocol: bool,
    /// Parse from the byte pipe as the body arrives (default), or buffer
    /// the whole response first.
    pub streaming: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_records: None,
            skip_records: None,
            sort_field: Vec::new(),
            sort_order: Vec::new(),
            post_script: None,
            pre_find_script: None,
            pre_sort_script: None,
            response_layout: None,
            logical_operator: None,
            modification_id: None,
            max_portal_rows: None,
            ignore_portals: false,
            database: None,
            layout: None,
            grammar: None,
            template: None,
            check_protocol: true,
            streaming: true,
        }
    }
}

/// How much addressing a command needs injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Server,
    Database,
    Layout,
}

/// A connection-level client for one server configuration.
pub struct Client {
    config: Config,
    pipeline: Pipeline,
}

impl Client {
    pub fn new(config: Config) -> Client {
        let pipeline = Pipeline::new(config.clone());
        Client { config, pipeline }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every record on the layout.
    pub fn find_all(&self, options: &QueryOptions) -> Result<Document> {
        self.records("-findall", Vec::new(), Scope::Layout, options)
    }

    /// A single random record.
    pub fn find_any(&self, options: &QueryOptions) -> Result<Document> {
        self.records("-findany", Vec::new(), Scope::Layout, options)
    }

    /// Find by field criteria.
    pub fn find(&self, criteria: &[(&str, &str)], options: &QueryOptions) -> Result<Document> {
        self.records("-find", owned_params(criteria), Scope::Layout, options)
    }

    /// Find one record by its internal record id.
    pub fn find_by_id(&self, record_id: u64, options: &QueryOptions) -> Result<Document> {
        let params = vec![("-recid".to_string(), record_id.to_string())];
        self.records("-find", params, Scope::Layout, options)
    }

    /// Raw compound query.
    pub fn find_query(&self, params: &[(&str, &str)], options: &QueryOptions) -> Result<Document> {
        self.records("-findquery", owned_params(params), Scope::Layout, options)
    }

    /// Create a record from field data.
    pub fn create(&self, data: &[(&str, &str)], options: &QueryOptions) -> Result<Document> {
        self.records("-new", owned_params(data), Scope::Layout, options)
    }

    /// Update the record with the given internal record id.
    pub fn edit(
        &self,
        record_id: u64,
        data: &[(&str, &str)],
        options: &QueryOptions,
    ) -> Result<Document> {
        let mut params = vec![("-recid".to_string(), record_id.to_string())];
        params.extend(owned_params(data));
        self.records("-edit", params, Scope::Layout, options)
    }

    /// Delete the record with the given internal record id.
    pub fn delete(&self, record_id: u64, options: &QueryOptions) -> Result<Document> {
        let params = vec![("-recid".to_string(), record_id.to_string())];
        self.records("-delete", params, Scope::Layout, options)
    }

    /// Layout metadata with an empty record set.
    pub fn view(&self, options: &QueryOptions) -> Result<Document> {
        self.records("-view", Vec::new(), Scope::Layout, options)
    }

    /// Database names on the server.
    pub fn databases(&self, options: &QueryOptions) -> Result<Document> {
        let options = listing(options);
        self.records("-dbnames", Vec::new(), Scope::Server, &options)
    }

    /// Layout names in the database.
    pub fn layouts(&self, options: &QueryOptions) -> Result<Document> {
        let options = listing(options);
        self.records("-layoutnames", Vec::new(), Scope::Database, &options)
    }

    /// Script names in the database.
    pub fn scripts(&self, options: &QueryOptions) -> Result<Document> {
        let options = listing(options);
        self.records("-scriptnames", Vec::new(), Scope::Database, &options)
    }

    /// Layout field styles and value lists.
    pub fn layout_meta(&self, options: &QueryOptions) -> Result<Document> {
        let mut options = options.clone();
        options.grammar = options.grammar.or(Some(Grammar::FmpXmlLayout));
        self.records("-view", Vec::new(), Scope::Layout, &options)
    }

    fn records(
        &self,
        action: &str,
        mut params: Vec<(String, String)>,
        scope: Scope,
        options: &QueryOptions,
    ) -> Result<Document> {
        if matches!(scope, Scope::Database | Scope::Layout) {
            let database = options
                .database
                .clone()
                .or_else(|| self.config.database.clone())
                .ok_or_else(|| XylemError::config(format!("'{action}' needs a database")))?;
            params.push(("-db".to_string(), database));
        }
        if scope == Scope::Layout {
            let layout = options
                .layout
                .clone()
                .or_else(|| self.config.layout.clone())
                .ok_or_else(|| XylemError::config(format!("'{action}' needs a layout")))?;
            params.push(("-lay".to_string(), layout));
        }
        params.extend(expand_options(options)?);

        let grammar = options.grammar.unwrap_or(self.config.grammar);
        debug!(%action, ?scope, %grammar, "running command");
        let document = if options.streaming {
            self.pipeline.run(action, &params, grammar, options.template.clone())?
        } else {
            self.pipeline.run_buffered(action, &params, grammar, options.template.clone())?
        };
        if options.check_protocol {
            document.protocol_error(&self.config)?;
        }
        Ok(document)
    }
}

fn owned_params(params: &[(&str, &str)]) -> Vec<(String, String)> {
    params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Listing commands default to the names/rows grammar.
fn listing(options: &QueryOptions) -> QueryOptions {
    let mut options = options.clone();
    options.grammar = options.grammar.or(Some(Grammar::FmpXmlResult));
    options
}

/// Translate friendly option names into wire parameters.
fn expand_options(options: &QueryOptions) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();

    if let Some(max) = options.max_portal_rows {
        out.push(("-relatedsets.max".to_string(), max.to_string()));
        out.push(("-relatedsets.filter".to_string(), "layout".to_string()));
    }
    if options.ignore_portals {
        out.push(("-relatedsets.max".to_string(), "0".to_string()));
        out.push(("-relatedsets.filter".to_string(), "layout".to_string()));
    }
    if let Some(max) = options.max_records {
        out.push(("-max".to_string(), max.to_string()));
    }
    if let Some(skip) = options.skip_records {
        out.push(("-skip".to_string(), skip.to_string()));
    }

    if options.sort_field.len() > 9 {
        return Err(XylemError::config(format!(
            "sort_field can have at most 9 fields, got {}",
            options.sort_field.len()
        )));
    }
    for (i, field) in options.sort_field.iter().enumerate() {
        out.push((format!("-sortfield.{}", i + 1), field.clone()));
    }
    if options.sort_order.len() > 9 {
        return Err(XylemError::config(format!(
            "sort_order can have at most 9 fields, got {}",
            options.sort_order.len()
        )));
    }
    for (i, order) in options.sort_order.iter().enumerate() {
        out.push((format!("-sortorder.{}", i + 1), order.clone()));
    }

    if let Some(script) = &options.post_script {
        out.push(("-script".to_string(), script.name.clone()));
        if let Some(param) = &script.param {
            out.push(("-script.param".to_string(), param.clone()));
        }
    }
    if let Some(script) = &options.pre_find_script {
        out.push(("-script.prefind".to_string(), script.name.clone()));
        if let Some(param) = &script.param {
            out.push(("-script.prefind.param".to_string(), param.clone()));
        }
    }
    if let Some(script) = &options.pre_sort_script {
        out.push(("-script.presort".to_string(), script.name.clone()));
        if let Some(param) = &script.param {
            out.push(("-script.presort.param".to_string(), param.clone()));
        }
    }

    if let Some(layout) = &options.response_layout {
        out.push(("-lay.response".to_string(), layout.clone()));
    }
    if let Some(op) = options.logical_operator {
        let token = match op {
            LogicalOperator::And => "and",
            LogicalOperator::Or => "or",
        };
        out.push(("-lop".to_string(), token.to_string()));
    }
    if let Some(modid) = options.modification_id {
        out.push(("-modid".to_string(), modid.to_string()));
    }

    Ok(out)
}
