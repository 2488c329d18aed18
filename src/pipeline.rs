//! The pipeline coordinator: network bytes → structural events → tree.
//!
//! One `run` wires the transport's byte pipe into a backend driver and a
//! fresh handler, so parsing proceeds on the caller's thread concurrently
//! with the worker's writes. Bytes — and therefore events — arrive in
//! exact network order; nothing here reorders or batches.
//!
//! The worker is always joined after the stream is consumed. Its terminal
//! state wins: a transport error aborts the run and discards any partially
//! built tree.

use std::sync::Arc;

use tracing::debug;

use crate::adapter::Backend;
use crate::config::Config;
use crate::errors::Result;
use crate::grammars::{self, Grammar};
use crate::handler::{Document, Handler};
use crate::template::Template;
use crate::transport::Transport;

/// Connects the streaming transport to the parser for one configuration.
/// Runs are fully independent; no state is shared between them.
#[derive(Debug)]
pub struct Pipeline {
    config: Config,
    transport: Transport,
}

impl Pipeline {
    pub fn new(config: Config) -> Pipeline {
        let transport = Transport::new(config.clone());
        Pipeline { config, transport }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn path_for(&self, grammar: Grammar) -> String {
        format!("{}/{}.xml", self.config.path_prefix, grammar.wire_name())
    }

    fn fields_for(&self, action: &str, params: &[(String, String)]) -> Vec<(String, String)> {
        let mut fields = params.to_vec();
        let action = if action.starts_with('-') {
            action.to_string()
        } else {
            format!("-{action}")
        };
        fields.push((action, String::new()));
        fields
    }

    fn template_for(&self, grammar: Grammar, template: Option<Arc<Template>>) -> Arc<Template> {
        template.unwrap_or_else(|| grammars::template_for(grammar))
    }

    /// Streaming run: fetch on a worker thread, parse the pipe as bytes
    /// arrive, join the worker, propagate its terminal state.
    pub fn run(
        &self,
        action: &str,
        params: &[(String, String)],
        grammar: Grammar,
        template: Option<Arc<Template>>,
    ) -> Result<Document> {
        // Fail fast on configuration problems before a worker exists.
        let backend = Backend::probe(self.config.backend.as_deref())?;
        let template = self.template_for(grammar, template);
        let fields = self.fields_for(action, params);
        let path = self.path_for(grammar);
        debug!(%action, %path, "starting streaming run");

        let (mut stream, worker) = self.transport.fetch_stream(&path, &fields)?;
        let document = Handler::new(&template, self.config.clone()).run(&mut stream, backend);
        drop(stream);

        let meta = worker.join()?;
        debug!(status = meta.status, errors = document.errors.len(), "streaming run complete");
        Ok(document)
    }

    /// Buffered run: fetch the whole body first, then parse it.
    pub fn run_buffered(
        &self,
        action: &str,
        params: &[(String, String)],
        grammar: Grammar,
        template: Option<Arc<Template>>,
    ) -> Result<Document> {
        let backend = Backend::probe(self.config.backend.as_deref())?;
        let template = self.template_for(grammar, template);
        let fields = self.fields_for(action, params);
        let path = self.path_for(grammar);
        debug!(%action, %path, "starting buffered run");

        let response = self.transport.fetch(&path, &fields)?;
        let mut body = response.body.as_slice();
        Ok(Handler::new(&template, self.config.clone()).run(&mut body, backend))
    }
}
