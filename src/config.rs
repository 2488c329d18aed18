//! Explicit configuration for every layer of the pipeline.
//!
//! There is no ambient configuration lookup anywhere in this crate: a
//! [`Config`] value is constructed once and passed into each component's
//! constructor. Components read from it; none of them write back.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Result, XylemError};
use crate::grammars::Grammar;

/// Where the transport gets the basic-auth password from.
///
/// `Env` defers resolution to the moment the request is issued, so rotated
/// credentials are picked up without rebuilding the config. Neither variant
/// ever appears in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub enum PasswordSource {
    Plain(String),
    /// Name of an environment variable holding the password.
    Env(String),
}

impl PasswordSource {
    /// Resolve to the actual password at call time.
    pub fn resolve(&self) -> Result<String> {
        match self {
            PasswordSource::Plain(p) => Ok(p.clone()),
            PasswordSource::Env(var) => std::env::var(var).map_err(|_| {
                XylemError::config(format!("password environment variable '{var}' is not set"))
            }),
        }
    }
}

impl std::fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordSource::Plain(_) => f.write_str("PasswordSource::Plain(<redacted>)"),
            PasswordSource::Env(var) => write!(f, "PasswordSource::Env({var})"),
        }
    }
}

/// TLS trust policy. There is no default on purpose: enabling TLS forces
/// the caller to state what they trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Verify the peer against a PEM root certificate at this path.
    CaFile(PathBuf),
    /// Disable certificate verification. Explicitly insecure.
    Insecure,
}

/// Outbound HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

/// What happens when two `hash`-attached siblings carry the same delimiter
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashCollision {
    /// The later entry replaces the earlier one at that key.
    #[default]
    LastWriteWins,
    /// Object entries are unioned slot-by-slot; later slots win inside the
    /// union. Non-object entries fall back to replacement.
    Merge,
}

/// Configuration shared by the parser, transport, and command layers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name or address.
    pub host: String,
    /// Explicit port; defaults to 80/443 by scheme when unset.
    pub port: Option<u16>,
    pub ssl: bool,
    /// Required when `ssl` is set; never assumed.
    pub trust: Option<TrustPolicy>,
    pub account_name: Option<String>,
    pub password: Option<PasswordSource>,
    pub proxy: Option<Proxy>,
    /// Single shared connect/read/write timeout.
    pub timeout: Duration,
    /// Maximum redirect hops before a Communication error.
    pub redirect_limit: u32,
    /// Fixed path prefix in front of `<grammar>.xml`.
    pub path_prefix: String,
    pub database: Option<String>,
    pub layout: Option<String>,
    /// Default response grammar for commands that do not override it.
    pub grammar: Grammar,
    /// Preferred event-source backend name; probed at run start.
    pub backend: Option<String>,
    /// Reserved slot name for element text content.
    pub text_label: String,
    /// Root slot holding the embedded protocol result code.
    pub error_code_slot: String,
    /// Lowercase tags/attribute names and map `-` to `_` before rule lookup.
    pub normalize_tags: bool,
    /// Stop the run at the first recorded structural error.
    pub abort_on_error: bool,
    /// Raise on an embedded protocol code of 401 instead of tolerating it.
    pub raise_protocol_401: bool,
    pub hash_collisions: HashCollision,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            ssl: false,
            trust: None,
            account_name: None,
            password: None,
            proxy: None,
            timeout: Duration::from_secs(60),
            redirect_limit: 10,
            path_prefix: "/fmi/xml".to_string(),
            database: None,
            layout: None,
            grammar: Grammar::FmResultset,
            backend: None,
            text_label: "text".to_string(),
            error_code_slot: "error".to_string(),
            normalize_tags: true,
            abort_on_error: false,
            raise_protocol_401: false,
            hash_collisions: HashCollision::default(),
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), ..Self::default() }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enable TLS with an explicit trust policy.
    pub fn with_ssl(mut self, trust: TrustPolicy) -> Self {
        self.ssl = true;
        self.trust = Some(trust);
        self
    }

    pub fn with_credentials(mut self, account: impl Into<String>, password: PasswordSource) -> Self {
        self.account_name = Some(account.into());
        self.password = Some(password);
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.layout = Some(layout.into());
        self
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some(Proxy { host: host.into(), port });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_redirect_limit(mut self, limit: u32) -> Self {
        self.redirect_limit = limit;
        self
    }

    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammar = grammar;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    pub fn with_hash_collisions(mut self, policy: HashCollision) -> Self {
        self.hash_collisions = policy;
        self
    }

    /// The port actually used: explicit, or 443/80 by scheme.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.ssl { 443 } else { 80 })
    }

    /// Normalize a tag or attribute name per `normalize_tags`.
    pub fn transform_name(&self, name: &str) -> String {
        if self.normalize_tags {
            name.to_ascii_lowercase().replace('-', "_")
        } else {
            name.to_string()
        }
    }
}
