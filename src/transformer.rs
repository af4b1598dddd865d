//! Transformer Capability Interface
//!
//! A transformer adapts request and response bodies for one protocol dialect or
//! one model quirk. Each transformer declares the subset of capabilities it
//! implements:
//! - `request_out`: raw caller body into the canonical request (endpoint owner)
//! - `request_in`: canonical request into a provider-native body (chain member)
//! - `response_out`: provider response back towards canonical (chain member)
//! - `response_in`: canonical response into the caller-facing shape (endpoint owner)
//! - `auth`: credential injection on the bypass path (endpoint owner)
//!
//! Undeclared capabilities are never invoked; the default method bodies pass
//! their input through untouched.
//!
//! [`TransformerRegistry`] maps names to factories. Provider configuration
//! refers to transformers by name, optionally with per-use options.

pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::ProviderResponse;
use crate::error::TransformError;
use crate::providers::ProviderDescriptor;

/// One optional transformer capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    RequestOut,
    RequestIn,
    ResponseIn,
    ResponseOut,
    Auth,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Capability::RequestOut => 1,
            Capability::RequestIn => 1 << 1,
            Capability::ResponseIn => 1 << 2,
            Capability::ResponseOut => 1 << 3,
            Capability::Auth => 1 << 4,
        }
    }
}

/// Set of declared capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        Capabilities(bits)
    }

    pub const fn with(self, cap: Capability) -> Self {
        Capabilities(self.0 | cap.bit())
    }

    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }
}

/// Outbound header edits. Keys are lower-cased; `None` marks a header for removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundHeaders(BTreeMap<String, Option<String>>);

impl OutboundHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), Some(value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.insert(name.to_ascii_lowercase(), None);
    }

    /// Current value, `None` when unset or marked removed.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.as_deref())
    }

    /// Apply `other` on top of `self`; entries in `other` win.
    pub fn merge(&mut self, other: OutboundHeaders) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outbound-call configuration fragment produced by transformer stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestConfig {
    /// Full upstream URL; the provider's base URL is used when absent
    pub url: Option<String>,
    pub headers: OutboundHeaders,
    /// Overrides the dispatcher's overall request timeout
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    /// Merge a later stage's fragment; set fields in `other` win.
    pub fn merge(&mut self, other: RequestConfig) {
        if other.url.is_some() {
            self.url = other.url;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        self.headers.merge(other.headers);
    }
}

/// Body plus config fragment returned by request-side capabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub body: Value,
    pub config: RequestConfig,
}

impl Transformed {
    pub fn body(body: Value) -> Self {
        Self {
            body,
            config: RequestConfig::default(),
        }
    }

    pub fn with_config(body: Value, config: RequestConfig) -> Self {
        Self { body, config }
    }
}

/// Per-request scratch space threaded through every stage of one request.
#[derive(Debug, Clone, Default)]
pub struct TransformerContext {
    request_id: String,
    values: HashMap<String, Value>,
}

impl TransformerContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            values: HashMap::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }
}

#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// HTTP path this transformer owns, if any.
    fn endpoint(&self) -> Option<&str> {
        None
    }

    fn capabilities(&self) -> Capabilities;

    async fn request_out(
        &self,
        body: Value,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        Ok(Transformed::body(body))
    }

    async fn request_in(
        &self,
        body: Value,
        _provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        Ok(Transformed::body(body))
    }

    async fn response_out(
        &self,
        response: ProviderResponse,
        _ctx: &mut TransformerContext,
    ) -> Result<ProviderResponse, TransformError> {
        Ok(response)
    }

    async fn response_in(
        &self,
        response: ProviderResponse,
        _ctx: &mut TransformerContext,
    ) -> Result<ProviderResponse, TransformError> {
        Ok(response)
    }

    async fn auth(
        &self,
        body: Value,
        _provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        Ok(Transformed::body(body))
    }
}

/// A chain entry as written in configuration: `"name"` or `["name", {options}]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TransformerSpec {
    Named(String),
    WithOptions(String, Value),
}

impl TransformerSpec {
    pub fn name(&self) -> &str {
        match self {
            TransformerSpec::Named(name) | TransformerSpec::WithOptions(name, _) => name,
        }
    }

    pub fn options(&self) -> Option<&Value> {
        match self {
            TransformerSpec::Named(_) => None,
            TransformerSpec::WithOptions(_, opts) => Some(opts),
        }
    }
}

pub type TransformerFactory =
    Arc<dyn Fn(Option<&Value>) -> Result<Arc<dyn Transformer>, TransformError> + Send + Sync>;

/// Name-keyed transformer factories.
///
/// Each registration also builds one option-less instance, which is what
/// endpoint routes are bound to and what bypass detection compares against.
#[derive(Default)]
pub struct TransformerRegistry {
    factories: HashMap<String, TransformerFactory>,
    defaults: HashMap<String, Arc<dyn Transformer>>,
    /// Per-name options applied when a chain entry carries none
    default_options: HashMap<String, Value>,
    order: Vec<String>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in transformers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a factory. Fails when the factory cannot build an
    /// option-less instance.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), TransformError>
    where
        F: Fn(Option<&Value>) -> Result<Arc<dyn Transformer>, TransformError>
            + Send
            + Sync
            + 'static,
    {
        let instance = factory(None)?;
        if !self.factories.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
        self.defaults.insert(name.to_string(), instance);
        Ok(())
    }

    /// Options used for `name` when a chain entry does not carry its own.
    pub fn set_default_options(&mut self, name: &str, options: Value) {
        self.default_options.insert(name.to_string(), options);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.defaults.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Instantiate one chain entry. Unknown names and factory failures are
    /// logged and yield `None`.
    pub fn instantiate(&self, spec: &TransformerSpec) -> Option<Arc<dyn Transformer>> {
        let name = spec.name();
        let Some(factory) = self.factories.get(name) else {
            tracing::warn!("Unknown transformer '{}' in provider config, skipping", name);
            return None;
        };
        let options = spec.options().or_else(|| self.default_options.get(name));
        if options.is_none() {
            return self.defaults.get(name).cloned();
        }
        match factory(options) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!("Failed to build transformer '{}': {}", name, e);
                None
            }
        }
    }

    /// Instantiate a whole chain, preserving order and skipping failures.
    pub fn instantiate_chain(&self, specs: &[TransformerSpec]) -> Vec<Arc<dyn Transformer>> {
        specs.iter().filter_map(|s| self.instantiate(s)).collect()
    }

    /// Transformers that own an HTTP endpoint, in registration order.
    pub fn endpoint_transformers(&self) -> Vec<Arc<dyn Transformer>> {
        self.order
            .iter()
            .filter_map(|name| self.defaults.get(name))
            .filter(|t| t.endpoint().is_some())
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for TransformerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerRegistry")
            .field("transformers", &self.order)
            .finish()
    }
}
