//! Provider Registry
//!
//! Stores provider descriptors and the routing table derived from them:
//! - Every `(provider, model)` pair is reachable as `provider,model`
//! - The bare `model` key belongs to the earliest-registered live provider
//!   serving it; when that provider drops the model the key passes to the
//!   next provider in registration order
//! - Providers are identified by `name` for every operation
//!
//! The registry is shared by all workers and guarded by an `RwLock`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ApiError, ApiResult};
use crate::transformer::{Transformer, TransformerRegistry, TransformerSpec};
use crate::util::mask_key;

/// Wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }
}

/// Per-model chain override.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelTransformerConfig {
    #[serde(rename = "use", default)]
    pub chain: Vec<TransformerSpec>,
}

/// Transformer chain configuration of a provider.
///
/// ```json
/// { "use": ["openai"], "gpt-4o": { "use": [["maxtoken", {"max_tokens": 4096}]] } }
/// ```
///
/// A `"*"` entry is treated as provider-wide and appended to `use`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformerConfig {
    #[serde(rename = "use", default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<TransformerSpec>,

    #[serde(flatten)]
    pub models: BTreeMap<String, ModelTransformerConfig>,
}

impl TransformerConfig {
    fn provider_specs(&self) -> Vec<TransformerSpec> {
        let mut specs = self.chain.clone();
        if let Some(wildcard) = self.models.get("*") {
            specs.extend(wildcard.chain.iter().cloned());
        }
        specs
    }
}

/// Instantiated chains of one provider.
#[derive(Clone, Default)]
pub struct ResolvedChains {
    provider: Vec<Arc<dyn Transformer>>,
    models: HashMap<String, Vec<Arc<dyn Transformer>>>,
}

impl ResolvedChains {
    fn build(config: Option<&TransformerConfig>, registry: &TransformerRegistry) -> Self {
        let Some(config) = config else {
            return Self::default();
        };
        let provider = registry.instantiate_chain(&config.provider_specs());
        let models = config
            .models
            .iter()
            .filter(|(model, _)| model.as_str() != "*")
            .map(|(model, cfg)| (model.clone(), registry.instantiate_chain(&cfg.chain)))
            .collect();
        Self { provider, models }
    }
}

impl std::fmt::Debug for ResolvedChains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |chain: &[Arc<dyn Transformer>]| {
            chain.iter().map(|t| t.name().to_string()).collect::<Vec<_>>()
        };
        let models: BTreeMap<_, _> = self
            .models
            .iter()
            .map(|(m, chain)| (m.clone(), names(chain.as_slice())))
            .collect();
        f.debug_struct("ResolvedChains")
            .field("provider", &names(self.provider.as_slice()))
            .field("models", &models)
            .finish()
    }
}

fn default_enabled() -> bool {
    true
}

fn serialize_masked<S: Serializer>(key: &str, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&mask_key(key))
}

/// A registered upstream provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    /// Unique identity and routing prefix
    pub name: String,

    /// Caller-supplied identifier, kept as metadata
    pub id: String,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProviderKind>,

    /// Full upstream URL requests are posted to
    pub base_url: String,

    /// Serialized masked
    #[serde(serialize_with = "serialize_masked")]
    pub api_key: String,

    /// Served models, in declaration order
    pub models: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerConfig>,

    pub enabled: bool,

    #[serde(skip)]
    chains: ResolvedChains,
}

impl ProviderDescriptor {
    pub fn new(name: &str, base_url: &str, api_key: &str, models: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            id: name.to_string(),
            kind: None,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            models,
            transformer: None,
            enabled: true,
            chains: ResolvedChains::default(),
        }
    }

    pub fn with_transformer(mut self, config: TransformerConfig) -> Self {
        self.transformer = Some(config);
        self
    }

    /// Provider-wide chain, in configuration order.
    pub fn provider_chain(&self) -> &[Arc<dyn Transformer>] {
        &self.chains.provider
    }

    /// Model-specific chain for `model`; empty when there is no override.
    pub fn model_chain(&self, model: &str) -> &[Arc<dyn Transformer>] {
        self.chains
            .models
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn full_model(&self, model: &str) -> String {
        format!("{},{}", self.name, model)
    }
}

/// Provider registration payload, shared by the HTTP API and the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistration {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(alias = "api_base_url")]
    pub base_url: Option<String>,
    #[serde(alias = "api_key")]
    pub api_key: Option<String>,
    pub models: Option<Vec<String>>,
    #[serde(alias = "transformerConfig")]
    pub transformer: Option<TransformerConfig>,
    pub enabled: Option<bool>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) fn validate_base_url(url: &str) -> ApiResult<()> {
    match reqwest::Url::parse(url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(()),
        _ => Err(ApiError::InvalidRequest(
            "Valid base URL is required".to_string(),
        )),
    }
}

pub(crate) fn validate_models(models: &[String]) -> ApiResult<()> {
    if models.is_empty() || models.iter().any(|m| m.trim().is_empty()) {
        return Err(ApiError::InvalidRequest(
            "At least one model is required".to_string(),
        ));
    }
    Ok(())
}

impl ProviderRegistration {
    /// Validate and build a descriptor. `strict` additionally requires `id`
    /// and `type`, as the HTTP API does.
    pub fn into_descriptor(self, strict: bool) -> ApiResult<ProviderDescriptor> {
        let name = non_empty(&self.name)
            .ok_or_else(|| ApiError::InvalidRequest("Provider name is required".to_string()))?
            .to_string();

        let id = match non_empty(&self.id) {
            Some(id) => id.to_string(),
            None if strict => {
                return Err(ApiError::InvalidRequest(
                    "Provider id is required".to_string(),
                ))
            }
            None => name.clone(),
        };

        let kind = match non_empty(&self.kind) {
            Some(k) => Some(ProviderKind::parse(k).ok_or_else(|| {
                ApiError::InvalidRequest(
                    "Provider type must be one of: openai, anthropic".to_string(),
                )
            })?),
            None if strict => {
                return Err(ApiError::InvalidRequest(
                    "Provider type must be one of: openai, anthropic".to_string(),
                ))
            }
            None => None,
        };

        let base_url = non_empty(&self.base_url)
            .ok_or_else(|| ApiError::InvalidRequest("Valid base URL is required".to_string()))?
            .to_string();
        validate_base_url(&base_url)?;

        let api_key = non_empty(&self.api_key)
            .ok_or_else(|| ApiError::InvalidRequest("API key is required".to_string()))?
            .to_string();

        let models = self.models.unwrap_or_default();
        validate_models(&models)?;

        Ok(ProviderDescriptor {
            name,
            id,
            kind,
            base_url,
            api_key,
            models,
            transformer: self.transformer,
            enabled: self.enabled.unwrap_or_else(default_enabled),
            chains: ResolvedChains::default(),
        })
    }
}

/// Partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ProviderKind>,
    #[serde(alias = "api_base_url")]
    pub base_url: Option<String>,
    #[serde(alias = "api_key")]
    pub api_key: Option<String>,
    pub models: Option<Vec<String>>,
    #[serde(alias = "transformerConfig")]
    pub transformer: Option<TransformerConfig>,
    pub enabled: Option<bool>,
}

/// One routing-table entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub provider: String,
    pub model: String,
    pub full_model: String,
}

/// Result of a successful [`ProviderRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub provider: ProviderDescriptor,
    /// The key that was looked up
    pub original_model: String,
    /// Model name to send upstream
    pub target_model: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    providers: HashMap<String, ProviderDescriptor>,
    order: Vec<String>,
    routes: HashMap<String, RouteEntry>,
}

impl RegistryState {
    fn install_routes(&mut self, name: &str) {
        let Some(provider) = self.providers.get(name) else {
            return;
        };
        for model in &provider.models {
            let entry = RouteEntry {
                provider: provider.name.clone(),
                model: model.clone(),
                full_model: provider.full_model(model),
            };
            self.routes
                .entry(model.clone())
                .or_insert_with(|| entry.clone());
            self.routes.insert(entry.full_model.clone(), entry);
        }
    }

    /// Remove `name`'s entries for `models`; returns the bare keys it owned.
    fn purge_routes(&mut self, name: &str, models: &[String]) -> Vec<String> {
        let mut freed = Vec::new();
        for model in models {
            self.routes.remove(&format!("{},{}", name, model));
            if self
                .routes
                .get(model)
                .is_some_and(|entry| entry.provider == name)
            {
                self.routes.remove(model);
                freed.push(model.clone());
            }
        }
        freed
    }

    /// Hand freed bare keys to the earliest-registered provider still serving them.
    fn reclaim(&mut self, freed: Vec<String>) {
        for model in freed {
            if self.routes.contains_key(&model) {
                continue;
            }
            let heir = self
                .order
                .iter()
                .filter_map(|n| self.providers.get(n))
                .find(|p| p.models.contains(&model));
            if let Some(heir) = heir {
                let entry = RouteEntry {
                    provider: heir.name.clone(),
                    model: model.clone(),
                    full_model: heir.full_model(&model),
                };
                self.routes.insert(model, entry);
            }
        }
    }
}

/// Live providers and their routing table.
pub struct ProviderRegistry {
    transformers: Arc<TransformerRegistry>,
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    pub fn new(transformers: Arc<TransformerRegistry>) -> Self {
        Self {
            transformers,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn transformers(&self) -> &Arc<TransformerRegistry> {
        &self.transformers
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace by name. A replaced provider keeps its registration slot.
    pub fn register(&self, descriptor: ProviderDescriptor) -> ProviderDescriptor {
        let descriptor = self.with_chains(descriptor);
        let mut state = self.write();
        Self::insert_locked(&mut state, descriptor.clone());
        descriptor
    }

    /// Insert only when no provider with the same name exists.
    pub fn register_if_absent(&self, descriptor: ProviderDescriptor) -> Option<ProviderDescriptor> {
        let descriptor = self.with_chains(descriptor);
        let mut state = self.write();
        if state.providers.contains_key(&descriptor.name) {
            return None;
        }
        Self::insert_locked(&mut state, descriptor.clone());
        Some(descriptor)
    }

    fn with_chains(&self, mut descriptor: ProviderDescriptor) -> ProviderDescriptor {
        descriptor.chains =
            ResolvedChains::build(descriptor.transformer.as_ref(), &self.transformers);
        descriptor
    }

    fn insert_locked(state: &mut RegistryState, descriptor: ProviderDescriptor) {
        let name = descriptor.name.clone();
        let models = descriptor.models.len();
        let previous = state.providers.get(&name).map(|old| old.models.clone());
        let freed = match previous {
            Some(old_models) => state.purge_routes(&name, &old_models),
            None => {
                state.order.push(name.clone());
                Vec::new()
            }
        };
        state.providers.insert(name.clone(), descriptor);
        state.install_routes(&name);
        state.reclaim(freed);

        tracing::debug!(provider = %name, models, "Registered provider");
    }

    /// Look up a bare or fully-qualified model key.
    pub fn resolve(&self, model_key: &str) -> Option<ResolvedRoute> {
        let state = self.read();
        let entry = state.routes.get(model_key)?;
        let provider = state.providers.get(&entry.provider)?;
        Some(ResolvedRoute {
            provider: provider.clone(),
            original_model: model_key.to_string(),
            target_model: entry.model.clone(),
        })
    }

    /// Merge `patch` into provider `name`. Returns `None` when it does not exist.
    pub fn update(&self, name: &str, patch: ProviderPatch) -> Option<ProviderDescriptor> {
        let mut state = self.write();
        let current = state.providers.get(name)?.clone();

        let mut next = current.clone();
        if let Some(id) = patch.id {
            next.id = id;
        }
        if let Some(kind) = patch.kind {
            next.kind = Some(kind);
        }
        if let Some(base_url) = patch.base_url {
            next.base_url = base_url;
        }
        if let Some(api_key) = patch.api_key {
            next.api_key = api_key;
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(config) = patch.transformer {
            next.chains = ResolvedChains::build(Some(&config), &self.transformers);
            next.transformer = Some(config);
        }

        let models_changed = patch.models.is_some();
        if let Some(models) = patch.models {
            next.models = models;
        }

        if models_changed {
            let freed = state.purge_routes(name, &current.models);
            state.providers.insert(name.to_string(), next.clone());
            state.install_routes(name);
            state.reclaim(freed);
        } else {
            state.providers.insert(name.to_string(), next.clone());
        }
        Some(next)
    }

    /// Remove provider `name` and its routes. Returns `false` when absent.
    pub fn delete(&self, name: &str) -> bool {
        let mut state = self.write();
        let Some(removed) = state.providers.remove(name) else {
            return false;
        };
        state.order.retain(|n| n != name);
        let freed = state.purge_routes(name, &removed.models);
        state.reclaim(freed);
        true
    }

    /// Flip the availability flag; routes are left intact.
    pub fn toggle_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.write();
        match state.providers.get_mut(name) {
            Some(p) => {
                p.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<ProviderDescriptor> {
        self.read().providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().providers.contains_key(name)
    }

    /// All providers in registration order.
    pub fn list(&self) -> Vec<ProviderDescriptor> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|n| state.providers.get(n).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routing table as `(key, entry)`, ordered by provider registration and
    /// model order, the full key before the bare one.
    pub fn routes(&self) -> Vec<(String, RouteEntry)> {
        let state = self.read();
        let mut out = Vec::with_capacity(state.routes.len());
        for provider in state.order.iter().filter_map(|n| state.providers.get(n)) {
            for model in &provider.models {
                let full = provider.full_model(model);
                if let Some(entry) = state.routes.get(&full) {
                    out.push((full, entry.clone()));
                }
                if let Some(entry) = state.routes.get(model) {
                    if entry.provider == provider.name {
                        out.push((model.clone(), entry.clone()));
                    }
                }
            }
        }
        out
    }

    /// Every resolvable model key.
    pub fn available_model_names(&self) -> Vec<String> {
        self.routes().into_iter().map(|(key, _)| key).collect()
    }

    /// Drop every provider.
    pub fn clear(&self) {
        let mut state = self.write();
        *state = RegistryState::default();
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("ProviderRegistry")
            .field("providers", &state.order)
            .field("routes", &state.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(TransformerRegistry::with_builtins()))
    }

    fn provider(name: &str, models: &[&str]) -> ProviderDescriptor {
        ProviderDescriptor::new(
            name,
            "https://api.example/v1/chat/completions",
            "k",
            models.iter().map(|m| m.to_string()).collect(),
        )
    }

    #[test]
    fn full_keys_resolve_for_every_model() {
        let reg = registry();
        reg.register(provider("a", &["x", "y"]));
        reg.register(provider("b", &["z"]));
        for (p, m) in [("a", "x"), ("a", "y"), ("b", "z")] {
            let hit = reg.resolve(&format!("{},{}", p, m)).unwrap();
            assert_eq!(hit.provider.name, p);
            assert_eq!(hit.target_model, m);
        }
    }

    #[test]
    fn bare_keys_are_first_wins() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        reg.register(provider("b", &["x"]));

        assert_eq!(reg.resolve("x").unwrap().provider.name, "a");
        let via_full = reg.resolve("b,x").unwrap();
        assert_eq!(via_full.provider.name, "b");
        assert_eq!(via_full.original_model, "b,x");
        assert_eq!(via_full.target_model, "x");
    }

    #[test]
    fn delete_removes_both_key_forms() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        assert!(reg.delete("a"));
        assert!(reg.resolve("x").is_none());
        assert!(reg.resolve("a,x").is_none());
        assert!(!reg.delete("a"));
    }

    #[test]
    fn delete_hands_bare_key_to_next_provider() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        reg.register(provider("b", &["x"]));
        reg.register(provider("c", &["x"]));
        assert!(reg.delete("a"));
        assert_eq!(reg.resolve("x").unwrap().provider.name, "b");
    }

    #[test]
    fn model_update_removes_exactly_its_own_stale_routes() {
        let reg = registry();
        reg.register(provider("a", &["shared", "old"]));
        reg.register(provider("b", &["shared", "other"]));

        let updated = reg
            .update(
                "a",
                ProviderPatch {
                    models: Some(vec!["new".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.models, vec!["new".to_string()]);

        assert!(reg.resolve("a,old").is_none());
        assert!(reg.resolve("old").is_none());
        assert!(reg.resolve("a,shared").is_none());
        assert_eq!(reg.resolve("a,new").unwrap().provider.name, "a");
        assert_eq!(reg.resolve("new").unwrap().provider.name, "a");

        // b's routes are untouched; it inherits the freed bare key
        assert_eq!(reg.resolve("b,shared").unwrap().provider.name, "b");
        assert_eq!(reg.resolve("shared").unwrap().provider.name, "b");
        assert_eq!(reg.resolve("other").unwrap().provider.name, "b");
    }

    #[test]
    fn update_keeping_a_model_keeps_its_bare_key() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        reg.register(provider("b", &["x"]));
        reg.update(
            "a",
            ProviderPatch {
                models: Some(vec!["x".into(), "y".into()]),
                ..Default::default()
            },
        );
        assert_eq!(reg.resolve("x").unwrap().provider.name, "a");
    }

    #[test]
    fn missing_targets_return_sentinels() {
        let reg = registry();
        assert!(reg.update("nope", ProviderPatch::default()).is_none());
        assert!(!reg.toggle_enabled("nope", false));
        assert!(reg.get("nope").is_none());
        assert!(reg.resolve("nope,x").is_none());
    }

    #[test]
    fn toggle_keeps_routes() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        assert!(reg.toggle_enabled("a", false));
        let hit = reg.resolve("x").unwrap();
        assert!(!hit.provider.enabled);
    }

    #[test]
    fn register_if_absent_refuses_duplicates() {
        let reg = registry();
        assert!(reg.register_if_absent(provider("a", &["x"])).is_some());
        assert!(reg.register_if_absent(provider("a", &["y"])).is_none());
        assert!(reg.resolve("y").is_none());
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        reg.register(provider("b", &["y"]));
        reg.register(provider("a", &["z"]));

        let names: Vec<_> = reg.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(reg.resolve("x").is_none());
        assert_eq!(reg.resolve("z").unwrap().provider.name, "a");
    }

    #[test]
    fn routes_listing_is_ordered() {
        let reg = registry();
        reg.register(provider("a", &["x"]));
        reg.register(provider("b", &["x", "y"]));
        assert_eq!(
            reg.available_model_names(),
            vec!["a,x", "x", "b,x", "b,y", "y"]
        );
    }

    #[test]
    fn chains_resolve_from_config() {
        let reg = registry();
        let config: TransformerConfig = serde_json::from_value(json!({
            "use": ["openai"],
            "*": {"use": ["sampling"]},
            "gpt-4o": {"use": [["maxtoken", {"max_tokens": 16}], "missing"]}
        }))
        .unwrap();
        let stored = reg.register(provider("a", &["gpt-4o"]).with_transformer(config));

        let names: Vec<_> = stored.provider_chain().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["openai", "sampling"]);
        let model: Vec<_> = stored.model_chain("gpt-4o").iter().map(|t| t.name()).collect();
        assert_eq!(model, vec!["maxtoken"]);
        assert!(stored.model_chain("other").is_empty());
        assert!(stored.model_chain("*").is_empty());
    }

    #[test]
    fn registration_validation_messages() {
        let missing_name = ProviderRegistration::default().into_descriptor(false);
        assert_eq!(
            missing_name.unwrap_err().to_string(),
            "Provider name is required"
        );

        let bad_url = ProviderRegistration {
            name: Some("a".into()),
            base_url: Some("not a url".into()),
            api_key: Some("k".into()),
            models: Some(vec!["m".into()]),
            ..Default::default()
        }
        .into_descriptor(false);
        assert_eq!(bad_url.unwrap_err().to_string(), "Valid base URL is required");

        let no_models = ProviderRegistration {
            name: Some("a".into()),
            base_url: Some("https://x/v1".into()),
            api_key: Some("k".into()),
            models: Some(vec![]),
            ..Default::default()
        }
        .into_descriptor(false);
        assert_eq!(
            no_models.unwrap_err().to_string(),
            "At least one model is required"
        );

        let strict = ProviderRegistration {
            name: Some("a".into()),
            base_url: Some("https://x/v1".into()),
            api_key: Some("k".into()),
            models: Some(vec!["m".into()]),
            ..Default::default()
        };
        assert!(strict.clone().into_descriptor(true).is_err());
        let relaxed = strict.into_descriptor(false).unwrap();
        assert_eq!(relaxed.id, "a");
        assert!(relaxed.enabled);
    }

    #[test]
    fn registration_accepts_legacy_spellings() {
        let reg: ProviderRegistration = serde_json::from_value(json!({
            "name": "deepseek",
            "api_base_url": "https://api.deepseek.com/chat/completions",
            "api_key": "sk-xxx",
            "models": ["deepseek-chat"],
            "transformer": {"use": ["openai"]}
        }))
        .unwrap();
        let desc = reg.into_descriptor(false).unwrap();
        assert_eq!(desc.base_url, "https://api.deepseek.com/chat/completions");
        assert_eq!(desc.api_key, "sk-xxx");
    }

    #[test]
    fn serialized_descriptor_masks_key() {
        let desc = ProviderDescriptor::new("a", "https://x/v1", "sk-1234567890", vec!["m".into()]);
        let v = serde_json::to_value(&desc).unwrap();
        assert_eq!(v["apiKey"], "...567890");
        assert_eq!(v["baseUrl"], "https://x/v1");
    }
}
