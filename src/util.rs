use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::dispatch::{DispatchSettings, UpstreamDispatcher};
use crate::error::{ApiError, ApiResult};
use crate::providers::{ProviderDescriptor, ProviderRegistry};
use crate::route_rules::RouteRuleMatcher;
use crate::transformer::TransformerRegistry;

/// Load environment files before anything reads the environment.
///
/// Tries ENV_FILE / DOTENV_PATH first, then `.env` discovery from the working
/// directory. Returns a description of the source for logging.
pub fn load_env_files() -> String {
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                return format!("{p} ({key})");
            }
        }
    }
    match dotenvy::dotenv() {
        Ok(path) => path.display().to_string(),
        Err(_) => "none".into(),
    }
}

/// Initialize structured tracing. `RUST_LOG` wins over `log_level`; the
/// default is `info`.
pub fn init_tracing(log_level: Option<&str>) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| log_level.map(str::to_string))
        .unwrap_or_else(|| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Last six characters of a secret, or `missing` for empty and unresolved
/// `${...}` values.
pub fn mask_key(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() || key.contains("${") {
        return "missing".into();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("...{tail}")
}

/// Build the upstream HTTP client: connect timeout, optional proxy, user agent.
/// The overall timeout is applied per request by the dispatcher.
pub fn build_http_client(settings: &DispatchSettings) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().connect_timeout(settings.connect_timeout);

    if let Some(url) = settings.https_proxy.as_deref() {
        match reqwest::Proxy::all(url) {
            Ok(p) => builder = builder.proxy(p),
            Err(e) => tracing::warn!("Ignoring invalid proxy URL {}: {}", url, e),
        }
    }

    builder = builder.user_agent(format!("llm-relay/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Falling back to default HTTP client: {}", e);
        reqwest::Client::new()
    })
}

/// Where a caller's model string ends up.
#[derive(Debug, Clone)]
pub struct ModelTarget {
    pub provider: ProviderDescriptor,
    /// Model name sent upstream
    pub model: String,
    /// Model string as the caller sent it
    pub original: String,
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub route_rules: Arc<RouteRuleMatcher>,
    pub dispatcher: UpstreamDispatcher,
    /// Fallback `provider,model`
    pub default_model: String,
    pub config: Arc<AppConfig>,
    /// Cancelled on shutdown; aborts in-flight upstream calls
    pub shutdown_token: CancellationToken,
}

impl AppState {
    /// Build state from configuration without registering any provider.
    pub fn new(config: AppConfig) -> Self {
        let mut transformers = TransformerRegistry::with_builtins();
        for spec in config.transformer_options() {
            match spec.options() {
                Some(opts) if transformers.contains(spec.name()) => {
                    transformers.set_default_options(spec.name(), opts.clone());
                }
                Some(_) => {
                    tracing::warn!("Options for unknown transformer '{}' ignored", spec.name())
                }
                None => {}
            }
        }

        let registry = Arc::new(ProviderRegistry::new(Arc::new(transformers)));
        let route_rules = Arc::new(RouteRuleMatcher::new(config.router().rules));
        let settings = config.dispatch_settings();
        let dispatcher = UpstreamDispatcher::new(build_http_client(&settings), settings);

        Self {
            registry,
            route_rules,
            dispatcher,
            default_model: config.default_model(),
            config: Arc::new(config),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Build state and register every provider from the configuration.
    pub fn init(config: AppConfig) -> Self {
        let state = Self::new(config);
        let registered = state.register_configured_providers();
        tracing::info!(
            providers = registered,
            rules = state.route_rules.len(),
            default_model = %state.default_model,
            "Relay state initialized"
        );
        state
    }

    /// Validate and register configured providers. Invalid entries are
    /// logged and skipped. Returns the number registered.
    pub fn register_configured_providers(&self) -> usize {
        let mut count = 0;
        for entry in self.config.providers() {
            let label = entry.name.clone().unwrap_or_else(|| "<unnamed>".into());
            match entry.into_descriptor(false) {
                Ok(desc) => {
                    let preview: Vec<&str> = desc.models.iter().take(3).map(String::as_str).collect();
                    tracing::info!(
                        provider = %desc.name,
                        base_url = %desc.base_url,
                        api_key = %mask_key(&desc.api_key),
                        models = desc.models.len(),
                        first_models = ?preview,
                        "Provider configured"
                    );
                    self.registry.register(desc);
                    count += 1;
                }
                Err(e) => tracing::warn!("Skipping provider {}: {}", label, e),
            }
        }
        count
    }

    pub fn transformers(&self) -> &Arc<TransformerRegistry> {
        self.registry.transformers()
    }

    /// Resolve a caller model string to a live, enabled provider and model.
    ///
    /// `provider,model` is taken literally. A bare name is looked up in the
    /// routing table, then in the route rules, then replaced by the default model.
    pub fn resolve_model(&self, raw: &str) -> ApiResult<ModelTarget> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ApiError::InvalidRequest(
                "Missing model in request body".to_string(),
            ));
        }

        let target = if raw.contains(',') {
            self.resolve_qualified(raw, raw)?
        } else if let Some(hit) = self.registry.resolve(raw) {
            ModelTarget {
                provider: hit.provider,
                model: hit.target_model,
                original: raw.to_string(),
            }
        } else {
            let default_provider = self.default_model.split_once(',').map(|(p, _)| p.trim());
            match self.route_rules.resolve(raw, default_provider) {
                Some(hit) => {
                    tracing::debug!(
                        model = raw,
                        routed = %hit.model,
                        rule = ?hit.description,
                        "Route rule matched"
                    );
                    self.resolve_qualified(&hit.model, raw)?
                }
                None => {
                    tracing::info!(
                        "No route for model '{}', using default {}",
                        raw,
                        self.default_model
                    );
                    self.resolve_qualified(&self.default_model, raw)?
                }
            }
        };

        if !target.provider.enabled {
            return Err(ApiError::InvalidRequest(format!(
                "Provider '{}' is disabled",
                target.provider.name
            )));
        }
        Ok(target)
    }

    fn resolve_qualified(&self, key: &str, original: &str) -> ApiResult<ModelTarget> {
        let (provider, model) = key
            .split_once(',')
            .map(|(p, m)| (p.trim(), m.trim()))
            .unwrap_or(("", ""));
        if provider.is_empty() || model.is_empty() {
            return Err(ApiError::InvalidRequest(format!(
                "Model '{}' must be in the form 'provider,model'",
                key
            )));
        }

        if let Some(hit) = self.registry.resolve(&format!("{},{}", provider, model)) {
            return Ok(ModelTarget {
                provider: hit.provider,
                model: hit.target_model,
                original: original.to_string(),
            });
        }
        let descriptor = self
            .registry
            .get(provider)
            .ok_or_else(|| ApiError::ProviderNotFound(format!("Provider '{}' not found", provider)))?;
        Ok(ModelTarget {
            provider: descriptor,
            model: model.to_string(),
            original: original.to_string(),
        })
    }

    /// Abort in-flight upstream calls and release registry contents.
    pub fn shutdown(&self) {
        tracing::info!(providers = self.registry.len(), "Shutting down relay state");
        self.shutdown_token.cancel();
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> AppState {
        let config = AppConfig::from_value(json!({
            "Router": {"default": "openrouter,anthropic/claude-3.5-sonnet"},
            "providers": [
                {"name": "openrouter", "baseUrl": "https://openrouter.ai/api/v1/chat/completions",
                 "apiKey": "sk-or", "models": ["anthropic/claude-sonnet-4.5", "anthropic/claude-3.5-sonnet"]},
                {"name": "deepseek", "baseUrl": "https://api.deepseek.com/chat/completions",
                 "apiKey": "sk-ds", "models": ["deepseek-chat"]},
                {"name": "broken", "baseUrl": "nope", "apiKey": "x", "models": ["m"]}
            ]
        }))
        .unwrap();
        AppState::init(config)
    }

    #[test]
    fn mask_key_variants() {
        assert_eq!(mask_key("sk-1234567890"), "...567890");
        assert_eq!(mask_key("abc"), "***");
        assert_eq!(mask_key(""), "missing");
        assert_eq!(mask_key("${OPENROUTER_KEY}"), "missing");
    }

    #[test]
    fn configured_providers_register_and_invalid_are_skipped() {
        let s = state();
        assert_eq!(s.registry.len(), 2);
        assert!(s.registry.get("broken").is_none());
    }

    #[test]
    fn resolution_order() {
        let s = state();

        let qualified = s.resolve_model("deepseek,deepseek-chat").unwrap();
        assert_eq!(qualified.provider.name, "deepseek");

        let bare = s.resolve_model("deepseek-chat").unwrap();
        assert_eq!(bare.provider.name, "deepseek");
        assert_eq!(bare.original, "deepseek-chat");

        let ruled = s.resolve_model("claude-sonnet").unwrap();
        assert_eq!(ruled.provider.name, "openrouter");
        assert_eq!(ruled.model, "anthropic/claude-sonnet-4.5");

        let fallback = s.resolve_model("mystery-model").unwrap();
        assert_eq!(fallback.model, "anthropic/claude-3.5-sonnet");
        assert_eq!(fallback.original, "mystery-model");
    }

    #[test]
    fn qualified_model_outside_list_is_allowed() {
        let s = state();
        let t = s.resolve_model("openrouter,openai/gpt-4o").unwrap();
        assert_eq!(t.provider.name, "openrouter");
        assert_eq!(t.model, "openai/gpt-4o");
    }

    #[test]
    fn resolution_errors() {
        let s = state();
        assert_eq!(s.resolve_model("").unwrap_err().code(), "invalid_request");
        assert_eq!(
            s.resolve_model("ghost,model").unwrap_err().code(),
            "provider_not_found"
        );
        assert_eq!(
            s.resolve_model("deepseek,").unwrap_err().code(),
            "invalid_request"
        );

        s.registry.toggle_enabled("deepseek", false);
        let err = s.resolve_model("deepseek-chat").unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn shutdown_clears_registry() {
        let s = state();
        s.shutdown();
        assert!(s.registry.is_empty());
        assert!(s.shutdown_token.is_cancelled());
    }
}
