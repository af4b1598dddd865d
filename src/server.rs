use std::sync::Arc;
use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::models::UnifiedMessage;
use crate::pipeline::{forwardable_headers, TransformerChain};
use crate::providers::{validate_base_url, validate_models, ProviderPatch, ProviderRegistration};
use crate::response::format_response;
use crate::transformer::builtin::CTX_STREAM;
use crate::transformer::{Transformer, TransformerContext, TransformerRegistry};
use crate::util::AppState;

/// Request body limit for JSON endpoints.
pub const BODY_LIMIT: usize = 50 * 1024 * 1024;

/// JSON extractor config: body limit, and parse failures rendered as `invalid_request`.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(BODY_LIMIT)
        .error_handler(|err, _req| ApiError::InvalidRequest(err.to_string()).into())
}

/// Register every route. Transformer endpoints come from `transformers`.
pub fn config_routes(cfg: &mut web::ServiceConfig, transformers: &TransformerRegistry) {
    cfg.app_data(json_config())
        .app_data(web::PayloadConfig::new(BODY_LIMIT));

    let mut scope = web::scope("")
        .route("/", web::get().to(root))
        .route("/health", web::get().to(health))
        .route("/v1/models", web::get().to(list_models))
        .route("/providers", web::post().to(create_provider))
        .route("/providers", web::get().to(list_providers))
        .route("/providers/{id}", web::get().to(get_provider))
        .route("/providers/{id}", web::put().to(update_provider))
        .route("/providers/{id}", web::delete().to(delete_provider))
        .route("/providers/{id}/toggle", web::patch().to(toggle_provider));

    for transformer in transformers.endpoint_transformers() {
        let Some(path) = transformer.endpoint().map(str::to_string) else {
            continue;
        };
        tracing::debug!(transformer = transformer.name(), path = %path, "Endpoint registered");
        scope = scope.route(
            &path,
            web::post().to(
                move |state: web::Data<AppState>, req: HttpRequest, body: web::Bytes| {
                    let transformer = transformer.clone();
                    async move { handle_transformer_endpoint(state, req, body, transformer).await }
                },
            ),
        );
    }

    cfg.service(scope);
}

async fn root() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "message": "LLM Relay API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// OpenAI-style model list with every resolvable key.
async fn list_models(state: web::Data<AppState>) -> impl Responder {
    let data: Vec<Value> = state
        .registry
        .routes()
        .into_iter()
        .map(|(id, entry)| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": entry.provider,
            })
        })
        .collect();
    HttpResponse::Ok().json(json!({ "object": "list", "data": data }))
}

fn last_user_excerpt(body: &Value) -> Option<String> {
    let message = body
        .get("messages")?
        .as_array()?
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;
    let parsed: UnifiedMessage = serde_json::from_value(message.clone()).ok()?;
    let text = parsed.content?.text();
    Some(text.chars().take(80).collect())
}

async fn handle_transformer_endpoint(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
    transformer: Arc<dyn Transformer>,
) -> ApiResult<HttpResponse> {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    let mut body: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON body: {}", e)))?;
    let Some(obj) = body.as_object_mut() else {
        return Err(ApiError::InvalidRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };
    let stream = obj
        .entry("stream")
        .or_insert(Value::Bool(false))
        .as_bool()
        .unwrap_or(false);
    let raw_model = obj
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let target = state.resolve_model(&raw_model)?;
    obj.insert("model".to_string(), Value::String(target.model.clone()));
    let provider = &target.provider;

    tracing::info!(
        request_id = %request_id,
        model = %target.original,
        provider = %provider.name,
        query = ?last_user_excerpt(&body),
        "received"
    );

    let chain = TransformerChain::build(transformer, provider, &target.model);
    let mut ctx = TransformerContext::new(request_id.clone());
    ctx.insert(CTX_STREAM, Value::Bool(stream));

    let caller_headers = forwardable_headers(
        req.headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let prepared = chain
        .process_request(body, &caller_headers, provider, &mut ctx)
        .await?;

    tracing::info!(
        request_id = %request_id,
        original_model = %target.original,
        final_model = %target.model,
        provider = %provider.name,
        url = %prepared.config.url.as_deref().unwrap_or(&provider.base_url),
        bypass = chain.is_bypass(),
        stages = ?chain.stage_names(),
        "executing"
    );

    let response = state
        .dispatcher
        .dispatch(
            &prepared.body,
            &prepared.config,
            provider,
            chain.is_bypass(),
            Some(&state.shutdown_token),
        )
        .await?;
    let response = chain.process_response(response, &mut ctx).await?;

    tracing::info!(
        request_id = %request_id,
        model = %target.model,
        provider = %provider.name,
        duration_ms = started.elapsed().as_millis() as u64,
        "completed"
    );

    format_response(response, stream).await
}

async fn create_provider(
    state: web::Data<AppState>,
    payload: web::Json<ProviderRegistration>,
) -> ApiResult<HttpResponse> {
    let descriptor = payload.into_inner().into_descriptor(true)?;
    let name = descriptor.name.clone();
    let stored = state.registry.register_if_absent(descriptor).ok_or_else(|| {
        ApiError::ProviderExists(format!("Provider with name '{}' already exists", name))
    })?;
    tracing::info!(provider = %stored.name, models = stored.models.len(), "Provider registered");
    Ok(HttpResponse::Ok().json(stored))
}

async fn list_providers(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.registry.list())
}

fn not_found() -> ApiError {
    ApiError::ProviderNotFound("Provider not found".to_string())
}

async fn get_provider(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let provider = state.registry.get(&path).ok_or_else(not_found)?;
    Ok(HttpResponse::Ok().json(provider))
}

async fn update_provider(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ProviderPatch>,
) -> ApiResult<HttpResponse> {
    let name = path.into_inner();
    let patch = payload.into_inner();

    if patch.name.as_deref().is_some_and(|n| n != name) {
        return Err(ApiError::InvalidRequest(
            "Provider name cannot be changed".to_string(),
        ));
    }
    if let Some(url) = patch.base_url.as_deref() {
        validate_base_url(url)?;
    }
    if let Some(models) = patch.models.as_deref() {
        validate_models(models)?;
    }
    if patch.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
        return Err(ApiError::InvalidRequest("API key is required".to_string()));
    }

    let updated = state.registry.update(&name, patch).ok_or_else(not_found)?;
    tracing::info!(provider = %updated.name, "Provider updated");
    Ok(HttpResponse::Ok().json(updated))
}

async fn delete_provider(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    if !state.registry.delete(&path) {
        return Err(not_found());
    }
    tracing::info!(provider = %path.as_str(), "Provider deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Provider deleted successfully" })))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_provider(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ToggleRequest>,
) -> ApiResult<HttpResponse> {
    let enabled = payload.enabled;
    if !state.registry.toggle_enabled(&path, enabled) {
        return Err(not_found());
    }
    let verb = if enabled { "enabled" } else { "disabled" };
    tracing::info!(provider = %path.as_str(), enabled, "Provider toggled");
    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Provider {} successfully", verb)
    })))
}
