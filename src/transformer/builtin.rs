//! Built-in transformers.
//!
//! - `openai`: owns `/v1/chat/completions`; OpenAI chat dialect in and out
//! - `maxtoken`: caps `max_tokens`
//! - `headers`: static outbound headers
//! - `sampling`: forces `temperature` / `top_p`

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{
    Capabilities, Capability, OutboundHeaders, RequestConfig, Transformed, Transformer,
    TransformerContext, TransformerRegistry,
};
use crate::dispatch::{ProviderResponse, ResponseBody};
use crate::error::TransformError;
use crate::models::{UnifiedChatRequest, UnifiedChatResponse};
use crate::providers::ProviderDescriptor;

pub const OPENAI_CHAT_ENDPOINT: &str = "/v1/chat/completions";

/// Context key holding the caller's `stream` flag.
pub const CTX_STREAM: &str = "stream";

pub fn register_builtins(registry: &mut TransformerRegistry) {
    let results = [
        registry.register("openai", |_| {
            Ok(Arc::new(OpenAiTransformer) as Arc<dyn Transformer>)
        }),
        registry.register("maxtoken", |opts| {
            Ok(Arc::new(MaxTokenTransformer::from_options(opts)?) as Arc<dyn Transformer>)
        }),
        registry.register("headers", |opts| {
            Ok(Arc::new(HeadersTransformer::from_options(opts)?) as Arc<dyn Transformer>)
        }),
        registry.register("sampling", |opts| {
            Ok(Arc::new(SamplingTransformer::from_options(opts)?) as Arc<dyn Transformer>)
        }),
    ];
    for result in results {
        if let Err(e) = result {
            tracing::error!("Failed to register built-in transformer: {}", e);
        }
    }
}

fn parse_options<T>(name: &str, opts: Option<&Value>) -> Result<T, TransformError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match opts {
        None => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| TransformError::Failed {
            name: name.to_string(),
            message: format!("invalid options: {}", e),
        }),
    }
}

fn body_object<'a>(
    name: &str,
    body: &'a mut Value,
) -> Result<&'a mut Map<String, Value>, TransformError> {
    body.as_object_mut().ok_or_else(|| TransformError::Failed {
        name: name.to_string(),
        message: "request body is not a JSON object".to_string(),
    })
}

/// OpenAI chat-completions dialect.
#[derive(Debug, Default)]
pub struct OpenAiTransformer;

#[async_trait]
impl Transformer for OpenAiTransformer {
    fn name(&self) -> &str {
        "openai"
    }

    fn endpoint(&self) -> Option<&str> {
        Some(OPENAI_CHAT_ENDPOINT)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::of(&[
            Capability::RequestOut,
            Capability::RequestIn,
            Capability::ResponseIn,
            Capability::Auth,
        ])
    }

    async fn request_out(
        &self,
        body: Value,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        let request: UnifiedChatRequest = serde_json::from_value(body)
            .map_err(|e| TransformError::InvalidPayload(e.to_string()))?;
        Ok(Transformed::body(serde_json::to_value(request)?))
    }

    async fn request_in(
        &self,
        mut body: Value,
        _provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        let obj = body_object(self.name(), &mut body)?;
        // Canonical reasoning controls map onto `reasoning_effort`.
        if let Some(reasoning) = obj.remove("reasoning") {
            if let Some(effort) = reasoning.get("effort").filter(|e| !e.is_null()) {
                obj.insert("reasoning_effort".to_string(), effort.clone());
            }
        }
        Ok(Transformed::body(body))
    }

    async fn response_in(
        &self,
        response: ProviderResponse,
        ctx: &mut TransformerContext,
    ) -> Result<ProviderResponse, TransformError> {
        let streaming = ctx
            .get(CTX_STREAM)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if streaming || !response.status.is_success() {
            return Ok(response);
        }

        let ProviderResponse {
            status,
            headers,
            body,
        } = response;
        let bytes = body.into_bytes().await.map_err(|e| TransformError::Failed {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parsed) = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .as_ref()
            .and_then(UnifiedChatResponse::from_chat_completion)
        {
            if let Some(usage) = parsed.usage {
                tracing::debug!(
                    request_id = ctx.request_id(),
                    model = %parsed.model,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "usage"
                );
            }
        }
        Ok(ProviderResponse {
            status,
            headers,
            body: ResponseBody::Buffered(bytes),
        })
    }

    async fn auth(
        &self,
        body: Value,
        provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        let mut headers = OutboundHeaders::new();
        headers.set("authorization", format!("Bearer {}", provider.api_key));
        headers.remove("host");
        Ok(Transformed::with_config(
            body,
            RequestConfig {
                headers,
                ..Default::default()
            },
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
struct MaxTokenOptions {
    max_tokens: Option<u32>,
}

/// Sets `max_tokens` when absent and lowers it when above the cap.
#[derive(Debug)]
pub struct MaxTokenTransformer {
    max_tokens: Option<u32>,
}

impl MaxTokenTransformer {
    pub fn from_options(opts: Option<&Value>) -> Result<Self, TransformError> {
        let opts: MaxTokenOptions = parse_options("maxtoken", opts)?;
        Ok(Self {
            max_tokens: opts.max_tokens,
        })
    }
}

#[async_trait]
impl Transformer for MaxTokenTransformer {
    fn name(&self) -> &str {
        "maxtoken"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::of(&[Capability::RequestIn])
    }

    async fn request_in(
        &self,
        mut body: Value,
        _provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        let Some(cap) = self.max_tokens else {
            return Ok(Transformed::body(body));
        };
        let obj = body_object(self.name(), &mut body)?;
        let current = obj.get("max_tokens").and_then(Value::as_u64);
        if current.map_or(true, |n| n > u64::from(cap)) {
            obj.insert("max_tokens".to_string(), Value::from(cap));
        }
        Ok(Transformed::body(body))
    }
}

/// Contributes fixed outbound headers.
#[derive(Debug)]
pub struct HeadersTransformer {
    headers: OutboundHeaders,
}

impl HeadersTransformer {
    pub fn from_options(opts: Option<&Value>) -> Result<Self, TransformError> {
        let map: std::collections::BTreeMap<String, String> = parse_options("headers", opts)?;
        let mut headers = OutboundHeaders::new();
        for (k, v) in map {
            headers.set(&k, v);
        }
        Ok(Self { headers })
    }
}

#[async_trait]
impl Transformer for HeadersTransformer {
    fn name(&self) -> &str {
        "headers"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::of(&[Capability::RequestIn])
    }

    async fn request_in(
        &self,
        body: Value,
        _provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        Ok(Transformed::with_config(
            body,
            RequestConfig {
                headers: self.headers.clone(),
                ..Default::default()
            },
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
struct SamplingOptions {
    temperature: Option<f64>,
    top_p: Option<f64>,
}

/// Overrides sampling parameters.
#[derive(Debug)]
pub struct SamplingTransformer {
    temperature: Option<f64>,
    top_p: Option<f64>,
}

impl SamplingTransformer {
    pub fn from_options(opts: Option<&Value>) -> Result<Self, TransformError> {
        let opts: SamplingOptions = parse_options("sampling", opts)?;
        Ok(Self {
            temperature: opts.temperature,
            top_p: opts.top_p,
        })
    }
}

#[async_trait]
impl Transformer for SamplingTransformer {
    fn name(&self) -> &str {
        "sampling"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::of(&[Capability::RequestIn])
    }

    async fn request_in(
        &self,
        mut body: Value,
        _provider: &ProviderDescriptor,
        _ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        let obj = body_object(self.name(), &mut body)?;
        if let Some(t) = self.temperature {
            obj.insert("temperature".to_string(), Value::from(t));
        }
        if let Some(p) = self.top_p {
            obj.insert("top_p".to_string(), Value::from(p));
        }
        Ok(Transformed::body(body))
    }
}
