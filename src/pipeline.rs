//! Transformer Chain
//!
//! Runs one request through the endpoint transformer and the provider's chain:
//! - Request path: endpoint `request_out`, then every chain member's
//!   `request_in` (provider-level first, then model-level), in order
//! - Response path: provider-level members in reverse through `response_out`,
//!   then model-level members in reverse, then the endpoint's `response_in`
//! - Bypass: when the provider's only chain member is the endpoint transformer
//!   itself, the caller body is forwarded as-is and only `auth` runs

use std::sync::Arc;

use serde_json::Value;

use crate::dispatch::ProviderResponse;
use crate::error::TransformError;
use crate::providers::ProviderDescriptor;
use crate::transformer::{
    Capability, OutboundHeaders, RequestConfig, Transformed, Transformer, TransformerContext,
};

/// Caller headers never forwarded on the bypass path.
const SKIPPED_CALLER_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
    "authorization",
    "x-api-key",
];

/// Caller request headers eligible for forwarding on the bypass path.
pub fn forwardable_headers<'a, I>(headers: I) -> OutboundHeaders
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = OutboundHeaders::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if !SKIPPED_CALLER_HEADERS.contains(&lower.as_str()) {
            out.set(&lower, value);
        }
    }
    out
}

/// True when `endpoint` already speaks `provider`'s dialect for `model`.
pub fn should_bypass(endpoint: &dyn Transformer, provider: &ProviderDescriptor, model: &str) -> bool {
    let provider_chain = provider.provider_chain();
    if provider_chain.len() != 1 || provider_chain[0].name() != endpoint.name() {
        return false;
    }
    let model_chain = provider.model_chain(model);
    model_chain.is_empty() || (model_chain.len() == 1 && model_chain[0].name() == endpoint.name())
}

/// The ordered stages for one request.
pub struct TransformerChain {
    endpoint: Arc<dyn Transformer>,
    provider_stages: Vec<Arc<dyn Transformer>>,
    model_stages: Vec<Arc<dyn Transformer>>,
    bypass: bool,
}

impl TransformerChain {
    pub fn build(endpoint: Arc<dyn Transformer>, provider: &ProviderDescriptor, model: &str) -> Self {
        let bypass = should_bypass(endpoint.as_ref(), provider, model);
        Self {
            endpoint,
            provider_stages: provider.provider_chain().to_vec(),
            model_stages: provider.model_chain(model).to_vec(),
            bypass,
        }
    }

    fn request_order(&self) -> impl Iterator<Item = &Arc<dyn Transformer>> {
        self.provider_stages.iter().chain(&self.model_stages)
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    /// Chain member names in request order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.request_order().map(|t| t.name()).collect()
    }

    /// Build the outbound body and config. `caller_headers` are only used on
    /// the bypass path.
    pub async fn process_request(
        &self,
        body: Value,
        caller_headers: &OutboundHeaders,
        provider: &ProviderDescriptor,
        ctx: &mut TransformerContext,
    ) -> Result<Transformed, TransformError> {
        let mut body = body;

        if self.bypass {
            let mut config = RequestConfig {
                headers: caller_headers.clone(),
                ..Default::default()
            };
            if self.endpoint.capabilities().contains(Capability::Auth) {
                let out = self.endpoint.auth(body, provider, ctx).await?;
                body = out.body;
                config.merge(out.config);
            }
            config.headers.remove("host");
            return Ok(Transformed::with_config(body, config));
        }

        let mut config = RequestConfig::default();
        if self.endpoint.capabilities().contains(Capability::RequestOut) {
            let out = self.endpoint.request_out(body, ctx).await?;
            body = out.body;
            config.merge(out.config);
        }
        for stage in self.request_order() {
            if !stage.capabilities().contains(Capability::RequestIn) {
                continue;
            }
            let out = stage.request_in(body, provider, ctx).await?;
            body = out.body;
            config.merge(out.config);
        }
        Ok(Transformed::with_config(body, config))
    }

    /// Unwind the chain over the upstream response.
    pub async fn process_response(
        &self,
        response: ProviderResponse,
        ctx: &mut TransformerContext,
    ) -> Result<ProviderResponse, TransformError> {
        if self.bypass {
            return Ok(response);
        }
        let mut response = response;
        let unwind = self
            .provider_stages
            .iter()
            .rev()
            .chain(self.model_stages.iter().rev());
        for stage in unwind {
            if stage.capabilities().contains(Capability::ResponseOut) {
                response = stage.response_out(response, ctx).await?;
            }
        }
        if self.endpoint.capabilities().contains(Capability::ResponseIn) {
            response = self.endpoint.response_in(response, ctx).await?;
        }
        Ok(response)
    }
}
