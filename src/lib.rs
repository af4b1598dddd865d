#![forbid(unsafe_code)]
#![doc = r#"
LLM Relay

Route chat requests to registered model providers, translating between a
provider-neutral chat schema and each provider's wire format.

Crate highlights
- Routing: `provider,model` keys, first-wins bare model names, and regex route rules.
- Transformers: pluggable request/response adapters with a bypass fast path.
- HTTP server (in `server`): one POST route per endpoint-owning transformer,
  provider CRUD, `/v1/models`, `/health`.

Modules
- `route_rules`: regex rules mapping bare model names to `provider,model`.
- `providers`: provider descriptors and the routing table.
- `transformer`: capability trait, registry, built-in transformers.
- `pipeline`: transformer chain execution (forward, reverse, bypass).
- `dispatch`: the outbound HTTP call.
- `response`: streaming vs buffered responses.
- `models`: canonical chat request/response types.
- `config`: config file discovery, `extends`, `${VAR}` interpolation.
- `server`: Actix routes and handlers.
- `util`: tracing, HTTP client, shared state.
"#]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod response;
pub mod route_rules;
pub mod server;
pub mod transformer;
pub mod util;

pub use crate::config::{AppConfig, RouterConfig};
pub use crate::dispatch::{DispatchSettings, ProviderResponse, ResponseBody, UpstreamDispatcher};
pub use crate::error::{ApiError, ApiResult, TransformError};
pub use crate::models::{UnifiedChatRequest, UnifiedChatResponse};
pub use crate::pipeline::TransformerChain;
pub use crate::providers::{
    ProviderDescriptor, ProviderKind, ProviderPatch, ProviderRegistration, ProviderRegistry,
    RouteEntry, TransformerConfig,
};
pub use crate::route_rules::{RouteMatch, RouteRule, RouteRuleMatcher};
pub use crate::transformer::{
    Capabilities, Capability, RequestConfig, Transformer, TransformerContext, TransformerRegistry,
    TransformerSpec,
};
pub use crate::util::AppState;
