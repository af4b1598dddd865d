//! Upstream Dispatcher
//!
//! Performs the single outbound call of a request:
//! - URL from the transformer config, else the provider's base URL
//! - Headers: provider key as bearer credential, then transformer headers
//! - Overall timeout per request, connect timeout and proxy on the client
//! - Optional cancellation token aborting both the call and the body stream
//!
//! Non-2xx answers become [`ApiError::ProviderResponse`].

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, TryStreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiResult};
use crate::providers::ProviderDescriptor;
use crate::transformer::{OutboundHeaders, RequestConfig};
use crate::util::mask_key;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl ResponseBody {
    /// Collect the whole body.
    pub async fn into_bytes(self) -> Result<Bytes, std::io::Error> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Body as a chunk stream, preserving upstream chunk boundaries.
    pub fn into_stream(self) -> ByteStream {
        match self {
            ResponseBody::Buffered(bytes) => {
                Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
            }
            ResponseBody::Streaming(stream) => stream,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Raw upstream answer as it travels back through the transformer chain.
#[derive(Debug)]
pub struct ProviderResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl ProviderResponse {
    pub fn buffered(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Buffered(body.into()),
        }
    }
}

/// Client-level dispatch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Overall request timeout, including the body
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3_600_000),
            connect_timeout: Duration::from_millis(30_000),
            https_proxy: None,
        }
    }
}

/// Final outbound headers: bearer credential first, then transformer edits.
/// Values equal to `undefined`, and authorization values containing it, are dropped.
pub fn merge_headers(api_key: &str, edits: &OutboundHeaders) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    merged.insert(
        "content-type".to_string(),
        "application/json".to_string(),
    );
    merged.insert("authorization".to_string(), format!("Bearer {}", api_key));
    for (name, value) in edits.iter() {
        match value {
            Some(v) => {
                merged.insert(name.to_string(), v.to_string());
            }
            None => {
                merged.remove(name);
            }
        }
    }
    merged.retain(|name, value| {
        value != "undefined" && !(name == "authorization" && value.contains("undefined"))
    });
    merged
}

fn masked_for_log(headers: &BTreeMap<String, String>) -> BTreeMap<&str, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let shown = if k == "authorization" || k == "x-api-key" {
                mask_key(v.trim_start_matches("Bearer "))
            } else {
                v.clone()
            };
            (k.as_str(), shown)
        })
        .collect()
}

/// Sends requests to providers.
#[derive(Debug, Clone)]
pub struct UpstreamDispatcher {
    client: reqwest::Client,
    settings: DispatchSettings,
}

impl UpstreamDispatcher {
    pub fn new(client: reqwest::Client, settings: DispatchSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn dispatch(
        &self,
        body: &Value,
        config: &RequestConfig,
        provider: &ProviderDescriptor,
        bypass: bool,
        cancel: Option<&CancellationToken>,
    ) -> ApiResult<ProviderResponse> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| provider.base_url.clone());
        let headers = merge_headers(&provider.api_key, &config.headers);
        let timeout = config.timeout.unwrap_or(self.settings.timeout);
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        tracing::debug!(
            url = %url,
            headers = ?masked_for_log(&headers),
            proxy = ?self.settings.https_proxy,
            bypass,
            timeout_ms = timeout.as_millis() as u64,
            "final request"
        );

        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    header_map.insert(n, v);
                }
                _ => {
                    tracing::warn!("Skipping invalid outbound header: {}", name);
                }
            }
        }

        let payload = serde_json::to_vec(body)
            .map_err(|e| ApiError::Internal(format!("Failed to encode request: {}", e)))?;
        let send = self
            .client
            .post(&url)
            .timeout(timeout)
            .headers(header_map)
            .body(payload)
            .send();

        let result = match cancel {
            Some(token) => tokio::select! {
                res = send => res,
                _ = token.cancelled() => {
                    return Err(ApiError::Internal("Upstream request cancelled".to_string()));
                }
            },
            None => send.await,
        };

        let resp = result.map_err(|e| {
            if e.is_timeout() {
                ApiError::Internal(format!("Upstream request to {} timed out", provider.name))
            } else if e.is_connect() {
                ApiError::Internal(format!("Failed to connect to {}: {}", provider.name, e))
            } else {
                ApiError::Internal(format!("Upstream request failed: {}", e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(
                provider = %provider.name,
                model = %model,
                status = status.as_u16(),
                "Provider returned error"
            );
            return Err(ApiError::provider_response(
                &provider.name,
                &model,
                status,
                &text,
            ));
        }

        let headers = resp.headers().clone();
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        let body: ByteStream = match cancel {
            Some(token) => Box::pin(stream.take_until(token.clone().cancelled_owned())),
            None => Box::pin(stream),
        };

        Ok(ProviderResponse {
            status,
            headers,
            body: ResponseBody::Streaming(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_first_then_transformer_headers() {
        let mut edits = OutboundHeaders::new();
        edits.set("X-Title", "relay");
        edits.set("Authorization", "Bearer override");
        let merged = merge_headers("k", &edits);
        assert_eq!(merged["authorization"], "Bearer override");
        assert_eq!(merged["x-title"], "relay");
        assert_eq!(merged["content-type"], "application/json");
    }

    #[test]
    fn undefined_values_are_dropped() {
        let mut edits = OutboundHeaders::new();
        edits.set("x-extra", "undefined");
        let merged = merge_headers("undefined", &edits);
        assert!(!merged.contains_key("x-extra"));
        assert!(!merged.contains_key("authorization"));
    }

    #[test]
    fn removals_apply() {
        let mut edits = OutboundHeaders::new();
        edits.set("host", "caller.local");
        edits.remove("host");
        edits.remove("content-type");
        let merged = merge_headers("k", &edits);
        assert!(!merged.contains_key("host"));
        assert!(!merged.contains_key("content-type"));
    }

    #[test]
    fn log_view_masks_credentials() {
        let merged = merge_headers("sk-abcdefghijkl", &OutboundHeaders::new());
        let shown = masked_for_log(&merged);
        assert_eq!(shown["authorization"], "...ghijkl");
    }

    /// Upstream that accepts the request and never answers on `/silent`, and on
    /// `/trickle` sends one event-stream chunk and then hangs.
    async fn stalled_upstream() -> (String, tokio::task::JoinHandle<()>) {
        use axum::{body::Body, routing::post, Router};

        async fn silent() -> &'static str {
            std::future::pending::<()>().await;
            "unreachable"
        }

        async fn trickle() -> Body {
            let first = futures_util::stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"data: 1\n\n"))
            });
            Body::from_stream(first.chain(futures_util::stream::pending()))
        }

        let app = Router::new()
            .route("/silent", post(silent))
            .route("/trickle", post(trickle));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("upstream server error");
        });
        (format!("http://{}", addr), join)
    }

    fn stalled_provider(base: &str, path: &str) -> ProviderDescriptor {
        ProviderDescriptor::new("slow", &format!("{}{}", base, path), "k", vec!["m".into()])
    }

    fn dispatcher() -> UpstreamDispatcher {
        UpstreamDispatcher::new(reqwest::Client::new(), DispatchSettings::default())
    }

    #[tokio::test]
    async fn overall_timeout_aborts_silent_upstream() {
        let (base, join) = stalled_upstream().await;
        let provider = stalled_provider(&base, "/silent");
        let config = RequestConfig {
            timeout: Some(Duration::from_millis(150)),
            ..Default::default()
        };

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            dispatcher().dispatch(&serde_json::json!({"model": "m"}), &config, &provider, false, None),
        )
        .await
        .expect("dispatch must not outlive its timeout")
        .unwrap_err();

        assert_eq!(err.code(), "internal_error");
        assert!(err.to_string().contains("timed out"), "{}", err);
        join.abort();
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_request() {
        let (base, join) = stalled_upstream().await;
        let provider = stalled_provider(&base, "/silent");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            dispatcher().dispatch(
                &serde_json::json!({"model": "m"}),
                &RequestConfig::default(),
                &provider,
                false,
                Some(&token),
            ),
        )
        .await
        .expect("dispatch must stop on cancellation")
        .unwrap_err();

        assert_eq!(err.code(), "internal_error");
        assert!(err.to_string().contains("cancelled"), "{}", err);
        join.abort();
    }

    #[tokio::test]
    async fn cancellation_ends_stream_in_progress() {
        let (base, join) = stalled_upstream().await;
        let provider = stalled_provider(&base, "/trickle");
        let token = CancellationToken::new();

        let response = dispatcher()
            .dispatch(
                &serde_json::json!({"model": "m", "stream": true}),
                &RequestConfig::default(),
                &provider,
                false,
                Some(&token),
            )
            .await
            .unwrap();
        let mut stream = response.body.into_stream();

        let first = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("first chunk")
            .expect("stream open")
            .unwrap();
        assert_eq!(&first[..], b"data: 1\n\n");

        token.cancel();
        let next = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("stream must end once cancelled");
        assert!(next.is_none());
        join.abort();
    }

    #[tokio::test]
    async fn buffered_body_streams_as_one_chunk() {
        let body = ResponseBody::Buffered(Bytes::from_static(b"data: x\n\n"));
        let chunks: Vec<_> = body.into_stream().collect().await;
        assert_eq!(chunks.len(), 1);

        let stream: ByteStream = Box::pin(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]));
        let all = ResponseBody::Streaming(stream).into_bytes().await.unwrap();
        assert_eq!(&all[..], b"ab");
    }
}
