//! Caller-facing response shaping: event-stream relay or buffered JSON.

use actix_web::HttpResponse;
use serde_json::Value;

use crate::dispatch::ProviderResponse;
use crate::error::{ApiError, ApiResult};

fn actix_status(status: http::StatusCode) -> actix_web::http::StatusCode {
    actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::OK)
}

/// Render the final response. Streaming requests relay the body chunk by
/// chunk; buffered ones are parsed and re-serialized as JSON.
pub async fn format_response(response: ProviderResponse, stream: bool) -> ApiResult<HttpResponse> {
    let status = actix_status(response.status);

    if stream {
        return Ok(HttpResponse::build(status)
            .insert_header(("content-type", "text/event-stream"))
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .streaming(response.body.into_stream()));
    }

    let bytes = response
        .body
        .into_bytes()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read provider response: {}", e)))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::Internal(format!("Invalid JSON from provider: {}", e)))?;
    Ok(HttpResponse::build(status).json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ByteStream, ResponseBody};
    use bytes::Bytes;
    use http::StatusCode;

    #[tokio::test]
    async fn stream_sets_event_stream_headers_and_relays_chunks() {
        let chunks: ByteStream = Box::pin(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]));
        let resp = ProviderResponse {
            status: StatusCode::OK,
            headers: http::HeaderMap::new(),
            body: ResponseBody::Streaming(chunks),
        };
        let out = format_response(resp, true).await.unwrap();
        assert_eq!(
            out.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(out.headers().get("cache-control").unwrap(), "no-cache");
        let body = actix_web::body::to_bytes(out.into_body()).await.unwrap();
        assert_eq!(&body[..], b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn buffered_json_is_reserialized_with_status() {
        let resp = ProviderResponse::buffered(StatusCode::ACCEPTED, r#"{ "ok" : true }"#);
        let out = format_response(resp, false).await.unwrap();
        assert_eq!(out.status().as_u16(), 202);
        let body = actix_web::body::to_bytes(out.into_body()).await.unwrap();
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn non_json_body_is_internal_error() {
        let resp = ProviderResponse::buffered(StatusCode::OK, "not json");
        let err = format_response(resp, false).await.unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }
}
