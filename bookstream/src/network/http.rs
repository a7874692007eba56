//! reqwest-backed transport.

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::RANGE;
use tracing::debug;

use super::transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, ProgressFn, TransportError,
};
use crate::cache::BoxFuture;
use crate::config::TransportConfig;

/// HTTP transport using an async reqwest client with rustls.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                TransportError::InvalidRequest(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    fn map_error(url: &str, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
            }
        } else if e.is_builder() {
            TransportError::InvalidRequest(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Connect(e.to_string())
        }
    }

    async fn execute(
        &self,
        request: HttpRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<HttpResponse, TransportError> {
        let url = request.url.as_str();
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Head => self.client.head(url),
        };
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let expected = response.content_length();

        debug!(method = %request.method, url, status, "HTTP response");

        let mut body = BytesMut::with_capacity(expected.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Self::map_error(url, e))?;
            body.extend_from_slice(&chunk);
            if let Some(report) = progress {
                report(body.len() as u64, expected);
            }
        }

        Ok(HttpResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        progress: Option<&'a ProgressFn>,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(self.execute(request, progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_with_default_config() {
        assert!(ReqwestTransport::new(&TransportConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_a_connect_error() {
        let transport = ReqwestTransport::new(&TransportConfig::default()).unwrap();
        let err = transport
            .send(HttpRequest::get("not a url"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }
}
