//! LLM gateway: send one prompt to the completion endpoint, return the raw body.
//!
//! The gateway deliberately does not parse domain JSON. Envelopes differ
//! between providers and between prompt variants, and the normaliser has to
//! see the raw body to run its fallback tiers. It also never retries:
//! whether a failed job runs again is the worker pool's decision, made on
//! the [`crate::error::FailureKind`] of the error returned here.
//!
//! ## Error mapping
//!
//! | Condition | Error | Retryable |
//! |-----------|-------|-----------|
//! | no / empty API key | `Configuration` | no |
//! | connect failure, timeout, broken body | `Transport` | yes |
//! | non-2xx status | `Upstream { status, body }` | yes |

use crate::config::{GatewayConfig, Provider};
use crate::error::IngestError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upstream error bodies are cut to this many characters in error messages.
const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// Anything that can turn a prompt into a raw completion response body.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, IngestError>;
}

/// Production gateway speaking HTTP to a Gemini or OpenAI-compatible endpoint.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    /// Build the gateway. The timeout is applied to every request made by
    /// the underlying client.
    pub fn new(config: GatewayConfig) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Configuration {
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[async_trait]
impl CompletionGateway for HttpGateway {
    async fn complete(&self, prompt: &str) -> Result<String, IngestError> {
        let api_key = api_key(&self.config)?;
        let url = request_url(&self.config, api_key)?;
        let body = request_body(&self.config, prompt);
        let endpoint = self.config.endpoint.clone();

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body);
        if self.config.provider == Provider::OpenAiCompatible {
            request = request.bearer_auth(api_key);
        }

        let start = Instant::now();
        info!(
            "Calling {:?} endpoint {} ({} prompt chars)",
            self.config.provider,
            endpoint,
            prompt.chars().count()
        );

        let response = request.send().await.map_err(|e| IngestError::Transport {
            endpoint: endpoint.clone(),
            detail: describe_transport_error(&e, self.config.timeout_secs),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| IngestError::Transport {
            endpoint: endpoint.clone(),
            detail: describe_transport_error(&e, self.config.timeout_secs),
        })?;
        debug!(
            "LLM raw response ({} bytes, HTTP {}, {:?}): {}",
            text.len(),
            status.as_u16(),
            start.elapsed(),
            text
        );

        if !status.is_success() {
            warn!("LLM endpoint {} returned HTTP {}", endpoint, status.as_u16());
            return Err(IngestError::Upstream {
                status: status.as_u16(),
                body: crate::prompts::truncate_chars(&text, MAX_ERROR_BODY_CHARS).to_string(),
            });
        }
        Ok(text)
    }
}

fn api_key(config: &GatewayConfig) -> Result<&str, IngestError> {
    match config.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(IngestError::Configuration {
            detail: "no API key configured".into(),
        }),
    }
}

/// The request URL. Gemini carries the key as the `key` query parameter.
pub fn request_url(config: &GatewayConfig, api_key: &str) -> Result<reqwest::Url, IngestError> {
    let mut url = reqwest::Url::parse(&config.endpoint).map_err(|e| IngestError::Configuration {
        detail: format!("invalid endpoint '{}': {e}", config.endpoint),
    })?;
    if config.provider == Provider::Gemini {
        url.query_pairs_mut().append_pair("key", api_key);
    }
    Ok(url)
}

/// The JSON request body for the configured provider.
pub fn request_body(config: &GatewayConfig, prompt: &str) -> Value {
    match config.provider {
        Provider::Gemini => json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        }),
        Provider::OpenAiCompatible => json!({
            "model": config.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0,
        }),
    }
}

fn describe_transport_error(e: &reqwest::Error, timeout_secs: u64) -> String {
    if e.is_timeout() {
        format!("request timed out after {timeout_secs}s")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PromptVariant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(provider: Provider, endpoint: &str, key: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            endpoint: endpoint.into(),
            api_key: key.map(str::to_string),
            timeout_secs: 5,
            prompt_variant: PromptVariant::QuestionSet,
            provider,
            model: "test-model".into(),
        }
    }

    /// Serve exactly one HTTP response, returning the raw request it answered.
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}/v1/generate"), handle)
    }

    #[test]
    fn gemini_url_carries_key() {
        let c = config(
            Provider::Gemini,
            "https://example.org/models/m:generateContent",
            Some("k1"),
        );
        let url = request_url(&c, "k1").unwrap();
        assert_eq!(url.query(), Some("key=k1"));
    }

    #[test]
    fn openai_url_has_no_key() {
        let c = config(
            Provider::OpenAiCompatible,
            "https://example.org/v1/chat/completions",
            Some("k1"),
        );
        let url = request_url(&c, "k1").unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn request_bodies_match_provider_contracts() {
        let g = request_body(&config(Provider::Gemini, "https://x", None), "hello");
        assert_eq!(g["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(g["generationConfig"]["responseMimeType"], "application/json");

        let o = request_body(&config(Provider::OpenAiCompatible, "https://x", None), "hello");
        assert_eq!(o["model"], "test-model");
        assert_eq!(o["messages"][0]["role"], "user");
        assert_eq!(o["messages"][0]["content"], "hello");
        assert_eq!(o["temperature"], 0);
    }

    #[tokio::test]
    async fn missing_key_is_configuration_error() {
        for key in [None, Some("   ")] {
            let gw =
                HttpGateway::new(config(Provider::Gemini, "https://example.org", key)).unwrap();
            let err = gw.complete("p").await.unwrap_err();
            assert!(matches!(err, IngestError::Configuration { .. }));
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let c = config(Provider::Gemini, "http://127.0.0.1:1/x", Some("k"));
        let gw = HttpGateway::new(c).unwrap();
        let err = gw.complete("p").await.unwrap_err();
        assert!(matches!(err, IngestError::Transport { .. }), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn non_2xx_is_upstream_error() {
        let (url, server) =
            one_shot_server("HTTP/1.1 503 Service Unavailable", r#"{"error":"overloaded"}"#).await;
        let gw = HttpGateway::new(config(Provider::Gemini, &url, Some("k"))).unwrap();
        let err = gw.complete("p").await.unwrap_err();
        match err {
            IngestError::Upstream { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("overloaded"));
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn success_returns_raw_body_and_sends_bearer() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK", r#"{"choices":[]}"#).await;
        let c = config(Provider::OpenAiCompatible, &url, Some("sk-test"));
        let gw = HttpGateway::new(c).unwrap();
        let body = gw.complete("prompt text").await.unwrap();
        assert_eq!(body, r#"{"choices":[]}"#);

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /v1/generate"));
        assert!(request.contains("authorization: bearer sk-test"));
        assert!(request.contains("prompt text"));
    }
}
