//! Reasoning oracle over the Anthropic messages API

use crate::config::OracleConfig;
use async_trait::async_trait;
use fixloop_kernel::{Oracle, OracleError, OracleReply, TokenUsage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// HTTP client for the messages API
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl HttpOracle {
    /// Oracle for `config`, authenticated with `api_key`
    ///
    /// # Errors
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(config: &OracleConfig, api_key: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .build()?,
            url: format!("{}/v1/messages", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: api_key.into(),
        })
    }
}

/// Map an HTTP status and body to the oracle taxonomy
fn classify_status(status: u16, body: &str) -> OracleError {
    match status {
        408 | 409 | 429 | 500..=599 => OracleError::Unavailable(format!("HTTP {status}: {body}")),
        _ => OracleError::Refused(format!("HTTP {status}: {body}")),
    }
}

fn into_reply(response: MessagesResponse) -> Result<OracleReply, OracleError> {
    let text: String = response
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("");
    if response.stop_reason.as_deref() == Some("refusal") {
        return Err(OracleError::Refused(if text.is_empty() {
            "request refused".to_string()
        } else {
            text
        }));
    }
    Ok(OracleReply {
        text,
        usage: TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens),
    })
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn ask(&self, prompt: &str, max_tokens: u32) -> Result<OracleReply, OracleError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "oracle request failed");
            return Err(classify_status(status.as_u16(), &body));
        }
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Unavailable(format!("unreadable response: {e}")))?;
        tracing::debug!(
            input = parsed.usage.input_tokens,
            output = parsed.usage.output_tokens,
            "oracle answered"
        );
        into_reply(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_and_server_errors_are_transient() {
        assert!(classify_status(529, "overloaded").is_retryable());
        assert!(classify_status(429, "slow down").is_retryable());
        assert!(!classify_status(400, "bad request").is_retryable());
    }

    #[test]
    fn text_blocks_are_joined_and_usage_kept() {
        let response: MessagesResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"{\"edits\":"},{"type":"text","text":"[]}"}],
                "stop_reason":"end_turn","usage":{"input_tokens":12,"output_tokens":5}}"#,
        )
        .unwrap();
        let reply = into_reply(response).unwrap();
        assert_eq!(reply.text, "{\"edits\":[]}");
        assert_eq!(reply.usage, TokenUsage::new(12, 5));
    }

    #[test]
    fn refusal_stop_reason_is_refused() {
        let response: MessagesResponse =
            serde_json::from_str(r#"{"content":[],"stop_reason":"refusal"}"#).unwrap();
        assert!(matches!(into_reply(response), Err(OracleError::Refused(_))));
    }
}
