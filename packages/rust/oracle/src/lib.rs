//! Reasoning-oracle client for CarbonBOM.
//!
//! The [`Oracle`] trait is the seam between the decomposition engine and
//! whatever answers its questions. [`HttpOracle`] implements it against an
//! OpenRouter-compatible chat-completion endpoint; tests swap in scripted
//! oracles.

pub mod escalation;
pub mod parser;

use std::time::Duration;

use async_trait::async_trait;
use carbonbom_shared::{CarbonBomError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub use escalation::{EscalationOutcome, call_with_escalation};

/// User-Agent string for oracle requests.
const USER_AGENT: &str = concat!("CarbonBOM/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Request / reply types
// ---------------------------------------------------------------------------

/// One turn of a chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// One oracle call: a model choice plus the full transcript so far.
#[derive(Debug, Clone)]
pub struct ElicitRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// An oracle answer.
#[derive(Debug, Clone)]
pub struct OracleReply {
    /// Raw reply text, to be run through the structured-field parser.
    pub text: String,
    /// True when the reply was cut off by the output limit and a follow-up
    /// turn is needed to finish it.
    pub is_incomplete: bool,
}

// ---------------------------------------------------------------------------
// Oracle trait
// ---------------------------------------------------------------------------

/// The question-answering dependency of the engine.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Ask the oracle one question with full conversational context.
    async fn elicit(&self, request: ElicitRequest) -> Result<OracleReply>;
}

// ---------------------------------------------------------------------------
// HttpOracle (OpenRouter-compatible)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// Oracle backed by an OpenRouter-compatible HTTP API.
pub struct HttpOracle {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpOracle {
    /// Build an HTTP oracle against `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CarbonBomError::Oracle(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn elicit(&self, request: ElicitRequest) -> Result<OracleReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CarbonBomError::Oracle(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(CarbonBomError::Oracle(format!(
                "oracle returned {status}: {snippet}"
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CarbonBomError::Oracle(format!("invalid oracle response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CarbonBomError::Oracle("oracle returned no choices".into()))?;

        let is_incomplete = choice.finish_reason.as_deref() == Some("length");
        tracing::debug!(
            model = %request.model,
            is_incomplete,
            chars = choice.message.content.len(),
            "oracle reply received"
        );

        Ok(OracleReply {
            text: choice.message.content,
            is_incomplete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_json(content: &str, finish_reason: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": { "role": "assistant", "content": content },
                "finish_reason": finish_reason
            }]
        })
    }

    #[tokio::test]
    async fn elicit_returns_reply_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_json(
                "*supplier: Acme Corp",
                "stop",
            )))
            .mount(&server)
            .await;

        let oracle = HttpOracle::new(server.uri(), "test-key").expect("build oracle");
        let reply = oracle
            .elicit(ElicitRequest {
                model: "test/model".into(),
                messages: vec![ChatMessage::user("Who supplies this?")],
            })
            .await
            .expect("elicit");

        assert_eq!(reply.text, "*supplier: Acme Corp");
        assert!(!reply.is_incomplete);
    }

    #[tokio::test]
    async fn truncated_reply_is_flagged_incomplete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(chat_json("*item_1_name: Bat", "length")),
            )
            .mount(&server)
            .await;

        let oracle = HttpOracle::new(server.uri(), "k").expect("build oracle");
        let reply = oracle
            .elicit(ElicitRequest {
                model: "test/model".into(),
                messages: vec![ChatMessage::user("List components")],
            })
            .await
            .expect("elicit");
        assert!(reply.is_incomplete);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let oracle = HttpOracle::new(server.uri(), "k").expect("build oracle");
        let result = oracle
            .elicit(ElicitRequest {
                model: "test/model".into(),
                messages: vec![ChatMessage::user("hi")],
            })
            .await;

        let err = result.expect_err("should fail");
        assert!(err.to_string().contains("429"));
    }
}
