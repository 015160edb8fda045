/// LLM Client Wrapper (§4.10 Ambient Stack)
///
/// A small trait over chat-completion calls so the semantic-gap detector can
/// be tested against a stub instead of a live Mistral endpoint.
use crate::error::LlmError;
use serde::Deserialize;
use std::time::Duration;

const MISTRAL_ENDPOINT: &str = "https://api.mistral.ai/v1/chat/completions";
const MODEL: &str = "mistral-small-latest";
const MAX_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

/// Mistral-backed implementation. Retries transient errors up to
/// `MAX_RETRIES` times with a fixed 1s delay, per the fixed retry contract
/// in §4.10 — this pins exact retry semantics rather than using a generic
/// backoff crate.
pub struct MistralClient {
    http: reqwest::Client,
    api_key: String,
}

impl MistralClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    async fn complete_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": MODEL,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        let resp = self
            .http
            .post(MISTRAL_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        if resp.status().is_server_error() || resp.status().as_u16() == 429 {
            return Err(LlmError::Transient(format!("status {}", resp.status())));
        }
        if !resp.status().is_success() {
            return Err(LlmError::Api(format!("status {}", resp.status())));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("no choices in response".into()))
    }
}

#[async_trait::async_trait]
impl ChatClient for MistralClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match self.complete_once(system_prompt, user_prompt).await {
                Ok(text) => return Ok(text),
                Err(LlmError::Transient(msg)) => {
                    last_err = Some(LlmError::Transient(msg));
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or(LlmError::Transient("exhausted retries".into())))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyThenOk {
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl ChatClient for FlakyThenOk {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(LlmError::Transient("timeout".into()))
            } else {
                Ok("72".to_string())
            }
        }
    }

    #[tokio::test]
    async fn stub_client_satisfies_trait_object() {
        let calls = Arc::new(AtomicU32::new(0));
        let client: Arc<dyn ChatClient> = Arc::new(FlakyThenOk { calls: calls.clone() });
        let err = client.complete("system", "user").await;
        assert!(err.is_err());
        let ok = client.complete("system", "user").await;
        assert_eq!(ok.unwrap(), "72");
    }
}
