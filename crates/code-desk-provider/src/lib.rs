#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use code_desk_core::{HistoryTurn, ModelSettings};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const GEMINI_ENDPOINT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// The opaque AI call boundary. Adapters turn a composed prompt plus replay
/// turns into one exchange; transport and provider failures surface as
/// errors for the caller to translate.
pub trait ModelAdapter {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn send(&self, prompt: &str, turns: &[HistoryTurn]) -> Result<ModelExchange>;
}

/// Everything worth persisting about one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelExchange {
    pub response_text: String,
    pub raw_response: Value,
    pub token_count: Option<u32>,
    pub request_payload: Value,
}

/// Deterministic offline adapter for tests and dry runs.
#[derive(Debug, Clone)]
pub struct MockModel {
    adapter_version: String,
}

impl Default for MockModel {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
        }
    }
}

impl MockModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deterministic_token(&self, prompt: &str, turns: &[HistoryTurn]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        for turn in turns {
            hasher.update(turn.role.as_str().as_bytes());
            hasher.update(turn.text.as_bytes());
        }
        hasher.update(self.adapter_version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl ModelAdapter for MockModel {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn send(&self, prompt: &str, turns: &[HistoryTurn]) -> Result<ModelExchange> {
        let token = self.deterministic_token(prompt, turns);
        let response_text = format!("mock:{}", token.chars().take(16).collect::<String>());

        let raw_response = json!({
            "deterministic_token": token,
            "prompt_chars": prompt.len(),
            "history_turns": turns.len(),
        });

        let prompt_chars = u32::try_from(prompt.len()).unwrap_or(u32::MAX);
        Ok(ModelExchange {
            response_text,
            raw_response,
            token_count: Some(prompt_chars / 4),
            request_payload: build_request_payload("mock", prompt, turns),
        })
    }
}

/// Blocking client for the Gemini `generateContent` REST endpoint.
#[derive(Debug, Clone)]
pub struct GeminiModel {
    model_name: String,
    api_key: String,
    endpoint_base: String,
    timeout_ms: u64,
}

impl GeminiModel {
    /// Builds the adapter from validated settings.
    ///
    /// # Errors
    /// Fails when the settings carry no API key.
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            anyhow::anyhow!("GOOGLE_API_KEY MUST be set for the gemini provider")
        })?;

        Ok(Self {
            model_name: settings.model_name.clone(),
            api_key,
            endpoint_base: GEMINI_ENDPOINT_BASE.to_string(),
            timeout_ms: REQUEST_TIMEOUT_MS,
        })
    }
}

impl ModelAdapter for GeminiModel {
    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn send(&self, prompt: &str, turns: &[HistoryTurn]) -> Result<ModelExchange> {
        let wire_request = build_generate_request(prompt, turns);
        let url = format!(
            "{}/{}:generateContent",
            self.endpoint_base, self.model_name
        );

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();

        let request = agent
            .request("POST", &url)
            .set("content-type", "application/json")
            .set("x-goog-api-key", &self.api_key);

        let body: Value = match request.send_json(&wire_request) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_json::<Value>().unwrap_or(Value::Null);
                return Err(anyhow::anyhow!(
                    "gemini call failed with http status {code}: {body}"
                ));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow::anyhow!("gemini transport failure: {err}"));
            }
        };

        let response_text = extract_response_text(&body)?;
        let token_count = extract_token_count(&body);

        Ok(ModelExchange {
            response_text,
            raw_response: body,
            token_count,
            request_payload: build_request_payload(&self.model_name, prompt, turns),
        })
    }
}

/// Builds the `generateContent` wire body: replay turns in order, then the
/// new prompt as the final user turn.
#[must_use]
pub fn build_generate_request(prompt: &str, turns: &[HistoryTurn]) -> Value {
    let mut contents: Vec<Value> = turns
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role.as_str(),
                "parts": [{"text": turn.text}],
            })
        })
        .collect();

    contents.push(json!({
        "role": "user",
        "parts": [{"text": prompt}],
    }));

    json!({ "contents": contents })
}

/// Builds the stored request payload: model, final prompt, and the replay
/// history when there is one.
#[must_use]
pub fn build_request_payload(model_name: &str, prompt: &str, turns: &[HistoryTurn]) -> Value {
    let mut payload = json!({
        "model_used": model_name,
        "prompt": prompt,
    });

    if !turns.is_empty() {
        let history: Vec<Value> = turns
            .iter()
            .map(|turn| json!({"role": turn.role.as_str(), "parts": [turn.text]}))
            .collect();
        payload["history_len"] = json!(history.len());
        payload["history"] = Value::Array(history);
    }

    payload
}

/// Pulls the concatenated candidate text out of a `generateContent` body.
///
/// # Errors
/// Fails when the body carries no candidate text.
pub fn extract_response_text(body: &Value) -> Result<String> {
    let parts = body
        .get("candidates")
        .and_then(|candidates| candidates.get(0))
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("gemini response carries no candidate parts"))?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        return Err(anyhow::anyhow!("gemini response text is empty"));
    }

    Ok(text)
}

#[must_use]
pub fn extract_token_count(body: &Value) -> Option<u32> {
    body.get("usageMetadata")
        .and_then(|usage| usage.get("totalTokenCount"))
        .and_then(Value::as_u64)
        .and_then(|count| u32::try_from(count).ok())
}

/// Shapes a failed call for storage, so the interaction is persisted rather
/// than lost.
#[must_use]
pub fn error_exchange(err: &anyhow::Error, prompt: &str) -> ModelExchange {
    ModelExchange {
        response_text: format!("Error communicating with the model API: {err}"),
        raw_response: json!({"error": err.to_string()}),
        token_count: None,
        request_payload: json!({"error": err.to_string(), "prompt": prompt}),
    }
}
