pub mod generic_provider;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM returned an empty response")]
    Empty,
    #[error("All LLM models exhausted after {attempts} attempt(s); last error: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("Missing LLM API key (set {0})")]
    MissingApiKey(String),
}

impl LlmError {
    /// Whether the same model is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) | LlmError::Timeout(_) | LlmError::Empty => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Exhausted { .. } | LlmError::MissingApiKey(_) => false,
        }
    }
}

/// One backend able to run a chat completion against a named model.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<String, LlmError>;
}

/// The capability the office workers depend on.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<String, LlmError>;
}

/// Runs a request down an ordered model chain with a per-call timeout and
/// exponential backoff between retries of the same model.
pub struct LlmManager {
    provider: Box<dyn LlmProvider>,
    models: Vec<String>,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
}

impl LlmManager {
    pub fn new(provider: Box<dyn LlmProvider>, models: Vec<String>) -> Self {
        info!(
            "Registered LLM provider {} with model chain {:?}",
            provider.provider_id(),
            models
        );
        Self {
            provider,
            models,
            timeout: Duration::from_secs(45),
            max_retries: 2,
            retry_base: Duration::from_millis(3000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = retry_base;
        self
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }
}

#[async_trait]
impl Llm for LlmManager {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<String, LlmError> {
        let mut attempts = 0u32;
        let mut last = LlmError::Empty;

        for model in &self.models {
            for retry in 0..=self.max_retries {
                attempts += 1;
                let call = self.provider.generate(model, messages, options);
                let outcome = match tokio::time::timeout(self.timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(self.timeout)),
                };
                match outcome {
                    Ok(text) if !text.trim().is_empty() => return Ok(text.trim().to_string()),
                    Ok(_) => last = LlmError::Empty,
                    Err(e) => last = e,
                }

                if !last.is_retryable() {
                    warn!("[LLM] {} failed, moving down the chain: {}", model, last);
                    break;
                }
                if retry < self.max_retries {
                    let delay = self.retry_base * 2u32.pow(retry);
                    warn!(
                        "[LLM] {} attempt {} failed ({}), retrying in {:?}",
                        model,
                        retry + 1,
                        last,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(LlmError::Exhausted {
            attempts,
            last: last.to_string(),
        })
    }
}

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```(?:json)?\s*|\s*```$").expect("fence pattern"));
static OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("object pattern"));

/// Pull a JSON object (or a bare array) out of model output: strip markdown
/// fences, then fall back to the outermost `{...}` span when the text around it
/// is prose. Scalars such as `42` or `"ok"` are not results.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let unfenced = FENCE.replace_all(trimmed, "");
    if let Ok(value @ (Value::Object(_) | Value::Array(_))) =
        serde_json::from_str::<Value>(unfenced.trim())
    {
        return Some(value);
    }
    OBJECT
        .find(trimmed)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedProvider {
        script: Mutex<Vec<(String, Result<String, LlmError>)>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<(&str, Result<String, LlmError>)>) -> Self {
            let mut script: Vec<_> = script.into_iter().map(|(m, r)| (m.to_string(), r)).collect();
            script.reverse();
            Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _options: GenerateOptions,
        ) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(model_id.to_string());
            let (expected, result) = self.script.lock().unwrap().pop().expect("script exhausted");
            assert_eq!(expected, model_id);
            result
        }
    }

    fn manager(provider: ScriptedProvider, models: &[&str]) -> LlmManager {
        LlmManager::new(
            Box::new(provider),
            models.iter().map(|m| m.to_string()).collect(),
        )
        .with_retries(1, Duration::from_millis(1))
    }

    #[test]
    fn json_is_found_behind_fences_and_prose() {
        let fenced = "```json\n{\"summary\": \"ok\"}\n```";
        assert_eq!(extract_json(fenced).unwrap()["summary"], "ok");
        let chatty = "Sure! Here you go: {\"a\": {\"b\": 1}} hope that helps";
        assert_eq!(extract_json(chatty).unwrap()["a"]["b"], 1);
        assert!(extract_json("[1, 2]").unwrap().is_array());
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn bare_scalars_are_not_results() {
        assert!(extract_json("42").is_none());
        assert!(extract_json("\"ok\"").is_none());
        assert!(extract_json("```json\ntrue\n```").is_none());
        assert!(extract_json("null").is_none());
    }

    #[tokio::test]
    async fn retries_then_falls_back_to_next_model() {
        let provider = ScriptedProvider::new(vec![
            ("primary", Err(LlmError::Status { status: 503, body: "busy".into() })),
            ("primary", Ok("   ".into())),
            ("backup", Ok("  hello  ".into())),
        ]);
        let llm = manager(provider, &["primary", "backup"]);
        let text = llm
            .generate(&[ChatMessage::user("hi")], GenerateOptions::new(0.7, 50))
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn client_errors_skip_remaining_retries() {
        let provider = ScriptedProvider::new(vec![
            ("primary", Err(LlmError::Status { status: 400, body: "bad".into() })),
            ("backup", Err(LlmError::Status { status: 401, body: "nope".into() })),
        ]);
        let llm = manager(provider, &["primary", "backup"]);
        let err = llm
            .generate(&[ChatMessage::user("hi")], GenerateOptions::new(0.7, 50))
            .await
            .unwrap_err();
        match err {
            LlmError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("401"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
