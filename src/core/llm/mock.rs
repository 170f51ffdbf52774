use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ChatMessage, GenerateOptions, Llm, LlmError};

/// Scripted LLM for tests. Replies are served in order; once the script runs
/// out the fallback reply is used, or `Exhausted` when there is none.
#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<(Vec<ChatMessage>, GenerateOptions)>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(text: &str) -> Self {
        Self {
            fallback: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn then(self, reply: Result<&str, LlmError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(reply.map(str::to_string));
        self
    }

    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, GenerateOptions)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<String, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), options));
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(text) => Ok(text.clone()),
            None => Err(LlmError::Exhausted {
                attempts: 1,
                last: "mock script empty".to_string(),
            }),
        }
    }
}
