use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use super::base::Provider;
use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::tools::Tool;

/// A provider that replays pre-configured replies and counts its calls.
pub struct MockProvider {
    responses: Mutex<Vec<anyhow::Result<String>>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<anyhow::Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self, model: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Return empty response if no more pre-configured responses
            return Ok(String::new());
        }
        responses
            .remove(0)
            .map_err(|e| SimplemindError::provider(self.name(), model, e))
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    fn send_conversation(
        &self,
        _conversation: &Conversation,
        llm_model: Option<&str>,
        _tools: &mut [Tool],
    ) -> Result<Message> {
        let model = self.model(llm_model);
        let text = self.next_response(model)?;
        let mut meta = serde_json::Map::new();
        meta.insert("mock".to_string(), json!(true));
        Ok(Message::assistant(text.clone())
            .with_meta(meta)
            .with_raw(json!({ "text": text }))
            .with_model(self.name(), model))
    }

    fn structured_value(
        &self,
        _prompt: &str,
        _schema: &Value,
        llm_model: Option<&str>,
    ) -> Result<Value> {
        let text = self.next_response(self.model(llm_model))?;
        serde_json::from_str(&text).map_err(|e| SimplemindError::Validation(e.to_string()))
    }

    fn generate_text(&self, _prompt: &str, llm_model: Option<&str>) -> Result<String> {
        self.next_response(self.model(llm_model))
    }
}
