use std::sync::OnceLock;

use anyhow::anyhow;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::base::{ensure_no_tools, Provider, TextStream};
use super::configs::GeminiProviderConfig;
use super::factory::ProviderType;
use super::utils::{
    build_client, extract_json, schema_instruction, send_json, send_request, LineStream,
    StreamEvent, StreamFormat,
};
use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::{Message, Role};
use crate::tools::Tool;

/// Adapter for the Gemini `generateContent` REST API.
pub struct GeminiProvider {
    config: GeminiProviderConfig,
    client: OnceLock<Client>,
}

impl GeminiProvider {
    pub fn new(config: GeminiProviderConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = Some(api_key.into());
        self
    }

    fn client(&self) -> Result<&Client> {
        if self.config.api_key.is_none() {
            return Err(SimplemindError::Configuration(
                "Gemini API key is required".to_string(),
            ));
        }
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = build_client(self.config.timeout)
            .map_err(|e| SimplemindError::Configuration(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    /// `models/gemini-1.5-flash` and `gemini-1.5-flash` name the same model.
    fn url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/v1beta/models/{}:{}", self.config.host, model, method)
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    fn post(&self, payload: &Value, model: &str) -> Result<Value> {
        let client = self.client()?;
        debug!(model, "generateContent request");
        send_json(
            client
                .post(self.url(model, "generateContent"))
                .header("x-goog-api-key", self.api_key())
                .json(payload),
        )
        .map_err(|e| SimplemindError::provider(self.name(), model, e))
    }

    fn generate(&self, payload: &Value, model: &str) -> Result<(String, Value)> {
        let response = self.post(payload, model)?;
        let text = candidate_text(&response).ok_or_else(|| {
            SimplemindError::provider(self.name(), model, anyhow!("Response has no candidates"))
        })?;
        Ok((text, response))
    }

    fn extract_stream_text(chunk: &Value) -> StreamEvent {
        match candidate_text(chunk) {
            Some(text) => StreamEvent::Text(text),
            None => StreamEvent::Skip,
        }
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        ProviderType::Gemini.name()
    }

    fn default_model(&self) -> &str {
        ProviderType::Gemini.default_model()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(provider = "gemini"))]
    fn send_conversation(
        &self,
        conversation: &Conversation,
        llm_model: Option<&str>,
        tools: &mut [Tool],
    ) -> Result<Message> {
        ensure_no_tools(self, tools)?;
        let model = self.model(llm_model);
        let payload = messages_to_gemini_spec(conversation.messages());
        let (text, response) = self.generate(&payload, model)?;
        Ok(Message::assistant(text)
            .with_raw(response)
            .with_model(self.name(), model))
    }

    #[instrument(skip_all, fields(provider = "gemini"))]
    fn structured_value(
        &self,
        prompt: &str,
        schema: &Value,
        llm_model: Option<&str>,
    ) -> Result<Value> {
        let model = self.model(llm_model);
        let payload = json!({
            "systemInstruction": {"parts": [{"text": schema_instruction(schema)}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {"responseMimeType": "application/json"},
        });
        let (text, _) = self.generate(&payload, model)?;
        extract_json(&text)
    }

    #[instrument(skip_all, fields(provider = "gemini"))]
    fn generate_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<String> {
        let model = self.model(llm_model);
        let payload = json!({"contents": [{"role": "user", "parts": [{"text": prompt}]}]});
        self.generate(&payload, model).map(|(text, _)| text)
    }

    fn generate_stream_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<TextStream> {
        let model = self.model(llm_model);
        let client = self.client()?;
        let payload = json!({"contents": [{"role": "user", "parts": [{"text": prompt}]}]});
        let response = send_request(
            client
                .post(self.url(model, "streamGenerateContent"))
                .query(&[("alt", "sse")])
                .header("x-goog-api-key", self.api_key())
                .json(&payload),
        )
        .map_err(|e| SimplemindError::provider(self.name(), model, e))?;

        Ok(Box::new(LineStream::new(
            response,
            StreamFormat::Sse,
            Self::extract_stream_text,
            self.name(),
            model,
        )))
    }

    fn available_models(&self) -> Vec<String> {
        let url = format!("{}/v1beta/models", self.config.host);
        let listing = self.client().map_err(anyhow::Error::from).and_then(|client| {
            send_json(client.get(url).header("x-goog-api-key", self.api_key()))
        });
        match listing {
            Ok(response) => super::utils::model_names(&response, "models", "name"),
            Err(e) => {
                warn!("Error fetching Gemini models: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// System messages become `systemInstruction`; assistant turns use the
/// `model` role.
pub fn messages_to_gemini_spec(messages: &[Message]) -> Value {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    for message in messages {
        let part = json!({"text": message.text});
        match message.role {
            Role::System => system.push(part),
            Role::User => contents.push(json!({"role": "user", "parts": [part]})),
            Role::Assistant => contents.push(json!({"role": "model", "parts": [part]})),
        }
    }

    let mut payload = json!({"contents": contents});
    if !system.is_empty() {
        payload["systemInstruction"] = json!({"parts": system});
    }
    payload
}

fn candidate_text(response: &Value) -> Option<String> {
    let parts = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    Some(parts.iter().filter_map(|p| p["text"].as_str()).collect())
}
