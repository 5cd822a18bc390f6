use std::sync::OnceLock;

use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::base::{ensure_no_tools, Provider, TextStream};
use super::configs::OllamaProviderConfig;
use super::factory::ProviderType;
use super::openai::messages_to_openai_spec;
use super::utils::{
    build_client, model_names, send_json, send_request, LineStream, StreamEvent, StreamFormat,
};
use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::tools::Tool;

pub struct OllamaProvider {
    config: OllamaProviderConfig,
    client: OnceLock<Client>,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into().trim_end_matches('/').to_string();
        self
    }

    fn client(&self) -> Result<&Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = build_client(self.config.timeout)
            .map_err(|e| SimplemindError::Configuration(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn chat(&self, messages: Vec<Value>, model: &str) -> Result<(String, Value)> {
        let client = self.client()?;
        debug!(model, host = %self.config.host, "chat request");
        let payload = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        let url = format!("{}/api/chat", self.config.host);
        let response = send_json(client.post(url).json(&payload))
            .map_err(|e| SimplemindError::provider(self.name(), model, e))?;
        let text = response["message"]["content"].as_str().unwrap_or_default().to_string();
        Ok((text, response))
    }

    fn extract_stream_text(chunk: &Value) -> StreamEvent {
        if chunk["done"] == json!(true) {
            return StreamEvent::Done;
        }
        match chunk["message"]["content"].as_str() {
            Some(text) => StreamEvent::Text(text.to_string()),
            None => StreamEvent::Skip,
        }
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        ProviderType::Ollama.name()
    }

    fn default_model(&self) -> &str {
        ProviderType::Ollama.default_model()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_structured_responses(&self) -> bool {
        false
    }

    #[instrument(skip_all, fields(provider = "ollama"))]
    fn send_conversation(
        &self,
        conversation: &Conversation,
        llm_model: Option<&str>,
        tools: &mut [Tool],
    ) -> Result<Message> {
        ensure_no_tools(self, tools)?;
        let model = self.model(llm_model);
        let (text, response) = self.chat(messages_to_openai_spec(conversation.messages()), model)?;
        Ok(Message::assistant(text)
            .with_raw(response)
            .with_model(self.name(), model))
    }

    fn structured_value(
        &self,
        _prompt: &str,
        _schema: &Value,
        _llm_model: Option<&str>,
    ) -> Result<Value> {
        Err(SimplemindError::not_supported(self.name(), "structured responses"))
    }

    #[instrument(skip_all, fields(provider = "ollama"))]
    fn generate_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<String> {
        let model = self.model(llm_model);
        let (text, _) = self.chat(vec![json!({"role": "user", "content": prompt})], model)?;
        Ok(text)
    }

    fn generate_stream_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<TextStream> {
        let model = self.model(llm_model);
        let client = self.client()?;
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": true,
        });
        let url = format!("{}/api/chat", self.config.host);
        let response = send_request(client.post(url).json(&payload))
            .map_err(|e| SimplemindError::provider(self.name(), model, e))?;

        Ok(Box::new(LineStream::new(
            response,
            StreamFormat::Ndjson,
            Self::extract_stream_text,
            self.name(),
            model,
        )))
    }

    fn available_models(&self) -> Vec<String> {
        let listing = self
            .client()
            .map_err(anyhow::Error::from)
            .and_then(|client| send_json(client.get(format!("{}/api/tags", self.config.host))));
        match listing {
            Ok(response) => model_names(&response, "models", "name"),
            Err(e) => {
                warn!("Error fetching Ollama models: {:#}", e);
                Vec::new()
            }
        }
    }
}
