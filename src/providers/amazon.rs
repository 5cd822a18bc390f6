use std::sync::OnceLock;

use anyhow::anyhow;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::base::{ensure_no_tools, Provider};
use super::configs::AmazonProviderConfig;
use super::factory::ProviderType;
use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::{Message, Role};
use crate::providers::utils::{build_client, send_json};
use crate::tools::Tool;

const STRUCTURED_TOOL_NAME: &str = "respond";

/// Bedrock runtime through the Converse API.
pub struct AmazonProvider {
    config: AmazonProviderConfig,
    client: OnceLock<Client>,
}

impl AmazonProvider {
    pub fn new(config: AmazonProviderConfig) -> Self {
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
                "Amazon Bedrock API key is required".to_string(),
            ));
        }
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = build_client(self.config.timeout)
            .map_err(|e| SimplemindError::Configuration(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn converse(&self, mut payload: Value, model: &str) -> Result<Value> {
        let client = self.client()?;
        payload["inferenceConfig"] = json!({"maxTokens": self.config.max_tokens});
        debug!(model, "converse request");
        let url = format!("{}/model/{}/converse", self.config.host, model);
        send_json(
            client
                .post(url)
                .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
                .json(&payload),
        )
        .map_err(|e| SimplemindError::provider(self.name(), model, e))
    }

    fn reply_text(&self, response: &Value, model: &str) -> Result<String> {
        output_blocks(response)
            .and_then(|blocks| blocks.iter().find_map(|b| b["text"].as_str()))
            .map(str::to_string)
            .ok_or_else(|| {
                let source = anyhow!("Response has no text output");
                SimplemindError::provider(self.name(), model, source)
            })
    }
}

impl Provider for AmazonProvider {
    fn name(&self) -> &str {
        ProviderType::Amazon.name()
    }

    fn default_model(&self) -> &str {
        ProviderType::Amazon.default_model()
    }

    #[instrument(skip_all, fields(provider = "amazon"))]
    fn send_conversation(
        &self,
        conversation: &Conversation,
        llm_model: Option<&str>,
        tools: &mut [Tool],
    ) -> Result<Message> {
        ensure_no_tools(self, tools)?;
        let model = self.model(llm_model);
        let response = self.converse(messages_to_bedrock_spec(conversation.messages()), model)?;
        let text = self.reply_text(&response, model)?;
        Ok(Message::assistant(text)
            .with_raw(response)
            .with_model(self.name(), model))
    }

    #[instrument(skip_all, fields(provider = "amazon"))]
    fn structured_value(
        &self,
        prompt: &str,
        schema: &Value,
        llm_model: Option<&str>,
    ) -> Result<Value> {
        let model = self.model(llm_model);
        let payload = json!({
            "messages": [{"role": "user", "content": [{"text": prompt}]}],
            "toolConfig": {
                "tools": [{
                    "toolSpec": {
                        "name": STRUCTURED_TOOL_NAME,
                        "description": "Respond with data matching the input schema.",
                        "inputSchema": {"json": schema},
                    }
                }],
                "toolChoice": {"tool": {"name": STRUCTURED_TOOL_NAME}},
            },
        });
        let response = self.converse(payload, model)?;
        output_blocks(&response)
            .and_then(|blocks| blocks.iter().find_map(|b| b.get("toolUse")))
            .map(|tool_use| tool_use["input"].clone())
            .ok_or_else(|| {
                SimplemindError::Validation("Bedrock response has no structured output".to_string())
            })
    }

    #[instrument(skip_all, fields(provider = "amazon"))]
    fn generate_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<String> {
        let model = self.model(llm_model);
        let payload = json!({"messages": [{"role": "user", "content": [{"text": prompt}]}]});
        let response = self.converse(payload, model)?;
        self.reply_text(&response, model)
    }
}

/// Converse takes system prompts separately and content as a list of blocks.
pub fn messages_to_bedrock_spec(messages: &[Message]) -> Value {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for message in messages {
        let block = json!({"text": message.text});
        if message.role == Role::System {
            system.push(block);
        } else {
            turns.push(json!({"role": message.role.as_str(), "content": [block]}));
        }
    }

    let mut payload = json!({"messages": turns});
    if !system.is_empty() {
        payload["system"] = json!(system);
    }
    payload
}

fn output_blocks(response: &Value) -> Option<&Vec<Value>> {
    response.get("output")?.get("message")?.get("content")?.as_array()
}
