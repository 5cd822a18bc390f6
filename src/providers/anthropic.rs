use std::sync::OnceLock;

use anyhow::anyhow;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::base::{ensure_no_tools, Provider, TextStream};
use super::configs::AnthropicProviderConfig;
use super::factory::ProviderType;
use super::utils::{
    build_client, check_tools, model_names, send_json, send_request, LineStream, StreamEvent,
    StreamFormat, MAX_TOOL_ROUNDS,
};
use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::{Message, Role};
use crate::tools::Tool;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const STRUCTURED_TOOL_NAME: &str = "respond";

pub struct AnthropicProvider {
    config: AnthropicProviderConfig,
    client: OnceLock<Client>,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Self {
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
                "Anthropic API key is required".to_string(),
            ));
        }
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = build_client(self.config.timeout)
            .map_err(|e| SimplemindError::Configuration(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("x-api-key", self.config.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn post(&self, payload: &Value, model: &str) -> Result<Value> {
        let client = self.client()?;
        debug!(model, "messages request");
        let url = format!("{}/v1/messages", self.config.host);
        send_json(self.authorized(client.post(url)).json(payload))
            .map_err(|e| SimplemindError::provider(self.name(), model, e))
    }

    fn payload(&self, model: &str, system: Option<&str>, messages: &[Value]) -> Value {
        let mut payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        payload
    }

    /// Run one turn through the tool loop. Each round, registered `tool_use`
    /// blocks are executed and answered with `tool_result` blocks in a
    /// following user message.
    pub(crate) fn converse<P>(
        &self,
        model: &str,
        system: Option<&str>,
        mut messages: Vec<Value>,
        tools: &mut [Tool],
        mut post: P,
    ) -> Result<Value>
    where
        P: FnMut(&Value) -> Result<Value>,
    {
        let mut payload = self.payload(model, system, &messages);
        if !tools.is_empty() {
            payload["tools"] = json!(tools_to_anthropic_spec(tools));
        }
        let mut response = post(&payload)?;

        for round in 0..=MAX_TOOL_ROUNDS {
            let blocks = response["content"].as_array().cloned().unwrap_or_default();
            let requested = blocks.iter().any(|block| {
                block["type"] == "tool_use"
                    && tools.iter().any(|t| block["name"] == t.name.as_str())
            });
            if !requested {
                return Ok(response);
            }
            if round == MAX_TOOL_ROUNDS {
                break;
            }

            let mut assistant_content = Vec::with_capacity(blocks.len());
            let mut results = Vec::new();

            for block in blocks {
                if block["type"] != "tool_use" {
                    assistant_content.push(block);
                    continue;
                }
                let name = block["name"].as_str().unwrap_or_default();
                let Some(tool) = tools.iter_mut().find(|t| t.name == name) else {
                    warn!(tool = name, "model requested an unregistered tool");
                    assistant_content.push(json!({"type": "text", "text": block.to_string()}));
                    continue;
                };

                let id = block["id"].as_str().unwrap_or_default();
                tool.execute(id, &block["input"])
                    .map_err(|e| SimplemindError::provider(self.name(), model, e))?;
                results.push(
                    tool_result_block(tool)
                        .map_err(|e| SimplemindError::provider(self.name(), model, e))?,
                );
                assistant_content.push(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": block["input"],
                }));
            }

            messages.push(json!({"role": "assistant", "content": assistant_content}));
            messages.push(json!({"role": "user", "content": results}));
            payload["messages"] = json!(messages);
            response = post(&payload)?;
        }

        Err(SimplemindError::provider(
            self.name(),
            model,
            anyhow!("Model kept requesting tools after {} rounds", MAX_TOOL_ROUNDS),
        ))
    }

    fn extract_stream_text(event: &Value) -> StreamEvent {
        match event["type"].as_str() {
            Some("content_block_delta") => match event["delta"]["text"].as_str() {
                Some(text) => StreamEvent::Text(text.to_string()),
                None => StreamEvent::Skip,
            },
            Some("message_stop") => StreamEvent::Done,
            _ => StreamEvent::Skip,
        }
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        ProviderType::Anthropic.name()
    }

    fn default_model(&self) -> &str {
        ProviderType::Anthropic.default_model()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_tools(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(provider = "anthropic"))]
    fn send_conversation(
        &self,
        conversation: &Conversation,
        llm_model: Option<&str>,
        tools: &mut [Tool],
    ) -> Result<Message> {
        ensure_no_tools(self, tools)?;
        check_tools(tools)?;
        let model = self.model(llm_model).to_string();
        let (system, messages) = messages_to_anthropic_spec(conversation.messages());

        let response = self.converse(&model, system.as_deref(), messages, tools, |payload| {
            self.post(payload, &model)
        })?;

        Ok(Message::assistant(response_text(&response))
            .with_raw(response)
            .with_model(self.name(), model))
    }

    #[instrument(skip_all, fields(provider = "anthropic"))]
    fn structured_value(
        &self,
        prompt: &str,
        schema: &Value,
        llm_model: Option<&str>,
    ) -> Result<Value> {
        let model = self.model(llm_model);
        let mut payload = self.payload(model, None, &[json!({"role": "user", "content": prompt})]);
        payload["tools"] = json!([{
            "name": STRUCTURED_TOOL_NAME,
            "description": "Respond with data matching the input schema.",
            "input_schema": schema,
        }]);
        payload["tool_choice"] = json!({"type": "tool", "name": STRUCTURED_TOOL_NAME});

        let response = self.post(&payload, model)?;
        response["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "tool_use"))
            .map(|block| block["input"].clone())
            .ok_or_else(|| {
                let message = "Anthropic response has no structured output";
                SimplemindError::Validation(message.to_string())
            })
    }

    #[instrument(skip_all, fields(provider = "anthropic"))]
    fn generate_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<String> {
        let model = self.model(llm_model);
        let payload = self.payload(model, None, &[json!({"role": "user", "content": prompt})]);
        let response = self.post(&payload, model)?;
        Ok(response_text(&response))
    }

    fn generate_stream_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<TextStream> {
        let model = self.model(llm_model);
        let client = self.client()?;
        let mut payload = self.payload(model, None, &[json!({"role": "user", "content": prompt})]);
        payload["stream"] = json!(true);

        let url = format!("{}/v1/messages", self.config.host);
        let response = send_request(self.authorized(client.post(url)).json(&payload))
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
        let url = format!("{}/v1/models", self.config.host);
        let listing = self
            .client()
            .map_err(anyhow::Error::from)
            .and_then(|client| send_json(self.authorized(client.get(url))));
        match listing {
            Ok(response) => model_names(&response, "data", "id"),
            Err(e) => {
                warn!("Error fetching Anthropic models: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// Split the history into Anthropic's top-level system prompt and its
/// user/assistant message list.
pub fn messages_to_anthropic_spec(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.text.as_str())
        .collect();
    let turns = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| json!({"role": m.role.as_str(), "content": m.text}))
        .collect();

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

pub fn tools_to_anthropic_spec(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters_schema(),
            })
        })
        .collect()
}

/// The `tool_result` block answering an executed tool.
pub fn tool_result_block(tool: &Tool) -> anyhow::Result<Value> {
    match (&tool.tool_id, &tool.function_result) {
        (Some(id), Some(result)) => Ok(json!({
            "type": "tool_result",
            "tool_use_id": id,
            "content": result,
        })),
        _ => Err(anyhow!("Tool {} was not executed", tool.name)),
    }
}

/// Text of the final reply. A `tool_use` block left in it names a tool that
/// was never registered and is kept verbatim as its JSON.
fn response_text(response: &Value) -> String {
    response["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| match b["type"].as_str() {
                    Some("text") => b["text"].as_str().map(str::to_string),
                    Some("tool_use") => Some(b.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
