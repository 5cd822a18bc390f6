use std::sync::OnceLock;

use anyhow::anyhow;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::base::{Provider, TextStream};
use super::configs::{OpenAiProviderConfig, StructuredMode};
use super::utils::{
    build_client, check_tools, extract_json, model_names, schema_instruction, send_json,
    send_request, LineStream, StreamEvent, StreamFormat, MAX_TOOL_ROUNDS,
};
use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::tools::Tool;

/// Adapter for OpenAI and every vendor that speaks its chat completions
/// protocol (Groq, XAI, DeepSeek).
pub struct OpenAiProvider {
    config: OpenAiProviderConfig,
    client: OnceLock<Client>,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    /// An explicit key always wins over the one from settings.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = Some(api_key.into());
        self
    }

    fn client(&self) -> Result<&Client> {
        if self.config.api_key.is_none() {
            return Err(SimplemindError::Configuration(format!(
                "{} API key is required",
                self.config.name
            )));
        }
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = build_client(self.config.timeout)
            .map_err(|e| SimplemindError::Configuration(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.host, path)
    }

    fn post(&self, payload: &Value, model: &str) -> Result<Value> {
        let client = self.client()?;
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        debug!(provider = %self.config.name, model, "chat completion request");
        send_json(
            client
                .post(self.url("chat/completions"))
                .bearer_auth(api_key)
                .json(payload),
        )
        .map_err(|e| SimplemindError::provider(self.name(), model, e))
    }

    fn chat_payload(model: &str, messages: &[Value], tools_spec: &[Value]) -> Value {
        let mut payload = json!({
            "model": model,
            "messages": messages,
        });
        if !tools_spec.is_empty() {
            payload["tools"] = json!(tools_spec);
        }
        payload
    }

    /// Run one turn, including any tool-call rounds, and return the final
    /// response body. `post` performs the actual round trip.
    pub(crate) fn converse<P>(
        &self,
        model: &str,
        mut messages: Vec<Value>,
        tools: &mut [Tool],
        mut post: P,
    ) -> Result<Value>
    where
        P: FnMut(&Value) -> Result<Value>,
    {
        let tools_spec = tools_to_openai_spec(tools);
        let mut response = post(&Self::chat_payload(model, &messages, &tools_spec))?;

        for round in 0..=MAX_TOOL_ROUNDS {
            let calls = tool_calls(&response);
            if calls.is_empty() || tools.is_empty() {
                return Ok(response);
            }
            if round == MAX_TOOL_ROUNDS {
                break;
            }

            messages.push(response["choices"][0]["message"].clone());
            for call in calls {
                let output = self.run_tool_call(&call, tools, model)?;
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": output,
                }));
            }
            response = post(&Self::chat_payload(model, &messages, &tools_spec))?;
        }

        Err(SimplemindError::provider(
            self.name(),
            model,
            anyhow!("Model kept requesting tools after {} rounds", MAX_TOOL_ROUNDS),
        ))
    }

    fn run_tool_call(&self, call: &ToolCall, tools: &mut [Tool], model: &str) -> Result<String> {
        let Some(tool) = tools.iter_mut().find(|t| t.name == call.name) else {
            warn!(tool = %call.name, "model requested an unregistered tool");
            return Ok(format!("Tool '{}' is not available", call.name));
        };
        let arguments: Value = match serde_json::from_str(&call.arguments) {
            Ok(arguments) => arguments,
            Err(_) => {
                return Ok(format!(
                    "Could not interpret tool use parameters for id {}: {}",
                    call.id, call.arguments
                ))
            }
        };
        tool.execute(&call.id, &arguments)
            .map(str::to_string)
            .map_err(|e| SimplemindError::provider(self.name(), model, e))
    }

    /// A body without `choices` is a malformed vendor reply, not bad JSON.
    fn reply_text(&self, response: &Value, model: &str) -> Result<String> {
        response_text(response).ok_or_else(|| {
            SimplemindError::provider(self.name(), model, anyhow!("Response has no choices"))
        })
    }

    fn extract_stream_text(chunk: &Value) -> StreamEvent {
        match chunk["choices"][0]["delta"]["content"].as_str() {
            Some(text) => StreamEvent::Text(text.to_string()),
            None => StreamEvent::Skip,
        }
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    fn supports_streaming(&self) -> bool {
        self.config.supports_streaming
    }

    fn supports_structured_responses(&self) -> bool {
        self.config.structured != StructuredMode::Unsupported
    }

    fn supports_tools(&self) -> bool {
        self.config.supports_tools
    }

    #[instrument(skip_all, fields(provider = %self.config.name))]
    fn send_conversation(
        &self,
        conversation: &Conversation,
        llm_model: Option<&str>,
        tools: &mut [Tool],
    ) -> Result<Message> {
        super::base::ensure_no_tools(self, tools)?;
        check_tools(tools)?;
        let model = self.model(llm_model).to_string();
        let messages = messages_to_openai_spec(conversation.messages());

        let response =
            self.converse(&model, messages, tools, |payload| self.post(payload, &model))?;
        let text = self.reply_text(&response, &model)?;

        Ok(Message::assistant(text)
            .with_raw(response)
            .with_model(self.name(), model))
    }

    #[instrument(skip_all, fields(provider = %self.config.name))]
    fn structured_value(
        &self,
        prompt: &str,
        schema: &Value,
        llm_model: Option<&str>,
    ) -> Result<Value> {
        let model = self.model(llm_model);
        let user = json!({"role": "user", "content": prompt});
        let payload = match self.config.structured {
            StructuredMode::JsonSchema => json!({
                "model": model,
                "messages": [user],
                "response_format": {
                    "type": "json_schema",
                    "json_schema": {
                        "name": schema.get("title").and_then(Value::as_str).unwrap_or("response"),
                        "schema": schema,
                    }
                }
            }),
            StructuredMode::JsonObject => json!({
                "model": model,
                "messages": [
                    {"role": "system", "content": schema_instruction(schema)},
                    user,
                ],
                "response_format": {"type": "json_object"}
            }),
            StructuredMode::Unsupported => {
                return Err(SimplemindError::not_supported(self.name(), "structured responses"))
            }
        };

        let response = self.post(&payload, model)?;
        let text = self.reply_text(&response, model)?;
        extract_json(&text)
    }

    #[instrument(skip_all, fields(provider = %self.config.name))]
    fn generate_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<String> {
        let model = self.model(llm_model);
        let messages = [json!({"role": "user", "content": prompt})];
        let response = self.post(&Self::chat_payload(model, &messages, &[]), model)?;
        self.reply_text(&response, model)
    }

    fn generate_stream_text(
        &self,
        prompt: &str,
        llm_model: Option<&str>,
    ) -> Result<TextStream> {
        if !self.supports_streaming() {
            return Err(SimplemindError::not_supported(self.name(), "streaming"));
        }
        let model = self.model(llm_model);
        let client = self.client()?;
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": true,
        });
        let response = send_request(
            client
                .post(self.url("chat/completions"))
                .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
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
        let listing = self.client().map_err(anyhow::Error::from).and_then(|client| {
            send_json(
                client
                    .get(self.url("models"))
                    .bearer_auth(self.config.api_key.as_deref().unwrap_or_default()),
            )
        });
        match listing {
            Ok(response) => model_names(&response, "data", "id"),
            Err(e) => {
                warn!(provider = %self.config.name, "Error fetching models: {:#}", e);
                Vec::new()
            }
        }
    }
}

struct ToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn tool_calls(response: &Value) -> Vec<ToolCall> {
    response["choices"][0]["message"]["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: call["function"]["arguments"]
                        .as_str()
                        .unwrap_or("{}")
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn response_text(response: &Value) -> Option<String> {
    let message = response.get("choices")?.get(0)?.get("message")?;
    Some(message["content"].as_str().unwrap_or_default().to_string())
}

/// Convert the history to OpenAI's message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role.as_str(),
                "content": message.text,
            })
        })
        .collect()
}

/// Convert tools to OpenAI's function tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters_schema(),
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Role;
    use crate::providers::base::structured_response;
    use crate::settings::Settings;
    use mockito::Matcher;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Poem {
        title: String,
        content: String,
    }

    fn provider(server: &mockito::Server) -> OpenAiProvider {
        let settings = Settings::default()
            .with_api_key("openai", "test_api_key")
            .with_host("openai", server.url());
        OpenAiProvider::new(OpenAiProviderConfig::openai(&settings))
    }

    fn completion(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    fn tool_request(id: &str, name: &str, arguments: &str) -> Value {
        json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments}
                    }]
                }
            }]
        })
    }

    fn conversation(text: &str) -> Conversation {
        let mut conversation =
            Conversation::with_settings(None, Some("openai"), Arc::new(Settings::default()));
        conversation.add_message(Role::User, text, None);
        conversation
    }

    #[test]
    fn test_send_conversation_basic() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test_api_key")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("Hi there").to_string())
            .create();

        let message = provider(&server).send_conversation(&conversation("Hello"), None, &mut [])?;

        mock.assert();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text, "Hi there");
        assert_eq!(message.llm_provider.as_deref(), Some("openai"));
        assert_eq!(message.llm_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(message.raw.as_ref().unwrap()["id"], "chatcmpl-1");
        Ok(())
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let provider = OpenAiProvider::new(OpenAiProviderConfig::openai(&Settings::default()));
        let err = provider.generate_text("hi", None).unwrap_err();
        assert!(matches!(err, SimplemindError::Configuration(_)));
    }

    #[test]
    fn test_explicit_key_wins() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer explicit")
            .with_status(200)
            .with_body(completion("ok").to_string())
            .create();

        let text = provider(&server)
            .with_api_key("explicit")
            .generate_text("hi", Some("gpt-4o"))
            .unwrap();
        mock.assert();
        assert_eq!(text, "ok");
    }

    #[test]
    fn test_vendor_failure_is_provider_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body(r#"{"error": {"message": "Incorrect API key provided"}}"#)
            .create();

        let err = provider(&server).generate_text("hi", None).unwrap_err();
        match &err {
            SimplemindError::Provider { provider, model, .. } => {
                assert_eq!(provider, "openai");
                assert_eq!(model, "gpt-4o-mini");
            }
            other => panic!("expected provider error, got {:?}", other),
        }
        assert!(err.to_string().contains("Incorrect API key provided"));
    }

    #[test]
    fn test_structured_response_uses_json_schema() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(json!({
                "response_format": {"type": "json_schema", "json_schema": {"name": "Poem"}}
            })))
            .with_status(200)
            .with_body(completion(r#"{"title": "T", "content": "C"}"#).to_string())
            .create();

        let poem: Poem = structured_response(&provider(&server), "Write a poem", None)?;
        mock.assert();
        assert_eq!(poem.title, "T");
        assert_eq!(poem.content, "C");
        Ok(())
    }

    #[test]
    fn test_structured_response_missing_field() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(completion(r#"{"title": "T"}"#).to_string())
            .create();

        let result: Result<Poem> = structured_response(&provider(&server), "Write a poem", None);
        assert!(matches!(result, Err(SimplemindError::Validation(_))));
    }

    #[test]
    fn test_structured_reply_without_choices_is_provider_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(json!({"id": "chatcmpl-2", "object": "chat.completion"}).to_string())
            .create();

        let result = provider(&server).structured_value("x", &json!({"type": "object"}), None);
        assert!(matches!(result, Err(SimplemindError::Provider { .. })));
    }

    #[test]
    fn test_xai_structured_not_supported() {
        let settings = Settings::default().with_api_key("xai", "k");
        let xai = OpenAiProvider::new(OpenAiProviderConfig::xai(&settings));
        let result = xai.structured_value("x", &json!({}), None);
        assert!(matches!(result, Err(SimplemindError::NotSupported { .. })));
    }

    #[test]
    fn test_tool_loop_executes_and_resubmits() -> anyhow::Result<()> {
        let provider = provider(&mockito::Server::new());
        let mut tools = vec![Tool::from_fn("add", "Add two integers", |args: AddArgs| {
            Ok(args.a + args.b)
        })?];
        let mut responses = vec![
            tool_request("call_1", "add", r#"{"a": 2, "b": 3}"#),
            completion("2 + 3 = 5"),
        ];
        let mut payloads = Vec::new();

        let messages = vec![json!({"role": "user", "content": "What is 2 + 3?"})];
        let response = provider.converse("gpt-4o-mini", messages, &mut tools, |payload| {
            payloads.push(payload.clone());
            Ok(responses.remove(0))
        })?;

        assert_eq!(response_text(&response).as_deref(), Some("2 + 3 = 5"));
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["tools"][0]["function"]["name"], "add");
        assert_eq!(
            payloads[0]["tools"][0]["function"]["parameters"]["required"],
            json!(["a", "b"])
        );

        let resubmitted = payloads[1]["messages"].as_array().unwrap();
        assert_eq!(resubmitted.len(), 3);
        assert_eq!(resubmitted[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(resubmitted[2]["role"], "tool");
        assert_eq!(resubmitted[2]["tool_call_id"], "call_1");
        assert_eq!(resubmitted[2]["content"], "5");

        assert!(tools[0].is_executed());
        assert_eq!(tools[0].tool_id.as_deref(), Some("call_1"));
        Ok(())
    }

    #[test]
    fn test_unknown_tool_is_not_executed() -> anyhow::Result<()> {
        let provider = provider(&mockito::Server::new());
        let mut tools = vec![Tool::from_fn("add", "Add", |args: AddArgs| Ok(args.a + args.b))?];
        let mut responses = vec![
            tool_request("call_9", "rm_rf", r#"{"path": "/"}"#),
            completion("I cannot do that"),
        ];
        let mut payloads = Vec::new();

        provider.converse("gpt-4o-mini", vec![], &mut tools, |payload| {
            payloads.push(payload.clone());
            Ok(responses.remove(0))
        })?;

        assert_eq!(payloads[1]["messages"][1]["content"], "Tool 'rm_rf' is not available");
        assert!(!tools[0].is_executed());
        Ok(())
    }

    #[test]
    fn test_tool_loop_is_bounded() -> anyhow::Result<()> {
        let provider = provider(&mockito::Server::new());
        let mut tools = vec![Tool::from_fn("add", "Add", |args: AddArgs| Ok(args.a + args.b))?];

        let mut posts = 0;
        let result = provider.converse("gpt-4o-mini", vec![], &mut tools, |_| {
            posts += 1;
            Ok(tool_request("call", "add", r#"{"a": 1, "b": 1}"#))
        });
        assert!(matches!(result, Err(SimplemindError::Provider { .. })));
        assert_eq!(posts, MAX_TOOL_ROUNDS + 1);
        Ok(())
    }

    #[test]
    fn test_answer_after_last_tool_round_is_kept() -> anyhow::Result<()> {
        let provider = provider(&mockito::Server::new());
        let mut tools = vec![Tool::from_fn("add", "Add", |args: AddArgs| Ok(args.a + args.b))?];
        let mut responses: Vec<Value> = (0..MAX_TOOL_ROUNDS)
            .map(|i| tool_request(&format!("call_{}", i), "add", r#"{"a": 1, "b": 1}"#))
            .collect();
        responses.push(completion("done"));
        let mut posts = 0;

        let response = provider.converse("gpt-4o-mini", vec![], &mut tools, |_| {
            posts += 1;
            Ok(responses.remove(0))
        })?;
        assert_eq!(posts, MAX_TOOL_ROUNDS + 1);
        assert_eq!(response_text(&response).as_deref(), Some("done"));
        Ok(())
    }

    #[test]
    fn test_stream_text() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let body = [
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"The moon"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":" glows"}}]}"#,
            "data: [DONE]",
        ]
        .join("\n\n");
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create();

        let chunks: Vec<String> = provider(&server)
            .generate_stream_text("Write a poem about the moon", None)?
            .collect::<Result<_>>()?;
        mock.assert();
        assert_eq!(chunks, vec!["The moon", " glows"]);
        Ok(())
    }

    #[test]
    fn test_available_models_degrades_to_empty() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/v1/models").with_status(500).create();
        assert!(provider(&server).available_models().is_empty());

        let settings = Settings::default();
        let keyless = OpenAiProvider::new(OpenAiProviderConfig::openai(&settings));
        assert!(keyless.available_models().is_empty());
    }

    #[test]
    fn test_available_models() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body(json!({"data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]}).to_string())
            .create();
        assert_eq!(provider(&server).available_models(), vec!["gpt-4o", "gpt-4o-mini"]);
    }
}
