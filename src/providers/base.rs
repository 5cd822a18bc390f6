use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{Result, SimplemindError};
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::tools::Tool;

/// A lazy, finite sequence of text fragments in the order the vendor sent
/// them. Dropping it stops reading; it does not cancel work on the vendor side.
pub type TextStream = Box<dyn Iterator<Item = Result<String>> + Send>;

/// Base trait for AI providers (OpenAI, Anthropic, etc)
pub trait Provider: Send + Sync {
    /// Canonical lowercase name, as used for lookup.
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supports_structured_responses(&self) -> bool {
        true
    }

    fn supports_tools(&self) -> bool {
        false
    }

    /// Send the whole history and return the assistant's reply.
    ///
    /// When `tools` is not empty the adapter runs the tool loop: requested
    /// tools are executed and their results sent back until the model answers
    /// with plain text.
    fn send_conversation(
        &self,
        conversation: &Conversation,
        llm_model: Option<&str>,
        tools: &mut [Tool],
    ) -> Result<Message>;

    /// Ask for a JSON value shaped like `schema`. The object-safe half of
    /// [`structured_response`].
    fn structured_value(&self, prompt: &str, schema: &Value, llm_model: Option<&str>)
        -> Result<Value>;

    fn generate_text(&self, prompt: &str, llm_model: Option<&str>) -> Result<String>;

    fn generate_stream_text(&self, _prompt: &str, _llm_model: Option<&str>) -> Result<TextStream> {
        Err(SimplemindError::not_supported(self.name(), "streaming"))
    }

    /// Models the vendor offers. Advisory only: failures give an empty list.
    fn available_models(&self) -> Vec<String> {
        Vec::new()
    }

    /// The model to send, always explicit.
    fn model<'a>(&'a self, llm_model: Option<&'a str>) -> &'a str {
        llm_model.unwrap_or_else(|| self.default_model())
    }
}

/// JSON schema for `T`, without the meta-schema marker vendors reject.
pub fn response_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
    }
    schema
}

/// Generate a value of type `T` in one shot.
///
/// The vendor's JSON must deserialize into `T` as is; missing or mistyped
/// fields are a [`SimplemindError::Validation`].
pub fn structured_response<T>(
    provider: &dyn Provider,
    prompt: &str,
    llm_model: Option<&str>,
) -> Result<T>
where
    T: JsonSchema + DeserializeOwned,
{
    if !provider.supports_structured_responses() {
        return Err(SimplemindError::not_supported(
            provider.name(),
            "structured responses",
        ));
    }
    let schema = response_schema::<T>();
    let value = provider.structured_value(prompt, &schema, llm_model)?;
    serde_json::from_value(value).map_err(|e| {
        SimplemindError::Validation(format!(
            "{} response does not match the requested schema: {}",
            provider.name(),
            e
        ))
    })
}

pub(crate) fn ensure_no_tools(provider: &dyn Provider, tools: &[Tool]) -> Result<()> {
    if !tools.is_empty() && !provider.supports_tools() {
        return Err(SimplemindError::not_supported(provider.name(), "tool calling"));
    }
    Ok(())
}
