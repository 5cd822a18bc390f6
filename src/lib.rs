pub mod errors;
pub mod models;
pub mod plugins;
pub mod providers;
pub mod settings;
pub mod tools;

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;

pub use errors::{Result, SimplemindError};
pub use models::conversation::Conversation;
pub use models::message::{Message, Role};
pub use plugins::{HookAction, MemoryPlugin, Plugin};
pub use providers::base::{Provider, TextStream};
pub use providers::factory::{find_provider, ProviderType};
pub use settings::Settings;
pub use tools::{PropertyKind, Tool, ToolProperty};

/// Entry point holding the settings every call resolves providers with.
///
/// An absent provider name falls back to `settings.default_llm_provider`.
#[derive(Debug, Clone)]
pub struct Simplemind {
    settings: Arc<Settings>,
}

impl Simplemind {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Settings::from_env())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn provider(&self, llm_provider: Option<&str>) -> Result<Box<dyn Provider>> {
        let name = llm_provider.or(self.settings.default_llm_provider.as_deref());
        find_provider(name, &self.settings)
    }

    pub fn create_conversation(
        &self,
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
    ) -> Conversation {
        Conversation::with_settings(llm_model, llm_provider, Arc::clone(&self.settings))
    }

    pub fn generate_text(
        &self,
        prompt: &str,
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
    ) -> Result<String> {
        self.provider(llm_provider)?.generate_text(prompt, llm_model)
    }

    /// Generate an instance of `T` from a prompt.
    pub fn generate_data<T>(
        &self,
        prompt: &str,
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
    ) -> Result<T>
    where
        T: JsonSchema + DeserializeOwned,
    {
        let provider = self.provider(llm_provider)?;
        providers::base::structured_response(provider.as_ref(), prompt, llm_model)
    }

    pub fn generate_stream_text(
        &self,
        prompt: &str,
        llm_model: Option<&str>,
        llm_provider: Option<&str>,
    ) -> Result<TextStream> {
        self.provider(llm_provider)?.generate_stream_text(prompt, llm_model)
    }
}

/// Create a conversation configured from the environment.
pub fn create_conversation(llm_model: Option<&str>, llm_provider: Option<&str>) -> Conversation {
    Conversation::new(llm_model, llm_provider)
}

pub fn generate_text(
    prompt: &str,
    llm_model: Option<&str>,
    llm_provider: Option<&str>,
) -> Result<String> {
    Simplemind::from_env().generate_text(prompt, llm_model, llm_provider)
}

pub fn generate_data<T>(
    prompt: &str,
    llm_model: Option<&str>,
    llm_provider: Option<&str>,
) -> Result<T>
where
    T: JsonSchema + DeserializeOwned,
{
    Simplemind::from_env().generate_data(prompt, llm_model, llm_provider)
}

pub fn generate_stream_text(
    prompt: &str,
    llm_model: Option<&str>,
    llm_provider: Option<&str>,
) -> Result<TextStream> {
    Simplemind::from_env().generate_stream_text(prompt, llm_model, llm_provider)
}
