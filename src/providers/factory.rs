use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tracing::debug;

use super::{
    amazon::AmazonProvider, anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig,
    gemini::GeminiProvider, ollama::OllamaProvider, openai::OpenAiProvider,
};
use crate::errors::{Result, SimplemindError};
use crate::settings::Settings;

/// Names scoring below this are not offered as suggestions.
pub const SUGGESTION_CUTOFF: f64 = 0.6;

/// Every provider the library knows. Supporting a new vendor means adding a
/// variant here.
#[derive(EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Groq,
    Gemini,
    Xai,
    Ollama,
    Amazon,
    Deepseek,
}

impl ProviderType {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Groq => "groq",
            ProviderType::Gemini => "gemini",
            ProviderType::Xai => "xai",
            ProviderType::Ollama => "ollama",
            ProviderType::Amazon => "amazon",
            ProviderType::Deepseek => "deepseek",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "gpt-4o-mini",
            ProviderType::Anthropic => "claude-3-5-sonnet-20241022",
            ProviderType::Groq => "llama3-8b-8192",
            ProviderType::Gemini => "gemini-1.5-flash-latest",
            ProviderType::Xai => "grok-beta",
            ProviderType::Ollama => "llama3.2",
            ProviderType::Amazon => "anthropic.claude-3-sonnet-20240229-v1:0",
            ProviderType::Deepseek => "deepseek-chat",
        }
    }

    /// Case-insensitive lookup. Unknown names fail with the closest
    /// registered name as a suggestion, when one is close enough.
    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().to_lowercase();
        if let Some(provider) = Self::iter().find(|p| p.name() == wanted) {
            return Ok(provider);
        }

        let suggestion = Self::iter()
            .map(|p| (p.name(), strsim::normalized_levenshtein(&wanted, p.name())))
            .filter(|(_, score)| *score >= SUGGESTION_CUTOFF)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name.to_string());

        Err(SimplemindError::NotFound {
            name: name.to_string(),
            suggestion,
        })
    }
}

pub fn get_provider(config: ProviderConfig) -> Box<dyn Provider> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Box::new(OpenAiProvider::new(openai_config)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Box::new(AnthropicProvider::new(anthropic_config))
        }
        ProviderConfig::Gemini(gemini_config) => Box::new(GeminiProvider::new(gemini_config)),
        ProviderConfig::Ollama(ollama_config) => Box::new(OllamaProvider::new(ollama_config)),
        ProviderConfig::Amazon(amazon_config) => Box::new(AmazonProvider::new(amazon_config)),
    }
}

/// Resolve a provider name to a fresh adapter.
///
/// An absent or blank name is a configuration problem, not a lookup miss.
pub fn find_provider(name: Option<&str>, settings: &Settings) -> Result<Box<dyn Provider>> {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| SimplemindError::Configuration("no provider configured".to_string()))?;

    let provider = ProviderType::from_name(name)?;
    debug!(provider = provider.name(), "resolved provider");
    Ok(get_provider(ProviderConfig::for_provider(provider, settings)))
}
