use std::time::Duration;

use super::factory::ProviderType;
use crate::settings::Settings;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const GROQ_HOST: &str = "https://api.groq.com/openai";
pub const XAI_HOST: &str = "https://api.x.ai";
pub const DEEPSEEK_HOST: &str = "https://api.deepseek.com";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const GEMINI_HOST: &str = "https://generativelanguage.googleapis.com";
pub const OLLAMA_HOST: &str = "http://localhost:11434";

pub const ANTHROPIC_MAX_TOKENS: u32 = 1_000;
pub const AMAZON_MAX_TOKENS: u32 = 5_000;

/// How an OpenAI-compatible vendor produces JSON that matches a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredMode {
    /// `response_format: json_schema`, the schema travels with the request.
    JsonSchema,
    /// `response_format: json_object`, the schema is spelled out in a system message.
    JsonObject,
    Unsupported,
}

// Unified enum to wrap the per-vendor configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Gemini(GeminiProviderConfig),
    Ollama(OllamaProviderConfig),
    Amazon(AmazonProviderConfig),
}

impl ProviderConfig {
    pub fn for_provider(provider: ProviderType, settings: &Settings) -> Self {
        match provider {
            ProviderType::OpenAi => ProviderConfig::OpenAi(OpenAiProviderConfig::openai(settings)),
            ProviderType::Groq => ProviderConfig::OpenAi(OpenAiProviderConfig::groq(settings)),
            ProviderType::Xai => ProviderConfig::OpenAi(OpenAiProviderConfig::xai(settings)),
            ProviderType::Deepseek => {
                ProviderConfig::OpenAi(OpenAiProviderConfig::deepseek(settings))
            }
            ProviderType::Anthropic => {
                ProviderConfig::Anthropic(AnthropicProviderConfig::from_settings(settings))
            }
            ProviderType::Gemini => {
                ProviderConfig::Gemini(GeminiProviderConfig::from_settings(settings))
            }
            ProviderType::Ollama => {
                ProviderConfig::Ollama(OllamaProviderConfig::from_settings(settings))
            }
            ProviderType::Amazon => {
                ProviderConfig::Amazon(AmazonProviderConfig::from_settings(settings))
            }
        }
    }
}

fn host_for(provider: ProviderType, settings: &Settings, default: &str) -> String {
    settings
        .get_host(provider.name())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

fn key_for(provider: ProviderType, settings: &Settings) -> Option<String> {
    settings.get_api_key(provider.name()).map(str::to_string)
}

/// Settings for any vendor speaking the OpenAI chat completions protocol.
#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub name: String,
    pub host: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub structured: StructuredMode,
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub timeout: Duration,
}

impl OpenAiProviderConfig {
    fn compatible(
        provider: ProviderType,
        settings: &Settings,
        host: &str,
        structured: StructuredMode,
    ) -> Self {
        Self {
            name: provider.name().to_string(),
            host: host_for(provider, settings, host),
            api_key: key_for(provider, settings),
            default_model: provider.default_model().to_string(),
            structured,
            supports_tools: true,
            supports_streaming: true,
            timeout: settings.timeout,
        }
    }

    pub fn openai(settings: &Settings) -> Self {
        Self::compatible(ProviderType::OpenAi, settings, OPENAI_HOST, StructuredMode::JsonSchema)
    }

    pub fn groq(settings: &Settings) -> Self {
        Self::compatible(ProviderType::Groq, settings, GROQ_HOST, StructuredMode::JsonObject)
    }

    pub fn xai(settings: &Settings) -> Self {
        Self::compatible(ProviderType::Xai, settings, XAI_HOST, StructuredMode::Unsupported)
    }

    pub fn deepseek(settings: &Settings) -> Self {
        Self::compatible(
            ProviderType::Deepseek,
            settings,
            DEEPSEEK_HOST,
            StructuredMode::JsonObject,
        )
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl AnthropicProviderConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host: host_for(ProviderType::Anthropic, settings, ANTHROPIC_HOST),
            api_key: key_for(ProviderType::Anthropic, settings),
            max_tokens: ANTHROPIC_MAX_TOKENS,
            timeout: settings.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiProviderConfig {
    pub host: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl GeminiProviderConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host: host_for(ProviderType::Gemini, settings, GEMINI_HOST),
            api_key: key_for(ProviderType::Gemini, settings),
            timeout: settings.timeout,
        }
    }
}

/// Ollama runs locally and takes no key.
#[derive(Debug, Clone)]
pub struct OllamaProviderConfig {
    pub host: String,
    pub timeout: Duration,
}

impl OllamaProviderConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host: host_for(ProviderType::Ollama, settings, OLLAMA_HOST),
            timeout: settings.timeout,
        }
    }
}

/// Bedrock runtime, authenticated with a Bedrock API key (bearer token).
#[derive(Debug, Clone)]
pub struct AmazonProviderConfig {
    pub host: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl AmazonProviderConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let default_host = format!("https://bedrock-runtime.{}.amazonaws.com", settings.aws_region);
        Self {
            host: host_for(ProviderType::Amazon, settings, &default_host),
            api_key: key_for(ProviderType::Amazon, settings),
            max_tokens: AMAZON_MAX_TOKENS,
            timeout: settings.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_compatible_profiles() {
        let settings = Settings::default().with_api_key("groq", "gsk");

        let groq = OpenAiProviderConfig::groq(&settings);
        assert_eq!(groq.name, "groq");
        assert_eq!(groq.host, GROQ_HOST);
        assert_eq!(groq.api_key.as_deref(), Some("gsk"));
        assert_eq!(groq.default_model, "llama3-8b-8192");
        assert_eq!(groq.structured, StructuredMode::JsonObject);

        let xai = OpenAiProviderConfig::xai(&settings);
        assert_eq!(xai.structured, StructuredMode::Unsupported);
        assert!(xai.api_key.is_none());
    }

    #[test]
    fn test_host_override_is_trimmed() {
        let settings = Settings::default().with_host("ollama", "http://gpu-box:11434/");
        let config = OllamaProviderConfig::from_settings(&settings);
        assert_eq!(config.host, "http://gpu-box:11434");
    }

    #[test]
    fn test_amazon_host_uses_region() {
        let mut settings = Settings::default();
        settings.aws_region = "eu-central-1".to_string();
        let config = AmazonProviderConfig::from_settings(&settings);
        assert_eq!(config.host, "https://bedrock-runtime.eu-central-1.amazonaws.com");
        assert_eq!(config.max_tokens, AMAZON_MAX_TOKENS);
    }

    #[test]
    fn test_for_provider_picks_adapter_config() {
        let settings = Settings::default();
        assert!(matches!(
            ProviderConfig::for_provider(ProviderType::Deepseek, &settings),
            ProviderConfig::OpenAi(ref c) if c.name == "deepseek"
        ));
        assert!(matches!(
            ProviderConfig::for_provider(ProviderType::Gemini, &settings),
            ProviderConfig::Gemini(_)
        ));
    }
}
