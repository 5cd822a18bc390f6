use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use strum::IntoEnumIterator;

use crate::providers::factory::ProviderType;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Source of raw configuration values.
#[cfg_attr(test, automock)]
pub trait Environment: Send + Sync {
    fn get_var(&self, key: &str) -> std::result::Result<String, env::VarError>;
}

pub struct RealEnvironment;

impl Environment for RealEnvironment {
    fn get_var(&self, key: &str) -> std::result::Result<String, env::VarError> {
        env::var(key)
    }
}

/// Resolved configuration for all providers. Adapters read keys and hosts from
/// here, never from the process environment.
#[derive(Debug, Clone)]
pub struct Settings {
    api_keys: HashMap<String, String>,
    hosts: HashMap<String, String>,
    pub default_llm_provider: Option<String>,
    pub aws_region: String,
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_keys: HashMap::new(),
            hosts: HashMap::new(),
            default_llm_provider: None,
            aws_region: DEFAULT_AWS_REGION.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Settings {
    /// Load `.env` if there is one, then read the process environment.
    pub fn from_env() -> Self {
        // A missing .env file is the normal case.
        let _ = dotenv::dotenv();
        Self::from_environment(&RealEnvironment)
    }

    pub fn from_environment(environment: &dyn Environment) -> Self {
        let lookup = |key: &str| {
            environment
                .get_var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Settings::default();
        for provider in ProviderType::iter() {
            let name = provider.name();
            let upper = name.to_uppercase();

            let key = lookup(&format!("{}_API_KEY", upper)).or_else(|| match provider {
                ProviderType::Amazon => lookup("AWS_BEARER_TOKEN_BEDROCK"),
                _ => None,
            });
            if let Some(key) = key {
                settings.api_keys.insert(name.to_string(), key);
            }
            if let Some(host) = lookup(&format!("{}_HOST_URL", upper)) {
                settings.hosts.insert(name.to_string(), host);
            }
        }

        settings.default_llm_provider = lookup("DEFAULT_LLM_PROVIDER");
        if let Some(region) = lookup("AWS_REGION") {
            settings.aws_region = region;
        }
        if let Some(secs) = lookup("SIMPLEMIND_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
            settings.timeout = Duration::from_secs(secs);
        }
        settings
    }

    pub fn get_api_key(&self, provider_name: &str) -> Option<&str> {
        self.api_keys
            .get(&provider_name.to_lowercase())
            .map(String::as_str)
    }

    pub fn get_host(&self, provider_name: &str) -> Option<&str> {
        self.hosts
            .get(&provider_name.to_lowercase())
            .map(String::as_str)
    }

    pub fn with_api_key(mut self, provider_name: &str, key: impl Into<String>) -> Self {
        self.api_keys
            .insert(provider_name.to_lowercase(), key.into());
        self
    }

    pub fn with_host(mut self, provider_name: &str, host: impl Into<String>) -> Self {
        self.hosts.insert(provider_name.to_lowercase(), host.into());
        self
    }

    pub fn with_default_provider(mut self, provider_name: impl Into<String>) -> Self {
        self.default_llm_provider = Some(provider_name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(vars: &'static [(&'static str, &'static str)]) -> MockEnvironment {
        let mut mock = MockEnvironment::new();
        mock.expect_get_var().returning(move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .ok_or(env::VarError::NotPresent)
        });
        mock
    }

    #[test]
    fn test_reads_api_keys_and_hosts() {
        let env = environment(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OLLAMA_HOST_URL", "http://box:11434"),
            ("DEFAULT_LLM_PROVIDER", "anthropic"),
        ]);
        let settings = Settings::from_environment(&env);

        assert_eq!(settings.get_api_key("openai"), Some("sk-test"));
        assert_eq!(settings.get_api_key("OpenAI"), Some("sk-test"));
        assert_eq!(settings.get_api_key("anthropic"), None);
        assert_eq!(settings.get_host("ollama"), Some("http://box:11434"));
        assert_eq!(settings.default_llm_provider.as_deref(), Some("anthropic"));
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let env = environment(&[("GROQ_API_KEY", "   ")]);
        let settings = Settings::from_environment(&env);
        assert_eq!(settings.get_api_key("groq"), None);
    }

    #[test]
    fn test_amazon_falls_back_to_bedrock_token() {
        let env = environment(&[
            ("AWS_BEARER_TOKEN_BEDROCK", "bedrock-token"),
            ("AWS_REGION", "eu-west-1"),
            ("SIMPLEMIND_TIMEOUT_SECS", "30"),
        ]);
        let settings = Settings::from_environment(&env);
        assert_eq!(settings.get_api_key("amazon"), Some("bedrock-token"));
        assert_eq!(settings.aws_region, "eu-west-1");
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_specific_key_checked_first() {
        let env = environment(&[
            ("AMAZON_API_KEY", "explicit"),
            ("AWS_BEARER_TOKEN_BEDROCK", "bedrock-token"),
        ]);
        let settings = Settings::from_environment(&env);
        assert_eq!(settings.get_api_key("amazon"), Some("explicit"));
    }

    #[test]
    fn test_builder_overrides() {
        let settings = Settings::default()
            .with_api_key("OpenAI", "k")
            .with_host("openai", "http://localhost:1234")
            .with_default_provider("openai");
        assert_eq!(settings.get_api_key("openai"), Some("k"));
        assert_eq!(settings.get_host("OPENAI"), Some("http://localhost:1234"));
        assert_eq!(settings.default_llm_provider.as_deref(), Some("openai"));
    }
}
