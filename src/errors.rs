use thiserror::Error;

/// Every failure the library reports to its callers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SimplemindError {
    /// Missing API key, absent provider name, or other unusable settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider '{name}' not found{}", suggestion_hint(.suggestion))]
    NotFound {
        name: String,
        suggestion: Option<String>,
    },

    /// A vendor call failed. The underlying cause stays in the chain.
    #[error("{provider} request failed (model {model}): {source:#}")]
    Provider {
        provider: String,
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{provider} does not support {capability}")]
    NotSupported {
        provider: String,
        capability: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Raised when a tool argument has a type outside string, integer and boolean.
    #[error("Argument '{name}' of type '{kind}' is not supported")]
    UnsupportedType { name: String, kind: String },
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(", did you mean '{}'?", s),
        None => String::new(),
    }
}

impl SimplemindError {
    pub fn provider(
        provider: impl Into<String>,
        model: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        SimplemindError::Provider {
            provider: provider.into(),
            model: model.into(),
            source: source.into(),
        }
    }

    pub fn not_supported(provider: impl Into<String>, capability: impl Into<String>) -> Self {
        SimplemindError::NotSupported {
            provider: provider.into(),
            capability: capability.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SimplemindError>;
