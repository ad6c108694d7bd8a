use std::fmt;
use thiserror::Error;

/// Failure classes an adapter may report. Provider-native error types never
/// cross the adapter boundary; everything is folded into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    RateLimit,
    Timeout,
    MalformedResponse,
    /// Transport failures and non-auth, non-quota HTTP errors.
    Unavailable,
}

impl ProviderErrorKind {
    /// Only credential and quota failures are worth a hop to the default provider.
    pub fn is_fallback_eligible(self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "authentication failed",
            Self::RateLimit => "quota or rate limit exceeded",
            Self::Timeout => "timed out",
            Self::MalformedResponse => "malformed response",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown tool '{0}'. Run the tools list to see valid names")]
    UnknownTool(String),

    #[error("Duplicate tool '{0}': names must be unique")]
    DuplicateTool(String),

    #[error("Unknown provider '{0}'. Run the providers list to see configured providers")]
    UnknownProvider(String),

    #[error("Unknown model '{model}' for provider {provider}. Run the models list to see valid ids")]
    UnknownModel { provider: String, model: String },

    #[error("{provider} {kind}: {message}{}", fallback_note(.fallback_error))]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
        fallback_error: Option<String>,
    },

    #[error("Tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fallback_note(fallback_error: &Option<String>) -> String {
    match fallback_error {
        Some(e) => format!(" (fallback also failed: {e})"),
        None => String::new(),
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn provider(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            kind,
            message: message.into(),
            fallback_error: None,
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::provider(provider, ProviderErrorKind::MalformedResponse, message)
    }

    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            operation,
        }
    }

    /// The provider failure class, if this is a provider error.
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Self::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Attach the failure of the fallback hop to the primary error.
    pub fn with_fallback_failure(self, fallback: &Error) -> Self {
        match self {
            Self::Provider {
                provider,
                kind,
                message,
                ..
            } => Self::Provider {
                provider,
                kind,
                message,
                fallback_error: Some(fallback.to_string()),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
