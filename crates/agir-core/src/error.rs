use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgirError {
    // Definition errors
    #[error("Invalid process definition: {0}")]
    Validation(String),

    // Resolution errors
    #[error("No model configured for node '{node}' (role '{role}')")]
    Configuration { node: String, role: String },

    #[error("No provider for node '{node}' (model '{model}'): {message}")]
    ProviderUnavailable {
        node: String,
        model: String,
        message: String,
    },

    // Execution errors
    #[error("Node '{node}' failed: {message}")]
    Execution { node: String, message: String },

    #[error("Step budget of {limit} exhausted at node '{node}'")]
    LoopDetected { node: String, limit: usize },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("LLM request timed out after {secs}s")]
    Timeout { secs: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Coarse classification used for CLI diagnostics and run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Configuration,
    Execution,
    LoopDetected,
    Persistence,
    Other,
}

impl AgirError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgirError::Validation(_) | AgirError::Yaml(_) => ErrorKind::Validation,
            AgirError::Configuration { .. }
            | AgirError::ProviderUnavailable { .. }
            | AgirError::UnsupportedProvider(_)
            | AgirError::Config(_)
            | AgirError::ConfigNotFound(_) => ErrorKind::Configuration,
            AgirError::Execution { .. } => ErrorKind::Execution,
            AgirError::LoopDetected { .. } => ErrorKind::LoopDetected,
            AgirError::Database(_) => ErrorKind::Persistence,
            _ => ErrorKind::Other,
        }
    }

    /// Wrap a provider failure with the node it happened on.
    pub fn execution(node: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        AgirError::Execution {
            node: node.into(),
            message: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = AgirError::Configuration {
            node: "Triage".into(),
            role: "nurse".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("Triage"));
        assert!(err.to_string().contains("nurse"));

        let err = AgirError::execution("Intro", AgirError::LlmRequest("HTTP 500".into()));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("HTTP 500"));

        assert_eq!(
            AgirError::Database("locked".into()).kind(),
            ErrorKind::Persistence
        );
    }
}
