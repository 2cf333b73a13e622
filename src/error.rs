use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Exploration error: {0}")]
    Exploration(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(String),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Sqlite(err.to_string())
    }
}

impl PipelineError {
    /// Whether a collaborator call that failed with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Llm(msg)
            | PipelineError::Retrieval(msg)
            | PipelineError::Sandbox(msg)
            | PipelineError::Sqlite(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("network")
                    || msg.contains("connection")
                    || msg.contains("temporar")
                    || msg.contains("rate limit")
                    || msg.contains("(429")
                    || msg.contains("(5")
                    || msg.contains("busy")
                    || msg.contains("locked")
            }
            PipelineError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::Llm("LLM API call failed: connection reset".to_string()).is_transient());
        assert!(PipelineError::Llm("LLM API error (503 Service Unavailable): busy".to_string()).is_transient());
        assert!(PipelineError::Llm("LLM API error (429 Too Many Requests)".to_string()).is_transient());
        assert!(!PipelineError::Llm("LLM API error (401 Unauthorized)".to_string()).is_transient());
        assert!(!PipelineError::Parse("Expected SELECT".to_string()).is_transient());
    }
}
