//! Error types for testrig

use thiserror::Error;

/// Result type alias using testrig Error
pub type Result<T> = std::result::Result<T, Error>;

/// testrig error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to start process '{name}': {reason}")]
    ProcessStart { name: String, reason: String },

    #[error("No running process with id {0}")]
    ProcessNotRunning(String),

    #[error("Call '{method}' timed out after {millis}ms")]
    ProcessCallTimeout { method: String, millis: u64 },

    #[error("Restart budget exhausted for '{name}' after {max_restarts} restarts")]
    RestartBudgetExceeded { name: String, max_restarts: u32 },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Process exited with code {code:?}: {stderr}")]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("Output is not valid JSON: {0}")]
    OutputParse(String),

    #[error("Could not decode tool output: {0}")]
    OutputDecode(String),

    #[error("Tool reported failure: {0}")]
    ToolReportedFailure(String),

    #[error("test exceeded maximum duration of {millis} ms")]
    TestTimeout { millis: u64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a missing test result
    pub fn test_not_found(test_id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "test".to_string(),
            id: test_id.into(),
        }
    }
}
