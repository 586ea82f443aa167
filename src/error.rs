use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid sample: {0}")]
    InvalidSample(String),

    #[error("failed to load pipeline from {script}: {reason}")]
    PipelineLoad { script: String, reason: String },

    #[error("pipeline entry point '{name}' not found in {script}")]
    PipelineNotFound { script: String, name: String },

    #[error("entry point '{name}' in {script} is not usable as the {expected} entry point")]
    EntryPointMismatch {
        script: String,
        name: String,
        expected: &'static str,
    },

    #[error("query '{query}' failed: {message}")]
    QueryInvocation { query: String, message: String },

    #[error("scorer shutdown: {0}")]
    ScorerShutdown(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("metrics store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
