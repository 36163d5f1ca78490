use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaceError {
    #[error("config error: {0}")]
    Config(String),

    #[error("preview stream failed for {arm}: {message}")]
    PreviewStream { arm: String, message: String },

    #[error("judge response could not be parsed after {attempts} attempts: {message}")]
    JudgeParse { attempts: u32, message: String },

    #[error("full stream failed for {arm}: {message}")]
    FullStream { arm: String, message: String },

    #[error("all {0} full-answer attempts failed")]
    AllFullFailed(usize),

    #[error("router persistence failed: {0}")]
    RouterPersistence(String),

    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    FeatureDim { expected: usize, actual: usize },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl RaceError {
    /// Name of the first arm implicated by this error, if any.
    pub fn arm(&self) -> Option<&str> {
        match self {
            Self::PreviewStream { arm, .. } => Some(arm),
            Self::FullStream { arm, .. } => Some(arm),
            _ => None,
        }
    }

    /// Sanitized message safe to print to a CLI user. Never leaks upstream
    /// response bodies or connection details.
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::PreviewStream { arm, .. } => format!("preview stream failed for {arm}"),
            Self::JudgeParse { .. } => "judge response could not be parsed".to_string(),
            Self::FullStream { arm, .. } => format!("full answer failed for {arm}"),
            Self::AllFullFailed(n) => format!("all {n} candidates failed to produce an answer"),
            Self::RouterPersistence(_) => "router state could not be persisted".to_string(),
            Self::FeatureDim { .. } => "internal feature dimension mismatch".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
