use thiserror::Error;

/// Unified error type for the Vigil application
#[derive(Error, Debug)]
pub enum VigilError {
    // Probe errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("Egress IP unavailable: {0}")]
    EgressIpUnavailable(String),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported check method: {0}")]
    UnsupportedCheckMethod(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;

impl VigilError {
    /// Network, TLS or DNS failure reaching the tunnel or the target
    pub fn is_transport(&self) -> bool {
        matches!(self, VigilError::Transport(_) | VigilError::Timeout)
    }

    /// The target answered, but not in a way that counts as healthy
    pub fn is_protocol(&self) -> bool {
        matches!(self, VigilError::Protocol(_))
    }

    /// Malformed probe settings; the affected proxy is marked offline
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            VigilError::InvalidConfig(_) | VigilError::UnsupportedCheckMethod(_)
        )
    }
}

// Convert from reqwest errors
impl From<reqwest::Error> for VigilError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return VigilError::Timeout;
        }
        if err.is_builder() {
            return VigilError::InvalidConfig(err.to_string());
        }
        VigilError::Transport(error_chain(&err))
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for VigilError {
    fn from(err: url::ParseError) -> Self {
        VigilError::InvalidConfig(format!("invalid URL: {}", err))
    }
}

/// Flatten an error and its sources into one line.
///
/// reqwest hides the interesting part (e.g. an unexpected EOF from the tunnel)
/// a few levels down the source chain.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}
