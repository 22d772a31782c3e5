use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Signaling peer unreachable within the connect timeout
    #[error("Connection error: {0}")]
    Connection(String),

    /// Signaling stream failure, malformed message, or use after close
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Offer/answer protocol violation
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Failure reported by the transport/codec engine
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Malformed probe payload
    #[error("Probe decode error: {0}")]
    ProbeDecode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether this error aborts the session.
    ///
    /// Frame dispatch and probe failures are telemetry problems and never
    /// take the negotiation down with them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Connection(_)
                | AppError::Signaling(_)
                | AppError::Negotiation(_)
                | AppError::Transport(_)
        )
    }

    /// Short machine-friendly category name, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Connection(_) => "connection",
            AppError::Signaling(_) => "signaling",
            AppError::Negotiation(_) => "negotiation",
            AppError::Transport(_) => "transport",
            AppError::Analysis(_) => "analysis",
            AppError::ProbeDecode(_) => "probe_decode",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AppError::Connection("refused".into()).is_fatal());
        assert!(AppError::Signaling("eof".into()).is_fatal());
        assert!(AppError::Negotiation("glare".into()).is_fatal());
        assert!(AppError::Transport("ice failed".into()).is_fatal());

        assert!(!AppError::ProbeDecode("bad echo".into()).is_fatal());
        assert!(!AppError::Analysis("timeout".into()).is_fatal());
        assert!(!AppError::Config("port".into()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("gone"));
    }
}
