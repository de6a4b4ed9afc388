use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl InfraError {
    /// Transport-level failures that leave the server state untouched.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_network_errors() {
        assert!(InfraError::Network("connection refused".to_string()).is_network());
        assert!(!InfraError::Storage("lock poisoned".to_string()).is_network());
        assert!(!InfraError::Http {
            status: 503,
            body: String::new()
        }
        .is_network());
        assert!(!InfraError::Protocol("bad body".to_string()).is_network());
    }
}
