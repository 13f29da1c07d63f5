use thiserror::Error;

pub type Result<T> = std::result::Result<T, P2PError>;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Peer unreachable: {0}")]
    UnreachablePeer(String),

    #[error("Lookup exhausted: {0}")]
    LookupExhausted(String),

    #[error("Transfer integrity failure: chunk {seq} of {path} failed verification twice")]
    TransferIntegrityFailure { path: String, seq: u64 },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Download incomplete: {0}")]
    IncompleteDownload(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl P2PError {
    /// Errors after which a pooled connection can no longer be trusted.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            P2PError::IoError(_)
                | P2PError::ConnectionClosed
                | P2PError::ConnectionFailed(_)
                | P2PError::NetworkError(_)
        )
    }
}

impl From<std::io::Error> for P2PError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => P2PError::ConnectionClosed,
            _ => P2PError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for P2PError {
    fn from(err: serde_json::Error) -> Self {
        P2PError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_connection_closed() {
        let err: P2PError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, P2PError::ConnectionClosed));
        assert!(err.is_connection_level());
    }

    #[test]
    fn test_protocol_errors_are_not_connection_level() {
        assert!(!P2PError::FileNotFound("a.txt".to_string()).is_connection_level());
        assert!(!P2PError::ShuttingDown.is_connection_level());
    }
}
