use thiserror::Error;

/// Every way a routed command can fail, as surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("No documents connected. Open a document with the bridge add-in loaded.")]
    NoConnections,
    #[error("Document not found: {0}. List connected documents with GET /connections.")]
    NotFound(String),
    #[error("Document connected but not ready: {0}")]
    NotReady(String),
    #[error(
        "Multiple documents connected. Specify documentId. Available: {}",
        .0.join(", ")
    )]
    Ambiguous(Vec<String>),
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("{0}")]
    CommandFailed(String),
    #[error("Document session disconnected")]
    Disconnected,
    /// The command never left the bridge: its frame could not be built.
    #[error("Command could not be sent: {0}")]
    InvalidCommand(String),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::NoConnections => "no_connections",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::NotReady(_) => "not_ready",
            BridgeError::Ambiguous(_) => "ambiguous_target",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::CommandFailed(_) => "command_failed",
            BridgeError::Disconnected => "disconnected",
            BridgeError::InvalidCommand(_) => "invalid_command",
        }
    }
}
