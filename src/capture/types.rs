use std::net::SocketAddr;

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Error types for the capture service
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The listener could not bind (port in use, bad address, permissions)
    #[error("failed to bind capture listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on a stream file
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task failed to complete
    #[error("capture task failed: {0}")]
    Task(String),
}

/// Running state reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running { local_addr: SocketAddr },
}
