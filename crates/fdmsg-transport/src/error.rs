/// Errors that can occur on the socket endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create a socket pair.
    #[error("failed to create socket pair: {0}")]
    Socketpair(std::io::Error),

    /// `sendmsg` failed.
    #[error("sendmsg failed: {0}")]
    Send(std::io::Error),

    /// `recvmsg` failed.
    #[error("recvmsg failed: {0}")]
    Recv(std::io::Error),

    /// An I/O error occurred on the endpoint.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// More than one control message arrived with a single receive.
    #[error("expected at most one control message, got {0}")]
    UnexpectedControlMessages(usize),

    /// A control message other than `SCM_RIGHTS` arrived.
    #[error("unexpected control message (level {level}, type {kind})")]
    UnexpectedControl { level: i32, kind: i32 },

    /// A single `SCM_RIGHTS` control message carried more than one descriptor.
    #[error("expected exactly one descriptor, got {0}")]
    UnexpectedDescriptors(usize),

    /// The kernel truncated ancillary data (`MSG_CTRUNC`).
    #[error("ancillary data truncated")]
    ControlTruncated,
}

pub type Result<T> = std::result::Result<T, TransportError>;
