use thiserror::Error;

/// Longest path (in bytes) accepted for mount sources and targets.
pub const MAX_PATH_BYTES: usize = 1024;

/// Hard cap on a single handshake line, newline included.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Errors with a closed, testable shape. Syscall failures are reported
/// through `anyhow` context chains instead; these are the cases callers
/// (and tests) need to tell apart.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration version '{0}' is not supported")]
    UnsupportedVersion(String),

    #[error("capability name '{0}' is not recognized")]
    UnknownCapability(String),

    #[error("path '{path}' is too long ({length} bytes, limit {})", MAX_PATH_BYTES - 1)]
    PathTooLong { path: String, length: usize },

    #[error("mount entry {0} has no target")]
    MissingMountTarget(usize),

    #[error("pivot-root entry {0} has no source")]
    MissingPivotSource(usize),

    #[error("unexpected handshake message: expected '{expected}', got '{received}'")]
    UnexpectedMessage { expected: String, received: String },

    #[error("handshake message exceeds {} bytes", MAX_MESSAGE_BYTES)]
    OversizedMessage,

    #[error("peer closed the channel before completing the handshake")]
    ChannelClosed,
}
