use crate::transport::Channel;
use thiserror::Error;

/// Failures of the underlying write/notify plumbing. Retryable by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Characteristic for {0} channel is not available. Is the watch connected?")]
    ChannelUnavailable(Channel),

    #[error("Watch is not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Transport backend error: {0}")]
    Backend(String),
}

/// Malformed frames on any channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unexpected frame: {0}")]
    Unexpected(String),
}

/// Handshake-level failures. The core never retries these on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Timed out waiting for the watch during authentication")]
    Timeout,

    #[error("Authentication characteristic not available yet. Wait for the connection to settle")]
    CharacteristicNotAvailable,

    #[error("Watch did not echo our random number. The secret key is probably wrong")]
    EchoMismatch,

    #[error("Watch rejected authentication with status 0x{0:02X}")]
    RejectedByWatch(u8),

    #[error("Failed to decrypt the watch challenge")]
    DecryptionFailed,

    #[error("An authentication handshake is already in progress")]
    AlreadyInProgress,

    #[error("No secret key available for this watch")]
    NoKey,

    #[error("Malformed authentication response: {0}")]
    MalformedResponse(String),

    #[error("Notification stream closed during authentication")]
    NotConnected,

    #[error("Transport error during authentication: {0}")]
    Transport(#[from] TransportError),
}

/// Lookup/get-level failures. Terminal for the fetch that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileTransferError {
    #[error("Session is not authenticated")]
    NotAuthenticated,

    #[error("Session key or randoms missing after re-authentication")]
    MissingEncryptionContext,

    #[error("Timed out waiting for the watch ({0})")]
    Timeout(&'static str),

    #[error("Watch rejected the request with status 0x{0:02X}")]
    Rejected(u8),

    #[error("Invalid response from watch: {0}")]
    InvalidResponse(String),

    #[error("CRC mismatch: expected 0x{expected:08X}, computed 0x{actual:08X}")]
    InvalidCRC { expected: u32, actual: u32 },

    #[error("Could not find a counter increment that decrypts the file")]
    InvalidDecryption,

    #[error("Watch answered for handle 0x{actual:04X}, expected 0x{expected:04X}")]
    UnexpectedHandle { expected: u16, actual: u16 },

    #[error("Failed to write request: {0}")]
    WriteFailed(TransportError),

    #[error("Watch reported an empty file")]
    EmptyFile,

    #[error("File transfer cancelled")]
    Cancelled,

    #[error("Watch disconnected during file transfer")]
    NotConnected,

    #[error("Failed to subscribe to notifications: {0}")]
    Subscribe(TransportError),

    #[error("Re-authentication before transfer failed: {0}")]
    Authentication(#[from] AuthError),
}

/// What a user can do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Remediation {
    #[strum(to_string = "wait for the connection and retry")]
    WaitAndRetry,
    #[strum(to_string = "re-pair the watch")]
    RePair,
    #[strum(to_string = "check the secret key")]
    CheckKey,
    #[strum(to_string = "retry the operation")]
    Retry,
}

impl AuthError {
    pub fn remediation(&self) -> Remediation {
        match self {
            AuthError::Timeout
            | AuthError::CharacteristicNotAvailable
            | AuthError::AlreadyInProgress
            | AuthError::NotConnected => Remediation::WaitAndRetry,
            AuthError::RejectedByWatch(_) => Remediation::RePair,
            AuthError::EchoMismatch | AuthError::DecryptionFailed | AuthError::NoKey => Remediation::CheckKey,
            AuthError::MalformedResponse(_) | AuthError::Transport(_) => Remediation::Retry,
        }
    }
}

impl FileTransferError {
    pub fn remediation(&self) -> Remediation {
        match self {
            FileTransferError::NotAuthenticated
            | FileTransferError::Timeout(_)
            | FileTransferError::Cancelled
            | FileTransferError::NotConnected => Remediation::WaitAndRetry,
            FileTransferError::Rejected(_) => Remediation::RePair,
            FileTransferError::MissingEncryptionContext | FileTransferError::InvalidDecryption => {
                Remediation::CheckKey
            }
            FileTransferError::Authentication(e) => e.remediation(),
            FileTransferError::InvalidResponse(_)
            | FileTransferError::InvalidCRC { .. }
            | FileTransferError::UnexpectedHandle { .. }
            | FileTransferError::WriteFailed(_)
            | FileTransferError::EmptyFile
            | FileTransferError::Subscribe(_) => Remediation::Retry,
        }
    }
}

impl From<FrameError> for AuthError {
    fn from(e: FrameError) -> Self {
        AuthError::MalformedResponse(e.to_string())
    }
}

impl From<FrameError> for FileTransferError {
    fn from(e: FrameError) -> Self {
        FileTransferError::InvalidResponse(e.to_string())
    }
}

/// Failures loading a [`SessionConfig`](crate::config::SessionConfig)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
