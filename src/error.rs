use crate::block::BlockKind;
use thiserror::Error;

/// Result type for Tesira operations
pub type Result<T> = std::result::Result<T, TesiraError>;

/// Errors that can occur when talking to a Tesira DSP
#[derive(Error, Debug)]
pub enum TesiraError {
    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection was closed by the device
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session is not connected, the command was not queued
    #[error("Not connected")]
    NotConnected,

    /// Connect or handshake did not complete in time
    #[error("Timeout")]
    Timeout,

    /// SSH protocol failure below the login
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// The device rejected the supplied credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A device payload could not be repaired into structured data
    #[error("Could not normalize payload: {0}")]
    Normalize(String),

    /// Command verb not recognised
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Attribute code not recognised
    #[error("Unknown attribute code: {0}")]
    UnknownAttribute(String),

    /// Write attempted on a channel that does not support the capability
    #[error("{instance_tag} channel {channel} does not support {capability}")]
    UnsupportedCapability {
        instance_tag: String,
        channel: u32,
        capability: &'static str,
    },

    /// Channel index outside 1..=NumberOfChannels
    #[error("{instance_tag} has no channel {index}")]
    ChannelOutOfRange { instance_tag: String, index: u32 },

    /// No factory is registered for the block kind
    #[error("Unsupported block kind: {0:?}")]
    UnsupportedBlockKind(BlockKind),

    /// A block with this instance tag already exists
    #[error("Duplicate instance tag: {0}")]
    DuplicateInstanceTag(String),

    /// Event channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}
