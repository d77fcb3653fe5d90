use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    // Configuration
    #[error("invalid instance name {0:?}")]
    InvalidName(String),

    #[error("not found flags")]
    MissingFlags,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("failed to read binary {path}: {source}")]
    ReadBinary {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("abs path {path}: {source}")]
    PathResolution {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("checksum fail got {actual}")]
    ChecksumMismatch { actual: String },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("instance {0} declared more than once")]
    DuplicateInstance(String),

    // Launch
    #[error("failed to launch {name}: {source}")]
    Launch {
        name: String,
        source: std::io::Error,
    },

    #[error("instance {0} is already started")]
    AlreadyStarted(String),

    #[error("instance {0} is closed")]
    Closed(String),

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    // Readiness and connection
    #[error("{name} not found {}", socket.display())]
    SocketNotFound { name: String, socket: PathBuf },

    #[error("failed to connect to {}: {source}", socket.display())]
    Connect {
        socket: PathBuf,
        source: std::io::Error,
    },

    // Dispatch
    #[error("extension socket i/o: {0}")]
    Transport(#[from] std::io::Error),

    #[error("extension call timed out after {0}s")]
    Timeout(u64),

    #[error("extension protocol: {0}")]
    Protocol(String),

    #[error("query failed ({code}): {message}")]
    QueryFailed { code: i32, message: String },

    // Registry
    #[error("not found osquery client")]
    NoDefault,
}

impl BrokerError {
    /// Whether the error means the client connection itself can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
