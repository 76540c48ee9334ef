use std::time::Duration;
use thiserror::Error;

use crate::envelope::Kind;

/// Business rejections. The `Display` text is what the participant sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("nickname already taken")]
    DuplicateNickname,
    #[error("room name already taken")]
    NameTaken,
    #[error("room not found")]
    RoomNotFound,
    #[error("nickname not registered")]
    NotRegistered,
    #[error("nickname must not be empty")]
    EmptyNickname,
    #[error("room name must be a single non-empty word")]
    InvalidRoomName,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected binary frame")]
    Binary,
    #[error("socket error: {0}")]
    Socket(#[from] warp::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind:?} rejected: {reason}")]
    Rejected { kind: Kind, reason: String },
    #[error("unexpected {0:?} response")]
    Unexpected(Kind),
    #[error("connection closed")]
    Closed,
}
