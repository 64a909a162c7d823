//! Error handling
use std::result;
use thiserror::Error;
use tungstenite::error::Error as WsError;

/// Simple `Result` type for errors in this module
pub type Result<T, E = Error> = result::Result<T, E>;

/// Custom error type for relay operation
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol parse error")]
    ProtoParseError,
    #[error("connection error")]
    ConnError,
    #[error("client write error")]
    ConnWriteError,
    #[error("event id does not match canonical hash")]
    EventMalformedId,
    #[error("signature verification failed")]
    EventInvalidSignature,
    #[error("event created_at is outside the accepted window")]
    EventInvalidTimestamp,
    #[error("event exceeded max size ({0} bytes)")]
    EventMaxLengthError(usize),
    #[error("event tag limits exceeded")]
    EventMaxTagsError,
    #[error("subscription identifier invalid")]
    SubIdInvalidError,
    #[error("subscription count exceeds maximum")]
    SubMaxExceededError,
    #[error("database directory does not exist")]
    DatabaseDirError,
    #[error("store error: {0}")]
    StoreError(heed::Error),
    #[error("JSON parsing failed: {0}")]
    JsonParseFailed(serde_json::Error),
    #[error("hex encoding failed")]
    HexError(hex::FromHexError),
    #[error("WebSocket error: {0}")]
    WebsocketError(WsError),
    #[error("I/O error: {0}")]
    IoError(std::io::Error),
    #[error("channel closed")]
    ChannelClosed,
    #[error("negentropy error: {0}")]
    NegentropyError(&'static str),
    #[error("sync session exceeds configured event bound")]
    NegentropyCapacityError,
    #[error("unknown command")]
    CommandUnknownError,
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<heed::Error> for Error {
    fn from(h: heed::Error) -> Self {
        Error::StoreError(h)
    }
}

impl From<serde_json::Error> for Error {
    fn from(r: serde_json::Error) -> Self {
        Error::JsonParseFailed(r)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(h: hex::FromHexError) -> Self {
        Error::HexError(h)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::WebsocketError(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}
