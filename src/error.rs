use std::net::SocketAddr;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("short datagram: {0} bytes")]
    ShortDatagram(usize),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid IE list: {0}")]
    InvalidIeList(String),

    #[error("unrepresentable subclass value: {0}")]
    Subclass(u32),

    #[error("transport error: {0}: {1}")]
    TransportError(String, SocketAddr),

    #[error("transaction error: {0}: call {1}")]
    TransactionError(String, u16),

    #[error("call numbers exhausted")]
    CallNoExhausted,

    #[error("engine error: {0}")]
    EngineError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}
