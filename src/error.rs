use std::io;
use thiserror::Error;

/// Errors surfaced by a channel, either from an API call or asynchronously on the error queue.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Writing or serializing an outbound frame failed. The outbound loop keeps running.
    #[error("send error: {0}")]
    Send(#[source] WireError),

    /// Reading or decoding an inbound frame failed. The inbound loop keeps running.
    #[error("recv error: {0}")]
    Recv(#[source] WireError),

    /// A value of a type that was never registered was handed to a sender. This is caller
    /// misuse, not a transport failure.
    #[error("type not allowed: {type_name}")]
    UnregisteredType { type_name: &'static str },

    /// The channel has been closed and accepts no further values.
    #[error("channel closed")]
    Closed,

    /// Error establishing a transport connection.
    #[error("connect error: {source}")]
    Connect {
        #[source]
        source: io::Error,
    },

    /// I/O error outside the framing loops, e.g. binding a listener.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures at the framing layer: I/O on the stream and the MessagePack codec.
#[derive(Error, Debug)]
pub enum WireError {
    /// Error occurred during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during MessagePack serialization.
    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Error occurred during MessagePack deserialization of a payload.
    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The stream carried bytes that are not valid MessagePack. `offset` is the position of the
    /// offending header within the value being read.
    #[error("malformed value at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    /// A complete value could not be read back as a MessagePack value.
    #[error("invalid value: {0}")]
    InvalidValue(#[from] rmpv::decode::Error),

    /// The stream ended cleanly between frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream ended in the middle of a value.
    #[error("connection closed mid-frame ({buffered} bytes discarded)")]
    Truncated { buffered: usize },

    /// A well-formed value appeared where the frame layout expects something else.
    #[error("unexpected value: {0}")]
    UnexpectedValue(String),

    /// The peer tagged a frame with a name this endpoint has not registered.
    #[error("unregistered type name: {0}")]
    UnknownType(String),
}

impl WireError {
    /// Whether this error means the stream is gone and no more frames will ever arrive.
    pub fn is_closed(&self) -> bool {
        match self {
            WireError::ConnectionClosed | WireError::Truncated { .. } => true,
            WireError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Errors raised while building a [`Registry`](crate::Registry).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// The name is already bound to a type.
    #[error("type name already registered: {0}")]
    DuplicateName(String),

    /// The type is already bound under another name, so lookups by value would be ambiguous.
    #[error("type {type_name} already registered as {existing}")]
    DuplicateType {
        type_name: &'static str,
        existing: String,
    },
}

pub type Result<T> = std::result::Result<T, ChannelError>;
