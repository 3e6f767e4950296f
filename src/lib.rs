//! Typed asynchronous message channels over any byte stream.
//!
//! Wraps a bidirectional stream (TCP, Unix socket, in-memory duplex, ...) so that callers send
//! and receive Rust values instead of bytes. Each value is written as a frame: its registered
//! type name, then its MessagePack encoding. The receiving end uses the name to pick the type to
//! decode into.
//!
//! To use a channel:
//! 1. Build a `Registry` naming every type the two ends exchange
//! 2. Wrap a stream with `Channel::new(stream, capacity, registry)`, or use `connect_tcp`,
//!    `connect_unix` or a `Listener`
//! 3. Send values with `channel.send(value)`, receive them with `channel.recv()`
//! 4. Watch `channel.recv_error()` for failures that happened in the background
//! 5. Call `channel.close()` when done
//!
//! Uses `tokio` for async I/O and `rmp-serde`/`rmpv` for MessagePack serialization.

mod channel;
mod config;
mod error;
mod frame;
mod registry;
mod transport;

pub use channel::*;
pub use config::*;
pub use error::*;
pub use registry::*;
pub use transport::*;
