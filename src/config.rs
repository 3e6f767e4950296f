//! Channel configuration.
use std::time::Duration;

/// Capacity of the error queue. Errors past this many unread ones are dropped.
pub const ERROR_QUEUE_CAPACITY: usize = 100;

/// Default capacity of the outbound and inbound queues.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default time the outbound loop keeps writing queued values after `close()`.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// What to do when a caller hands a sender a value of an unregistered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Return [`ChannelError::UnregisteredType`](crate::ChannelError::UnregisteredType).
    #[default]
    Error,
    /// Panic with the same error.
    Panic,
}

/// What the inbound loop does after reporting a frame tagged with an unregistered name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTypeAction {
    /// Report the error and carry on reading. The frame's payload stays on the stream and is
    /// read next as if it were a type name, so the stream may desynchronize.
    #[default]
    Report,
    /// Report the error and discard the frame's payload value.
    Skip,
    /// Report the error and stop reading, closing the inbound queue.
    Disconnect,
}

/// Settings for a [`Channel`](crate::Channel).
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of both the outbound and the inbound queue.
    pub capacity: usize,
    /// How long queued outbound values may still be written after `close()`.
    pub linger: Duration,
    pub violation: ViolationPolicy,
    pub unknown_type: UnknownTypeAction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            linger: DEFAULT_LINGER,
            violation: ViolationPolicy::default(),
            unknown_type: UnknownTypeAction::default(),
        }
    }
}

impl Config {
    /// Sets the outbound and inbound queue capacity. Values below one are raised to one.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_violation(mut self, violation: ViolationPolicy) -> Self {
        self.violation = violation;
        self
    }

    pub fn with_unknown_type(mut self, action: UnknownTypeAction) -> Self {
        self.unknown_type = action;
        self
    }
}
