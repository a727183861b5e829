//! Byte transport used to exchange packets with the bootloader.

use core::fmt;
use std::time::Duration;

/// Blocking packet transport to a claimed bootloader interface
///
/// Every [`Transport::send`] is followed by exactly one
/// [`Transport::receive`] before the next request is issued.
pub trait Transport {
    /// Send a packet, returning the number of bytes written
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Receive a single packet of at most `max_len` bytes
    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).send(data, timeout)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).receive(max_len, timeout)
    }
}

/// Transport failure categories
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransportErrorKind {
    Io,
    InvalidParameter,
    AccessDenied,
    Busy,
    Interrupted,
    NoMemory,
    Unsupported,
    Timeout,
    Pipe,
    Overflow,
    DeviceGone,
    Unresolved,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransportErrorKind::Io => "input/output error",
            TransportErrorKind::InvalidParameter => "invalid parameter",
            TransportErrorKind::AccessDenied => "access denied (insufficient permissions)",
            TransportErrorKind::Busy => "resource busy",
            TransportErrorKind::Interrupted => "system call interrupted",
            TransportErrorKind::NoMemory => "insufficient memory",
            TransportErrorKind::Unsupported => "operation not supported on this platform",
            TransportErrorKind::Timeout => "transfer timed out",
            TransportErrorKind::Pipe => "endpoint halted",
            TransportErrorKind::Overflow => "device offered more data",
            TransportErrorKind::DeviceGone => "device has been disconnected",
            TransportErrorKind::Unresolved => "unresolved error",
        };
        f.write_str(msg)
    }
}

/// Transfer direction a failure occurred on
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    Send,
    Receive,
}

/// Failure raised by a [`Transport`]
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
#[error("{direction:?} failed: {kind}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub direction: Direction,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, direction: Direction) -> Self {
        Self { kind, direction }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }
}
