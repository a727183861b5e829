//! Anastasia USB Bootloader.
//!
//! Host side library for querying and flashing devices running the
//! Anastasia bootloader. A [`Session`] translates bootloader operations
//! into packet exchanges over a [`Transport`], and a [`Flasher`] drives a
//! session through the page by page unlock / erase / write / verify / lock
//! cycle.

use std::time::Duration;

#[macro_use]
extern crate log;

#[cfg(feature = "structopt")]
extern crate structopt;

pub mod crc;
pub mod firmware;
pub mod flash;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(feature = "usb")]
pub mod usb;

pub use crc::Crc32;
pub use firmware::{FirmwareImage, FirmwareVersion, Page};
pub use flash::{FlashEvent, FlashReport, Flasher, PageReport};
pub use protocol::{BootInfo, Mode, Opcode, ProtocolVersion, Version};
pub use session::Session;
pub use transport::{Direction, Transport, TransportError, TransportErrorKind};

/// Bootloader error type
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error {
    /// Transport level failure, passed through from the [`Transport`]
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Packet could not be decoded
    #[error("malformed frame: {reason} ({len} bytes)")]
    MalformedFrame { reason: &'static str, len: usize },

    /// Reply mode did not match the request
    #[error("expected {expected} reply, received {found}")]
    UnexpectedMode { expected: Mode, found: Mode },

    /// Device replied with something other than OK
    #[error("device rejected {opcode:?} (reply code 0x{code:02x})")]
    DeviceRejected { opcode: Opcode, code: u8 },

    /// Image does not fit the application region
    #[error("image requires {pages} pages, only {available} available")]
    ImageTooLarge { pages: u32, available: u32 },

    /// Bootloader reported unusable flash geometry
    #[error("invalid boot info: {0}")]
    InvalidBootInfo(&'static str),

    /// Legacy erase requested without a staged page address
    #[error("no page address staged")]
    AddressNotStaged,

    /// No matching USB device
    #[error("no device found matching {vid:04x}:{pid:04x}")]
    DeviceNotFound { vid: u16, pid: u16 },

    /// Device found but could not be opened
    #[error("permission denied opening device")]
    PermissionDenied,

    /// Interface setup failed
    #[error("failed to {action}: {kind}")]
    Interface {
        action: &'static str,
        kind: TransportErrorKind,
    },

    /// Firmware image signature not present
    #[error("firmware signature not found")]
    SignatureNotFound,

    #[error("io error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl Error {
    /// Whether the error came from the link rather than the bootloader
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.kind())
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout for each half of a bootloader exchange
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "200"))]
    pub timeout_ms: u64,

    /// Bootloader protocol version (framed, legacy)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "framed"))]
    pub protocol: ProtocolVersion,

    /// Flash reserved for the bootloader, in bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10240"))]
    pub bootloader_size: u32,
}

impl Options {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout_ms: 200,
            protocol: ProtocolVersion::Framed,
            bootloader_size: 10240,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let o = Options::default();
        assert_eq!(o.timeout(), Duration::from_millis(200));
        assert_eq!(o.protocol, ProtocolVersion::Framed);
    }

    #[cfg(feature = "structopt")]
    #[test]
    fn test_options_flags() {
        use structopt::StructOpt;

        let o = Options::from_iter(&[
            "anastasia-loader",
            "--timeout-ms",
            "500",
            "--protocol",
            "legacy",
        ]);

        assert_eq!(o.timeout(), Duration::from_millis(500));
        assert_eq!(o.protocol, ProtocolVersion::Legacy);
        assert_eq!(o.bootloader_size, 10240);
    }
}
