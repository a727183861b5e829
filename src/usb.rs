use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::transport::{Direction, Transport, TransportError, TransportErrorKind};
use crate::{Error, Options, Session};

/// Default bootloader USB vendor ID
pub const USB_VID: u16 = 0x0483;
/// Default bootloader USB product ID
pub const USB_PID: u16 = 0x5710;

/// Interrupt OUT endpoint
pub const EP_OUT: u8 = 0x01;
/// Interrupt IN endpoint
pub const EP_IN: u8 = 0x81;

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct UsbOptions {
    /// USB vendor ID of the bootloader (hex)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0483", parse(try_from_str = parse_hex)))]
    pub vid: u16,

    /// USB product ID of the bootloader (hex)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5710", parse(try_from_str = parse_hex)))]
    pub pid: u16,

    /// USB interface to claim
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub interface: u8,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            vid: USB_VID,
            pid: USB_PID,
            interface: 0,
        }
    }
}

#[allow(dead_code)]
fn parse_hex(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// Interrupt endpoint transport over a claimed USB interface
pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    reattach: bool,
}

impl UsbTransport {
    /// Find, open and claim the bootloader interface
    pub fn open(opts: &UsbOptions) -> Result<Self, Error> {
        let devices = rusb::devices().map_err(|e| Error::Interface {
            action: "list devices",
            kind: error_kind(e),
        })?;

        let device = devices
            .iter()
            .find(|d| match d.device_descriptor() {
                Ok(desc) => desc.vendor_id() == opts.vid && desc.product_id() == opts.pid,
                Err(_) => false,
            })
            .ok_or(Error::DeviceNotFound {
                vid: opts.vid,
                pid: opts.pid,
            })?;

        info!(
            "Opening device {:04x}:{:04x} at bus {} address {}",
            opts.vid,
            opts.pid,
            device.bus_number(),
            device.address()
        );

        let mut handle = device.open().map_err(|e| match e {
            rusb::Error::Access => Error::PermissionDenied,
            e => Error::Interface {
                action: "open device",
                kind: error_kind(e),
            },
        })?;

        // Kernel driver queries are unsupported on some platforms
        let reattach = match handle.kernel_driver_active(opts.interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", opts.interface);
                handle
                    .detach_kernel_driver(opts.interface)
                    .map_err(|e| Error::Interface {
                        action: "detach kernel driver",
                        kind: error_kind(e),
                    })?;
                true
            }
            Ok(false) | Err(rusb::Error::NotSupported) => false,
            Err(e) => {
                return Err(Error::Interface {
                    action: "query kernel driver",
                    kind: error_kind(e),
                })
            }
        };

        handle
            .claim_interface(opts.interface)
            .map_err(|e| Error::Interface {
                action: "claim interface",
                kind: error_kind(e),
            })?;

        debug!("Claimed interface {}", opts.interface);

        Ok(Self {
            handle,
            interface: opts.interface,
            reattach,
        })
    }
}

impl Transport for UsbTransport {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.handle
            .write_interrupt(EP_OUT, data, timeout)
            .map_err(|e| TransportError::new(error_kind(e), Direction::Send))
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buff = vec![0u8; max_len];

        let n = self
            .handle
            .read_interrupt(EP_IN, &mut buff, timeout)
            .map_err(|e| TransportError::new(error_kind(e), Direction::Receive))?;

        buff.truncate(n);

        Ok(buff)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }

        if self.reattach {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                debug!("Failed to reattach kernel driver: {}", e);
            }
        }
    }
}

impl Session<UsbTransport> {
    /// Create a new USB bootloader session
    pub fn usb(usb: &UsbOptions, options: Options) -> Result<Self, Error> {
        // Open and claim device
        let port = UsbTransport::open(usb)?;

        // Return instance
        Ok(Self::new(port, options))
    }
}

/// Map a libusb error onto a transport failure category
pub fn error_kind(e: rusb::Error) -> TransportErrorKind {
    match e {
        rusb::Error::Io => TransportErrorKind::Io,
        rusb::Error::InvalidParam => TransportErrorKind::InvalidParameter,
        rusb::Error::Access => TransportErrorKind::AccessDenied,
        rusb::Error::Busy => TransportErrorKind::Busy,
        rusb::Error::Interrupted => TransportErrorKind::Interrupted,
        rusb::Error::NoMem => TransportErrorKind::NoMemory,
        rusb::Error::NotSupported => TransportErrorKind::Unsupported,
        rusb::Error::Timeout => TransportErrorKind::Timeout,
        rusb::Error::Pipe => TransportErrorKind::Pipe,
        rusb::Error::Overflow => TransportErrorKind::Overflow,
        rusb::Error::NoDevice => TransportErrorKind::DeviceGone,
        _ => TransportErrorKind::Unresolved,
    }
}
