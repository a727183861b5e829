//! Bootloader session, translating operations into packet exchanges.
//!
//! A session does not track where in the page write sequence it is;
//! operations are issued in whatever order the caller requests. The
//! [`Flasher`](crate::Flasher) is responsible for ordering.

use crate::protocol::{
    decode_frame, decode_info, encode_command, encode_data, BootInfo, Command, DataChunk, Frame,
    LegacyPacket, Mode, Opcode, ProtocolVersion, BOOT_INFO_SIZE, MAX_PACKET_SIZE,
    RETURN_CRC_MISMATCH, RETURN_OK,
};
use crate::transport::{Direction, Transport, TransportError, TransportErrorKind};
use crate::{Error, Options};

/// Bootloader session over an exclusively owned transport
pub struct Session<T> {
    port: T,
    options: Options,
    /// Page address staged for the legacy protocol, which has no
    /// set-page-address request and carries the address in the erase packet
    staged_addr: Option<u32>,
}

impl<T> Session<T>
where
    T: Transport,
{
    /// Create a new session using the protocol version from `options`
    pub fn new(port: T, options: Options) -> Self {
        Self {
            port,
            options,
            staged_addr: None,
        }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.options.protocol
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the underlying transport
    pub fn into_inner(self) -> T {
        self.port
    }

    /// Fetch bootloader information
    pub fn get_info(&mut self) -> Result<BootInfo, Error> {
        debug!("Requesting boot info");

        let info = match self.protocol() {
            ProtocolVersion::Framed => {
                let req = encode_command(&Command::bare(Opcode::GetInfo));

                match self.exchange_frame(&req)? {
                    Frame::Data(d) => decode_info(d.data())?,
                    Frame::Command(_) => {
                        error!("Boot info answered with a command frame");
                        return Err(Error::UnexpectedMode {
                            expected: Mode::Data,
                            found: Mode::Command,
                        });
                    }
                }
            }
            ProtocolVersion::Legacy => {
                let reply = self.exchange_legacy(LegacyPacket::new(Opcode::GetInfo, 0, &[])?)?;
                check_ok(Opcode::GetInfo, reply.params)?;
                decode_info(&reply.data[..BOOT_INFO_SIZE])?
            }
        };

        debug!("Boot info: {:?}", info);

        Ok(info)
    }

    /// Unlock the application flash
    pub fn unlock(&mut self) -> Result<(), Error> {
        debug!("Unlocking flash");
        self.control(Opcode::Unlock, 0, 0)
    }

    /// Lock the application flash
    pub fn lock(&mut self) -> Result<(), Error> {
        debug!("Locking flash");
        self.control(Opcode::Lock, 0, 0)
    }

    /// Stage the address of the page to erase / write
    pub fn set_page_address(&mut self, addr: u32) -> Result<(), Error> {
        debug!("Setting page address 0x{:08x}", addr);

        match self.protocol() {
            ProtocolVersion::Framed => self.control(Opcode::SetPageAddress, addr, 0),
            ProtocolVersion::Legacy => {
                self.staged_addr = Some(addr);
                Ok(())
            }
        }
    }

    /// Erase the staged page
    pub fn erase_page(&mut self) -> Result<(), Error> {
        debug!("Erasing page");

        match self.protocol() {
            ProtocolVersion::Framed => self.control(Opcode::ErasePage, 0, 0),
            ProtocolVersion::Legacy => {
                let addr = self.staged_addr.ok_or(Error::AddressNotStaged)?;
                self.legacy_control(Opcode::ErasePage, 0, &addr.to_le_bytes())
            }
        }
    }

    /// Prepare the device to receive page data
    pub fn begin_data_write(&mut self) -> Result<(), Error> {
        match self.protocol() {
            ProtocolVersion::Framed => {
                debug!("Starting data write");
                self.control(Opcode::WriteData, 0, 0)
            }
            // Legacy data packets are self describing
            ProtocolVersion::Legacy => Ok(()),
        }
    }

    /// Send a single chunk of page data, at most [`ProtocolVersion::max_chunk`] bytes
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), Error> {
        trace!("Sending {} data bytes", data.len());

        match self.protocol() {
            ProtocolVersion::Framed => {
                let req = encode_data(&DataChunk::new(data)?);
                let reply = self.exchange_command(&req)?;
                check_ok(Opcode::WriteData, reply.opcode)
            }
            ProtocolVersion::Legacy => {
                self.legacy_control(Opcode::WriteData, data.len() as u8, data)
            }
        }
    }

    /// Stream a page buffer in order, returning the number of chunks sent
    pub fn send_page(&mut self, page: &[u8]) -> Result<usize, Error> {
        let max = self.protocol().max_chunk();
        let mut count = 0;

        for chunk in page.chunks(max) {
            self.send_data(chunk)?;
            count += 1;
        }

        debug!("Sent {} bytes in {} chunks", page.len(), count);

        Ok(count)
    }

    /// Commit buffered page data to flash
    pub fn commit_page(&mut self) -> Result<(), Error> {
        debug!("Committing page");

        match self.protocol() {
            ProtocolVersion::Framed => self.control(Opcode::CommitPage, 0, 0),
            ProtocolVersion::Legacy => self.legacy_control(Opcode::CommitPage, 0, &[]),
        }
    }

    /// Check the CRC of the page at `addr`
    ///
    /// Returns `Ok(false)` on a CRC mismatch, which is not an error.
    pub fn check_crc(&mut self, addr: u32, crc: u32) -> Result<bool, Error> {
        debug!("Checking CRC 0x{:08x} for page 0x{:08x}", crc, addr);

        let code = match self.protocol() {
            ProtocolVersion::Framed => {
                let req = encode_command(&Command::new(Opcode::CheckCrc, crc, addr));
                self.exchange_command(&req)?.opcode
            }
            ProtocolVersion::Legacy => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&crc.to_le_bytes());
                data[4..].copy_from_slice(&addr.to_le_bytes());

                let p = LegacyPacket::new(Opcode::CheckCrc, 0, &data)?;
                self.exchange_legacy(p)?.params
            }
        };

        match code {
            RETURN_OK => Ok(true),
            RETURN_CRC_MISMATCH => Ok(false),
            _ => Err(Error::DeviceRejected {
                opcode: Opcode::CheckCrc,
                code,
            }),
        }
    }

    /// Issue a control request that must be answered with OK
    fn control(&mut self, opcode: Opcode, param1: u32, param2: u32) -> Result<(), Error> {
        match self.protocol() {
            ProtocolVersion::Framed => {
                let req = encode_command(&Command::new(opcode, param1, param2));
                let reply = self.exchange_command(&req)?;
                check_ok(opcode, reply.opcode)
            }
            ProtocolVersion::Legacy => self.legacy_control(opcode, 0, &[]),
        }
    }

    fn legacy_control(&mut self, opcode: Opcode, params: u8, data: &[u8]) -> Result<(), Error> {
        let reply = self.exchange_legacy(LegacyPacket::new(opcode, params, data)?)?;
        check_ok(opcode, reply.params)
    }

    /// Exchange a framed request expecting a command reply
    fn exchange_command(&mut self, req: &[u8]) -> Result<Command, Error> {
        match self.exchange_frame(req)? {
            Frame::Command(c) => Ok(c),
            Frame::Data(_) => {
                error!("Expected command reply, received data frame");
                Err(Error::UnexpectedMode {
                    expected: Mode::Command,
                    found: Mode::Data,
                })
            }
        }
    }

    fn exchange_frame(&mut self, req: &[u8]) -> Result<Frame, Error> {
        let reply = self.exchange(req)?;
        decode_frame(&reply)
    }

    fn exchange_legacy(&mut self, packet: LegacyPacket) -> Result<LegacyPacket, Error> {
        let reply = self.exchange(&packet.encode())?;
        LegacyPacket::decode(&reply)
    }

    /// Send a request and await exactly one reply
    fn exchange(&mut self, req: &[u8]) -> Result<Vec<u8>, Error> {
        let timeout = self.options.timeout();

        trace!("TX: {:02x?}", req);

        match self.port.send(req, timeout) {
            Ok(n) if n == req.len() => (),
            Ok(n) => {
                error!("Short write: sent {} of {} bytes", n, req.len());
                return Err(TransportError::new(TransportErrorKind::Io, Direction::Send).into());
            }
            Err(e) => {
                error!("Send failed: {}", e);
                return Err(e.into());
            }
        }

        let reply = match self.port.receive(MAX_PACKET_SIZE, timeout) {
            Ok(r) => r,
            Err(e) => {
                error!("Receive failed: {}", e);
                return Err(e.into());
            }
        };

        trace!("RX: {:02x?}", reply);

        Ok(reply)
    }
}

fn check_ok(opcode: Opcode, code: u8) -> Result<(), Error> {
    match code {
        RETURN_OK => Ok(()),
        _ => {
            debug!("{:?} rejected with code 0x{:02x}", opcode, code);
            Err(Error::DeviceRejected { opcode, code })
        }
    }
}
