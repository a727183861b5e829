//! Bootloader wire protocol definitions and packet codec.
//!
//! Two protocol versions exist in the field. [`ProtocolVersion::Framed`]
//! prefixes every packet with a [`Mode`] byte and splits control requests
//! ([`Command`]) from page data ([`DataChunk`]). [`ProtocolVersion::Legacy`]
//! uses a single monolithic [`LegacyPacket`] for everything.
//!
//! All multi-byte fields are little endian.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;

use crate::Error;

/// Size of the USB interrupt reports exchanged with the bootloader
pub const MAX_PACKET_SIZE: usize = 64;

/// Size of an encoded command frame (mode, opcode, param1, param2)
pub const COMMAND_FRAME_SIZE: usize = 10;

/// Size of the payload field in a data frame
pub const DATA_PAYLOAD_SIZE: usize = 61;

/// Size of an encoded data frame (mode, payload field, length)
pub const DATA_FRAME_SIZE: usize = DATA_PAYLOAD_SIZE + 2;

/// Size of a legacy packet (cmd, params, data)
pub const LEGACY_PACKET_SIZE: usize = 62;

/// Size of the data field in a legacy packet
pub const LEGACY_PAYLOAD_SIZE: usize = LEGACY_PACKET_SIZE - 2;

/// Length of the bootloader name field in [`BootInfo`]
pub const BOOT_NAME_LEN: usize = 32;

/// Size of an encoded [`BootInfo`] record
pub const BOOT_INFO_SIZE: usize = BOOT_NAME_LEN + 3 + 2 + 2 + 4;

/// Reply code for a successful operation
pub const RETURN_OK: u8 = 0x01;
/// Reply code when the device received more data than fits a page
pub const RETURN_OVERFLOW: u8 = 0x02;
/// Reply code when a page CRC did not match
pub const RETURN_CRC_MISMATCH: u8 = 0x03;

/// Bootloader request opcodes
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch bootloader name, version and flash geometry
    GetInfo = 0x01,

    /// Stage the address of the page to operate on (framed protocol only)
    SetPageAddress = 0x03,

    /// Lock the application flash against writes
    Lock = 0x04,

    /// Unlock the application flash for erase / write
    Unlock = 0x05,

    /// Erase the staged page
    ErasePage = 0x06,

    /// Begin streaming page data (framed), or carry one data chunk (legacy)
    WriteData = 0x07,

    /// Commit the buffered page data to flash
    CommitPage = 0x08,

    /// Compare a host computed CRC against the page in flash
    CheckCrc = 0x09,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let op = match v {
            0x01 => Opcode::GetInfo,
            0x03 => Opcode::SetPageAddress,
            0x04 => Opcode::Lock,
            0x05 => Opcode::Unlock,
            0x06 => Opcode::ErasePage,
            0x07 => Opcode::WriteData,
            0x08 => Opcode::CommitPage,
            0x09 => Opcode::CheckCrc,
            _ => return Err(v),
        };
        Ok(op)
    }
}

/// Frame mode discriminator (first byte of every framed packet)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Mode {
    Command = 0x01,
    Data = 0x02,
}

impl TryFrom<u8> for Mode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Mode::Command),
            0x02 => Ok(Mode::Data),
            _ => Err(v),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Command => write!(f, "COMMAND"),
            Mode::Data => write!(f, "DATA"),
        }
    }
}

/// Bootloader protocol version, selected when a session is created
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolVersion {
    /// Mode tagged command / data frames with address pre-staging
    Framed,
    /// Single fixed packet layout with implicit sizing
    Legacy,
}

impl ProtocolVersion {
    /// Largest page fragment carried by a single data packet
    pub fn max_chunk(&self) -> usize {
        match self {
            ProtocolVersion::Framed => DATA_PAYLOAD_SIZE,
            ProtocolVersion::Legacy => LEGACY_PAYLOAD_SIZE,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::Framed
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "framed" => Ok(ProtocolVersion::Framed),
            "legacy" => Ok(ProtocolVersion::Legacy),
            _ => Err(format!("unknown protocol version '{}' (framed, legacy)", s)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Framed => write!(f, "framed"),
            ProtocolVersion::Legacy => write!(f, "legacy"),
        }
    }
}

/// Control plane request or reply
///
/// Replies reuse the layout with the opcode byte carrying a reply code,
/// so the opcode is kept as a raw byte.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Command {
    pub opcode: u8,
    pub param1: u32,
    pub param2: u32,
}

impl Command {
    pub fn new(opcode: Opcode, param1: u32, param2: u32) -> Self {
        Self {
            opcode: opcode as u8,
            param1,
            param2,
        }
    }

    /// Request without parameters
    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, 0, 0)
    }
}

/// One fragment of a page being streamed to the device
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DataChunk {
    payload: [u8; DATA_PAYLOAD_SIZE],
    len: u8,
}

impl DataChunk {
    /// Build a chunk from up to [`DATA_PAYLOAD_SIZE`] bytes
    pub fn new(data: &[u8]) -> Result<Self, Error> {
        if data.len() > DATA_PAYLOAD_SIZE {
            return Err(Error::MalformedFrame {
                reason: "data chunk exceeds payload field",
                len: data.len(),
            });
        }

        let mut payload = [0u8; DATA_PAYLOAD_SIZE];
        payload[..data.len()].copy_from_slice(data);

        Ok(Self {
            payload,
            len: data.len() as u8,
        })
    }

    /// Valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for DataChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChunk")
            .field("len", &self.len)
            .field("data", &self.data())
            .finish()
    }
}

/// Unit placed on the wire by the framed protocol
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Frame {
    Command(Command),
    Data(DataChunk),
}

impl Frame {
    pub fn mode(&self) -> Mode {
        match self {
            Frame::Command(_) => Mode::Command,
            Frame::Data(_) => Mode::Data,
        }
    }

    /// Encode the frame to its wire representation
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Command(c) => encode_command(c).to_vec(),
            Frame::Data(d) => encode_data(d).to_vec(),
        }
    }
}

/// Encode a command frame
pub fn encode_command(cmd: &Command) -> [u8; COMMAND_FRAME_SIZE] {
    let mut buff = [0u8; COMMAND_FRAME_SIZE];

    buff[0] = Mode::Command as u8;
    buff[1] = cmd.opcode;
    buff[2..6].copy_from_slice(&cmd.param1.to_le_bytes());
    buff[6..10].copy_from_slice(&cmd.param2.to_le_bytes());

    buff
}

/// Encode a data frame, zero filling the unused payload field
pub fn encode_data(chunk: &DataChunk) -> [u8; DATA_FRAME_SIZE] {
    let mut buff = [0u8; DATA_FRAME_SIZE];

    buff[0] = Mode::Data as u8;
    buff[1..1 + DATA_PAYLOAD_SIZE].copy_from_slice(&chunk.payload);
    buff[DATA_FRAME_SIZE - 1] = chunk.len;

    buff
}

/// Decode a received framed packet according to its mode byte
pub fn decode_frame(buff: &[u8]) -> Result<Frame, Error> {
    let (mode, body) = match buff.split_first() {
        Some(v) => v,
        None => {
            return Err(Error::MalformedFrame {
                reason: "empty frame",
                len: 0,
            })
        }
    };

    let mode = Mode::try_from(*mode).map_err(|_| Error::MalformedFrame {
        reason: "unknown mode",
        len: buff.len(),
    })?;

    match mode {
        Mode::Command => {
            if buff.len() != COMMAND_FRAME_SIZE {
                return Err(Error::MalformedFrame {
                    reason: "command frame size",
                    len: buff.len(),
                });
            }

            Ok(Frame::Command(Command {
                opcode: body[0],
                param1: read_u32(&body[1..5]),
                param2: read_u32(&body[5..9]),
            }))
        }
        Mode::Data => {
            if buff.len() != DATA_FRAME_SIZE {
                return Err(Error::MalformedFrame {
                    reason: "data frame size",
                    len: buff.len(),
                });
            }

            let len = body[DATA_PAYLOAD_SIZE];
            if len as usize > DATA_PAYLOAD_SIZE {
                return Err(Error::MalformedFrame {
                    reason: "data length exceeds payload field",
                    len: len as usize,
                });
            }

            let mut payload = [0u8; DATA_PAYLOAD_SIZE];
            payload.copy_from_slice(&body[..DATA_PAYLOAD_SIZE]);

            Ok(Frame::Data(DataChunk { payload, len }))
        }
    }
}

/// Monolithic packet used by the legacy protocol
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LegacyPacket {
    pub cmd: u8,
    pub params: u8,
    pub data: [u8; LEGACY_PAYLOAD_SIZE],
}

impl LegacyPacket {
    /// Build a packet, copying up to [`LEGACY_PAYLOAD_SIZE`] bytes of data
    pub fn new(opcode: Opcode, params: u8, data: &[u8]) -> Result<Self, Error> {
        if data.len() > LEGACY_PAYLOAD_SIZE {
            return Err(Error::MalformedFrame {
                reason: "legacy data exceeds payload field",
                len: data.len(),
            });
        }

        let mut p = Self {
            cmd: opcode as u8,
            params,
            data: [0u8; LEGACY_PAYLOAD_SIZE],
        };
        p.data[..data.len()].copy_from_slice(data);

        Ok(p)
    }

    pub fn encode(&self) -> [u8; LEGACY_PACKET_SIZE] {
        let mut buff = [0u8; LEGACY_PACKET_SIZE];

        buff[0] = self.cmd;
        buff[1] = self.params;
        buff[2..].copy_from_slice(&self.data);

        buff
    }

    pub fn decode(buff: &[u8]) -> Result<Self, Error> {
        if buff.len() != LEGACY_PACKET_SIZE {
            return Err(Error::MalformedFrame {
                reason: "legacy packet size",
                len: buff.len(),
            });
        }

        let mut data = [0u8; LEGACY_PAYLOAD_SIZE];
        data.copy_from_slice(&buff[2..]);

        Ok(Self {
            cmd: buff[0],
            params: buff[1],
            data,
        })
    }
}

impl fmt::Debug for LegacyPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyPacket")
            .field("cmd", &format_args!("0x{:02x}", self.cmd))
            .field("params", &format_args!("0x{:02x}", self.params))
            .finish()
    }
}

/// Semantic version triple
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Bootloader information, queried once per session
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BootInfo {
    /// Raw bootloader name, NUL padded
    pub name: [u8; BOOT_NAME_LEN],
    pub version: Version,
    /// Flash size in KiB
    pub flash_size_kib: u16,
    /// Page size in bytes
    pub page_size: u16,
    /// Base address of the application region
    pub app_addr: u32,
}

impl BootInfo {
    /// Bootloader name up to the first NUL
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(BOOT_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn flash_size_bytes(&self) -> u32 {
        self.flash_size_kib as u32 * 1024
    }

    /// Total number of pages in the device flash
    pub fn total_pages(&self) -> u32 {
        match self.page_size {
            0 => 0,
            p => self.flash_size_bytes() / p as u32,
        }
    }

    /// Pages occupied by a bootloader of `bootloader_size` bytes
    pub fn reserved_pages(&self, bootloader_size: u32) -> u32 {
        match self.page_size as u32 {
            0 => 0,
            p => (bootloader_size + p - 1) / p,
        }
    }

    /// Pages available to the application
    pub fn available_pages(&self, bootloader_size: u32) -> u32 {
        self.total_pages()
            .saturating_sub(self.reserved_pages(bootloader_size))
    }

    /// Writable application range as (start, exclusive end)
    pub fn app_range(&self, bootloader_size: u32) -> (u32, u32) {
        let len = self.available_pages(bootloader_size) * self.page_size as u32;
        (self.app_addr, self.app_addr.wrapping_add(len))
    }

    /// Encode to the on-wire record
    pub fn encode(&self) -> [u8; BOOT_INFO_SIZE] {
        let mut buff = [0u8; BOOT_INFO_SIZE];

        buff[..BOOT_NAME_LEN].copy_from_slice(&self.name);
        buff[32] = self.version.major;
        buff[33] = self.version.minor;
        buff[34] = self.version.patch;
        buff[35..37].copy_from_slice(&self.flash_size_kib.to_le_bytes());
        buff[37..39].copy_from_slice(&self.page_size.to_le_bytes());
        buff[39..43].copy_from_slice(&self.app_addr.to_le_bytes());

        buff
    }
}

/// Decode a [`BootInfo`] record, which must be exactly [`BOOT_INFO_SIZE`] bytes
pub fn decode_info(buff: &[u8]) -> Result<BootInfo, Error> {
    if buff.len() != BOOT_INFO_SIZE {
        return Err(Error::MalformedFrame {
            reason: "boot info size",
            len: buff.len(),
        });
    }

    let mut name = [0u8; BOOT_NAME_LEN];
    name.copy_from_slice(&buff[..BOOT_NAME_LEN]);

    Ok(BootInfo {
        name,
        version: Version {
            major: buff[32],
            minor: buff[33],
            patch: buff[34],
        },
        flash_size_kib: u16::from_le_bytes([buff[35], buff[36]]),
        page_size: u16::from_le_bytes([buff[37], buff[38]]),
        app_addr: read_u32(&buff[39..43]),
    })
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
