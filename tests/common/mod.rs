//! In-memory bootloader speaking both protocol versions.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::time::Duration;

use anastasia_loader::protocol::{
    decode_frame, encode_command, encode_data, Command, DataChunk, Frame, LegacyPacket,
    BOOT_INFO_SIZE, BOOT_NAME_LEN, RETURN_CRC_MISMATCH, RETURN_OK, RETURN_OVERFLOW,
};
use anastasia_loader::{
    BootInfo, Crc32, Direction, Opcode, ProtocolVersion, Transport, TransportError,
    TransportErrorKind, Version,
};

/// Operations observed by the device, in order
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Op {
    GetInfo,
    Unlock,
    Lock,
    SetAddress(u32),
    Erase(u32),
    BeginWrite,
    Data(Vec<u8>),
    Commit(u32),
    CheckCrc { addr: u32, crc: u32 },
}

impl Op {
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::GetInfo => Opcode::GetInfo,
            Op::Unlock => Opcode::Unlock,
            Op::Lock => Opcode::Lock,
            Op::SetAddress(_) => Opcode::SetPageAddress,
            Op::Erase(_) => Opcode::ErasePage,
            Op::BeginWrite | Op::Data(_) => Opcode::WriteData,
            Op::Commit(_) => Opcode::CommitPage,
            Op::CheckCrc { .. } => Opcode::CheckCrc,
        }
    }
}

pub struct MockBootloader {
    pub protocol: ProtocolVersion,
    pub info: BootInfo,
    pub ops: Vec<Op>,
    pub flash: BTreeMap<u32, Vec<u8>>,
    pub unlocked: bool,

    /// Reply to the nth (0 based) request with each opcode using a reject code
    pub reject: Vec<(Opcode, usize)>,
    /// Time out sending the nth (0 based) data packet
    pub timeout_on_data: Option<usize>,
    /// Page addresses whose flash contents get corrupted on commit
    pub corrupt: Vec<u32>,

    staged: Option<u32>,
    buffer: Vec<u8>,
    data_sent: usize,
    reply: Option<Vec<u8>>,
}

pub const APP_ADDR: u32 = 0x0800_4000;

pub fn boot_info(flash_size_kib: u16, page_size: u16) -> BootInfo {
    let mut name = [0u8; BOOT_NAME_LEN];
    name[..9].copy_from_slice(b"Anastasia");

    BootInfo {
        name,
        version: Version {
            major: 1,
            minor: 0,
            patch: 2,
        },
        flash_size_kib,
        page_size,
        app_addr: APP_ADDR,
    }
}

impl MockBootloader {
    pub fn new(protocol: ProtocolVersion, info: BootInfo) -> Self {
        Self {
            protocol,
            info,
            ops: vec![],
            flash: BTreeMap::new(),
            unlocked: false,
            reject: vec![],
            timeout_on_data: None,
            corrupt: vec![],
            staged: None,
            buffer: vec![],
            data_sent: 0,
            reply: None,
        }
    }

    /// Operations excluding page data
    pub fn control_ops(&self) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|o| !matches!(o, Op::Data(_)))
            .cloned()
            .collect()
    }

    /// Data payloads in the order they were received
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.ops
            .iter()
            .filter_map(|o| match o {
                Op::Data(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, opcode: Opcode) -> usize {
        self.ops.iter().filter(|o| o.opcode() == opcode).count()
    }

    /// Apply an operation, returning the reply code
    fn apply(&mut self, op: Op) -> u8 {
        let opcode = op.opcode();
        let nth = self.count(opcode);
        self.ops.push(op.clone());

        if self.reject.contains(&(opcode, nth)) {
            return RETURN_OVERFLOW;
        }

        match op {
            Op::Unlock => self.unlocked = true,
            Op::Lock => self.unlocked = false,
            Op::SetAddress(a) => self.staged = Some(a),
            Op::Erase(a) => {
                self.flash
                    .insert(a, vec![0xFF; self.info.page_size as usize]);
            }
            Op::BeginWrite => self.buffer.clear(),
            Op::Data(d) => {
                self.buffer.extend_from_slice(&d);
                if self.buffer.len() > self.info.page_size as usize {
                    return RETURN_OVERFLOW;
                }
            }
            Op::Commit(a) => {
                assert!(self.unlocked, "commit while locked");
                let mut page = std::mem::take(&mut self.buffer);
                page.resize(self.info.page_size as usize, 0xFF);
                if self.corrupt.contains(&a) {
                    page[0] ^= 0x01;
                }
                self.flash.insert(a, page);
            }
            Op::CheckCrc { addr, crc } => {
                let actual = self
                    .flash
                    .get(&addr)
                    .map(|p| Crc32::new().compute(p))
                    .unwrap_or(0);
                if actual != crc {
                    return RETURN_CRC_MISMATCH;
                }
            }
            Op::GetInfo => (),
        }

        RETURN_OK
    }

    fn handle_framed(&mut self, data: &[u8]) -> Vec<u8> {
        let frame = decode_frame(data).expect("host sent malformed frame");

        let op = match frame {
            Frame::Data(d) => Op::Data(d.data().to_vec()),
            Frame::Command(c) => match Opcode::try_from(c.opcode).expect("unknown opcode") {
                Opcode::GetInfo => {
                    self.ops.push(Op::GetInfo);
                    let d = DataChunk::new(&self.info.encode()).unwrap();
                    return encode_data(&d).to_vec();
                }
                Opcode::SetPageAddress => Op::SetAddress(c.param1),
                Opcode::Lock => Op::Lock,
                Opcode::Unlock => Op::Unlock,
                Opcode::ErasePage => Op::Erase(self.staged.expect("erase without address")),
                Opcode::WriteData => Op::BeginWrite,
                Opcode::CommitPage => Op::Commit(self.staged.expect("commit without address")),
                Opcode::CheckCrc => Op::CheckCrc {
                    crc: c.param1,
                    addr: c.param2,
                },
            },
        };

        let code = self.apply(op);
        encode_command(&Command {
            opcode: code,
            param1: 0,
            param2: 0,
        })
        .to_vec()
    }

    fn handle_legacy(&mut self, data: &[u8]) -> Vec<u8> {
        let p = LegacyPacket::decode(data).expect("host sent malformed packet");
        let le = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);

        let mut reply = LegacyPacket {
            cmd: p.cmd,
            params: RETURN_OK,
            data: [0u8; 60],
        };

        let op = match p.cmd {
            0x01 => {
                self.ops.push(Op::GetInfo);
                reply.data[..BOOT_INFO_SIZE].copy_from_slice(&self.info.encode());
                return reply.encode().to_vec();
            }
            0x04 => Op::Lock,
            0x05 => Op::Unlock,
            0x06 => {
                let a = le(&p.data[..4]);
                self.staged = Some(a);
                self.buffer.clear();
                Op::Erase(a)
            }
            0x07 => Op::Data(p.data[..p.params as usize].to_vec()),
            0x08 => Op::Commit(self.staged.expect("commit without address")),
            0x09 => Op::CheckCrc {
                crc: le(&p.data[..4]),
                addr: le(&p.data[4..8]),
            },
            o => panic!("unknown legacy command 0x{:02x}", o),
        };

        reply.params = self.apply(op);
        reply.encode().to_vec()
    }

    fn is_data(&self, data: &[u8]) -> bool {
        match self.protocol {
            ProtocolVersion::Framed => data.first() == Some(&0x02),
            ProtocolVersion::Legacy => data.first() == Some(&(Opcode::WriteData as u8)),
        }
    }
}

impl Transport for MockBootloader {
    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        assert!(self.reply.is_none(), "request sent before reply was read");

        if self.is_data(data) {
            let n = self.data_sent;
            self.data_sent += 1;

            if self.timeout_on_data == Some(n) {
                return Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    Direction::Send,
                ));
            }
        }

        let reply = match self.protocol {
            ProtocolVersion::Framed => self.handle_framed(data),
            ProtocolVersion::Legacy => self.handle_legacy(data),
        };
        self.reply = Some(reply);

        Ok(data.len())
    }

    fn receive(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.reply.take() {
            Some(r) => {
                assert!(r.len() <= max_len);
                Ok(r)
            }
            None => Err(TransportError::new(
                TransportErrorKind::Timeout,
                Direction::Receive,
            )),
        }
    }
}
