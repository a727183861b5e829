//! Firmware images and the optional embedded version signature.

use std::path::Path;

use crate::protocol::Version;
use crate::Error;

/// Tag marking the start of an embedded version record
pub const SIGNATURE_TAG: &[u8; 4] = b"FIRM";

/// Length of the tag field in the version record (tag plus NUL)
const SIGNATURE_TAG_FIELD: usize = 5;

/// Length of the firmware name field in the version record
const FIRMWARE_NAME_LEN: usize = 16;

/// Size of the embedded version record
pub const SIGNATURE_RECORD_SIZE: usize = SIGNATURE_TAG_FIELD + FIRMWARE_NAME_LEN + 3;

/// Version record embedded in a firmware image
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FirmwareVersion {
    /// Offset of the record within the image
    pub offset: usize,
    pub name: String,
    pub version: Version,
}

/// A contiguous page of the image and its target address
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Page {
    pub index: u32,
    pub address: u32,
    /// Page contents, zero padded to the full page size
    pub data: Vec<u8>,
}

/// Firmware image loaded from storage
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from a file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = std::fs::read(path.as_ref())?;

        debug!(
            "Loaded {} bytes from {}",
            data.len(),
            path.as_ref().display()
        );

        Ok(Self { data })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of pages of `page_size` bytes needed to hold the image
    pub fn page_count(&self, page_size: usize) -> usize {
        match page_size {
            0 => 0,
            p => (self.data.len() + p - 1) / p,
        }
    }

    /// Split the image into pages starting at `base`
    ///
    /// The final page is zero padded so every page spans `page_size` bytes.
    pub fn pages(&self, page_size: usize, base: u32) -> impl Iterator<Item = Page> + '_ {
        // A zero page size yields no pages rather than panicking in chunks()
        let step = page_size.max(1);
        let chunks = match page_size {
            0 => self.data[..0].chunks(step),
            _ => self.data.chunks(step),
        };

        chunks.enumerate().map(move |(i, chunk)| {
            let mut data = chunk.to_vec();
            data.resize(page_size, 0);

            Page {
                index: i as u32,
                address: base.wrapping_add((i * page_size) as u32),
                data,
            }
        })
    }

    /// Search the image for an embedded version record
    pub fn find_signature(&self) -> Option<FirmwareVersion> {
        if self.data.len() < SIGNATURE_RECORD_SIZE {
            return None;
        }

        let last = self.data.len() - SIGNATURE_RECORD_SIZE;
        let offset = (0..=last).find(|i| self.data[*i..].starts_with(SIGNATURE_TAG))?;

        let record = &self.data[offset..offset + SIGNATURE_RECORD_SIZE];
        let name = &record[SIGNATURE_TAG_FIELD..SIGNATURE_TAG_FIELD + FIRMWARE_NAME_LEN];
        let name_len = name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(FIRMWARE_NAME_LEN);
        let v = &record[SIGNATURE_TAG_FIELD + FIRMWARE_NAME_LEN..];

        let sig = FirmwareVersion {
            offset,
            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
            version: Version {
                major: v[0],
                minor: v[1],
                patch: v[2],
            },
        };

        debug!("Found firmware signature at 0x{:x}: {:?}", offset, sig);

        Some(sig)
    }
}

impl From<Vec<u8>> for FirmwareImage {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}
