//! Table driven CRC-32 used to verify written pages.
//!
//! This is the reflected zlib / PNG variant (polynomial 0xEDB88320, initial
//! value and final complement of all ones), and must match the bootloader's
//! implementation bit for bit.

/// Reversed CRC-32 generator polynomial
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

/// CRC-32 engine with a precomputed lookup table
#[derive(Clone)]
pub struct Crc32 {
    table: [u32; 256],
}

impl Crc32 {
    /// Create a new engine, building the lookup table
    pub fn new() -> Self {
        Self {
            table: build_table(),
        }
    }

    /// Compute the CRC-32 of the provided bytes
    pub fn compute(&self, data: &[u8]) -> u32 {
        let crc = data.iter().fold(0xFFFF_FFFFu32, |acc, b| {
            self.table[((acc ^ *b as u32) & 0xFF) as usize] ^ (acc >> 8)
        });

        !crc
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Crc32")
            .field("polynomial", &format_args!("0x{:08x}", POLYNOMIAL))
            .finish()
    }
}

/// Build the 256 entry lookup table, one entry per byte value
fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];

    for (b, entry) in table.iter_mut().enumerate() {
        let mut remainder = b as u32;

        for _ in 0..8 {
            remainder = if remainder & 1 != 0 {
                (remainder >> 1) ^ POLYNOMIAL
            } else {
                remainder >> 1
            };
        }

        *entry = remainder;
    }

    table
}
