//! Checksums used by ZMODEM headers and data sub-packets.
//!
//! CRC16 is reflected and table-driven with the table built at compile time;
//! CRC32 is the IEEE CRC from `crc32fast`. Callers feed the unescaped
//! logical bytes, never wire bytes.

const CRC16_POLY: u16 = 0x8408;

const CRC16_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Incremental CRC16 (reflected CCITT, initial value 0).
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 >> 8) ^ CRC16_TABLE[((self.0 ^ b as u16) & 0xFF) as usize];
        }
    }

    pub fn finish(&self) -> u16 {
        self.0
    }
}

/// Incremental CRC32 (IEEE 802.3).
#[derive(Debug, Clone, Default)]
pub struct Crc32(crc32fast::Hasher);

impl Crc32 {
    pub fn new() -> Self {
        Self(crc32fast::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(&self) -> u32 {
        self.0.clone().finalize()
    }
}

pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(bytes);
    crc.finish()
}

pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Width of the checksum trailing a header or sub-packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcWidth {
    Crc16,
    Crc32,
}

impl CrcWidth {
    /// Number of checksum bytes on the wire (before escaping).
    pub fn byte_len(self) -> usize {
        match self {
            Self::Crc16 => 2,
            Self::Crc32 => 4,
        }
    }

    /// Checksum `parts` in order and return the wire bytes.
    ///
    /// CRC16 goes out high byte first, CRC32 least significant byte first.
    pub fn checksum(self, parts: &[&[u8]]) -> ([u8; 4], usize) {
        match self {
            Self::Crc16 => {
                let mut crc = Crc16::new();
                for part in parts {
                    crc.update(part);
                }
                let [hi, lo] = crc.finish().to_be_bytes();
                ([hi, lo, 0, 0], 2)
            }
            Self::Crc32 => {
                let mut crc = Crc32::new();
                for part in parts {
                    crc.update(part);
                }
                (crc.finish().to_le_bytes(), 4)
            }
        }
    }

    /// Interpret received checksum bytes as a number, for error reporting.
    pub fn value_of(self, wire: &[u8]) -> u32 {
        match self {
            Self::Crc16 => u16::from_be_bytes([wire[0], wire[1]]) as u32,
            Self::Crc32 => u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]),
        }
    }
}
