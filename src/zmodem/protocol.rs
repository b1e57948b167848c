//! ZMODEM protocol vocabulary.
//!
//! Wire constants, frame types, capability flags and the ZFILE metadata
//! payload. All multi-byte header fields are little-endian (ZP0 first);
//! flag fields are addressed from the other end (ZF0 is the last byte).

use crate::error::FrameError;

/// Padding byte that precedes every header
pub const ZPAD: u8 = b'*';
/// Escape byte (same value as CAN)
pub const ZDLE: u8 = 0x18;
/// Escaped ZDLE
pub const ZDLEE: u8 = ZDLE ^ 0x40;
/// Binary header with CRC16
pub const ZBIN: u8 = b'A';
/// Hex header with CRC16
pub const ZHEX: u8 = b'B';
/// Binary header with CRC32
pub const ZBIN32: u8 = b'C';

/// ZDLE-escaped 0x7F
pub const ZRUB0: u8 = b'l';
/// ZDLE-escaped 0xFF
pub const ZRUB1: u8 = b'm';

pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const CAN: u8 = 0x18;
pub const BS: u8 = 0x08;

/// What a sender prints first so a shell-side `rz` can be started.
pub const RZ_COMMAND: &[u8] = b"rz\r";

/// Session trailer written by the sender after the final ZFIN.
pub const OVER_AND_OUT: &[u8] = b"OO";

/// Abort sequence: ten CANs followed by ten backspaces to erase them on
/// terminals that echo.
pub const CANCEL_SEQUENCE: [u8; 20] = [
    CAN, CAN, CAN, CAN, CAN, CAN, CAN, CAN, CAN, CAN, BS, BS, BS, BS, BS, BS, BS, BS, BS, BS,
];

/// Consecutive CANs that abort a session.
pub const CANCEL_RUN: usize = 5;

/// Largest data sub-packet accepted or produced.
pub const MAX_SUBPACKET_LEN: usize = 8192;

/// Largest file whose offsets fit the 32-bit position field.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

// =============================================================================
// Frame types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    ZRQINIT = 0,
    ZRINIT = 1,
    ZSINIT = 2,
    ZACK = 3,
    ZFILE = 4,
    ZSKIP = 5,
    ZNAK = 6,
    ZABORT = 7,
    ZFIN = 8,
    ZRPOS = 9,
    ZDATA = 10,
    ZEOF = 11,
    ZFERR = 12,
    ZCRC = 13,
    ZCHALLENGE = 14,
    ZCOMPL = 15,
    ZCAN = 16,
    ZFREECNT = 17,
    ZCOMMAND = 18,
    ZSTDERR = 19,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::ZRQINIT),
            1 => Some(Self::ZRINIT),
            2 => Some(Self::ZSINIT),
            3 => Some(Self::ZACK),
            4 => Some(Self::ZFILE),
            5 => Some(Self::ZSKIP),
            6 => Some(Self::ZNAK),
            7 => Some(Self::ZABORT),
            8 => Some(Self::ZFIN),
            9 => Some(Self::ZRPOS),
            10 => Some(Self::ZDATA),
            11 => Some(Self::ZEOF),
            12 => Some(Self::ZFERR),
            13 => Some(Self::ZCRC),
            14 => Some(Self::ZCHALLENGE),
            15 => Some(Self::ZCOMPL),
            16 => Some(Self::ZCAN),
            17 => Some(Self::ZFREECNT),
            18 => Some(Self::ZCOMMAND),
            19 => Some(Self::ZSTDERR),
            _ => None,
        }
    }
}

// =============================================================================
// Sub-packet terminators
// =============================================================================

/// End marker of a data sub-packet, sent as `ZDLE <byte>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubpacketTerminator {
    /// ZCRCE: frame ends, no response expected
    EndOfFrameNoAck = b'h',
    /// ZCRCG: frame continues, no response expected
    ContinueNoAck = b'i',
    /// ZCRCQ: frame continues, ZACK expected
    ContinueAck = b'j',
    /// ZCRCW: frame ends, ZACK expected
    EndOfFrameAck = b'k',
}

impl SubpacketTerminator {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            b'h' => Some(Self::EndOfFrameNoAck),
            b'i' => Some(Self::ContinueNoAck),
            b'j' => Some(Self::ContinueAck),
            b'k' => Some(Self::EndOfFrameAck),
            _ => None,
        }
    }

    pub fn ends_frame(self) -> bool {
        matches!(self, Self::EndOfFrameNoAck | Self::EndOfFrameAck)
    }

    pub fn wants_ack(self) -> bool {
        matches!(self, Self::ContinueAck | Self::EndOfFrameAck)
    }
}

// =============================================================================
// Capability flags
// =============================================================================

bitflags::bitflags! {
    /// Receiver capabilities, carried in ZF0 of ZRINIT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ZrinitFlags: u8 {
        /// Can send and receive at the same time
        const CANFDX = 0x01;
        /// Can receive data during disk I/O
        const CANOVIO = 0x02;
        /// Can send a break signal
        const CANBRK = 0x04;
        const CANCRY = 0x08;
        const CANLZW = 0x10;
        /// Can use 32-bit frame check
        const CANFC32 = 0x20;
        /// Expects control characters to be escaped
        const ESCCTL = 0x40;
        /// Expects 8th bit to be escaped
        const ESC8 = 0x80;
    }
}

bitflags::bitflags! {
    /// Sender requests, carried in ZF0 of ZSINIT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ZsinitFlags: u8 {
        const TESCCTL = 0x40;
        const TESC8 = 0x80;
    }
}

/// ZFILE conversion option (ZF0): binary transfer
pub const ZCBIN: u8 = 1;
/// ZFILE conversion option (ZF0): resume interrupted transfer
pub const ZCRESUM: u8 = 3;

/// Receiver capabilities learned from ZRINIT, fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub flags: ZrinitFlags,
    /// Receiver buffer size; 0 means it can take a full stream
    pub buffer_size: u16,
}

impl Capabilities {
    pub fn supports_crc32(&self) -> bool {
        self.flags.contains(ZrinitFlags::CANFC32)
    }

    pub fn wants_escaped_control(&self) -> bool {
        self.flags.contains(ZrinitFlags::ESCCTL)
    }

    pub fn full_duplex(&self) -> bool {
        self.flags.contains(ZrinitFlags::CANFDX)
    }
}

// =============================================================================
// ZFILE metadata
// =============================================================================

/// File information carried in the ZFILE sub-packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch (0 if unknown)
    pub mtime: u64,
    /// Unix mode bits (0 if unknown)
    pub mode: u32,
}

impl FileMetadata {
    /// Encode as `name NUL "size mtime mode 0 files_left bytes_left" NUL`.
    ///
    /// mtime and mode are octal as on the wire.
    pub fn encode(&self, files_left: usize, bytes_left: u64) -> Vec<u8> {
        let tail = format!(
            "{} {:o} {:o} 0 {} {}",
            self.size, self.mtime, self.mode, files_left, bytes_left
        );
        let mut buf = Vec::with_capacity(self.name.len() + tail.len() + 2);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(tail.as_bytes());
        buf.push(0);
        buf
    }

    /// Parse a ZFILE payload. The size field is required; later fields
    /// default to 0 when missing or malformed.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let name_end = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FrameError::BadFileHeader("missing NUL after name".to_string()))?;
        if name_end == 0 {
            return Err(FrameError::BadFileHeader("empty file name".to_string()));
        }
        let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();

        let rest = &payload[name_end + 1..];
        let tail_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let tail = String::from_utf8_lossy(&rest[..tail_end]);
        let mut fields = tail.split_ascii_whitespace();

        let size = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| FrameError::BadFileHeader(format!("missing size for {}", name)))?;
        let mtime = fields
            .next()
            .and_then(|s| u64::from_str_radix(s, 8).ok())
            .unwrap_or(0);
        let mode = fields
            .next()
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .unwrap_or(0);

        Ok(Self {
            name,
            size,
            mtime,
            mode,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_u8() {
        assert_eq!(FrameType::from_u8(0), Some(FrameType::ZRQINIT));
        assert_eq!(FrameType::from_u8(9), Some(FrameType::ZRPOS));
        assert_eq!(FrameType::from_u8(19), Some(FrameType::ZSTDERR));
        assert_eq!(FrameType::from_u8(20), None);
    }

    #[test]
    fn test_terminator_semantics() {
        use SubpacketTerminator::*;
        assert!(EndOfFrameNoAck.ends_frame() && !EndOfFrameNoAck.wants_ack());
        assert!(EndOfFrameAck.ends_frame() && EndOfFrameAck.wants_ack());
        assert!(!ContinueAck.ends_frame() && ContinueAck.wants_ack());
        assert!(!ContinueNoAck.ends_frame() && !ContinueNoAck.wants_ack());
        assert_eq!(SubpacketTerminator::from_u8(b'k'), Some(EndOfFrameAck));
        assert_eq!(SubpacketTerminator::from_u8(b'g'), None);
    }

    #[test]
    fn test_file_metadata_full_tail() {
        let payload = b"report.pdf\0123456 14367417152 100644 0 3 999999\0";
        let meta = FileMetadata::decode(payload).unwrap();
        assert_eq!(meta.name, "report.pdf");
        assert_eq!(meta.size, 123456);
        assert_eq!(meta.mtime, 0o14367417152);
        assert_eq!(meta.mode, 0o100644);
    }

    #[test]
    fn test_file_metadata_size_only() {
        let meta = FileMetadata::decode(b"a.txt\011\0").unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.mtime, 0);
        assert_eq!(meta.mode, 0);
    }

    #[test]
    fn test_file_metadata_malformed_tail_fields() {
        // Non-octal mtime, missing trailing NUL
        let meta = FileMetadata::decode(b"a.txt\042 99x 644").unwrap();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.mtime, 0);
        assert_eq!(meta.mode, 0o644);
    }

    #[test]
    fn test_file_metadata_missing_size() {
        assert!(FileMetadata::decode(b"a.txt\0\0").is_err());
        assert!(FileMetadata::decode(b"a.txt\0abc\0").is_err());
        assert!(FileMetadata::decode(b"no-nul").is_err());
        assert!(FileMetadata::decode(b"\0 12\0").is_err());
    }

    #[test]
    fn test_file_metadata_encode() {
        let meta = FileMetadata {
            name: "x.bin".to_string(),
            size: 1024,
            mtime: 0o777,
            mode: 0o644,
        };
        let encoded = meta.encode(2, 4096);
        assert_eq!(encoded, b"x.bin\01024 777 644 0 2 4096\0".to_vec());
        assert_eq!(FileMetadata::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities {
            flags: ZrinitFlags::CANFDX | ZrinitFlags::CANFC32,
            buffer_size: 0,
        };
        assert!(caps.supports_crc32());
        assert!(caps.full_duplex());
        assert!(!caps.wants_escaped_control());
    }
}
