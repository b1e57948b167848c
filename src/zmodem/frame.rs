//! Header and data sub-packet framing.
//!
//! Wire format of a header:
//!
//! ```text
//! ZPAD ZPAD ZDLE 'B' <14 hex digits: type, p0..p3, crc16> CR LF [XON]
//! ZPAD ZPAD ZDLE 'A' <escaped: type, p0..p3, crc16>
//! ZPAD ZPAD ZDLE 'C' <escaped: type, p0..p3, crc32>
//! ```
//!
//! Decoders take a `BytesMut` accumulation buffer, consume what they
//! recognise, and return `Ok(None)` when the buffer holds only part of a
//! unit. Bytes before a header's sync sequence are line noise and dropped.

use crate::error::{CodecError, FrameError};
use crate::zmodem::codec::{unescape, Escaper, Unescaped};
use crate::zmodem::crc::CrcWidth;
use crate::zmodem::protocol::{
    FrameType, SubpacketTerminator, CAN, CANCEL_RUN, MAX_SUBPACKET_LEN, XON, ZBIN, ZBIN32, ZDLE,
    ZHEX, ZPAD,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Number of hex digits in a hex header body
const HEX_BODY_LEN: usize = 14;

// =============================================================================
// Header encoding
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    Hex,
    Binary16,
    Binary32,
}

impl HeaderEncoding {
    pub fn marker(self) -> u8 {
        match self {
            Self::Hex => ZHEX,
            Self::Binary16 => ZBIN,
            Self::Binary32 => ZBIN32,
        }
    }

    pub fn from_marker(b: u8) -> Option<Self> {
        match b {
            ZHEX => Some(Self::Hex),
            ZBIN => Some(Self::Binary16),
            ZBIN32 => Some(Self::Binary32),
            _ => None,
        }
    }

    /// CRC width of the header, and of any sub-packet that follows it.
    pub fn crc_width(self) -> CrcWidth {
        match self {
            Self::Hex | Self::Binary16 => CrcWidth::Crc16,
            Self::Binary32 => CrcWidth::Crc32,
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

/// A decoded or to-be-sent header.
///
/// `position_or_flags` holds ZP0..ZP3 little-endian, so ZF0 is the top byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub position_or_flags: u32,
    pub encoding: HeaderEncoding,
}

impl Frame {
    pub fn new(frame_type: FrameType, position_or_flags: u32, encoding: HeaderEncoding) -> Self {
        Self {
            frame_type,
            position_or_flags,
            encoding,
        }
    }

    pub fn hex(frame_type: FrameType, position_or_flags: u32) -> Self {
        Self::new(frame_type, position_or_flags, HeaderEncoding::Hex)
    }

    /// Pack flag bytes ZF0..ZF3 into the header field.
    pub fn flags_field(zf0: u8, zf1: u8, zf2: u8, zf3: u8) -> u32 {
        u32::from_le_bytes([zf3, zf2, zf1, zf0])
    }

    pub fn position(&self) -> u32 {
        self.position_or_flags
    }

    pub fn zf0(&self) -> u8 {
        self.field_bytes()[3]
    }

    pub fn zf1(&self) -> u8 {
        self.field_bytes()[2]
    }

    fn field_bytes(&self) -> [u8; 4] {
        self.position_or_flags.to_le_bytes()
    }

    pub fn encode(&self, escaper: &Escaper) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.encode_into(escaper, &mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, escaper: &Escaper, out: &mut BytesMut) {
        let mut raw = [0u8; 5];
        raw[0] = self.frame_type as u8;
        raw[1..].copy_from_slice(&self.field_bytes());

        let (crc, crc_len) = self.encoding.crc_width().checksum(&[&raw]);

        out.put_slice(&[ZPAD, ZPAD, ZDLE, self.encoding.marker()]);
        match self.encoding {
            HeaderEncoding::Hex => {
                out.put_slice(hex::encode(raw).as_bytes());
                out.put_slice(hex::encode(&crc[..crc_len]).as_bytes());
                out.put_slice(b"\r\n");
                if !matches!(self.frame_type, FrameType::ZACK | FrameType::ZFIN) {
                    out.put_u8(XON);
                }
            }
            HeaderEncoding::Binary16 | HeaderEncoding::Binary32 => {
                escaper.escape_into(&raw, out);
                escaper.escape_into(&crc[..crc_len], out);
            }
        }
    }
}

/// Find and decode the next header in `src`.
pub fn decode_header(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let mut can_run = 0;
    let mut i = 0;

    while i < src.len() {
        let b = src[i];
        if b == ZPAD {
            let mut j = i;
            while j < src.len() && src[j] == ZPAD {
                j += 1;
            }
            if j < src.len() && src[j] != ZDLE {
                can_run = 0;
                i = j;
                continue;
            }
            if j + 1 >= src.len() {
                // Pads (and maybe ZDLE) at the end: keep them for the next read
                src.advance(i);
                return Ok(None);
            }

            let marker = src[j + 1];
            let body = j + 2 - i;
            src.advance(i);
            return match HeaderEncoding::from_marker(marker) {
                Some(HeaderEncoding::Hex) => decode_hex_body(src, body),
                Some(encoding) => decode_binary_body(src, body, encoding),
                None => {
                    src.advance(body);
                    Err(FrameError::UnknownFormat(marker))
                }
            };
        }

        if b == CAN {
            can_run += 1;
            if can_run >= CANCEL_RUN {
                src.advance(i + 1);
                return Err(FrameError::CancelSequence);
            }
        } else {
            can_run = 0;
        }
        i += 1;
    }

    // Nothing but noise; keep a trailing CAN run so it can complete later
    let keep = can_run;
    src.advance(src.len() - keep);
    Ok(None)
}

fn decode_hex_body(src: &mut BytesMut, body: usize) -> Result<Option<Frame>, FrameError> {
    if src.len() < body + HEX_BODY_LEN {
        return Ok(None);
    }

    let decoded = match hex::decode(&src[body..body + HEX_BODY_LEN]) {
        Ok(d) => d,
        Err(_) => {
            src.advance(body);
            return Err(FrameError::BadHex);
        }
    };
    src.advance(body + HEX_BODY_LEN);

    // Line ending and XON, if they have arrived already
    while let Some(&b) = src.first() {
        if matches!(b, b'\r' | b'\n' | 0x8D | 0x8A | XON) {
            src.advance(1);
        } else {
            break;
        }
    }

    finish_header(&decoded[..5], &decoded[5..7], HeaderEncoding::Hex).map(Some)
}

fn decode_binary_body(
    src: &mut BytesMut,
    body: usize,
    encoding: HeaderEncoding,
) -> Result<Option<Frame>, FrameError> {
    let want = 5 + encoding.crc_width().byte_len();
    let mut raw = [0u8; 9];
    let mut got = 0;
    let mut cursor = body;

    while got < want {
        match unescape(&src[cursor..]) {
            Ok((Unescaped::Byte(b), n)) => {
                raw[got] = b;
                got += 1;
                cursor += n;
            }
            Ok((Unescaped::EndOfStream, _)) => return Ok(None),
            Ok((Unescaped::Terminator(_), _)) => {
                src.advance(body);
                return Err(CodecError::UnexpectedTerminator.into());
            }
            Err(e) => {
                src.advance(body);
                return Err(e.into());
            }
        }
    }
    src.advance(cursor);

    finish_header(&raw[..5], &raw[5..want], encoding).map(Some)
}

fn finish_header(raw: &[u8], crc: &[u8], encoding: HeaderEncoding) -> Result<Frame, FrameError> {
    let width = encoding.crc_width();
    let (expected, n) = width.checksum(&[raw]);
    if expected[..n] != *crc {
        return Err(FrameError::BadCrc {
            expected: width.value_of(&expected[..n]),
            actual: width.value_of(crc),
        });
    }

    let frame_type = FrameType::from_u8(raw[0]).ok_or(FrameError::UnknownFrameType(raw[0]))?;
    let position_or_flags = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
    Ok(Frame::new(frame_type, position_or_flags, encoding))
}

// =============================================================================
// Data sub-packets
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSubpacket {
    pub payload: Bytes,
    pub terminator: SubpacketTerminator,
}

/// Append an escaped sub-packet: payload, `ZDLE terminator`, CRC.
pub fn encode_subpacket(
    payload: &[u8],
    terminator: SubpacketTerminator,
    width: CrcWidth,
    escaper: &Escaper,
    out: &mut BytesMut,
) {
    let (crc, crc_len) = width.checksum(&[payload, &[terminator as u8]]);
    escaper.escape_into(payload, out);
    out.put_u8(ZDLE);
    out.put_u8(terminator as u8);
    escaper.escape_into(&crc[..crc_len], out);
    if terminator == SubpacketTerminator::EndOfFrameAck {
        out.put_u8(XON);
    }
}

/// Resumable sub-packet decoder.
///
/// Keeps partial progress across calls so a sub-packet that arrives over
/// many reads is scanned once.
#[derive(Debug)]
pub struct SubpacketDecoder {
    width: CrcWidth,
    max_len: usize,
    payload: BytesMut,
    terminator: Option<SubpacketTerminator>,
    crc: [u8; 4],
    crc_got: usize,
}

impl SubpacketDecoder {
    pub fn new(width: CrcWidth) -> Self {
        Self::with_max_len(width, MAX_SUBPACKET_LEN)
    }

    pub fn with_max_len(width: CrcWidth, max_len: usize) -> Self {
        Self {
            width,
            max_len,
            payload: BytesMut::with_capacity(max_len.min(MAX_SUBPACKET_LEN)),
            terminator: None,
            crc: [0; 4],
            crc_got: 0,
        }
    }

    pub fn width(&self) -> CrcWidth {
        self.width
    }

    pub fn reset(&mut self) {
        self.payload.clear();
        self.terminator = None;
        self.crc_got = 0;
    }

    /// Decode from `src`, consuming what was used.
    ///
    /// On error the decoder is reset and the offending bytes are left in
    /// `src` for header resynchronisation to skip.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DataSubpacket>, FrameError> {
        loop {
            let (unit, n) = match unescape(&src[..]) {
                Ok(u) => u,
                Err(e) => {
                    self.reset();
                    return Err(e.into());
                }
            };

            match (unit, self.terminator) {
                (Unescaped::EndOfStream, _) => return Ok(None),
                (Unescaped::Byte(b), None) => {
                    if self.payload.len() >= self.max_len {
                        self.reset();
                        return Err(FrameError::SubpacketTooLong { max: self.max_len });
                    }
                    self.payload.put_u8(b);
                }
                (Unescaped::Terminator(t), None) => self.terminator = Some(t),
                (Unescaped::Byte(b), Some(_)) => {
                    self.crc[self.crc_got] = b;
                    self.crc_got += 1;
                }
                (Unescaped::Terminator(_), Some(_)) => {
                    self.reset();
                    return Err(CodecError::UnexpectedTerminator.into());
                }
            }
            src.advance(n);

            if let Some(terminator) = self.terminator {
                if self.crc_got == self.width.byte_len() {
                    return self.finish(terminator).map(Some);
                }
            }
        }
    }

    fn finish(&mut self, terminator: SubpacketTerminator) -> Result<DataSubpacket, FrameError> {
        let n = self.width.byte_len();
        let (expected, _) = self.width.checksum(&[&self.payload, &[terminator as u8]]);
        if expected[..n] != self.crc[..n] {
            let err = FrameError::BadCrc {
                expected: self.width.value_of(&expected[..n]),
                actual: self.width.value_of(&self.crc[..n]),
            };
            self.reset();
            return Err(err);
        }

        let payload = self.payload.split().freeze();
        self.reset();
        Ok(DataSubpacket {
            payload,
            terminator,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
