//! ZDLE byte codec shared by both transfer roles.
//!
//! Escaping: selected control bytes go out as `ZDLE (b ^ 0x40)`, ZDLE itself
//! as `ZDLE ZDLEE`. Unescaping is the inverse, and additionally recognises the
//! four sub-packet terminators and the two rubout codes.

use crate::error::CodecError;
use crate::zmodem::protocol::{SubpacketTerminator, XOFF, XON, ZDLE, ZDLEE, ZRUB0, ZRUB1};
use bytes::{BufMut, BytesMut};

/// Output of escaping a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escaped {
    Plain(u8),
    Pair(u8, u8),
}

impl Escaped {
    pub fn put(self, out: &mut BytesMut) {
        match self {
            Self::Plain(b) => out.put_u8(b),
            Self::Pair(a, b) => {
                out.put_u8(a);
                out.put_u8(b);
            }
        }
    }
}

/// Escaper configured for one direction of a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct Escaper {
    /// Escape every control character (peer asked for ESCCTL)
    escape_control: bool,
}

impl Escaper {
    pub fn new(escape_control: bool) -> Self {
        Self { escape_control }
    }

    fn needs_escape(&self, b: u8) -> bool {
        match b {
            ZDLE | 0x10 | XON | XOFF | 0x90 | 0x91 | 0x93 | 0x0D | 0x8D => true,
            _ => self.escape_control && (b & 0x60) == 0,
        }
    }

    pub fn escape(&self, b: u8) -> Escaped {
        if b == ZDLE {
            Escaped::Pair(ZDLE, ZDLEE)
        } else if self.needs_escape(b) {
            Escaped::Pair(ZDLE, b ^ 0x40)
        } else {
            Escaped::Plain(b)
        }
    }

    pub fn escape_into(&self, input: &[u8], out: &mut BytesMut) {
        out.reserve(input.len() + input.len() / 8);
        for &b in input {
            self.escape(b).put(out);
        }
    }
}

/// One logical unit decoded from escaped wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unescaped {
    Byte(u8),
    Terminator(SubpacketTerminator),
    /// Input ran out; nothing was consumed
    EndOfStream,
}

/// Decode the next logical unit from `input`.
///
/// Returns the unit and how many input bytes it used. Unescaped XON/XOFF
/// bytes are flow-control noise from the line and are skipped.
pub fn unescape(input: &[u8]) -> Result<(Unescaped, usize), CodecError> {
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        match b {
            XON | XOFF | 0x91 | 0x93 => {
                i += 1;
                continue;
            }
            ZDLE => {
                let mut j = i + 1;
                while matches!(input.get(j), Some(&(XON | XOFF | 0x91 | 0x93))) {
                    j += 1;
                }
                let Some(&next) = input.get(j) else {
                    return Ok((Unescaped::EndOfStream, 0));
                };
                let used = j + 1;
                let unit = match next {
                    ZDLEE => Unescaped::Byte(ZDLE),
                    ZRUB0 => Unescaped::Byte(0x7F),
                    ZRUB1 => Unescaped::Byte(0xFF),
                    c => match SubpacketTerminator::from_u8(c) {
                        Some(t) => Unescaped::Terminator(t),
                        None if (c & 0x60) == 0x40 => Unescaped::Byte(c ^ 0x40),
                        None => return Err(CodecError::BadEscape(c)),
                    },
                };
                return Ok((unit, used));
            }
            _ => return Ok((Unescaped::Byte(b), i + 1)),
        }
    }
    Ok((Unescaped::EndOfStream, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(escaper: Escaper, data: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        escaper.escape_into(data, &mut wire);
        let mut out = Vec::new();
        let mut rest = &wire[..];
        loop {
            match unescape(rest).unwrap() {
                (Unescaped::Byte(b), n) => {
                    out.push(b);
                    rest = &rest[n..];
                }
                (Unescaped::EndOfStream, _) => break,
                (Unescaped::Terminator(t), _) => panic!("unexpected terminator {:?}", t),
            }
        }
        out
    }

    #[test]
    fn test_every_byte_roundtrips() {
        for escaper in [Escaper::new(false), Escaper::new(true)] {
            for b in 0..=255u8 {
                assert_eq!(roundtrip(escaper, &[b]), vec![b], "byte 0x{:02X}", b);
            }
        }
    }

    #[test]
    fn test_escape_outputs() {
        let esc = Escaper::default();
        assert_eq!(esc.escape(ZDLE), Escaped::Pair(ZDLE, ZDLEE));
        assert_eq!(esc.escape(XON), Escaped::Pair(ZDLE, XON ^ 0x40));
        assert_eq!(esc.escape(0x93), Escaped::Pair(ZDLE, 0xD3));
        assert_eq!(esc.escape(b'A'), Escaped::Plain(b'A'));
        assert_eq!(esc.escape(0x01), Escaped::Plain(0x01));
        assert_eq!(Escaper::new(true).escape(0x01), Escaped::Pair(ZDLE, b'A'));
    }

    #[test]
    fn test_unescape_terminators_and_rubouts() {
        assert_eq!(
            unescape(&[ZDLE, b'h']).unwrap(),
            (Unescaped::Terminator(SubpacketTerminator::EndOfFrameNoAck), 2)
        );
        assert_eq!(
            unescape(&[ZDLE, b'k', 0x00]).unwrap(),
            (Unescaped::Terminator(SubpacketTerminator::EndOfFrameAck), 2)
        );
        assert_eq!(unescape(&[ZDLE, ZRUB0]).unwrap(), (Unescaped::Byte(0x7F), 2));
        assert_eq!(unescape(&[ZDLE, ZRUB1]).unwrap(), (Unescaped::Byte(0xFF), 2));
    }

    #[test]
    fn test_unescape_needs_more_input() {
        assert_eq!(unescape(&[]).unwrap(), (Unescaped::EndOfStream, 0));
        assert_eq!(unescape(&[ZDLE]).unwrap(), (Unescaped::EndOfStream, 0));
        assert_eq!(unescape(&[XON, ZDLE]).unwrap(), (Unescaped::EndOfStream, 0));
    }

    #[test]
    fn test_unescape_skips_flow_control() {
        assert_eq!(unescape(&[XON, XOFF, b'z']).unwrap(), (Unescaped::Byte(b'z'), 3));
    }

    #[test]
    fn test_unescape_rejects_bad_escape() {
        assert_eq!(unescape(&[ZDLE, b'0']), Err(CodecError::BadEscape(b'0')));
    }

    proptest! {
        #[test]
        fn prop_payload_roundtrips(data in proptest::collection::vec(any::<u8>(), 0..2048),
                                   escape_control in any::<bool>()) {
            let escaper = Escaper::new(escape_control);
            prop_assert_eq!(roundtrip(escaper, &data), data);
        }
    }
}
