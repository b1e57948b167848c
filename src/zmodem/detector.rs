//! Passive ZMODEM session detection on a terminal stream.
//!
//! The detector only looks at the bytes it is shown; it never alters or
//! withholds them, so the terminal keeps rendering everything. A short tail
//! of each chunk is carried into the next call so a signature split across
//! reads is still found.

use crate::zmodem::protocol::{ZDLE, ZHEX, ZPAD};

/// Start of the hex ZRQINIT a remote `sz` emits.
pub const SENDER_SIGNATURE: [u8; 4] = [ZPAD, ZPAD, ZDLE, ZHEX];

/// Prompt printed by a remote `rz` before its ZRINIT.
pub const RECEIVER_PROMPT: &[u8] = b"rz waiting to receive.";

/// Hex digits of the ZRINIT frame type, right after the hex header marker.
const ZRINIT_DIGITS: &[u8] = b"01";

const CARRY_LEN: usize = RECEIVER_PROMPT.len() - 1;

// An undecided signature plus its type digits must survive the carry
const _: () = assert!(CARRY_LEN >= SENDER_SIGNATURE.len() + ZRINIT_DIGITS.len());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    None,
    /// The remote side started sending; the local side should receive
    RemoteSender {
        /// Offset just past the match within the chunk
        end: usize,
    },
    /// The remote side waits to receive; the local side should send
    RemoteReceiver { end: usize },
}

impl DetectionResult {
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Default)]
pub struct Detector {
    carry: Vec<u8>,
}

impl Detector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the next chunk of terminal output.
    pub fn process_stream_chunk(&mut self, chunk: &[u8]) -> DetectionResult {
        let carried = self.carry.len();
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);

        let prompt = find(&window, RECEIVER_PROMPT).map(|i| i + RECEIVER_PROMPT.len());
        // The frame type digits decide the direction; `None` until both arrived
        let signature = find(&window, &SENDER_SIGNATURE).map(|i| {
            let end = i + SENDER_SIGNATURE.len();
            let is_zrinit = window
                .get(end..end + ZRINIT_DIGITS.len())
                .map(|digits| digits == ZRINIT_DIGITS);
            (end, is_zrinit)
        });

        let result = match (prompt, signature) {
            (Some(p), Some((s, _))) if p <= s => DetectionResult::RemoteReceiver {
                end: p.saturating_sub(carried),
            },
            (_, Some((s, Some(true)))) => DetectionResult::RemoteReceiver {
                end: s.saturating_sub(carried),
            },
            (_, Some((s, Some(false)))) => DetectionResult::RemoteSender {
                end: s.saturating_sub(carried),
            },
            (_, Some((_, None))) => DetectionResult::None,
            (Some(p), None) => DetectionResult::RemoteReceiver {
                end: p.saturating_sub(carried),
            },
            (None, None) => DetectionResult::None,
        };

        if result.is_match() {
            tracing::debug!("zmodem session detected: {:?}", result);
        } else {
            let keep = window.len().min(CARRY_LEN);
            window.drain(..window.len() - keep);
            self.carry = window;
        }
        result
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
