//! Frame I/O over the async byte stream.
//!
//! [`FrameReader`] accumulates input and hands out decoded headers and data
//! sub-packets. Every wait is bounded by the header timeout and sliced by
//! the poll interval so a cancellation request is noticed promptly.
//! [`FrameWriter`] batches encoded output and writes it with the same
//! cancellation checks.

use crate::config::TransferConfig;
use crate::error::{FrameError, Result, ZmodemError};
use crate::zmodem::codec::Escaper;
use crate::zmodem::crc::CrcWidth;
use crate::zmodem::frame::{decode_header, encode_subpacket, DataSubpacket, Frame, SubpacketDecoder};
use crate::zmodem::protocol::{SubpacketTerminator, CANCEL_SEQUENCE, OVER_AND_OUT};
use crate::zmodem::session::CancelToken;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
struct Timing {
    header_timeout: Duration,
    poll_interval: Duration,
    max_errors: u32,
}

impl Timing {
    fn from_config(config: &TransferConfig) -> Self {
        Self {
            header_timeout: config.header_timeout(),
            poll_interval: config.poll_interval(),
            max_errors: config.max_errors,
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    decoder: SubpacketDecoder,
    cancel: CancelToken,
    timing: Timing,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, config: &TransferConfig, cancel: CancelToken) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            decoder: SubpacketDecoder::new(CrcWidth::Crc16),
            cancel,
            timing: Timing::from_config(config),
        }
    }

    /// Read more input. Returns false once `deadline` has passed.
    async fn fill(&mut self, deadline: Instant) -> Result<bool> {
        loop {
            self.cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(self.timing.poll_interval);
            self.buf.reserve(READ_BUFFER_SIZE);
            match timeout(slice, self.reader.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => {
                    return Err(ZmodemError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    )))
                }
                Ok(Ok(_)) => return Ok(true),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            }
        }
    }

    /// Wait for the next valid header.
    ///
    /// Returns `Ok(None)` when nothing valid arrived within the header
    /// timeout, or when more framing errors than allowed were seen; callers
    /// treat both as "resend and retry". A peer cancel sequence is an abort.
    pub async fn next_header(&mut self) -> Result<Option<Frame>> {
        self.next_header_within(self.timing.header_timeout).await
    }

    pub async fn next_header_within(&mut self, wait: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + wait;
        let mut errors = 0;
        loop {
            match decode_header(&mut self.buf) {
                Ok(Some(frame)) => {
                    tracing::debug!(
                        "<- {:?} {:?} 0x{:08X}",
                        frame.frame_type,
                        frame.encoding,
                        frame.position_or_flags
                    );
                    return Ok(Some(frame));
                }
                Ok(None) => {
                    if !self.fill(deadline).await? {
                        return Ok(None);
                    }
                }
                Err(FrameError::CancelSequence) => {
                    return Err(ZmodemError::abort("peer sent cancel sequence"))
                }
                Err(e) => {
                    errors += 1;
                    tracing::warn!(
                        "Discarding bad header ({}/{}): {}",
                        errors,
                        self.timing.max_errors,
                        e
                    );
                    if errors >= self.timing.max_errors {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Check for a header without waiting.
    ///
    /// Takes whatever input is already available; framing errors are noise
    /// here and only logged.
    pub async fn poll_header(&mut self) -> Result<Option<Frame>> {
        self.cancel.check()?;
        loop {
            match decode_header(&mut self.buf) {
                Ok(Some(frame)) => {
                    tracing::debug!(
                        "<- {:?} (polled) 0x{:08X}",
                        frame.frame_type,
                        frame.position_or_flags
                    );
                    return Ok(Some(frame));
                }
                Ok(None) => {}
                Err(FrameError::CancelSequence) => {
                    return Err(ZmodemError::abort("peer sent cancel sequence"))
                }
                Err(e) => {
                    tracing::warn!("Discarding bad header: {}", e);
                    continue;
                }
            }

            self.buf.reserve(READ_BUFFER_SIZE);
            match timeout(Duration::ZERO, self.reader.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => {
                    return Err(ZmodemError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    )))
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Read the data sub-packet that follows a header.
    ///
    /// Framing problems come back as `ZmodemError::Framing` so the caller can
    /// ask for a retransmission; a stalled peer gives `ZmodemError::Timeout`.
    pub async fn read_subpacket(&mut self, width: CrcWidth) -> Result<DataSubpacket> {
        if self.decoder.width() != width {
            self.decoder = SubpacketDecoder::new(width);
        }
        let deadline = Instant::now() + self.timing.header_timeout;
        loop {
            if let Some(subpacket) = self.decoder.decode(&mut self.buf)? {
                return Ok(subpacket);
            }
            if !self.fill(deadline).await? {
                self.decoder.reset();
                return Err(ZmodemError::timeout("data sub-packet"));
            }
        }
    }

    /// Best-effort read of the "OO" session trailer.
    pub async fn read_trailer(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(i) = self
                .buf
                .windows(OVER_AND_OUT.len())
                .position(|w| w == OVER_AND_OUT)
            {
                self.buf.advance(i + OVER_AND_OUT.len());
                return true;
            }
            match self.fill(deadline).await {
                Ok(true) => continue,
                _ => return false,
            }
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

pub struct FrameWriter<W> {
    writer: W,
    escaper: Escaper,
    buf: BytesMut,
    cancel: CancelToken,
    timing: Timing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, config: &TransferConfig, cancel: CancelToken) -> Self {
        Self {
            writer,
            escaper: Escaper::default(),
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            cancel,
            timing: Timing::from_config(config),
        }
    }

    pub fn escaper(&self) -> Escaper {
        self.escaper
    }

    pub fn set_escaper(&mut self, escaper: Escaper) {
        self.escaper = escaper;
    }

    /// Queue a header.
    pub fn write_header(&mut self, frame: Frame) {
        tracing::debug!(
            "-> {:?} {:?} 0x{:08X}",
            frame.frame_type,
            frame.encoding,
            frame.position_or_flags
        );
        frame.encode_into(&self.escaper, &mut self.buf);
    }

    /// Queue a data sub-packet.
    pub fn write_subpacket(
        &mut self,
        payload: &[u8],
        terminator: SubpacketTerminator,
        width: CrcWidth,
    ) {
        encode_subpacket(payload, terminator, width, &self.escaper, &mut self.buf);
    }

    /// Queue bytes verbatim.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub async fn send_header(&mut self, frame: Frame) -> Result<()> {
        self.write_header(frame);
        self.flush().await
    }

    /// Write out everything queued.
    ///
    /// A peer that accepts nothing for a whole header timeout is treated as
    /// gone.
    pub async fn flush(&mut self) -> Result<()> {
        let mut stalled_since = Instant::now();
        while !self.buf.is_empty() {
            self.cancel.check()?;
            match timeout(self.timing.poll_interval, self.writer.write_buf(&mut self.buf)).await {
                Ok(Ok(0)) => {
                    return Err(ZmodemError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    )))
                }
                Ok(Ok(_)) => stalled_since = Instant::now(),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if stalled_since.elapsed() >= self.timing.header_timeout {
                        return Err(ZmodemError::timeout("peer to accept output"));
                    }
                }
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Tell the peer to abort: CAN x10, BS x10.
    ///
    /// Used on the way out of a failed or cancelled session, so it ignores the
    /// cancellation token and gives up after `wait`.
    pub async fn send_cancel(&mut self, wait: Duration) {
        self.buf.clear();
        let write = async {
            self.writer.write_all(&CANCEL_SEQUENCE).await?;
            self.writer.flush().await
        };
        match timeout(wait, write).await {
            Ok(Ok(())) => tracing::debug!("-> cancel sequence"),
            Ok(Err(e)) => tracing::warn!("Failed to send cancel sequence: {}", e),
            Err(_) => tracing::warn!("Timed out sending cancel sequence"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zmodem::frame::HeaderEncoding;
    use crate::zmodem::protocol::{FrameType, CAN};
    use tokio::io::duplex;

    fn fast_config() -> TransferConfig {
        TransferConfig {
            header_timeout_ms: 200,
            poll_interval_ms: 10,
            max_errors: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_header_across_writes() {
        let config = fast_config();
        let (a, mut b) = duplex(1024);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());

        let frame = Frame::new(FrameType::ZRPOS, 77, HeaderEncoding::Binary32);
        let wire = frame.encode(&Escaper::default());
        let (head, tail) = wire.split_at(5);
        b.write_all(head).await.unwrap();
        let feeder = tokio::spawn({
            let tail = tail.to_vec();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                b.write_all(&tail).await.unwrap();
                b
            }
        });

        assert_eq!(reader.next_header().await.unwrap(), Some(frame));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_next_header_times_out() {
        let config = fast_config();
        let (a, _b) = duplex(64);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        assert_eq!(reader.next_header().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_budget_exhausted() {
        let config = fast_config();
        let (a, mut b) = duplex(1024);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        b.write_all(b"**\x18Z**\x18Z**\x18Z**\x18Z").await.unwrap();
        assert_eq!(reader.next_header().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_sequence_aborts() {
        let config = fast_config();
        let (a, mut b) = duplex(64);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        b.write_all(&[CAN; 8]).await.unwrap();
        assert!(matches!(
            reader.next_header().await,
            Err(ZmodemError::ProtocolAbort(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_token_interrupts_wait() {
        let config = TransferConfig {
            header_timeout_ms: 60_000,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let (a, _b) = duplex(64);
        let cancel = CancelToken::new();
        let mut reader = FrameReader::new(a, &config, cancel.clone());

        let started = std::time::Instant::now();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        });
        assert!(matches!(
            reader.next_header().await,
            Err(ZmodemError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_header_does_not_wait() {
        let config = fast_config();
        let (a, mut b) = duplex(1024);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        assert_eq!(reader.poll_header().await.unwrap(), None);

        let frame = Frame::hex(FrameType::ZSKIP, 0);
        b.write_all(&frame.encode(&Escaper::default())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reader.poll_header().await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_writer_reader_subpacket() {
        let config = fast_config();
        let (a, b) = duplex(64 * 1024);
        let cancel = CancelToken::new();
        let mut writer = FrameWriter::new(b, &config, cancel.clone());
        let mut reader = FrameReader::new(a, &config, cancel);

        writer.write_header(Frame::new(FrameType::ZDATA, 0, HeaderEncoding::Binary16));
        writer.write_subpacket(b"payload", SubpacketTerminator::EndOfFrameNoAck, CrcWidth::Crc16);
        writer.flush().await.unwrap();

        let header = reader.next_header().await.unwrap().unwrap();
        assert_eq!(header.frame_type, FrameType::ZDATA);
        let sp = reader.read_subpacket(CrcWidth::Crc16).await.unwrap();
        assert_eq!(sp.payload.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_read_subpacket_timeout() {
        let config = fast_config();
        let (a, mut b) = duplex(64);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        b.write_all(b"partial").await.unwrap();
        assert!(matches!(
            reader.read_subpacket(CrcWidth::Crc32).await,
            Err(ZmodemError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_trailer() {
        let config = fast_config();
        let (a, mut b) = duplex(64);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        b.write_all(b"\x11OO").await.unwrap();
        assert!(reader.read_trailer(Duration::from_millis(100)).await);
        assert!(!reader.read_trailer(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let config = fast_config();
        let (a, b) = duplex(64);
        drop(b);
        let mut reader = FrameReader::new(a, &config, CancelToken::new());
        assert!(matches!(reader.next_header().await, Err(ZmodemError::Io(_))));
    }
}
