//! Sender role.
//!
//! Starts the session with ZRQINIT, learns the receiver's capabilities from
//! ZRINIT, then offers each file with ZFILE and streams it from whatever
//! offset the receiver asks for. A ZRPOS at any point moves the stream back
//! (or forward) to that offset.

use crate::config::TransferConfig;
use crate::error::{Result, ZmodemError};
use crate::zmodem::channel::{CompletedFile, EventSink, TransferContext, TransferStats};
use crate::zmodem::codec::Escaper;
use crate::zmodem::crc::Crc32;
use crate::zmodem::frame::{Frame, HeaderEncoding};
use crate::zmodem::link::{FrameReader, FrameWriter};
use crate::zmodem::protocol::{
    Capabilities, FileMetadata, FrameType, SubpacketTerminator, ZrinitFlags, ZsinitFlags,
    MAX_FILE_SIZE, OVER_AND_OUT, RZ_COMMAND, ZCBIN, ZCRESUM,
};
use crate::zmodem::session::CancelToken;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, SeekFrom};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    AwaitCapabilities,
    FileHeaderSent,
    AwaitResumePosition,
    SendingData,
    /// ZEOF sent, waiting for ZRINIT
    AwaitNextReady,
    Finishing,
    Done,
}

/// How a stretch of the data phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    ResendFrom(u64),
    Skipped,
}

pub struct Sender {
    files: Vec<PathBuf>,
    config: TransferConfig,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
    state: SenderState,
    caps: Capabilities,
    encoding: HeaderEncoding,
    current: Option<TransferContext>,
    stats: TransferStats,
}

impl Sender {
    pub fn new(
        files: Vec<PathBuf>,
        config: TransferConfig,
        sink: Arc<dyn EventSink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            files,
            config,
            sink,
            cancel,
            state: SenderState::AwaitCapabilities,
            caps: Capabilities::default(),
            encoding: HeaderEncoding::Binary16,
            current: None,
            stats: TransferStats::new(),
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Capabilities the receiver advertised; default until ZRINIT arrives.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Send every file, then close the session.
    pub async fn run<R, W>(&mut self, reader: R, writer: W) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.config.validate()?;
        let sources = self.inspect_sources().await?;

        let mut reader = FrameReader::new(reader, &self.config, self.cancel.clone());
        let mut writer = FrameWriter::new(writer, &self.config, self.cancel.clone());

        let result = self.drive(sources, &mut reader, &mut writer).await;
        self.current = None;

        match result {
            Ok(()) => Ok(std::mem::take(&mut self.stats)),
            Err(e) => {
                if !matches!(e, ZmodemError::ProtocolAbort(_)) {
                    writer.send_cancel(self.config.finish_timeout()).await;
                }
                Err(e)
            }
        }
    }

    /// Stat every source up front so a bad argument fails before the
    /// session starts.
    async fn inspect_sources(&self) -> Result<Vec<(PathBuf, FileMetadata)>> {
        let mut sources = Vec::with_capacity(self.files.len());
        for path in &self.files {
            let md = fs::metadata(path)
                .await
                .map_err(|e| ZmodemError::Config(format!("{}: {}", path.display(), e)))?;
            if !md.is_file() {
                return Err(ZmodemError::Config(format!(
                    "{}: not a regular file",
                    path.display()
                )));
            }
            if md.len() > MAX_FILE_SIZE {
                return Err(ZmodemError::Config(format!(
                    "{}: {} bytes is more than ZMODEM offsets can address",
                    path.display(),
                    md.len()
                )));
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ZmodemError::Config(format!("{}: no file name", path.display())))?;
            let mtime = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            sources.push((
                path.clone(),
                FileMetadata {
                    name,
                    size: md.len(),
                    mtime,
                    mode: file_mode(&md),
                },
            ));
        }
        Ok(sources)
    }

    async fn drive<R, W>(
        &mut self,
        sources: Vec<(PathBuf, FileMetadata)>,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.negotiate(reader, writer).await?;
        if self.config.escape_control {
            self.send_zsinit(reader, writer).await?;
        }

        let total = sources.len();
        let mut bytes_left: u64 = sources.iter().map(|(_, m)| m.size).sum();
        for (i, (path, metadata)) in sources.into_iter().enumerate() {
            let size = metadata.size;
            self.send_file(path, metadata, total - i, bytes_left, reader, writer)
                .await?;
            bytes_left = bytes_left.saturating_sub(size);
        }

        self.finish_session(reader, writer).await
    }

    // =========================================================================
    // Session setup
    // =========================================================================

    async fn negotiate<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.state = SenderState::AwaitCapabilities;
        if self.config.send_rz_command {
            writer.write_raw(RZ_COMMAND);
        }
        writer.send_header(Frame::hex(FrameType::ZRQINIT, 0)).await?;

        let mut retries = 0;
        loop {
            let Some(frame) = reader.next_header().await? else {
                retries += 1;
                if retries > self.config.max_retries {
                    return Err(ZmodemError::timeout("receiver ZRINIT"));
                }
                tracing::warn!(
                    "No ZRINIT yet, resending ZRQINIT ({}/{})",
                    retries,
                    self.config.max_retries
                );
                writer.send_header(Frame::hex(FrameType::ZRQINIT, 0)).await?;
                continue;
            };

            match frame.frame_type {
                FrameType::ZRINIT => {
                    self.caps = Capabilities {
                        flags: ZrinitFlags::from_bits_retain(frame.zf0()),
                        buffer_size: (frame.position() & 0xFFFF) as u16,
                    };
                    break;
                }
                FrameType::ZCHALLENGE => {
                    writer
                        .send_header(Frame::hex(FrameType::ZACK, frame.position()))
                        .await?
                }
                FrameType::ZABORT | FrameType::ZCAN | FrameType::ZFERR | FrameType::ZFIN => {
                    return Err(ZmodemError::abort(format!(
                        "receiver sent {:?} before the first file",
                        frame.frame_type
                    )))
                }
                other => tracing::debug!("Ignoring {:?} while waiting for ZRINIT", other),
            }
        }

        self.encoding = if self.caps.supports_crc32() && self.config.use_crc32 {
            HeaderEncoding::Binary32
        } else {
            HeaderEncoding::Binary16
        };
        writer.set_escaper(Escaper::new(
            self.caps.wants_escaped_control() || self.config.escape_control,
        ));
        tracing::info!(
            "Receiver capabilities {:?}, buffer {}; using {:?}",
            self.caps.flags,
            self.caps.buffer_size,
            self.encoding
        );
        Ok(())
    }

    /// Ask the receiver to escape control characters too.
    async fn send_zsinit<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let field = Frame::flags_field(ZsinitFlags::TESCCTL.bits(), 0, 0, 0);
        let mut retries = 0;
        let mut resend = true;
        loop {
            if resend {
                writer.write_header(Frame::new(FrameType::ZSINIT, field, self.encoding));
                // Empty attention string
                writer.write_subpacket(
                    b"\0",
                    SubpacketTerminator::EndOfFrameAck,
                    self.encoding.crc_width(),
                );
                writer.flush().await?;
            }

            resend = match reader.next_header().await? {
                Some(frame) if frame.frame_type == FrameType::ZACK => return Ok(()),
                Some(frame) if is_abort(frame.frame_type) => {
                    return Err(ZmodemError::abort(format!(
                        "receiver sent {:?}",
                        frame.frame_type
                    )))
                }
                Some(frame) if frame.frame_type == FrameType::ZNAK => true,
                // Stale ZRINIT
                Some(_) => false,
                None => true,
            };
            if resend {
                retries += 1;
                if retries > self.config.max_retries {
                    return Err(ZmodemError::timeout("ZACK for ZSINIT"));
                }
            }
        }
    }

    // =========================================================================
    // Per file
    // =========================================================================

    async fn send_file<R, W>(
        &mut self,
        path: PathBuf,
        metadata: FileMetadata,
        files_left: usize,
        bytes_left: u64,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let file = File::open(&path).await?;
        tracing::info!("Sending {} ({} bytes)", metadata.name, metadata.size);
        self.sink.on_file_start(&metadata.name, metadata.size);
        self.current = Some(TransferContext::new(metadata, path, file, 0));

        let Some(start) = self.offer_file(files_left, bytes_left, reader, writer).await? else {
            return self.skip_current();
        };
        let mut offset = start;
        loop {
            self.state = SenderState::SendingData;
            let outcome = match self.stream_data(offset, reader, writer).await? {
                Outcome::Done => {
                    self.state = SenderState::AwaitNextReady;
                    self.await_next_ready(reader, writer).await?
                }
                other => other,
            };
            match outcome {
                Outcome::Done => break,
                Outcome::ResendFrom(pos) => {
                    tracing::debug!("Receiver asked to resume at {}", pos);
                    offset = pos;
                }
                Outcome::Skipped => return self.skip_current(),
            }
        }

        if let Some(mut ctx) = self.current.take() {
            ctx.report_progress(self.sink.as_ref());
            tracing::info!("Sent {} ({} bytes)", ctx.name(), ctx.transferred);
            self.sink.on_file_complete(ctx.name(), &ctx.path);
            self.stats.completed.push(CompletedFile {
                name: ctx.metadata.name.clone(),
                path: ctx.path.clone(),
                size: ctx.transferred,
            });
        }
        Ok(())
    }

    fn skip_current(&mut self) -> Result<()> {
        if let Some(ctx) = self.current.take() {
            tracing::info!("Receiver skipped {}", ctx.name());
            self.sink.on_file_skipped(ctx.name());
            self.stats.files_skipped += 1;
        }
        Ok(())
    }

    /// Send ZFILE until the receiver names a start offset.
    ///
    /// `None` means the receiver skipped the file.
    async fn offer_file<R, W>(
        &mut self,
        files_left: usize,
        bytes_left: u64,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Option<u64>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (payload, size, path) = match self.current.as_ref() {
            Some(ctx) => (
                ctx.metadata.encode(files_left, bytes_left),
                ctx.metadata.size,
                ctx.path.clone(),
            ),
            None => return Ok(None),
        };
        let conversion = if self.config.resume { ZCRESUM } else { ZCBIN };
        let header = Frame::new(
            FrameType::ZFILE,
            Frame::flags_field(conversion, 0, 0, 0),
            self.encoding,
        );
        let width = self.encoding.crc_width();

        let mut retries = 0;
        let mut resend = true;
        loop {
            if resend {
                self.state = SenderState::FileHeaderSent;
                writer.write_header(header);
                writer.write_subpacket(&payload, SubpacketTerminator::EndOfFrameAck, width);
                writer.flush().await?;
                self.state = SenderState::AwaitResumePosition;
            }
            resend = false;

            let Some(frame) = reader.next_header().await? else {
                retries += 1;
                if retries > self.config.max_retries {
                    return Err(ZmodemError::timeout("ZRPOS for file header"));
                }
                tracing::warn!("No answer to ZFILE ({}/{})", retries, self.config.max_retries);
                resend = true;
                continue;
            };

            match frame.frame_type {
                FrameType::ZRPOS => return Ok(Some(u64::from(frame.position()).min(size))),
                FrameType::ZSKIP => return Ok(None),
                FrameType::ZCRC => {
                    let crc = file_crc32(&path, frame.position()).await?;
                    writer.send_header(Frame::hex(FrameType::ZCRC, crc)).await?;
                }
                FrameType::ZNAK => resend = true,
                t if is_abort(t) => {
                    return Err(ZmodemError::abort(format!("receiver sent {:?}", t)))
                }
                // Stale ZRINIT or ZACK
                other => tracing::debug!("Ignoring {:?} after ZFILE", other),
            }
        }
    }

    /// Stream the file from `offset` until its end or an interruption.
    async fn stream_data<R, W>(
        &mut self,
        offset: u64,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let chunk_size = self.config.effective_chunk_size();
        let window = u64::from(self.caps.buffer_size);
        let encoding = self.encoding;
        let width = encoding.crc_width();
        let max_retries = self.config.max_retries;

        let Some(ctx) = self.current.as_mut() else {
            return Ok(Outcome::Skipped);
        };
        match ctx.file.as_mut() {
            Some(file) => file.seek(SeekFrom::Start(offset)).await?,
            None => return Ok(Outcome::Skipped),
        };
        ctx.transferred = offset;
        let size = ctx.metadata.size;

        let mut buf = vec![0u8; chunk_size];
        let mut since_ack = 0u64;
        writer.write_header(Frame::new(FrameType::ZDATA, offset as u32, encoding));

        loop {
            self.cancel.check()?;

            let remaining = size.saturating_sub(ctx.transferred);
            let want = remaining.min(chunk_size as u64) as usize;
            let n = match ctx.file.as_mut() {
                Some(file) => read_chunk(file, &mut buf[..want]).await?,
                None => 0,
            };
            // A file that shrank ends early
            let last = n as u64 >= remaining || n < want;

            since_ack += n as u64;
            let window_full = window > 0 && since_ack >= window;
            let terminator = if last {
                SubpacketTerminator::EndOfFrameNoAck
            } else if window_full {
                SubpacketTerminator::EndOfFrameAck
            } else {
                SubpacketTerminator::ContinueNoAck
            };

            writer.write_subpacket(&buf[..n], terminator, width);
            writer.flush().await?;
            ctx.transferred += n as u64;
            self.stats.bytes_transferred += n as u64;
            ctx.report_progress(self.sink.as_ref());

            if last {
                return Ok(Outcome::Done);
            }

            if terminator == SubpacketTerminator::EndOfFrameAck {
                if let Some(outcome) = wait_for_ack(reader, size, max_retries).await? {
                    return Ok(outcome);
                }
                since_ack = 0;
                writer.write_header(Frame::new(
                    FrameType::ZDATA,
                    ctx.transferred as u32,
                    encoding,
                ));
                continue;
            }

            while let Some(frame) = reader.poll_header().await? {
                if let Some(outcome) = interruption(&frame, size)? {
                    return Ok(outcome);
                }
            }
        }
    }

    /// Send ZEOF and wait for the receiver to close the file.
    async fn await_next_ready<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (position, size) = match self.current.as_ref() {
            Some(ctx) => (ctx.transferred as u32, ctx.metadata.size),
            None => return Ok(Outcome::Done),
        };
        let eof = Frame::new(FrameType::ZEOF, position, self.encoding);
        writer.send_header(eof).await?;

        let mut retries = 0;
        loop {
            let Some(frame) = reader.next_header().await? else {
                retries += 1;
                if retries > self.config.max_retries {
                    return Err(ZmodemError::timeout("ZRINIT after ZEOF"));
                }
                writer.send_header(eof).await?;
                continue;
            };
            match frame.frame_type {
                FrameType::ZRINIT => return Ok(Outcome::Done),
                FrameType::ZNAK => writer.send_header(eof).await?,
                _ => {
                    if let Some(outcome) = interruption(&frame, size)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn finish_session<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.state = SenderState::Finishing;
        writer.send_header(Frame::hex(FrameType::ZFIN, 0)).await?;

        let mut retries = 0;
        loop {
            match reader.next_header().await? {
                Some(frame) if frame.frame_type == FrameType::ZFIN => break,
                Some(frame) if is_abort(frame.frame_type) => {
                    return Err(ZmodemError::abort(format!(
                        "receiver sent {:?} while finishing",
                        frame.frame_type
                    )))
                }
                Some(frame) => tracing::debug!("Ignoring {:?} while finishing", frame.frame_type),
                None => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return Err(ZmodemError::timeout("ZFIN from receiver"));
                    }
                    writer.send_header(Frame::hex(FrameType::ZFIN, 0)).await?;
                }
            }
        }

        writer.write_raw(OVER_AND_OUT);
        writer.flush().await?;
        self.state = SenderState::Done;
        Ok(())
    }
}

fn is_abort(frame_type: FrameType) -> bool {
    matches!(
        frame_type,
        FrameType::ZABORT | FrameType::ZCAN | FrameType::ZFERR | FrameType::ZFIN
    )
}

/// Frames that cut the data phase short.
fn interruption(frame: &Frame, size: u64) -> Result<Option<Outcome>> {
    match frame.frame_type {
        FrameType::ZRPOS => Ok(Some(Outcome::ResendFrom(
            u64::from(frame.position()).min(size),
        ))),
        FrameType::ZSKIP => Ok(Some(Outcome::Skipped)),
        t if is_abort(t) => Err(ZmodemError::abort(format!("receiver sent {:?}", t))),
        _ => Ok(None),
    }
}

/// Wait for the ZACK closing a ZCRCW window.
///
/// `None` means carry on streaming.
async fn wait_for_ack<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    size: u64,
    max_retries: u32,
) -> Result<Option<Outcome>> {
    let mut retries = 0;
    loop {
        let Some(frame) = reader.next_header().await? else {
            retries += 1;
            if retries > max_retries {
                return Err(ZmodemError::timeout("ZACK for data window"));
            }
            continue;
        };
        if frame.frame_type == FrameType::ZACK {
            return Ok(None);
        }
        if let Some(outcome) = interruption(&frame, size)? {
            return Ok(Some(outcome));
        }
    }
}

/// Fill `buf` from `file`, stopping early only at end of file.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// CRC32 of the first `len` bytes of a file (all of it when `len` is 0).
async fn file_crc32(path: &Path, len: u32) -> Result<u32> {
    let mut file = File::open(path).await?;
    let mut crc = Crc32::new();
    let mut left = if len == 0 { u64::MAX } else { u64::from(len) };
    let mut buf = vec![0u8; 64 * 1024];
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        left -= n as u64;
    }
    Ok(crc.finish())
}

#[cfg(unix)]
fn file_mode(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_md: &std::fs::Metadata) -> u32 {
    0o100644
}

// =============================================================================
// Tests
// =============================================================================
