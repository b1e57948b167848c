//! Receiver role.
//!
//! Advertises capabilities with ZRINIT, accepts ZFILE offers, writes ZDATA
//! sub-packets to disk and asks for retransmission with ZRPOS whenever the
//! stream and the file offset disagree. Partially received files are kept
//! on every exit path.

use crate::config::TransferConfig;
use crate::error::{Result, ZmodemError};
use crate::zmodem::channel::{CompletedFile, EventSink, TransferContext, TransferStats};
use crate::zmodem::codec::Escaper;
use crate::zmodem::frame::Frame;
use crate::zmodem::link::{FrameReader, FrameWriter};
use crate::zmodem::protocol::{
    FileMetadata, FrameType, ZrinitFlags, ZsinitFlags, MAX_FILE_SIZE, ZCRESUM,
};
use crate::zmodem::session::CancelToken;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};

/// ZCOMPL status sent for a refused ZCOMMAND
const COMMAND_REFUSED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// ZRINIT sent, nothing heard yet
    AwaitInit,
    AwaitFileHeaderOrFin,
    ReceivingData,
    Done,
}

pub struct Receiver {
    dest_dir: PathBuf,
    config: TransferConfig,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
    state: ReceiverState,
    current: Option<TransferContext>,
    stats: TransferStats,
    /// Consecutive bad sub-packets in the current file
    data_errors: u32,
}

impl Receiver {
    pub fn new(
        dest_dir: impl Into<PathBuf>,
        config: TransferConfig,
        sink: Arc<dyn EventSink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            config,
            sink,
            cancel,
            state: ReceiverState::AwaitInit,
            current: None,
            stats: TransferStats::new(),
            data_errors: 0,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Receive files until the sender finishes the session.
    ///
    /// Errors are returned, not reported to the sink; see
    /// [`start_receive`](crate::zmodem::session::start_receive) for a worker
    /// that reports them.
    pub async fn run<R, W>(&mut self, reader: R, writer: W) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.config.validate()?;
        let mut reader = FrameReader::new(reader, &self.config, self.cancel.clone());
        let mut writer = FrameWriter::new(writer, &self.config, self.cancel.clone());

        let result = self.drive(&mut reader, &mut writer).await;
        self.close_current().await;

        match result {
            Ok(()) => Ok(std::mem::take(&mut self.stats)),
            Err(e) => {
                // A peer that aborted is already gone
                if !matches!(e, ZmodemError::ProtocolAbort(_)) {
                    writer.send_cancel(self.config.finish_timeout()).await;
                }
                Err(e)
            }
        }
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        fs::create_dir_all(&self.dest_dir).await?;
        self.state = ReceiverState::AwaitInit;
        self.send_zrinit(writer).await?;

        let mut retries = 0;
        loop {
            let frame = match reader.next_header().await? {
                Some(frame) => frame,
                None => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return Err(ZmodemError::timeout(self.waiting_for()));
                    }
                    tracing::warn!(
                        "No valid frame while waiting for {} (retry {}/{})",
                        self.waiting_for(),
                        retries,
                        self.config.max_retries
                    );
                    self.nudge(writer).await?;
                    continue;
                }
            };
            retries = 0;

            match self.state {
                ReceiverState::AwaitInit | ReceiverState::AwaitFileHeaderOrFin => {
                    self.handle_idle(frame, reader, writer).await?
                }
                ReceiverState::ReceivingData => self.handle_data(frame, reader, writer).await?,
                ReceiverState::Done => {}
            }

            if self.state == ReceiverState::Done {
                return Ok(());
            }
        }
    }

    fn waiting_for(&self) -> &'static str {
        match self.state {
            ReceiverState::AwaitInit => "sender to start",
            ReceiverState::AwaitFileHeaderOrFin => "file header",
            ReceiverState::ReceivingData | ReceiverState::Done => "file data",
        }
    }

    /// Re-send whatever request the sender may have missed.
    async fn nudge<W: AsyncWrite + Unpin>(&mut self, writer: &mut FrameWriter<W>) -> Result<()> {
        match self.state {
            ReceiverState::ReceivingData => {
                let offset = self.current_offset();
                writer.send_header(Frame::hex(FrameType::ZRPOS, offset)).await
            }
            _ => self.send_zrinit(writer).await,
        }
    }

    fn capabilities(&self) -> ZrinitFlags {
        let mut flags = ZrinitFlags::CANFDX | ZrinitFlags::CANOVIO;
        if self.config.use_crc32 {
            flags |= ZrinitFlags::CANFC32;
        }
        if self.config.escape_control {
            flags |= ZrinitFlags::ESCCTL;
        }
        flags
    }

    async fn send_zrinit<W: AsyncWrite + Unpin>(&self, writer: &mut FrameWriter<W>) -> Result<()> {
        // Buffer size (ZP0/ZP1) 0: the sender may stream without waiting
        let field = Frame::flags_field(self.capabilities().bits(), 0, 0, 0);
        writer.send_header(Frame::hex(FrameType::ZRINIT, field)).await
    }

    fn current_offset(&self) -> u32 {
        self.current
            .as_ref()
            .map(|ctx| ctx.transferred as u32)
            .unwrap_or(0)
    }

    // =========================================================================
    // Between files
    // =========================================================================

    async fn handle_idle<R, W>(
        &mut self,
        frame: Frame,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match frame.frame_type {
            FrameType::ZRQINIT => self.send_zrinit(writer).await,
            FrameType::ZSINIT => {
                match reader.read_subpacket(frame.encoding.crc_width()).await {
                    Ok(_attention) => {
                        let flags = ZsinitFlags::from_bits_retain(frame.zf0());
                        if flags.contains(ZsinitFlags::TESCCTL) {
                            tracing::debug!("Sender asked for escaped control characters");
                            writer.set_escaper(Escaper::new(true));
                        }
                        writer.send_header(Frame::hex(FrameType::ZACK, 0)).await
                    }
                    Err(e) if is_retryable(&e) => {
                        tracing::warn!("Bad ZSINIT sub-packet: {}", e);
                        writer.send_header(Frame::hex(FrameType::ZNAK, 0)).await
                    }
                    Err(e) => Err(e),
                }
            }
            // Free space unknown
            FrameType::ZFREECNT => writer.send_header(Frame::hex(FrameType::ZACK, 0)).await,
            FrameType::ZCOMMAND => {
                match reader.read_subpacket(frame.encoding.crc_width()).await {
                    Ok(command) => tracing::warn!(
                        "Refusing remote command: {}",
                        String::from_utf8_lossy(&command.payload)
                    ),
                    Err(e) if is_retryable(&e) => tracing::warn!("Refusing remote command: {}", e),
                    Err(e) => return Err(e),
                }
                writer
                    .send_header(Frame::hex(FrameType::ZCOMPL, COMMAND_REFUSED))
                    .await
            }
            FrameType::ZFILE => self.handle_file_header(frame, reader, writer).await,
            FrameType::ZFIN => {
                writer.send_header(Frame::hex(FrameType::ZFIN, 0)).await?;
                if !reader.read_trailer(self.config.finish_timeout()).await {
                    tracing::debug!("No session trailer from sender");
                }
                self.state = ReceiverState::Done;
                Ok(())
            }
            // Our ZRINIT after the last file got lost
            FrameType::ZEOF => self.send_zrinit(writer).await,
            FrameType::ZABORT | FrameType::ZCAN | FrameType::ZFERR => Err(ZmodemError::abort(
                format!("sender sent {:?}", frame.frame_type),
            )),
            other => {
                tracing::debug!("Ignoring {:?} between files", other);
                Ok(())
            }
        }
    }

    async fn handle_file_header<R, W>(
        &mut self,
        frame: Frame,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let subpacket = match reader.read_subpacket(frame.encoding.crc_width()).await {
            Ok(sp) => sp,
            Err(e) if is_retryable(&e) => {
                tracing::warn!("Bad ZFILE sub-packet: {}", e);
                return writer.send_header(Frame::hex(FrameType::ZNAK, 0)).await;
            }
            Err(e) => return Err(e),
        };

        let mut metadata = match FileMetadata::decode(&subpacket.payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Skipping file: {}", e);
                self.stats.files_skipped += 1;
                return writer.send_header(Frame::hex(FrameType::ZSKIP, 0)).await;
            }
        };

        let Some(name) = sanitize_file_name(&metadata.name) else {
            tracing::warn!("Skipping file with unusable name {:?}", metadata.name);
            return self.skip_file(&metadata.name, writer).await;
        };
        metadata.name = name;
        if metadata.size > MAX_FILE_SIZE {
            tracing::warn!(
                "Skipping {}: {} bytes is more than ZMODEM offsets can address",
                metadata.name,
                metadata.size
            );
            return self.skip_file(&metadata.name, writer).await;
        }
        let path = self.dest_dir.join(&metadata.name);

        let resume = self.config.resume || frame.zf0() == ZCRESUM;
        let existing = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => Some(m.len()),
            _ => None,
        };

        let start = match existing {
            Some(len) if resume && len == metadata.size => {
                tracing::info!("{} is already complete", path.display());
                return self.skip_file(&metadata.name, writer).await;
            }
            Some(len) if resume && len < metadata.size => len,
            _ => 0,
        };

        let file = if start > 0 {
            let mut file = OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            file
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await?
        };

        tracing::info!(
            "Receiving {} ({} bytes){}",
            metadata.name,
            metadata.size,
            if start > 0 {
                format!(", resuming at {}", start)
            } else {
                String::new()
            }
        );
        self.sink.on_file_start(&metadata.name, metadata.size);

        self.current = Some(TransferContext::new(metadata, path, file, start));
        self.data_errors = 0;
        self.state = ReceiverState::ReceivingData;
        writer
            .send_header(Frame::hex(FrameType::ZRPOS, start as u32))
            .await
    }

    async fn skip_file<W: AsyncWrite + Unpin>(
        &mut self,
        name: &str,
        writer: &mut FrameWriter<W>,
    ) -> Result<()> {
        self.stats.files_skipped += 1;
        self.sink.on_file_skipped(name);
        writer.send_header(Frame::hex(FrameType::ZSKIP, 0)).await
    }

    // =========================================================================
    // Inside a file
    // =========================================================================

    async fn handle_data<R, W>(
        &mut self,
        frame: Frame,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let offset = self.current_offset();
        match frame.frame_type {
            FrameType::ZDATA => {
                if frame.position() != offset {
                    tracing::warn!(
                        "ZDATA at {} while expecting {}; requesting resend",
                        frame.position(),
                        offset
                    );
                    return writer.send_header(Frame::hex(FrameType::ZRPOS, offset)).await;
                }
                self.receive_data(frame, reader, writer).await
            }
            FrameType::ZEOF => {
                if frame.position() == offset {
                    self.finish_file(writer).await
                } else {
                    tracing::warn!("ZEOF at {} while at {}", frame.position(), offset);
                    writer.send_header(Frame::hex(FrameType::ZRPOS, offset)).await
                }
            }
            // Sender missed our ZRPOS and offered the file again
            FrameType::ZFILE => {
                match reader.read_subpacket(frame.encoding.crc_width()).await {
                    Ok(_) => {}
                    Err(e) if is_retryable(&e) => {}
                    Err(e) => return Err(e),
                }
                writer.send_header(Frame::hex(FrameType::ZRPOS, offset)).await
            }
            FrameType::ZNAK => writer.send_header(Frame::hex(FrameType::ZRPOS, offset)).await,
            FrameType::ZABORT | FrameType::ZCAN | FrameType::ZFERR => Err(ZmodemError::abort(
                format!("sender sent {:?}", frame.frame_type),
            )),
            FrameType::ZFIN => Err(ZmodemError::abort(format!(
                "sender finished the session during {}",
                self.current.as_ref().map(|c| c.name()).unwrap_or("a file")
            ))),
            other => {
                tracing::debug!("Ignoring {:?} during file data", other);
                Ok(())
            }
        }
    }

    /// Read the sub-packets of one ZDATA frame.
    async fn receive_data<R, W>(
        &mut self,
        frame: Frame,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let width = frame.encoding.crc_width();
        loop {
            let subpacket = match reader.read_subpacket(width).await {
                Ok(sp) => sp,
                Err(e) if is_retryable(&e) => {
                    self.data_errors += 1;
                    let offset = self.current_offset();
                    tracing::warn!(
                        "Bad data sub-packet at {} ({}/{}): {}",
                        offset,
                        self.data_errors,
                        self.config.max_errors,
                        e
                    );
                    if self.data_errors > self.config.max_errors {
                        return Err(ZmodemError::timeout("valid data sub-packet"));
                    }
                    return writer.send_header(Frame::hex(FrameType::ZRPOS, offset)).await;
                }
                Err(e) => return Err(e),
            };
            self.data_errors = 0;

            let Some(ctx) = self.current.as_mut() else {
                return Ok(());
            };
            if let Some(file) = ctx.file.as_mut() {
                file.write_all(&subpacket.payload).await?;
            }
            let len = subpacket.payload.len() as u64;
            ctx.transferred += len;
            self.stats.bytes_transferred += len;
            ctx.report_progress(self.sink.as_ref());

            if subpacket.terminator.wants_ack() {
                let ack = Frame::hex(FrameType::ZACK, ctx.transferred as u32);
                writer.send_header(ack).await?;
            }
            if subpacket.terminator.ends_frame() {
                return Ok(());
            }
        }
    }

    async fn finish_file<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut FrameWriter<W>,
    ) -> Result<()> {
        if let Some(mut ctx) = self.current.take() {
            if let Some(mut file) = ctx.file.take() {
                file.flush().await?;
                file.sync_all().await?;
            }
            ctx.report_progress(self.sink.as_ref());
            apply_metadata(&ctx.path, &ctx.metadata).await;

            tracing::info!(
                "Received {} ({} bytes) -> {}",
                ctx.name(),
                ctx.transferred,
                ctx.path.display()
            );
            self.sink.on_file_complete(ctx.name(), &ctx.path);
            self.stats.completed.push(CompletedFile {
                name: ctx.metadata.name.clone(),
                path: ctx.path.clone(),
                size: ctx.transferred,
            });
        }
        self.state = ReceiverState::AwaitFileHeaderOrFin;
        self.send_zrinit(writer).await
    }

    /// Flush and close an unfinished file, keeping what arrived.
    async fn close_current(&mut self) {
        let Some(mut ctx) = self.current.take() else {
            return;
        };
        if let Some(mut file) = ctx.file.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!("Failed to flush {}: {}", ctx.path.display(), e);
            }
        }
        tracing::warn!(
            "Keeping partial file {} ({} of {} bytes)",
            ctx.path.display(),
            ctx.transferred,
            ctx.metadata.size
        );
    }
}

fn is_retryable(e: &ZmodemError) -> bool {
    matches!(e, ZmodemError::Framing(_) | ZmodemError::Timeout { .. })
}

/// Reduce a sender-supplied name to a plain file name.
///
/// Directory parts are dropped, so nothing can be written outside the
/// destination directory. Returns `None` when no usable name remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?;
    let mut components = Path::new(last).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return None,
    }
    Some(
        last.chars()
            .map(|c| if c.is_control() { '_' } else { c })
            .collect(),
    )
}

/// Apply mtime and permission bits from the file header, best effort.
async fn apply_metadata(path: &Path, metadata: &FileMetadata) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.mode != 0 {
            let perms = std::fs::Permissions::from_mode(metadata.mode & 0o7777);
            if let Err(e) = fs::set_permissions(path, perms).await {
                tracing::warn!("Failed to set permissions on {}: {}", path.display(), e);
            }
        }
    }

    if metadata.mtime != 0 {
        let mtime = filetime::FileTime::from_unix_time(metadata.mtime as i64, 0);
        let target = path.to_path_buf();
        match tokio::task::spawn_blocking(move || filetime::set_file_mtime(&target, mtime)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to set mtime on {}: {}", path.display(), e),
            Err(e) => tracing::warn!("Failed to set mtime on {}: {}", path.display(), e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
