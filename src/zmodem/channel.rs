//! Transfer events and per-session bookkeeping.
//!
//! Workers report through an [`EventSink`]. Sink methods are called from the
//! worker task and must not block; [`ChannelSink`] forwards every call as a
//! [`TransferEvent`] over an unbounded channel for hosts that prefer to poll.

use crate::zmodem::protocol::FileMetadata;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::sync::mpsc;

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    FileStart {
        name: String,
        size: u64,
    },
    Progress {
        name: String,
        transferred: u64,
        total: u64,
    },
    FileComplete {
        name: String,
        path: PathBuf,
    },
    FileSkipped {
        name: String,
    },
    /// Terminal: the session failed
    Error {
        message: String,
    },
    /// Terminal: every file was handled
    SessionComplete {
        file_count: usize,
    },
    /// Terminal: stopped through the cancellation token
    Cancelled,
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::SessionComplete { .. } | Self::Cancelled
        )
    }
}

/// Receives domain events from a transfer worker.
pub trait EventSink: Send + Sync {
    fn on_file_start(&self, name: &str, size: u64);
    fn on_progress(&self, name: &str, transferred: u64, total: u64);
    fn on_file_complete(&self, name: &str, path: &std::path::Path);
    fn on_file_skipped(&self, name: &str);
    fn on_error(&self, message: &str);
    fn on_session_complete(&self, file_count: usize);
    fn on_cancelled(&self);
}

/// Sink that forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

impl ChannelSink {
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: TransferEvent) {
        // Host dropped the receiver; nobody is listening
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_file_start(&self, name: &str, size: u64) {
        self.emit(TransferEvent::FileStart {
            name: name.to_string(),
            size,
        });
    }

    fn on_progress(&self, name: &str, transferred: u64, total: u64) {
        self.emit(TransferEvent::Progress {
            name: name.to_string(),
            transferred,
            total,
        });
    }

    fn on_file_complete(&self, name: &str, path: &std::path::Path) {
        self.emit(TransferEvent::FileComplete {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    fn on_file_skipped(&self, name: &str) {
        self.emit(TransferEvent::FileSkipped {
            name: name.to_string(),
        });
    }

    fn on_error(&self, message: &str) {
        self.emit(TransferEvent::Error {
            message: message.to_string(),
        });
    }

    fn on_session_complete(&self, file_count: usize) {
        self.emit(TransferEvent::SessionComplete { file_count });
    }

    fn on_cancelled(&self) {
        self.emit(TransferEvent::Cancelled);
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_file_start(&self, _name: &str, _size: u64) {}
    fn on_progress(&self, _name: &str, _transferred: u64, _total: u64) {}
    fn on_file_complete(&self, _name: &str, _path: &std::path::Path) {}
    fn on_file_skipped(&self, _name: &str) {}
    fn on_error(&self, _message: &str) {}
    fn on_session_complete(&self, _file_count: usize) {}
    fn on_cancelled(&self) {}
}

// =============================================================================
// Per-file context
// =============================================================================

/// State of the file currently being transferred.
#[derive(Debug)]
pub struct TransferContext {
    pub metadata: FileMetadata,

    /// Local path (destination when receiving, source when sending)
    pub path: PathBuf,

    /// Open handle; `None` once the file is closed
    pub file: Option<File>,

    /// Bytes of the file covered so far, i.e. the current offset
    pub transferred: u64,

    /// Highest progress value reported, so events never go backwards
    reported: Option<u64>,
}

impl TransferContext {
    pub fn new(
        metadata: FileMetadata,
        path: PathBuf,
        file: File,
        start_offset: u64,
    ) -> Self {
        Self {
            metadata,
            path,
            file: Some(file),
            transferred: start_offset,
            reported: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Report progress if the offset moved past anything reported before.
    pub fn report_progress(&mut self, sink: &dyn EventSink) {
        if self.reported.is_some_and(|r| r >= self.transferred) {
            return;
        }
        self.reported = Some(self.transferred);
        let total = self.metadata.size.max(self.transferred);
        sink.on_progress(&self.metadata.name, self.transferred, total);
    }
}

// =============================================================================
// Session statistics
// =============================================================================

/// A file that was fully transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Outcome of a finished session.
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    /// Files fully transferred, in order
    pub completed: Vec<CompletedFile>,

    /// Files the peer (or the receiver itself) declined
    pub files_skipped: u64,

    /// Payload bytes moved in this session, excluding resumed prefixes
    pub bytes_transferred: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_count(&self) -> usize {
        self.completed.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
