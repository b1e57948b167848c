//! Transfer sessions: one worker task per transfer.
//!
//! The worker owns the stream until the session ends and reports exactly one
//! terminal event: `on_session_complete`, `on_error` or `on_cancelled`.

use crate::config::TransferConfig;
use crate::error::{Result, ZmodemError};
use crate::zmodem::channel::{EventSink, TransferStats};
use crate::zmodem::receiver::Receiver;
use crate::zmodem::sender::Sender;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

/// Shared flag a host sets to stop a transfer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ZmodemError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle to a running transfer.
#[derive(Debug)]
pub struct TransferHandle {
    cancel: CancelToken,
    task: JoinHandle<Result<TransferStats>>,
}

impl TransferHandle {
    /// Request cancellation. The worker notices within one poll interval.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker and return its outcome.
    pub async fn wait(self) -> Result<TransferStats> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(task_failure(e)),
        }
    }
}

/// Start receiving files into `dest_dir` over `stream`.
pub fn start_receive<S>(
    stream: S,
    dest_dir: impl Into<PathBuf>,
    config: TransferConfig,
    sink: Arc<dyn EventSink>,
) -> TransferHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = CancelToken::new();
    let dest_dir = dest_dir.into();
    let worker_sink = sink.clone();
    let worker_cancel = cancel.clone();

    let task = spawn_worker(sink, async move {
        let (reader, writer) = tokio::io::split(stream);
        let mut receiver = Receiver::new(dest_dir, config, worker_sink, worker_cancel);
        receiver.run(reader, writer).await
    });

    TransferHandle { cancel, task }
}

/// Start sending `files` over `stream`.
pub fn start_send<S>(
    stream: S,
    files: Vec<PathBuf>,
    config: TransferConfig,
    sink: Arc<dyn EventSink>,
) -> TransferHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = CancelToken::new();
    let worker_sink = sink.clone();
    let worker_cancel = cancel.clone();

    let task = spawn_worker(sink, async move {
        let (reader, writer) = tokio::io::split(stream);
        let mut sender = Sender::new(files, config, worker_sink, worker_cancel);
        sender.run(reader, writer).await
    });

    TransferHandle { cancel, task }
}

/// Run `work` in its own task and report how it ended.
///
/// A panicking worker still produces its one terminal event.
fn spawn_worker<F>(sink: Arc<dyn EventSink>, work: F) -> JoinHandle<Result<TransferStats>>
where
    F: Future<Output = Result<TransferStats>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match tokio::spawn(work).await {
            Ok(result) => result,
            Err(e) => Err(task_failure(e)),
        };
        report(sink.as_ref(), &result);
        result
    })
}

fn task_failure(e: tokio::task::JoinError) -> ZmodemError {
    ZmodemError::Io(std::io::Error::other(format!("transfer task failed: {}", e)))
}

fn report(sink: &dyn EventSink, result: &Result<TransferStats>) {
    match result {
        Ok(stats) => {
            tracing::info!(
                "Session complete: {} file(s), {} skipped, {} bytes",
                stats.file_count(),
                stats.files_skipped,
                stats.bytes_transferred
            );
            sink.on_session_complete(stats.file_count());
        }
        Err(ZmodemError::Cancelled) => {
            tracing::info!("Session cancelled");
            sink.on_cancelled();
        }
        Err(e) => {
            tracing::error!("Session failed: {}", e);
            sink.on_error(&e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zmodem::channel::{ChannelSink, TransferEvent};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ZmodemError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_idle_receiver() {
        let tmp = TempDir::new().unwrap();
        let (local, _peer) = tokio::io::duplex(4096);
        let (sink, mut events) = ChannelSink::new();
        let config = TransferConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };

        let handle = start_receive(local, tmp.path(), config, Arc::new(sink));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(ZmodemError::Cancelled)));
        assert_eq!(events.recv().await, Some(TransferEvent::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_worker_still_reports() {
        let (sink, mut events) = ChannelSink::new();
        let task = spawn_worker(Arc::new(sink), async {
            let stats: Option<TransferStats> = None;
            Ok(stats.expect("worker bug"))
        });

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ZmodemError::Io(_))));
        assert!(matches!(events.recv().await, Some(TransferEvent::Error { .. })));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_missing_source_file_reports_error() {
        let tmp = TempDir::new().unwrap();
        let (local, _peer) = tokio::io::duplex(4096);
        let (sink, mut events) = ChannelSink::new();

        let handle = start_send(
            local,
            vec![tmp.path().join("does-not-exist")],
            TransferConfig::default(),
            Arc::new(sink),
        );
        let result = handle.wait().await;
        assert!(matches!(result, Err(ZmodemError::Config(_))));
        assert!(matches!(
            events.recv().await,
            Some(TransferEvent::Error { .. })
        ));
    }
}
