//! zmx command line
//!
//! `sz`/`rz`-style transfers over stdin/stdout. Logging goes to stderr so
//! stdout stays a clean data stream.

mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing_subscriber::EnvFilter;

use progress::{format_bytes, TransferProgress};
use zmx::zmodem::channel::EventReceiver;
use zmx::{
    start_receive, start_send, ChannelSink, DetectionResult, Detector, TransferConfig,
    TransferHandle, TransferStats,
};

/// ZMODEM file transfer over the terminal
#[derive(Parser)]
#[command(name = "zmx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (default: ~/.config/zmx/config.toml if it exists)
    #[arg(short, long, env = "ZMX_CONFIG")]
    config: Option<String>,

    /// Payload bytes per data sub-packet (max 8192)
    #[arg(long, env = "ZMX_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Stick to 16-bit CRCs
    #[arg(long)]
    crc16: bool,

    /// Escape all control characters
    #[arg(short, long)]
    escape_control: bool,

    /// Continue interrupted transfers
    #[arg(short, long)]
    resume: bool,

    /// Seconds to wait for each frame
    #[arg(long, env = "ZMX_TIMEOUT")]
    timeout: Option<u64>,

    /// No progress bars
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files to the receiver on the other end (like sz)
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Don't print "rz\r" to start a remote receiver
        #[arg(long)]
        no_rz: bool,
    },

    /// Receive files from the sender on the other end (like rz)
    Receive {
        /// Destination directory
        #[arg(default_value = ".")]
        dir: String,
    },

    /// Copy stdin to stdout until a ZMODEM session appears
    Detect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Send { files, no_rz } => {
            if no_rz {
                config.send_rz_command = false;
            }
            let (sink, events) = ChannelSink::new();
            let handle = start_send(Stdio::new(), files, config, Arc::new(sink));
            let stats = follow(handle, events, cli.quiet).await?;
            tracing::info!(
                "Sent {} file(s), {}",
                stats.file_count(),
                format_bytes(stats.bytes_transferred)
            );
        }
        Commands::Receive { dir } => {
            let dest = expand_tilde(Path::new(&dir));
            let (sink, events) = ChannelSink::new();
            let handle = start_receive(Stdio::new(), dest, config, Arc::new(sink));
            let stats = follow(handle, events, cli.quiet).await?;
            tracing::info!(
                "Received {} file(s), {}",
                stats.file_count(),
                format_bytes(stats.bytes_transferred)
            );
        }
        Commands::Detect => detect().await?,
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ZMX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<TransferConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = expand_tilde(Path::new(path));
            TransferConfig::from_file(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => TransferConfig::load_or_default().context("Failed to load default config")?,
    };

    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if cli.crc16 {
        config.use_crc32 = false;
    }
    if cli.escape_control {
        config.escape_control = true;
    }
    if cli.resume {
        config.resume = true;
    }
    if let Some(secs) = cli.timeout {
        config.header_timeout_ms = secs.saturating_mul(1000);
    }

    config.validate()?;
    Ok(config)
}

/// Drive the progress display until the worker finishes. Ctrl-C cancels.
async fn follow(
    handle: TransferHandle,
    mut events: EventReceiver,
    quiet: bool,
) -> anyhow::Result<TransferStats> {
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut display = TransferProgress::new(quiet);
    while let Some(event) = events.recv().await {
        if display.handle(&event) {
            break;
        }
    }

    handle.wait().await.context("Transfer failed")
}

async fn detect() -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut detector = Detector::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stdout.write_all(&buf[..n]).await?;
        stdout.flush().await?;

        match detector.process_stream_chunk(&buf[..n]) {
            DetectionResult::None => {}
            DetectionResult::RemoteSender { .. } => {
                eprintln!("zmx: remote side is sending; run `zmx receive`");
                return Ok(());
            }
            DetectionResult::RemoteReceiver { .. } => {
                eprintln!("zmx: remote side is waiting to receive; run `zmx send FILE...`");
                return Ok(());
            }
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

/// stdin and stdout as one duplex stream.
struct Stdio {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
}

impl Stdio {
    fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl AsyncRead for Stdio {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stdio {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(expand_tilde(Path::new("rel")), PathBuf::from("rel"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/in")), home.join("in"));
        }
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["zmx", "--resume", "send", "a", "b", "--no-rz"]).unwrap();
        assert!(cli.resume);
        match cli.command {
            Commands::Send { files, no_rz } => {
                assert_eq!(files.len(), 2);
                assert!(no_rz);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_cli_requires_files() {
        assert!(Cli::try_parse_from(["zmx", "send"]).is_err());
    }
}
