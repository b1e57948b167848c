//! End-to-end transfers: a real sender against a real receiver over an
//! in-memory duplex stream, plus synthetic peers for abort and cancel paths.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use zmx::zmodem::channel::{EventReceiver, NullSink};
use zmx::zmodem::crc::CrcWidth;
use zmx::zmodem::frame::{Frame, HeaderEncoding};
use zmx::zmodem::link::{FrameReader, FrameWriter};
use zmx::zmodem::protocol::{FileMetadata, FrameType, SubpacketTerminator, ZrinitFlags, ZCBIN};
use zmx::{
    start_receive, start_send, CancelToken, ChannelSink, DetectionResult, Detector,
    TransferConfig, TransferEvent, ZmodemError,
};

fn test_config() -> TransferConfig {
    TransferConfig {
        header_timeout_ms: 5_000,
        poll_interval_ms: 10,
        finish_timeout_ms: 500,
        ..Default::default()
    }
}

/// Deterministic bytes covering every value, escape-worthy ones included.
fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

async fn drain(mut rx: EventReceiver) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn write_sources(dir: &TempDir, files: &[(&str, &[u8])]) -> Vec<PathBuf> {
    files
        .iter()
        .map(|(name, data)| {
            let path = dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            path
        })
        .collect()
}

#[tokio::test]
async fn test_loopback_file_sizes() {
    let sizes = [0usize, 1, 1023, 1024, 1_000_000];
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let contents: Vec<(String, Vec<u8>)> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| (format!("file_{}.bin", size), pattern(size, i as u32)))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = contents
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();
    let paths = write_sources(&src, &borrowed);

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (send_sink, send_events) = ChannelSink::new();
    let (recv_sink, recv_events) = ChannelSink::new();
    let receiver = start_receive(b, dst.path(), test_config(), Arc::new(recv_sink));
    let sender = start_send(a, paths, test_config(), Arc::new(send_sink));

    let sent = sender.wait().await.unwrap();
    let received = receiver.wait().await.unwrap();
    assert_eq!(sent.file_count(), sizes.len());
    assert_eq!(received.file_count(), sizes.len());

    for (name, data) in &contents {
        let got = std::fs::read(dst.path().join(name)).unwrap();
        assert_eq!(got.len(), data.len(), "{}", name);
        assert!(got == *data, "{} differs", name);
    }

    for events in [drain(send_events).await, drain(recv_events).await] {
        let mut last: HashMap<String, (u64, u64)> = HashMap::new();
        for event in &events {
            if let TransferEvent::Progress {
                name,
                transferred,
                total,
            } = event
            {
                let prev = last.get(name).map(|p| p.0).unwrap_or(0);
                assert!(*transferred >= prev, "progress went backwards for {}", name);
                last.insert(name.clone(), (*transferred, *total));
            }
        }
        for (name, data) in &contents {
            let size = data.len() as u64;
            assert_eq!(last.get(name), Some(&(size, size)), "final progress of {}", name);
        }
        assert_eq!(
            events.last(),
            Some(&TransferEvent::SessionComplete {
                file_count: sizes.len()
            })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}

#[tokio::test]
async fn test_loopback_crc16_with_control_escaping() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = pattern(100_000, 7);
    let paths = write_sources(&src, &[("ctl.bin", &data)]);

    let config = TransferConfig {
        use_crc32: false,
        escape_control: true,
        chunk_size: 8192,
        ..test_config()
    };
    let (a, b) = tokio::io::duplex(16 * 1024);
    let receiver = start_receive(b, dst.path(), config.clone(), Arc::new(NullSink));
    let sender = start_send(a, paths, config, Arc::new(NullSink));

    sender.wait().await.unwrap();
    receiver.wait().await.unwrap();
    assert!(std::fs::read(dst.path().join("ctl.bin")).unwrap() == data);
}

#[tokio::test]
async fn test_receiver_resumes_partial_file() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = pattern(50_000, 3);
    let paths = write_sources(&src, &[("resume.bin", &data)]);
    std::fs::write(dst.path().join("resume.bin"), &data[..20_000]).unwrap();

    let recv_config = TransferConfig {
        resume: true,
        ..test_config()
    };
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (recv_sink, recv_events) = ChannelSink::new();
    let receiver = start_receive(b, dst.path(), recv_config, Arc::new(recv_sink));
    let sender = start_send(a, paths, test_config(), Arc::new(NullSink));

    let sent = sender.wait().await.unwrap();
    let received = receiver.wait().await.unwrap();
    assert_eq!(sent.bytes_transferred, 30_000);
    assert_eq!(received.bytes_transferred, 30_000);
    assert!(std::fs::read(dst.path().join("resume.bin")).unwrap() == data);

    let first_progress = drain(recv_events).await.into_iter().find_map(|e| match e {
        TransferEvent::Progress { transferred, .. } => Some(transferred),
        _ => None,
    });
    assert!(first_progress.unwrap() > 20_000);
}

#[tokio::test]
async fn test_detect_then_receive() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = pattern(4096, 11);
    let paths = write_sources(&src, &[("detected.txt", &data)]);

    let (mut host, remote) = tokio::io::duplex(64 * 1024);
    let sender = start_send(remote, paths, test_config(), Arc::new(NullSink));

    // Host side: show terminal output until the detector fires
    let mut detector = Detector::new();
    let mut buf = [0u8; 7];
    let detected = loop {
        let n = host.read(&mut buf).await.unwrap();
        assert!(n > 0);
        let result = detector.process_stream_chunk(&buf[..n]);
        if result.is_match() {
            break result;
        }
    };
    assert!(matches!(detected, DetectionResult::RemoteSender { .. }));

    let receiver = start_receive(host, dst.path(), test_config(), Arc::new(NullSink));
    sender.wait().await.unwrap();
    receiver.wait().await.unwrap();
    assert!(std::fs::read(dst.path().join("detected.txt")).unwrap() == data);
}

#[tokio::test]
async fn test_cancel_sender_while_waiting_for_ack() {
    let src = TempDir::new().unwrap();
    let paths = write_sources(&src, &[("big.bin", &pattern(100_000, 5))]);

    let config = TransferConfig {
        header_timeout_ms: 60_000,
        poll_interval_ms: 10,
        ..Default::default()
    };
    let (local, peer) = tokio::io::duplex(64 * 1024);
    let (sink, events) = ChannelSink::new();
    let handle = start_send(local, paths, config, Arc::new(sink));

    // Synthetic receiver that advertises a 1 KiB window and never acknowledges
    let (r, w) = tokio::io::split(peer);
    let mut reader = FrameReader::new(r, &test_config(), CancelToken::new());
    let mut writer = FrameWriter::new(w, &test_config(), CancelToken::new());

    assert_eq!(
        reader.next_header().await.unwrap().unwrap().frame_type,
        FrameType::ZRQINIT
    );
    let caps = ZrinitFlags::CANFDX | ZrinitFlags::CANFC32;
    writer
        .send_header(Frame::hex(
            FrameType::ZRINIT,
            Frame::flags_field(caps.bits(), 0, 0, 0) | 1024,
        ))
        .await
        .unwrap();
    let zfile = reader.next_header().await.unwrap().unwrap();
    assert_eq!(zfile.frame_type, FrameType::ZFILE);
    reader.read_subpacket(CrcWidth::Crc32).await.unwrap();
    writer
        .send_header(Frame::hex(FrameType::ZRPOS, 0))
        .await
        .unwrap();

    assert_eq!(
        reader.next_header().await.unwrap().unwrap().frame_type,
        FrameType::ZDATA
    );
    let sp = reader.read_subpacket(CrcWidth::Crc32).await.unwrap();
    assert_eq!(sp.terminator, SubpacketTerminator::EndOfFrameAck);

    let started = Instant::now();
    handle.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert!(matches!(result, Err(ZmodemError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));

    let events = drain(events).await;
    assert_eq!(events.last(), Some(&TransferEvent::Cancelled));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransferEvent::Error { .. })));

    // The peer is told with a cancel sequence
    assert!(matches!(
        reader.next_header().await,
        Err(ZmodemError::ProtocolAbort(_))
    ));
}

#[tokio::test]
async fn test_peer_abort_reports_error_and_keeps_partial_file() {
    let dst = TempDir::new().unwrap();
    let (local, peer) = tokio::io::duplex(64 * 1024);
    let (sink, events) = ChannelSink::new();
    let handle = start_receive(local, dst.path(), test_config(), Arc::new(sink));

    let (r, w) = tokio::io::split(peer);
    let mut reader = FrameReader::new(r, &test_config(), CancelToken::new());
    let mut writer = FrameWriter::new(w, &test_config(), CancelToken::new());

    assert_eq!(
        reader.next_header().await.unwrap().unwrap().frame_type,
        FrameType::ZRINIT
    );
    let meta = FileMetadata {
        name: "movie.mkv".to_string(),
        size: 1_000_000,
        mtime: 0,
        mode: 0,
    };
    writer.write_header(Frame::new(
        FrameType::ZFILE,
        Frame::flags_field(ZCBIN, 0, 0, 0),
        HeaderEncoding::Binary32,
    ));
    writer.write_subpacket(
        &meta.encode(1, meta.size),
        SubpacketTerminator::EndOfFrameAck,
        CrcWidth::Crc32,
    );
    writer.flush().await.unwrap();
    assert_eq!(
        reader.next_header().await.unwrap().unwrap().frame_type,
        FrameType::ZRPOS
    );

    writer.write_header(Frame::new(FrameType::ZDATA, 0, HeaderEncoding::Binary32));
    writer.write_subpacket(
        b"first bytes",
        SubpacketTerminator::EndOfFrameNoAck,
        CrcWidth::Crc32,
    );
    writer.write_header(Frame::hex(FrameType::ZABORT, 0));
    writer.flush().await.unwrap();

    let result = handle.wait().await;
    assert!(matches!(result, Err(ZmodemError::ProtocolAbort(_))));

    let events = drain(events).await;
    assert!(matches!(events.last(), Some(TransferEvent::Error { .. })));
    assert!(!events.contains(&TransferEvent::Cancelled));
    assert_eq!(
        std::fs::read(dst.path().join("movie.mkv")).unwrap(),
        b"first bytes"
    );
}
