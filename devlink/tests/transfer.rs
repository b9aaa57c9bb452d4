//! Sliced file transfer over real Unix sockets.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;

use devlink::proto::{HEADER_SIZE, MsgKind, MsgStatus, RequestType};
use devlink::{Conn, IoMode, OpenParams, Transport, TransportKind, TransportRegistry, UnixTransport, codec};

const LEN: usize = 1_200_000;

fn pattern() -> Vec<u8> {
    (0..LEN).map(|i| (i % 253) as u8).collect()
}

/// Listener + connected pair on a fresh socket directory.
fn unix_pair(dir: &std::path::Path) -> (Conn, Conn) {
    let transports = TransportRegistry::new();
    let unix: Arc<dyn Transport> = Arc::new(UnixTransport::new(dir));
    transports.register(Arc::clone(&unix)).unwrap();
    let params = OpenParams::for_device("xfer", 0);
    let mut server = unix.open_server(&params).unwrap();
    let client = Conn::connect(&transports, TransportKind::Unix, &params).unwrap();
    let accepted = Conn::new(Arc::clone(&unix), unix.accept(&server).unwrap());
    unix.close_server(&mut server).unwrap();
    (client, accepted)
}

#[test]
fn slices_follow_offset_and_total_rules() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = unix_pair(dir.path());
    let data = pattern();
    let mut src = tempfile::tempfile().unwrap();
    src.write_all(&data).unwrap();
    src.seek(SeekFrom::Start(0)).unwrap();

    thread::scope(|s| {
        let receiver = s.spawn(|| {
            let mut headers = Vec::new();
            let mut out = Vec::new();
            loop {
                let raw = server.read_bytes(IoMode::Blocking).unwrap();
                let frame = devlink::proto::Frame::from_bytes(raw.clone()).unwrap();
                assert_eq!(raw.len(), frame.header.slice_len as usize + HEADER_SIZE);
                out.extend_from_slice(&frame.payload);
                headers.push(frame.header);
                if frame.header.is_last_slice() {
                    break;
                }
            }
            codec::send_response(&server, RequestType::SendFile.code(), MsgStatus::NoError)
                .unwrap();
            (headers, out)
        });

        let sent = codec::send_file(&client, RequestType::SendFile.code(), &mut src).unwrap();
        assert_eq!(sent.slices, 3);

        let (headers, out) = receiver.join().unwrap();
        let lens: Vec<u32> = headers.iter().map(|h| h.slice_len).collect();
        assert_eq!(lens, vec![500_000, 500_000, 200_000]);
        assert!(headers.iter().all(|h| h.total_len as usize == LEN));
        assert!(headers.iter().all(|h| h.kind == MsgKind::Data));
        assert_eq!(lens.iter().map(|&l| l as usize).sum::<usize>(), LEN);
        let last = headers.last().unwrap();
        assert_eq!(last.offset, 1_000_000);
        assert_eq!(last.total_len, last.slice_len + last.offset);
        assert_eq!(out, data);
    });
}

#[test]
fn send_file_and_recv_file_agree() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = unix_pair(dir.path());
    let data = pattern();
    let mut src = tempfile::tempfile().unwrap();
    src.write_all(&data).unwrap();
    src.seek(SeekFrom::Start(0)).unwrap();
    let dest_path = dir.path().join("received.bin");

    thread::scope(|s| {
        let receiver = s.spawn(|| {
            let mut dest = std::fs::File::create(&dest_path).unwrap();
            codec::recv_file(&server, &mut dest).unwrap()
        });
        codec::send_file(&client, RequestType::SendFile.code(), &mut src).unwrap();
        let summary = receiver.join().unwrap();
        assert_eq!(summary.bytes, LEN as u64);
        assert_eq!(summary.aborted, None);
    });
    assert_eq!(std::fs::read(&dest_path).unwrap(), data);
}

#[test]
fn peer_abort_ends_transfer_successfully() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = unix_pair(dir.path());
    thread::scope(|s| {
        let receiver = s.spawn(|| {
            let mut out = Vec::new();
            codec::recv_file(&server, &mut out).unwrap()
        });
        let first = devlink::proto::Frame::slice(1, 0, 100, 0, vec![7; 40]).unwrap();
        codec::send_frame(&client, &first).unwrap();
        codec::send_response(&client, 1, MsgStatus::FileError).unwrap();
        let summary = receiver.join().unwrap();
        assert_eq!(summary.bytes, 40);
        assert_eq!(summary.aborted, Some(MsgStatus::FileError));
    });
}

#[test]
fn oversized_slice_is_dropped_but_counted() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = unix_pair(dir.path());
    let total = 40 + 600_000;
    thread::scope(|s| {
        let receiver = s.spawn(|| {
            let mut out = Vec::new();
            let summary = codec::recv_file(&server, &mut out).unwrap();
            (summary, out)
        });
        let first = devlink::proto::Frame::slice(1, 0, total, 0, vec![7; 40]).unwrap();
        codec::send_frame(&client, &first).unwrap();
        let huge = devlink::proto::Frame::slice(1, 0, total, 40, vec![9; 600_000]).unwrap();
        assert!(huge.header.is_last_slice());
        codec::send_frame(&client, &huge).unwrap();
        codec::recv_response(&client, IoMode::Blocking).unwrap();

        let (summary, out) = receiver.join().unwrap();
        assert_eq!(summary.slices, 2);
        assert_eq!(summary.bytes, 40);
        assert_eq!(summary.aborted, None);
        assert_eq!(out, vec![7; 40]);
    });
}
