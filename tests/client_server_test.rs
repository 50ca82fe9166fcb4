// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use rfio::auth::{Authorizer, CloseNotifier, Identity};
use rfio::backend::wire_flags::{O_CREAT, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use rfio::backend::{FileStat, LocalBackend};
use rfio::checksum::{adler32_of, format_checksum, XATTR_CKSUM_TYPE, XATTR_CKSUM_VALUE};
use rfio::client::RfioClient;
use rfio::config::{RfioConfig, CKSUM_TYPE_ADLER32};
use rfio::error::serrno;
use rfio::protocol::{RequestHeader, RFIO_MAGIC, RQSTSIZE};
use rfio::session::ServerContext;

use common::{pattern, start_server, test_config, MemoryBackend, TEST_BUFSIZE};

const TIMEOUT: Duration = Duration::from_secs(60);

async fn client(ctx: ServerContext) -> RfioClient {
    let (addr, _cancel) = start_server(ctx).await;
    tokio::time::timeout(TIMEOUT, RfioClient::connect(addr))
        .await
        .expect("connect timed out")
        .expect("failed to connect")
        .with_identity(1000, 100, "tester")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn v3_read_streams_whole_file() {
    // Not a multiple of the buffer size, so the last block is short.
    let content = pattern(10 * TEST_BUFSIZE + 1234);
    for &threaded in &[true, false] {
        let backend = MemoryBackend::new();
        backend.insert("/data/file", &content);
        let ctx = ServerContext::new(test_config(threaded), Arc::new(backend));
        let mut client = client(ctx).await;

        let open = client.open_v3("/data/file", O_RDONLY, 0).await.unwrap();
        assert_eq!((open.status, open.errno), (0, 0));
        assert!(open.data_port > 0);

        let mut out = Vec::new();
        let read = tokio::time::timeout(TIMEOUT, client.read_v3(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.error, None);
        assert_eq!(read.announced, content.len() as u64);
        assert_eq!(read.received, content.len() as u64);
        assert!(out == content, "threaded = {}", threaded);

        let close = client.close_v3(None).await.unwrap();
        assert_eq!((close.status, close.errno), (0, 0));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn v3_write_stores_file_and_checksum() {
    let content = pattern(1_000_000);
    for &threaded in &[true, false] {
        let backend = MemoryBackend::new();
        let ctx = ServerContext::new(test_config(threaded), Arc::new(backend.clone()));
        let mut client = client(ctx).await;

        let open = client
            .open_v3("/data/new", O_WRONLY | O_CREAT | O_TRUNC, 0o644)
            .await
            .unwrap();
        assert_eq!(open.status, 0);

        let write = tokio::time::timeout(TIMEOUT, client.write_v3(&content))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(write.error, None);
        assert_eq!(write.sent, 1_000_000);

        let close = client.close_v3(Some(write.sent)).await.unwrap();
        assert_eq!((close.status, close.errno), (0, 0));

        assert!(backend.contents("/data/new").unwrap() == content);
        assert_eq!(
            backend.xattr("/data/new", XATTR_CKSUM_TYPE).unwrap(),
            CKSUM_TYPE_ADLER32.as_bytes()
        );
        assert_eq!(
            backend.xattr("/data/new", XATTR_CKSUM_VALUE).unwrap(),
            format_checksum(adler32_of(&content)).into_bytes()
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_buffer_is_flushed_on_close() {
    // 1,000,000 bytes never fill a 2 MiB buffer: only the close frame with
    // the declared total can complete the write.
    let config = RfioConfig {
        port_range: (0, 0),
        ..RfioConfig::default()
    };
    assert!(config.write.buffer_size > 1_000_000);
    let content = pattern(1_000_000);
    let backend = MemoryBackend::new();
    let ctx = ServerContext::new(config, Arc::new(backend.clone()));
    let mut client = client(ctx).await;

    let close = tokio::time::timeout(TIMEOUT, async {
        client.open_v3("/partial", O_WRONLY | O_CREAT, 0o644).await.unwrap();
        let write = client.write_v3(&content).await.unwrap();
        client.close_v3(Some(write.sent)).await.unwrap()
    })
    .await
    .expect("transfer timed out");
    assert_eq!((close.status, close.errno), (0, 0));
    assert!(backend.contents("/partial").unwrap() == content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn v3_write_of_nothing() {
    let backend = MemoryBackend::new();
    let ctx = ServerContext::new(test_config(true), Arc::new(backend.clone()));
    let mut client = client(ctx).await;

    client.open_v3("/empty", O_WRONLY | O_CREAT, 0o644).await.unwrap();
    let write = client.write_v3(&[]).await.unwrap();
    assert_eq!(write.sent, 0);
    let close = client.close_v3(Some(0)).await.unwrap();
    assert_eq!(close.status, 0);
    assert_eq!(backend.contents("/empty").unwrap(), Vec::<u8>::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disk_full_is_reported_while_client_keeps_sending() {
    const CAPACITY: u64 = 100_000;
    let content = pattern(32 * 1024 * 1024);
    for &threaded in &[true, false] {
        let backend = MemoryBackend::with_capacity(CAPACITY);
        let ctx = ServerContext::new(test_config(threaded), Arc::new(backend.clone()));
        let mut client = client(ctx).await;
        client.open_v3("/full", O_WRONLY | O_CREAT, 0o644).await.unwrap();

        let close = tokio::time::timeout(TIMEOUT, async {
            let write = client.write_v3(&content).await.unwrap();
            if write.error.is_some() {
                // Keep sending after the notification; the server has to
                // keep reading until it is acknowledged.
                let extra = pattern(16 * 1024 * 1024);
                client.data_stream().unwrap().write_all(&extra).await.unwrap();
            }
            client.close_v3(Some(write.sent)).await.unwrap()
        })
        .await
        .expect("transfer deadlocked");

        assert_eq!((close.status, close.errno), (-1, libc::ENOSPC));
        assert!(backend.contents("/full").unwrap().len() as u64 <= CAPACITY);
        assert_eq!(backend.xattr("/full", XATTR_CKSUM_VALUE), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checksum_mismatch_fails_the_read() {
    let content = pattern(300_000);
    for &threaded in &[true, false] {
        let backend = MemoryBackend::new();
        backend.insert("/bad", &content);
        backend.set_xattr("/bad", XATTR_CKSUM_TYPE, CKSUM_TYPE_ADLER32.as_bytes());
        let wrong = adler32_of(&content).wrapping_add(1);
        backend.set_xattr("/bad", XATTR_CKSUM_VALUE, format_checksum(wrong).as_bytes());
        let ctx = ServerContext::new(test_config(threaded), Arc::new(backend));
        let mut client = client(ctx).await;

        client.open_v3("/bad", O_RDONLY, 0).await.unwrap();
        let mut out = Vec::new();
        let read = tokio::time::timeout(TIMEOUT, client.read_v3(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.error, Some(serrno::SECHECKSUM));

        let close = client.close_v3(None).await.unwrap();
        assert_eq!((close.status, close.errno), (-1, serrno::SECHECKSUM));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_request_closes_connection() {
    let ctx = ServerContext::new(test_config(true), Arc::new(MemoryBackend::new()));
    let max = ctx.config.max_request_size;
    let (addr, _cancel) = start_server(ctx).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut frame = BytesMut::new();
    RequestHeader {
        magic: RFIO_MAGIC,
        opcode: 0x2001,
        length: max + 1,
    }
    .encode(&mut frame);
    assert_eq!(frame.len(), RQSTSIZE);
    stream.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn legacy_operations() {
    let backend = MemoryBackend::new();
    let ctx = ServerContext::new(test_config(true), Arc::new(backend.clone()));
    let mut client = client(ctx).await;

    let open = client.open("/legacy", O_RDWR | O_CREAT, 0o644).await.unwrap();
    assert_eq!((open.status, open.offset), (0, 0));

    let busy = client.open("/other", O_RDWR | O_CREAT, 0o644).await.unwrap();
    assert_eq!((busy.status, busy.errno), (-1, libc::EBUSY));

    let write = client.write(b"hello world").await.unwrap();
    assert_eq!(write.status, 11);

    let seek = client.lseek(0, 0).await.unwrap();
    assert_eq!((seek.offset, seek.errno), (0, 0));
    assert_eq!(client.read(5).await.unwrap().unwrap(), b"hello");
    assert_eq!(client.read_at(5, 0, 6).await.unwrap().unwrap(), b"world");
    assert_eq!(client.read(5).await.unwrap().unwrap(), b"");

    let st = client.fstat().await.unwrap().unwrap();
    assert_eq!(st.size, 11);

    client.lseek(0, 0).await.unwrap();
    assert_eq!(client.readahead(4).await.unwrap().unwrap(), b"hello world");

    let bad_seek = client.lseek(0, 7).await.unwrap();
    assert_eq!((bad_seek.offset, bad_seek.errno), (-1, libc::EINVAL));

    assert_eq!(client.lockf(1, 0).await.unwrap().status, 0);
    assert_eq!(client.close().await.unwrap().status, 0);

    let again = client.close().await.unwrap();
    assert_eq!((again.status, again.errno), (-1, libc::EBADF));
    assert_eq!(client.fstat().await.unwrap(), Err(libc::EBADF));
    assert_eq!(client.read(5).await.unwrap(), Err(libc::EBADF));

    let st = client.stat("/legacy").await.unwrap().unwrap();
    assert_eq!(st.size, 11);
    assert_eq!(client.lstat("/legacy").await.unwrap().unwrap().size, 11);
    assert_eq!(client.stat("/missing").await.unwrap(), Err(libc::ENOENT));

    client.end().await.unwrap();
    assert_eq!(backend.contents("/legacy").unwrap(), b"hello world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_path_is_answered_not_fatal() {
    let ctx = ServerContext::new(test_config(true), Arc::new(MemoryBackend::new()));
    let mut client = client(ctx).await;

    let path = "/".to_string() + &"x".repeat(2000);
    let open = client.open(&path, O_RDONLY, 0).await.unwrap();
    assert_eq!((open.status, open.errno), (-1, serrno::SENAMETOOLONG));

    // The session is still usable.
    assert_eq!(client.stat("/missing").await.unwrap(), Err(libc::ENOENT));
}

struct DenyAll;

impl Authorizer for DenyAll {
    fn is_granted(&self, _identity: &Identity, _capability: &str) -> bool {
        false
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_host() {
    let backend = MemoryBackend::new();
    backend.insert("/secret", b"x");
    let ctx = ServerContext::new(test_config(true), Arc::new(backend))
        .with_authorizer(Arc::new(DenyAll));
    let mut client = client(ctx).await;

    let open = client.open_v3("/secret", O_RDONLY, 0).await.unwrap();
    assert_eq!((open.status, open.errno), (-1, serrno::SEHOSTREFUSED));
    assert!(client.data_stream().is_none());
    assert_eq!(
        client.stat("/secret").await.unwrap(),
        Err(serrno::SEHOSTREFUSED)
    );
}

struct FailingNotifier;

impl CloseNotifier for FailingNotifier {
    fn file_closed(
        &self,
        _path: &str,
        _stat: &FileStat,
        _pending_error: Option<i32>,
    ) -> Result<(), i32> {
        Err(libc::EIO)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_notification_failure_fails_the_close() {
    let backend = MemoryBackend::new();
    let ctx = ServerContext::new(test_config(true), Arc::new(backend.clone()))
        .with_notifier(Arc::new(FailingNotifier));
    let mut client = client(ctx).await;

    client.open_v3("/notified", O_WRONLY | O_CREAT, 0o644).await.unwrap();
    let write = client.write_v3(b"some bytes").await.unwrap();
    let close = client.close_v3(Some(write.sent)).await.unwrap();
    assert_eq!((close.status, close.errno), (-1, libc::EIO));
    assert_eq!(backend.contents("/notified").unwrap(), b"some bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfer_without_data_connection_is_refused() {
    let backend = MemoryBackend::new();
    backend.insert("/plain", b"abc");
    let ctx = ServerContext::new(test_config(true), Arc::new(backend));
    let mut client = client(ctx).await;

    client.open("/plain", O_RDONLY, 0).await.unwrap();
    let mut out = Vec::new();
    let read = client.read_v3(&mut out).await.unwrap();
    assert_eq!(read.error, Some(libc::EBADF));
    assert!(out.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_backend_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stored");
    let path = path.to_str().unwrap();
    let content = pattern(3 * TEST_BUFSIZE + 17);

    let ctx = ServerContext::new(test_config(true), Arc::new(LocalBackend));
    let (addr, _cancel) = start_server(ctx).await;

    tokio::time::timeout(TIMEOUT, async {
        let mut writer = RfioClient::connect(addr).await.unwrap();
        writer.open_v3(path, O_WRONLY | O_CREAT | O_TRUNC, 0o600).await.unwrap();
        let write = writer.write_v3(&content).await.unwrap();
        assert_eq!(writer.close_v3(Some(write.sent)).await.unwrap().status, 0);
        assert!(std::fs::read(path).unwrap() == content);

        let mut reader = RfioClient::connect(addr).await.unwrap();
        reader.open_v3(path, O_RDONLY, 0).await.unwrap();
        let mut out = Vec::new();
        let read = reader.read_v3(&mut out).await.unwrap();
        assert_eq!(read.error, None);
        assert!(out == content);
        assert_eq!(reader.close_v3(None).await.unwrap().status, 0);
    })
    .await
    .expect("transfer timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_io_roundtrip_with_unaligned_tail() {
    // Not a multiple of the page size: the last block cannot go through
    // O_DIRECT.
    let content = pattern(1_000_000);
    for &threaded in &[true, false] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direct");
        let path = path.to_str().unwrap();
        let config = RfioConfig {
            direct_io: true,
            ..test_config(threaded)
        };
        let ctx = ServerContext::new(config, Arc::new(LocalBackend));
        let (addr, _cancel) = start_server(ctx).await;

        tokio::time::timeout(TIMEOUT, async {
            let mut writer = RfioClient::connect(addr).await.unwrap();
            writer.open_v3(path, O_WRONLY | O_CREAT | O_TRUNC, 0o600).await.unwrap();
            let write = writer.write_v3(&content).await.unwrap();
            assert_eq!(write.error, None, "threaded = {}", threaded);
            let close = writer.close_v3(Some(write.sent)).await.unwrap();
            assert_eq!((close.status, close.errno), (0, 0));
            assert!(std::fs::read(path).unwrap() == content);

            let mut reader = RfioClient::connect(addr).await.unwrap();
            reader.open_v3(path, O_RDONLY, 0).await.unwrap();
            let mut out = Vec::new();
            let read = reader.read_v3(&mut out).await.unwrap();
            assert_eq!(read.error, None, "threaded = {}", threaded);
            assert!(out == content);
            assert_eq!(reader.close_v3(None).await.unwrap().status, 0);
        })
        .await
        .expect("transfer timed out");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn early_close_stops_a_large_read() {
    // Far more than the ring and the socket buffers hold.
    let content = pattern(8 * 1024 * 1024);
    for &threaded in &[true, false] {
        let backend = MemoryBackend::new();
        backend.insert("/large", &content);
        let ctx = ServerContext::new(test_config(threaded), Arc::new(backend));
        let mut client = client(ctx).await;

        let close = tokio::time::timeout(TIMEOUT, async {
            client.open_v3("/large", O_RDONLY, 0).await.unwrap();
            let announced = client.start_read_v3().await.unwrap();
            assert_eq!(announced, Ok(content.len() as u64));

            let mut block = vec![0u8; TEST_BUFSIZE];
            let data = client.data_stream().unwrap();
            data.read_exact(&mut block).await.unwrap();
            assert!(block[..] == content[..TEST_BUFSIZE]);

            // Stop reading the data connection and close right away.
            client.close_v3(None).await.unwrap()
        })
        .await
        .expect("early close was not noticed");
        assert_eq!((close.status, close.errno), (0, 0), "threaded = {}", threaded);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_follows_end_of_file() {
    let content = pattern(2 * TEST_BUFSIZE + 5);
    for &threaded in &[true, false] {
        let backend = MemoryBackend::new();
        backend.insert("/small", &content);
        let ctx = ServerContext::new(test_config(threaded), Arc::new(backend));
        let mut client = client(ctx).await;

        tokio::time::timeout(TIMEOUT, async {
            client.open_v3("/small", O_RDONLY, 0).await.unwrap();
            let mut out = Vec::new();
            let read = client.read_v3(&mut out).await.unwrap();
            assert_eq!(read.error, None);
            assert!(out == content);

            // The server now waits on the control connection alone: the data
            // connection stays open and quiet until the close.
            let mut byte = [0u8; 1];
            let data = client.data_stream().unwrap();
            let quiet =
                tokio::time::timeout(Duration::from_millis(300), data.read(&mut byte)).await;
            assert!(quiet.is_err(), "threaded = {}", threaded);

            let close = client.close_v3(None).await.unwrap();
            assert_eq!((close.status, close.errno), (0, 0));
        })
        .await
        .expect("transfer timed out");
    }
}
