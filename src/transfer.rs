// Copyright 2020 Joyent, Inc.

//! v3 streaming transfers.
//!
//! A transfer owns the data connection of a session and borrows its control
//! connection. It waits on both sockets at once with a bounded timeout:
//!
//! * Reading, file bytes go out on the data socket while the control socket
//!   is watched for an early close. End of file and disk errors are
//!   announced with `REP_EOF` and `REP_ERROR` frames.
//!
//! * Writing, file bytes come in on the data socket while the control socket
//!   is watched for the close frame declaring how many bytes were sent. The
//!   transfer completes once that many bytes have been handed to the disk.
//!
//! A disk error while writing moves the transfer to
//! [`TransferState::DrainingOnError`]: the error is announced, and whatever
//! the client keeps sending is read and discarded until the client
//! acknowledges. Closing the data socket instead could leave both sides
//! blocked on full socket buffers.
//!
//! Both directions end with the close sub-protocol: flush, stat, notify,
//! close the file, close the data socket, send the final status on the
//! control socket and shut it down.

use std::io::{self, SeekFrom};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use slog::{debug, error, info, trace, warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::backend::{FileHandle, OpenFlags};
use crate::buffer::AlignedBuf;
use crate::checksum::{ReadChecksum, WriteChecksum};
use crate::error::{io_errno, serrno, RfioError};
use crate::handlers::{set_socket_buffer, SocketBuffer};
use crate::message::{
    encode_eof, encode_error, encode_read_announcement, CloseV3Request,
    StatusReply,
};
use crate::protocol::{ControlStream, Opcode, Request};
use crate::ring::{Chunk, RingBuffer, RingReader, RingWriter};
use crate::session::{close_file, OpenFile, ServerContext};
use crate::worker::{read_retrying, write_block, Worker};

/// Longest wait on the sockets before polling again.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Polling granularity while draining after an error.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long the control connection is kept reading after the final status,
/// so that late frames from the client do not reset it.
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AwaitingFirstOp,
    Streaming,
    DrainingOnError,
    Closing,
    Closed,
}

impl TransferState {
    fn describe(self) -> &'static str {
        match self {
            TransferState::AwaitingFirstOp => "setting up a transfer",
            TransferState::Streaming => "streaming",
            TransferState::DrainingOnError => "draining after an error",
            TransferState::Closing => "closing",
            TransferState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes sent to or written for the client.
    pub bytes: u64,
    /// The errno reported to the client in the final status, if any.
    pub error: Option<i32>,
}

/// An open file with its handle taken out, to be put back once the handle
/// returns from a worker thread.
struct Detached {
    path: String,
    flags: OpenFlags,
    checksum: Option<WriteChecksum>,
}

impl Detached {
    fn split(file: OpenFile) -> (Box<dyn FileHandle>, Detached) {
        let OpenFile {
            handle,
            path,
            flags,
            checksum,
        } = file;
        (
            handle,
            Detached {
                path,
                flags,
                checksum,
            },
        )
    }

    fn attach(self, handle: Box<dyn FileHandle>) -> OpenFile {
        OpenFile {
            handle,
            path: self.path,
            flags: self.flags,
            checksum: self.checksum,
        }
    }
}

/// Current offset and size of the file.
fn position(handle: &mut dyn FileHandle) -> Result<(u64, u64), i32> {
    let offset = handle
        .lseek(SeekFrom::Current(0))
        .map_err(|e| io_errno(&e))?;
    let size = handle.fstat().map_err(|e| io_errno(&e))?.size;
    Ok((offset, size))
}

enum Block {
    Loaded,
    End,
    Failed(i32),
}

/// Where file data comes from when reading. A block is loaded, then sent
/// in as many socket writes as it takes.
enum Source {
    Threaded {
        worker: Worker,
        reader: RingReader,
        current: Option<Chunk>,
        offset: usize,
    },
    Direct {
        handle: Box<dyn FileHandle>,
        buf: AlignedBuf,
        len: usize,
        offset: usize,
        verify: Option<ReadChecksum>,
    },
}

impl Source {
    /// The part of the current block not sent yet.
    fn unsent(&self) -> &[u8] {
        match self {
            Source::Threaded {
                current: Some(chunk),
                offset,
                ..
            } => &chunk.payload()[*offset..],
            Source::Threaded { current: None, .. } => &[],
            Source::Direct {
                buf, len, offset, ..
            } => &buf[*offset..*len],
        }
    }

    /// Mark `n` more bytes of the current block as sent. A fully sent ring
    /// slot goes back to the producer.
    fn consume(&mut self, n: usize) {
        match self {
            Source::Threaded {
                reader,
                current,
                offset,
                ..
            } => {
                *offset += n;
                let done = current
                    .as_ref()
                    .map_or(false, |chunk| *offset >= chunk.payload().len());
                if done {
                    if let Some(chunk) = current.take() {
                        reader.release(chunk);
                    }
                    *offset = 0;
                }
            }
            Source::Direct { offset, .. } => *offset += n,
        }
    }

    /// Load the next block once the current one has been sent.
    async fn load(&mut self) -> Block {
        match self {
            Source::Threaded {
                reader,
                current,
                offset,
                ..
            } => {
                let chunk = match reader.next().await {
                    Ok(chunk) => chunk,
                    Err(_) => return Block::Failed(serrno::SEINTERNAL),
                };
                if chunk.length > 0 {
                    *current = Some(chunk);
                    *offset = 0;
                    return Block::Loaded;
                }
                let block = match chunk.errno() {
                    Some(errno) => Block::Failed(errno),
                    None => Block::End,
                };
                reader.release(chunk);
                block
            }
            Source::Direct {
                handle,
                buf,
                len,
                offset,
                verify,
            } => {
                *offset = 0;
                *len = 0;
                match read_retrying(handle.as_mut(), buf) {
                    Ok(0) => match verify.as_ref().map(ReadChecksum::verify) {
                        Some(Err(errno)) => Block::Failed(errno),
                        _ => Block::End,
                    },
                    Ok(n) => {
                        if let Some(v) = verify.as_mut() {
                            v.update(&buf[..n]);
                        }
                        *len = n;
                        Block::Loaded
                    }
                    Err(e) => Block::Failed(io_errno(&e)),
                }
            }
        }
    }

    /// Stop reading and take the file handle back.
    async fn finish(self) -> Result<Box<dyn FileHandle>, RfioError> {
        match self {
            Source::Threaded {
                worker,
                mut reader,
                current,
                ..
            } => {
                if let Some(chunk) = current {
                    reader.release(chunk);
                }
                worker.request_stop();
                Ok(worker.join().await?.handle)
            }
            Source::Direct { handle, .. } => Ok(handle),
        }
    }
}

/// Where file data goes when writing.
enum Sink {
    Threaded {
        worker: Worker,
        writer: RingWriter,
    },
    Direct {
        handle: Box<dyn FileHandle>,
        checksum: Option<WriteChecksum>,
    },
}

struct Finished {
    handle: Box<dyn FileHandle>,
    error: Option<i32>,
    checksum: Option<WriteChecksum>,
    bytes: Option<u64>,
}

impl Sink {
    /// Hand the first `len` bytes of `inflight` to the disk. On the threaded
    /// path `inflight` is swapped with the buffer of a free ring slot.
    async fn flush(&mut self, inflight: &mut AlignedBuf, len: usize) -> Result<(), i32> {
        match self {
            Sink::Threaded { worker, writer } => {
                if let Some(errno) = worker.error() {
                    return Err(errno);
                }
                let mut chunk = writer
                    .claim()
                    .await
                    .map_err(|_| worker.error().unwrap_or(libc::EIO))?;
                std::mem::swap(&mut chunk.data, inflight);
                chunk.length = len as i64;
                writer.commit(chunk);
                Ok(())
            }
            Sink::Direct { handle, checksum } => {
                let block = &inflight[..len];
                write_block(handle.as_mut(), block)?;
                if let Some(c) = checksum.as_mut() {
                    c.update(block);
                }
                Ok(())
            }
        }
    }

    /// End the stream, with an error sentinel if `failure` is set, and take
    /// the file handle back.
    async fn finish(self, failure: Option<i32>, log: &Logger) -> Result<Finished, RfioError> {
        match self {
            Sink::Threaded { worker, mut writer } => {
                let sentinel = failure.map_or(0, |errno| -i64::from(errno));
                if writer.push_sentinel(sentinel).await.is_err() {
                    debug!(log, "consumer already gone");
                }
                let outcome = worker.join().await?;
                debug!(log, "consumer joined"; "bytes" => outcome.bytes,
                    "checksum" => ?outcome.checksum);
                Ok(Finished {
                    handle: outcome.handle,
                    error: outcome.error,
                    checksum: None,
                    bytes: Some(outcome.bytes),
                })
            }
            Sink::Direct { handle, checksum } => Ok(Finished {
                handle,
                error: None,
                checksum,
                bytes: None,
            }),
        }
    }
}

pub struct Transfer<'a> {
    control: &'a mut ControlStream,
    data: TcpStream,
    ctx: &'a ServerContext,
    log: Logger,
    state: TransferState,
}

impl<'a> Transfer<'a> {
    pub fn new(
        control: &'a mut ControlStream,
        data: TcpStream,
        ctx: &'a ServerContext,
        log: &Logger,
    ) -> Transfer<'a> {
        Transfer {
            control,
            data,
            ctx,
            log: log.clone(),
            state: TransferState::AwaitingFirstOp,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn enter(&mut self, state: TransferState) {
        debug!(self.log, "transfer state"; "from" => ?self.state, "to" => ?state);
        self.state = state;
    }

    async fn send_frame<F>(&mut self, encode: F) -> Result<(), RfioError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut buf = BytesMut::new();
        encode(&mut buf);
        self.control.get_mut().write_all(&buf).await?;
        Ok(())
    }

    /// What the control stream yielded, with the end of the stream turned
    /// into an error.
    fn control_frame(
        &self,
        frame: Option<Result<Request, RfioError>>,
    ) -> Result<Request, RfioError> {
        match frame {
            Some(result) => result,
            None => Err(RfioError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("control connection closed while {}", self.state.describe()),
            ))),
        }
    }

    async fn read_control(&mut self) -> Result<Request, RfioError> {
        let frame = self.control.next().await;
        self.control_frame(frame)
    }

    fn unexpected(&self, req: &Request) -> RfioError {
        RfioError::UnexpectedOpcode {
            opcode: req.header.opcode,
            state: self.state.describe(),
        }
    }

    /// Setup failed before streaming started: announce the error and give
    /// up on the session.
    async fn fail_setup(
        mut self,
        file: OpenFile,
        errno: i32,
    ) -> Result<TransferOutcome, RfioError> {
        error!(self.log, "transfer setup failed"; "errno" => errno);
        let _ = close_file(self.ctx, file, Some(errno), &self.log);
        self.send_frame(|buf| encode_error(buf, errno)).await?;
        self.enter(TransferState::Closed);
        Ok(TransferOutcome {
            bytes: 0,
            error: Some(errno),
        })
    }

    /// Send the file to the client.
    pub async fn read(mut self, file: OpenFile) -> Result<TransferOutcome, RfioError> {
        let settings = self.ctx.config.read;
        let (mut handle, detached) = Detached::split(file);

        let (offset, size) = match position(handle.as_mut()) {
            Ok(pos) => pos,
            Err(errno) => return self.fail_setup(detached.attach(handle), errno).await,
        };
        let remaining = size.saturating_sub(offset);
        let verify = if self.ctx.config.checksum_enabled() {
            ReadChecksum::start(handle.as_ref(), offset)
        } else {
            None
        };

        let mut source = if settings.use_threads {
            let ring = match RingBuffer::new(settings.nbuf, settings.buffer_size) {
                Ok(ring) => ring,
                Err(e) => {
                    let file = detached.attach(handle);
                    return self.fail_setup(file, io_errno(&e)).await;
                }
            };
            match Worker::spawn_producer(handle, ring.clone(), verify, &self.log) {
                Ok(worker) => Source::Threaded {
                    worker,
                    reader: RingReader::new(ring),
                    current: None,
                    offset: 0,
                },
                Err(failed) => {
                    let errno = failed.error.errno();
                    return self.fail_setup(detached.attach(failed.handle), errno).await;
                }
            }
        } else {
            match AlignedBuf::try_new(settings.buffer_size) {
                Ok(buf) => Source::Direct {
                    handle,
                    buf,
                    len: 0,
                    offset: 0,
                    verify,
                },
                Err(e) => {
                    let file = detached.attach(handle);
                    return self.fail_setup(file, io_errno(&e)).await;
                }
            }
        };
        set_socket_buffer(&self.data, settings.buffer_size, SocketBuffer::Send, &self.log);

        info!(self.log, "read started"; "path" => &detached.path,
            "offset" => offset, "bytes" => remaining,
            "threaded" => settings.use_threads);
        self.send_frame(|buf| encode_read_announcement(buf, remaining))
            .await?;
        self.enter(TransferState::Streaming);

        let mut eof = false;
        let mut sent = 0u64;
        let failure = loop {
            if !eof && source.unsent().is_empty() {
                match source.load().await {
                    Block::Loaded => {}
                    Block::End => {
                        eof = true;
                        debug!(self.log, "end of file"; "sent" => sent);
                        self.send_frame(encode_eof).await?;
                    }
                    Block::Failed(errno) => break Some(errno),
                }
            }

            // After end of file only the control connection is watched.
            tokio::select! {
                biased;
                frame = self.control.next() => {
                    let req = self.control_frame(frame)?;
                    if req.opcode() != Some(Opcode::CloseV3) {
                        return Err(self.unexpected(&req));
                    }
                    debug!(self.log, "close requested"; "sent" => sent, "eof" => eof);
                    break None;
                }
                written = self.data.write(source.unsent()), if !eof => {
                    let n = written?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    source.consume(n);
                    sent += n as u64;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    trace!(self.log, "poll timeout"; "sent" => sent);
                }
            }
        };

        if let Some(errno) = failure {
            warn!(self.log, "read failed"; "errno" => errno, "sent" => sent);
            self.send_frame(|buf| encode_error(buf, errno)).await?;
            let ack = self.read_control().await?;
            debug!(self.log, "error acknowledged"; "opcode" => ack.header.opcode);
        }

        let handle = source.finish().await?;
        self.close(detached.attach(handle), failure, sent).await
    }

    /// Receive the file from the client.
    pub async fn write(mut self, file: OpenFile) -> Result<TransferOutcome, RfioError> {
        let settings = self.ctx.config.write;
        let (handle, mut detached) = Detached::split(file);

        let mut inflight = match AlignedBuf::try_new(settings.buffer_size) {
            Ok(buf) => buf,
            Err(e) => return self.fail_setup(detached.attach(handle), io_errno(&e)).await,
        };
        let mut sink = if settings.use_threads {
            let ring = match RingBuffer::new(settings.nbuf, settings.buffer_size) {
                Ok(ring) => ring,
                Err(e) => {
                    let file = detached.attach(handle);
                    return self.fail_setup(file, io_errno(&e)).await;
                }
            };
            // The consumer takes over the checksum; a failed start hands it
            // back with the handle.
            let checksum = detached.checksum.take();
            match Worker::spawn_consumer(handle, ring.clone(), checksum.clone(), &self.log) {
                Ok(worker) => Sink::Threaded {
                    worker,
                    writer: RingWriter::new(ring),
                },
                Err(failed) => {
                    detached.checksum = checksum;
                    let errno = failed.error.errno();
                    return self.fail_setup(detached.attach(failed.handle), errno).await;
                }
            }
        } else {
            let checksum = detached.checksum.take();
            Sink::Direct { handle, checksum }
        };
        set_socket_buffer(&self.data, settings.buffer_size, SocketBuffer::Recv, &self.log);

        info!(self.log, "write started"; "path" => &detached.path,
            "threaded" => settings.use_threads);
        self.enter(TransferState::Streaming);

        let mut filled = 0usize;
        let mut from_network = 0u64;
        let mut to_disk = 0u64;
        let mut declared: Option<u64> = None;
        let mut data_eof = false;

        let failure = loop {
            let full = filled == inflight.len();
            let last = filled > 0 && declared == Some(from_network);
            if full || last {
                if let Err(errno) = sink.flush(&mut inflight, filled).await {
                    break Some(errno);
                }
                to_disk += filled as u64;
                filled = 0;
            }

            if let Some(total) = declared {
                if to_disk == total {
                    break None;
                }
                if from_network > total {
                    return Err(RfioError::Protocol(format!(
                        "received {} bytes but {} were declared",
                        from_network, total
                    )));
                }
                if data_eof {
                    return Err(RfioError::Protocol(format!(
                        "data connection closed after {} of {} bytes",
                        from_network, total
                    )));
                }
            }

            tokio::select! {
                biased;
                frame = self.control.next(), if declared.is_none() => {
                    let req = self.control_frame(frame)?;
                    if req.opcode() != Some(Opcode::CloseV3) {
                        return Err(self.unexpected(&req));
                    }
                    let total = CloseV3Request::decode(&req.body)?
                        .bytes_written
                        .ok_or_else(|| {
                            RfioError::Protocol("write closed without a byte count".into())
                        })?;
                    debug!(self.log, "close requested"; "declared" => total,
                        "received" => from_network);
                    declared = Some(total);
                }
                received = self.data.read(&mut inflight[filled..]), if !data_eof => {
                    match received? {
                        0 => {
                            debug!(self.log, "data connection closed by client";
                                "received" => from_network);
                            data_eof = true;
                        }
                        n => {
                            filled += n;
                            from_network += n as u64;
                        }
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    trace!(self.log, "poll timeout"; "received" => from_network,
                        "written" => to_disk);
                }
            }
        };

        if let Some(errno) = failure {
            let discarded = self.drain_on_error(errno).await?;
            debug!(self.log, "drained"; "discarded" => discarded);
        }

        let finished = sink.finish(failure, &self.log).await?;
        let pending = failure.or(finished.error);
        detached.checksum = finished.checksum;
        let bytes = finished.bytes.unwrap_or(to_disk);
        self.close(detached.attach(finished.handle), pending, bytes)
            .await
    }

    /// Announce `errno` and discard incoming data until the client
    /// acknowledges with a control frame. Returns the number of bytes
    /// discarded.
    pub async fn drain_on_error(&mut self, errno: i32) -> Result<u64, RfioError> {
        self.enter(TransferState::DrainingOnError);
        warn!(self.log, "write failed, draining the data connection"; "errno" => errno);
        self.send_frame(|buf| encode_error(buf, errno)).await?;

        let mut scratch = vec![0u8; DRAIN_BUFFER_SIZE];
        let mut data_open = true;
        let mut discarded = 0u64;
        loop {
            tokio::select! {
                biased;
                frame = self.control.next() => {
                    let ack = self.control_frame(frame)?;
                    debug!(self.log, "error acknowledged"; "opcode" => ack.header.opcode);
                    return Ok(discarded);
                }
                received = self.data.read(&mut scratch), if data_open => {
                    match received {
                        Ok(0) => data_open = false,
                        Ok(n) => discarded += n as u64,
                        Err(e) => {
                            debug!(self.log, "data connection failed while draining";
                                "err" => %e);
                            data_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    trace!(self.log, "waiting for the error acknowledgement";
                        "discarded" => discarded);
                }
            }
        }
    }

    /// Close sub-protocol. Ends the transfer and the session.
    async fn close(
        mut self,
        file: OpenFile,
        pending: Option<i32>,
        bytes: u64,
    ) -> Result<TransferOutcome, RfioError> {
        self.enter(TransferState::Closing);
        let result = close_file(self.ctx, file, pending, &self.log);

        let Transfer {
            control, data, log, ..
        } = self;
        drop(data);

        let mut buf = BytesMut::new();
        StatusReply::new(Opcode::CloseV3, result.map(|_| 0)).encode(&mut buf);
        let stream = control.get_mut();
        stream.write_all(&buf).await?;
        let _ = stream.shutdown().await;
        linger(stream).await;
        debug!(log, "transfer state"; "to" => ?TransferState::Closed,
            "bytes" => bytes);

        Ok(TransferOutcome {
            bytes,
            error: result.err(),
        })
    }
}

/// Read and drop whatever the client still sends until it closes its side,
/// for at most [`LINGER_TIMEOUT`].
async fn linger(stream: &mut TcpStream) {
    let mut scratch = [0u8; 512];
    let _ = tokio::time::timeout(LINGER_TIMEOUT, async {
        while let Ok(n) = stream.read(&mut scratch).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use slog::{o, Discard};
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    use crate::backend::LocalBackend;
    use crate::config::RfioConfig;
    use crate::message::STATUS_REPLY_SIZE;
    use crate::protocol::{encode_request, RfioCodec, Unmarshaller};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn drain_keeps_reading_until_acknowledged() {
        const BLOCK: usize = 64 * 1024;
        const BLOCKS: usize = 512;

        let (server_ctl, mut client_ctl) = pair().await;
        let (server_data, mut client_data) = pair().await;
        let ctx = ServerContext::new(RfioConfig::default(), Arc::new(LocalBackend));
        let mut server_ctl = FramedRead::new(server_ctl, RfioCodec::new(1024));
        let log = Logger::root(Discard, o!());

        let client = tokio::spawn(async move {
            let mut notice = [0u8; STATUS_REPLY_SIZE];
            client_ctl.read_exact(&mut notice).await.unwrap();
            // Far more than the socket buffers hold: this only completes if
            // the server keeps reading.
            let block = vec![0x5au8; BLOCK];
            for _ in 0..BLOCKS {
                client_data.write_all(&block).await.unwrap();
            }
            let mut ack = BytesMut::new();
            encode_request(Opcode::CloseV3, &[], &mut ack);
            client_ctl.write_all(&ack).await.unwrap();
            notice
        });

        let mut transfer = Transfer::new(&mut server_ctl, server_data, &ctx, &log);
        let discarded = tokio::time::timeout(
            Duration::from_secs(60),
            transfer.drain_on_error(libc::ENOSPC),
        )
        .await
        .expect("drain deadlocked")
        .unwrap();
        assert_eq!(transfer.state(), TransferState::DrainingOnError);

        let notice = client.await.unwrap();
        let mut cursor = Unmarshaller::new(&notice);
        assert_eq!(Opcode::from_word(cursor.word().unwrap()), Some(Opcode::Error));
        let reply = StatusReply::decode_after_opcode(Opcode::Error, &notice[2..]).unwrap();
        assert_eq!((reply.status, reply.errno), (-1, libc::ENOSPC));
        assert!(discarded >= (BLOCK * BLOCKS / 2) as u64);
    }

    #[test]
    fn states_describe_themselves() {
        assert_eq!(TransferState::Streaming.describe(), "streaming");
        assert_eq!(
            TransferState::DrainingOnError.describe(),
            "draining after an error"
        );
    }
}
