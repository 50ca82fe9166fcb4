// Copyright 2020 Joyent, Inc.

//! This module provides a client for talking to an RFIO server: the legacy
//! request/reply operations and the v3 streaming transfers.
//!
//! The client follows the server's rules for errors during a transfer: an
//! error notification received on the control connection is acknowledged
//! with a close frame, after which the server sends its final status.
//!
//! Everything the server sends on the control connection lands in a single
//! buffer first, so a transfer loop can wait on the control and data
//! connections together without losing part of a frame.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::backend::FileStat;
use crate::error::RfioError;
use crate::message::{
    decode_fstat_body, decode_fstat_header, decode_stat_reply, CloseV3Request,
    IoRequest, LockfRequest, LseekReply, LseekRequest, OpenReply, OpenRequest,
    ReadReplyHeader, StatRequest, StatusReply, FSTAT_HEADER_SIZE,
    LSEEK_REPLY_SIZE, OPEN_REPLY_SIZE, READ_REPLY_HEADER_SIZE,
    STATUS_REPLY_SIZE, STAT_REPLY_SIZE,
};
use crate::protocol::{encode_request, Opcode, LONGSIZE, NO_SEEK};

const TRANSFER_BLOCK: usize = 64 * 1024;
const CONTROL_READ_SIZE: usize = 4096;

/// Result of a v3 read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// The byte count the server announced.
    pub announced: u64,
    pub received: u64,
    /// Set when the server reported an error instead of end of file.
    pub error: Option<i32>,
}

/// Result of a v3 write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub sent: u64,
    /// Set when the server reported an error while data was being sent.
    pub error: Option<i32>,
}

/// A frame the server may send in the middle of a v3 transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    Eof,
    Error(i32),
}

/// Take one complete notice off the front of `pending`. Returns `None`
/// until the whole frame has arrived.
fn take_notice(
    pending: &mut BytesMut,
    state: &'static str,
) -> Result<Option<Notice>, RfioError> {
    if pending.len() < 2 {
        return Ok(None);
    }
    let word = u16::from_be_bytes([pending[0], pending[1]]);
    match Opcode::from_word(word) {
        Some(Opcode::Eof) => {
            pending.advance(2);
            Ok(Some(Notice::Eof))
        }
        Some(Opcode::Error) if pending.len() < STATUS_REPLY_SIZE => Ok(None),
        Some(Opcode::Error) => {
            let frame = pending.split_to(STATUS_REPLY_SIZE);
            let reply = StatusReply::decode_after_opcode(Opcode::Error, &frame[2..])?;
            Ok(Some(Notice::Error(reply.errno)))
        }
        _ => Err(RfioError::UnexpectedOpcode {
            opcode: word,
            state,
        }),
    }
}

pub struct RfioClient {
    control: TcpStream,
    /// Bytes received on the control connection and not consumed yet.
    pending: BytesMut,
    data: Option<TcpStream>,
    uid: u16,
    gid: u16,
    user: String,
}

impl RfioClient {
    pub async fn connect(addr: SocketAddr) -> Result<RfioClient, RfioError> {
        let control = TcpStream::connect(addr).await?;
        Ok(RfioClient {
            control,
            pending: BytesMut::new(),
            data: None,
            uid: 0,
            gid: 0,
            user: String::new(),
        })
    }

    pub fn with_identity(mut self, uid: u16, gid: u16, user: &str) -> RfioClient {
        self.uid = uid;
        self.gid = gid;
        self.user = user.to_string();
        self
    }

    /// The data connection of a v3 open, for callers driving it directly.
    pub fn data_stream(&mut self) -> Option<&mut TcpStream> {
        self.data.as_mut()
    }

    async fn request<F>(&mut self, opcode: Opcode, body: F) -> Result<(), RfioError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut encoded = BytesMut::new();
        body(&mut encoded);
        let mut frame = BytesMut::new();
        encode_request(opcode, &encoded, &mut frame);
        self.control.write_all(&frame).await?;
        Ok(())
    }

    /// Read more of the control connection into `pending`. The read is
    /// cancel safe: bytes are never lost if the future is dropped.
    async fn fill(control: &mut TcpStream, pending: &mut BytesMut) -> Result<(), RfioError> {
        pending.reserve(CONTROL_READ_SIZE);
        if control.read_buf(pending).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed by the server",
            )
            .into());
        }
        Ok(())
    }

    async fn reply(&mut self, len: usize) -> Result<Vec<u8>, RfioError> {
        while self.pending.len() < len {
            RfioClient::fill(&mut self.control, &mut self.pending).await?;
        }
        Ok(self.pending.split_to(len).to_vec())
    }

    async fn reply_word(&mut self) -> Result<u16, RfioError> {
        let raw = self.reply(2).await?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    async fn status_reply(&mut self) -> Result<StatusReply, RfioError> {
        let raw = self.reply(STATUS_REPLY_SIZE).await?;
        let word = u16::from_be_bytes([raw[0], raw[1]]);
        let opcode = Opcode::from_word(word).ok_or(RfioError::UnexpectedOpcode {
            opcode: word,
            state: "reading a status reply",
        })?;
        StatusReply::decode_after_opcode(opcode, &raw[2..])
    }

    /// The errno of an error notification whose opcode word has already
    /// been read.
    async fn error_body(&mut self) -> Result<i32, RfioError> {
        let raw = self.reply(2 * LONGSIZE).await?;
        Ok(StatusReply::decode_after_opcode(Opcode::Error, &raw)?.errno)
    }

    fn open_request(&self, path: &str, flags: u32, mode: u32) -> OpenRequest {
        OpenRequest {
            uid: self.uid,
            gid: self.gid,
            umask: 0,
            flags,
            mode,
            user: self.user.clone(),
            path: path.to_string(),
        }
    }

    /// Legacy open. `flags` uses the wire flag values.
    pub async fn open(
        &mut self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> Result<OpenReply, RfioError> {
        let open = self.open_request(path, flags, mode);
        self.request(Opcode::Open, |buf| open.encode(buf)).await?;
        OpenReply::decode(&self.reply(OPEN_REPLY_SIZE).await?)
    }

    /// v3 open. On success the data connection is established before
    /// returning.
    pub async fn open_v3(
        &mut self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> Result<OpenReply, RfioError> {
        let open = self.open_request(path, flags, mode);
        self.request(Opcode::OpenV3, |buf| open.encode(buf)).await?;
        let reply = OpenReply::decode(&self.reply(OPEN_REPLY_SIZE).await?)?;
        if reply.status == 0 {
            let ip = self.control.peer_addr()?.ip();
            let port = reply.data_port as u16;
            self.data = Some(TcpStream::connect((ip, port)).await?);
        }
        Ok(reply)
    }

    /// Ask for the open file and wait for the announced byte count. The
    /// file bytes then arrive on [`RfioClient::data_stream`].
    pub async fn start_read_v3(&mut self) -> Result<Result<u64, i32>, RfioError> {
        self.request(Opcode::ReadV3, |_| {}).await?;

        let word = self.reply_word().await?;
        match Opcode::from_word(word) {
            Some(Opcode::ReadV3) => {
                let raw = self.reply(8).await?;
                Ok(Ok(u64::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ])))
            }
            Some(Opcode::Error) => Ok(Err(self.error_body().await?)),
            _ => Err(RfioError::UnexpectedOpcode {
                opcode: word,
                state: "waiting for a read announcement",
            }),
        }
    }

    /// Stream the open file into `out`.
    pub async fn read_v3(&mut self, out: &mut Vec<u8>) -> Result<ReadOutcome, RfioError> {
        let announced = match self.start_read_v3().await? {
            Ok(announced) => announced,
            Err(errno) => {
                return Ok(ReadOutcome {
                    announced: 0,
                    received: 0,
                    error: Some(errno),
                })
            }
        };

        let data = self
            .data
            .as_mut()
            .ok_or_else(|| RfioError::Protocol("no data connection".into()))?;
        let mut buf = vec![0u8; TRANSFER_BLOCK];
        let mut received = 0u64;
        let mut eof = false;
        loop {
            if !eof {
                match take_notice(&mut self.pending, "reading a file")? {
                    Some(Notice::Eof) => eof = true,
                    Some(Notice::Error(errno)) => {
                        return Ok(ReadOutcome {
                            announced,
                            received,
                            error: Some(errno),
                        });
                    }
                    None => {}
                }
            }
            if eof && received >= announced {
                break;
            }
            tokio::select! {
                biased;
                filled = RfioClient::fill(&mut self.control, &mut self.pending), if !eof => {
                    filled?;
                }
                n = data.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                    received += n as u64;
                }
            }
        }
        Ok(ReadOutcome {
            announced,
            received,
            error: None,
        })
    }

    /// Stream `payload` to the open file. Stops early if the server reports
    /// an error.
    pub async fn write_v3(&mut self, payload: &[u8]) -> Result<WriteOutcome, RfioError> {
        self.request(Opcode::WriteV3, |_| {}).await?;

        let data = self
            .data
            .as_mut()
            .ok_or_else(|| RfioError::Protocol("no data connection".into()))?;
        let mut sent = 0usize;
        while sent < payload.len() {
            match take_notice(&mut self.pending, "writing a file")? {
                Some(Notice::Error(errno)) => {
                    return Ok(WriteOutcome {
                        sent: sent as u64,
                        error: Some(errno),
                    });
                }
                Some(Notice::Eof) => {
                    return Err(RfioError::UnexpectedOpcode {
                        opcode: Opcode::Eof.as_word(),
                        state: "writing a file",
                    });
                }
                None => {}
            }
            let end = payload.len().min(sent + TRANSFER_BLOCK);
            tokio::select! {
                biased;
                filled = RfioClient::fill(&mut self.control, &mut self.pending) => {
                    filled?;
                }
                n = data.write(&payload[sent..end]) => {
                    sent += n?;
                }
            }
        }
        Ok(WriteOutcome {
            sent: sent as u64,
            error: None,
        })
    }

    /// End a v3 transfer. Writers pass the number of bytes they sent.
    /// Error notifications still in flight are acknowledged; the returned
    /// reply is the server's final status.
    pub async fn close_v3(
        &mut self,
        bytes_written: Option<u64>,
    ) -> Result<StatusReply, RfioError> {
        let close = CloseV3Request { bytes_written };
        self.request(Opcode::CloseV3, |buf| close.encode(buf)).await?;
        loop {
            let word = self.reply_word().await?;
            match Opcode::from_word(word) {
                Some(Opcode::Eof) => continue,
                Some(Opcode::Error) => {
                    self.error_body().await?;
                    self.request(Opcode::CloseV3, |_| {}).await?;
                }
                Some(Opcode::CloseV3) => {
                    let raw = self.reply(2 * LONGSIZE).await?;
                    self.data = None;
                    return StatusReply::decode_after_opcode(Opcode::CloseV3, &raw);
                }
                _ => {
                    return Err(RfioError::UnexpectedOpcode {
                        opcode: word,
                        state: "closing a transfer",
                    })
                }
            }
        }
    }

    async fn stat_common(
        &mut self,
        opcode: Opcode,
        path: &str,
    ) -> Result<Result<FileStat, i32>, RfioError> {
        let stat = StatRequest {
            uid: self.uid,
            gid: self.gid,
            path: path.to_string(),
        };
        self.request(opcode, |buf| stat.encode(buf)).await?;
        decode_stat_reply(&self.reply(STAT_REPLY_SIZE).await?)
    }

    pub async fn stat(&mut self, path: &str) -> Result<Result<FileStat, i32>, RfioError> {
        self.stat_common(Opcode::Stat, path).await
    }

    pub async fn lstat(&mut self, path: &str) -> Result<Result<FileStat, i32>, RfioError> {
        self.stat_common(Opcode::Lstat, path).await
    }

    pub async fn fstat(&mut self) -> Result<Result<FileStat, i32>, RfioError> {
        self.request(Opcode::Fstat, |_| {}).await?;
        let (status, errno, len) =
            decode_fstat_header(&self.reply(FSTAT_HEADER_SIZE).await?)?;
        if status != 0 {
            return Ok(Err(errno));
        }
        Ok(Ok(decode_fstat_body(&self.reply(len).await?)?))
    }

    pub async fn lseek(&mut self, offset: i64, whence: i32) -> Result<LseekReply, RfioError> {
        let seek = LseekRequest { offset, whence };
        self.request(Opcode::Lseek, |buf| seek.encode(buf)).await?;
        LseekReply::decode(&self.reply(LSEEK_REPLY_SIZE).await?)
    }

    async fn read_reply(&mut self) -> Result<Result<Vec<u8>, i32>, RfioError> {
        let header = ReadReplyHeader::decode(&self.reply(READ_REPLY_HEADER_SIZE).await?)?;
        if header.status < 0 {
            return Ok(Err(header.errno));
        }
        Ok(Ok(self.reply(header.data_len).await?))
    }

    /// Legacy read of up to `size` bytes at the current position.
    pub async fn read(&mut self, size: i32) -> Result<Result<Vec<u8>, i32>, RfioError> {
        self.read_at(size, NO_SEEK, 0).await
    }

    /// Legacy read, seeking first unless `how` is [`NO_SEEK`].
    pub async fn read_at(
        &mut self,
        size: i32,
        how: i32,
        offset: i64,
    ) -> Result<Result<Vec<u8>, i32>, RfioError> {
        let io = IoRequest { size, how, offset };
        self.request(Opcode::Read, |buf| io.encode(buf)).await?;
        self.read_reply().await
    }

    /// Read the rest of the file in replies of up to `size` bytes.
    pub async fn readahead(&mut self, size: i32) -> Result<Result<Vec<u8>, i32>, RfioError> {
        let io = IoRequest {
            size,
            how: NO_SEEK,
            offset: 0,
        };
        self.request(Opcode::ReadAhead, |buf| io.encode(buf)).await?;
        let mut out = Vec::new();
        loop {
            match self.read_reply().await? {
                Ok(block) if block.is_empty() => return Ok(Ok(out)),
                Ok(block) => out.extend_from_slice(&block),
                Err(errno) => return Ok(Err(errno)),
            }
        }
    }

    /// Legacy write; the payload follows the request frame.
    pub async fn write(&mut self, payload: &[u8]) -> Result<StatusReply, RfioError> {
        let io = IoRequest {
            size: payload.len() as i32,
            how: NO_SEEK,
            offset: 0,
        };
        self.request(Opcode::Write, |buf| io.encode(buf)).await?;
        self.control.write_all(payload).await?;
        self.status_reply().await
    }

    pub async fn lockf(&mut self, op: i32, length: i64) -> Result<StatusReply, RfioError> {
        let lock = LockfRequest { op, length };
        self.request(Opcode::Lockf, |buf| lock.encode(buf)).await?;
        self.status_reply().await
    }

    /// Legacy close; the connection stays usable.
    pub async fn close(&mut self) -> Result<StatusReply, RfioError> {
        self.request(Opcode::Close, |_| {}).await?;
        self.status_reply().await
    }

    /// End the session.
    pub async fn end(mut self) -> Result<(), RfioError> {
        self.request(Opcode::End, |_| {}).await?;
        self.control.shutdown().await?;
        Ok(())
    }
}
