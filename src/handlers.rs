// Copyright 2020 Joyent, Inc.

//! Request handlers.
//!
//! Each handler decodes its request body, checks permissions, calls the
//! backend and answers with the reply layout of its opcode. Backend and
//! permission failures are answered, never fatal. Bodies that cannot be
//! decoded drop the connection, except for over-long strings, which are
//! answered with `SENAMETOOLONG`.

use std::io::{self, SeekFrom};
use std::net::IpAddr;

use bytes::BytesMut;
use rand::Rng;
use slog::{debug, info, warn, Logger};
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::auth::{
    authorize, Identity, OPEN_READ_CAPABILITIES, OPEN_WRITE_CAPABILITIES,
    STAT_CAPABILITIES,
};
use crate::backend::{LockOp, OpenFlags};
use crate::checksum::WriteChecksum;
use crate::error::{io_errno, RfioError};
use crate::message::{
    encode_error, encode_fstat_reply, encode_stat_reply, IoRequest,
    LockfRequest, LseekReply, LseekRequest, OpenReply, OpenRequest,
    ReadReplyHeader, StatRequest, StatusReply,
};
use crate::protocol::{Opcode, Request, NO_SEEK};
use crate::session::{close_file, read_payload, skip_payload, Flow, OpenFile, Session};
use crate::transfer::Transfer;
use crate::worker::{read_retrying, write_block};

/// Which kernel buffer of a socket to resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketBuffer {
    Send,
    Recv,
}

/// Resize a socket buffer to follow an I/O buffer. Failure only costs
/// throughput and is logged.
pub(crate) fn set_socket_buffer(
    stream: &TcpStream,
    size: usize,
    which: SocketBuffer,
    log: &Logger,
) {
    let sock = SockRef::from(stream);
    let result = match which {
        SocketBuffer::Send => sock.set_send_buffer_size(size),
        SocketBuffer::Recv => sock.set_recv_buffer_size(size),
    };
    if let Err(e) = result {
        warn!(log, "failed to resize socket buffer";
            "size" => size, "which" => ?which, "err" => %e);
    }
}

/// Bind the listener for a data connection on `ip`, on a port of the
/// inclusive `range`. The search starts at a random port so concurrent
/// sessions do not all race for the low end of the range. `(0, 0)` lets the
/// system pick.
pub(crate) async fn bind_data_listener(
    ip: IpAddr,
    range: (u16, u16),
) -> io::Result<TcpListener> {
    let (low, high) = range;
    if low == 0 && high == 0 {
        return TcpListener::bind((ip, 0)).await;
    }
    let span = match high.checked_sub(low) {
        Some(width) => u32::from(width) + 1,
        None => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
    };
    let start = rand::thread_rng().gen_range(0..span);
    for i in 0..span {
        let port = low + ((start + i) % span) as u16;
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::from_raw_os_error(libc::EADDRINUSE))
}

/// Decode failures that can still be answered.
fn answerable(err: RfioError) -> Result<i32, RfioError> {
    match err {
        RfioError::StringTooLong { .. } => Ok(err.errno()),
        other => Err(other),
    }
}

fn seek_from(whence: i32, offset: i64) -> Result<SeekFrom, i32> {
    match whence {
        0 if offset >= 0 => Ok(SeekFrom::Start(offset as u64)),
        1 => Ok(SeekFrom::Current(offset)),
        2 => Ok(SeekFrom::End(offset)),
        _ => Err(libc::EINVAL),
    }
}

impl Session {
    fn identity(&self, uid: u16, gid: u16, user: &str) -> Identity {
        Identity {
            uid: u32::from(uid),
            gid: u32::from(gid),
            user: user.to_string(),
            host: self.peer.ip(),
        }
    }

    pub(crate) async fn handle_open(
        &mut self,
        req: &Request,
        v3: bool,
    ) -> Result<Flow, RfioError> {
        let opcode = if v3 { Opcode::OpenV3 } else { Opcode::Open };
        let open = match OpenRequest::decode(&req.body) {
            Ok(open) => open,
            Err(e) => {
                let errno = answerable(e)?;
                self.send_encoded(|buf| OpenReply::failed(opcode, errno).encode(buf))
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        let (file, offset) = match self.open_file(&open) {
            Ok(opened) => opened,
            Err(errno) => {
                info!(self.log, "open failed"; "path" => &open.path, "errno" => errno);
                self.send_encoded(|buf| OpenReply::failed(opcode, errno).encode(buf))
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        info!(self.log, "file opened"; "path" => &file.path,
            "write" => file.flags.write, "offset" => offset, "v3" => v3);

        if !v3 {
            self.file = Some(file);
            let reply = OpenReply {
                opcode,
                status: 0,
                errno: 0,
                data_port: 0,
                offset,
            };
            self.send_encoded(|buf| reply.encode(buf)).await?;
            return Ok(Flow::Continue);
        }

        let local_ip = self.control.get_ref().local_addr()?.ip();
        let listener =
            match bind_data_listener(local_ip, self.ctx.config.port_range).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(self.log, "cannot bind data socket"; "err" => %e);
                    let errno = io_errno(&e);
                    let _ = close_file(&self.ctx, file, Some(errno), &self.log);
                    self.send_encoded(|buf| OpenReply::failed(opcode, errno).encode(buf))
                        .await?;
                    return Ok(Flow::Continue);
                }
            };
        let port = listener.local_addr()?.port();
        let reply = OpenReply {
            opcode,
            status: 0,
            errno: 0,
            data_port: i32::from(port),
            offset,
        };
        self.send_encoded(|buf| reply.encode(buf)).await?;

        match self.accept_data(listener).await {
            Ok(data) => {
                self.data = Some(data);
                self.file = Some(file);
                Ok(Flow::Continue)
            }
            Err(e) => {
                let _ = close_file(&self.ctx, file, Some(e.errno()), &self.log);
                Err(e)
            }
        }
    }

    fn open_file(&mut self, open: &OpenRequest) -> Result<(OpenFile, i64), i32> {
        if self.file.is_some() {
            return Err(libc::EBUSY);
        }
        let mut flags = OpenFlags::from_wire(open.flags);
        flags.direct = self.ctx.config.direct_io;

        let identity = self.identity(open.uid, open.gid, &open.user);
        let capabilities = if flags.write {
            OPEN_WRITE_CAPABILITIES
        } else {
            OPEN_READ_CAPABILITIES
        };
        let granted = authorize(self.ctx.authorizer.as_ref(), &identity, capabilities)
            .map_err(|e| {
                warn!(self.log, "open refused"; "user" => &open.user,
                    "path" => &open.path);
                e.errno()
            })?;
        debug!(self.log, "open authorized"; "capability" => granted);

        let mode = open.mode & !open.umask & 0o7777;
        let mut handle = self
            .ctx
            .backend
            .open(&open.path, &flags, mode)
            .map_err(|e| io_errno(&e))?;
        let whence = if flags.append {
            SeekFrom::End(0)
        } else {
            SeekFrom::Current(0)
        };
        let offset = handle.lseek(whence).map_err(|e| io_errno(&e))?;

        let prealloc = self.ctx.config.preallocation_size;
        if flags.write && prealloc > 0 {
            if let Err(e) = handle.preallocate(prealloc) {
                warn!(self.log, "preallocation failed"; "bytes" => prealloc, "err" => %e);
            }
        }
        let checksum = if flags.write && self.ctx.config.checksum_enabled() {
            Some(WriteChecksum::start(handle.as_ref(), offset))
        } else {
            None
        };

        Ok((
            OpenFile {
                handle,
                path: open.path.clone(),
                flags,
                checksum,
            },
            offset as i64,
        ))
    }

    /// Wait for the client to connect to the data listener. Connections from
    /// any host but the control peer are turned away. Running out of time is
    /// fatal to the session.
    async fn accept_data(&mut self, listener: TcpListener) -> Result<TcpStream, RfioError> {
        let peer_ip = self.peer.ip();
        let log = self.log.clone();
        let accept = async {
            loop {
                let (stream, addr) = listener.accept().await?;
                if addr.ip() == peer_ip {
                    debug!(log, "data connection accepted"; "addr" => %addr);
                    return Ok::<_, io::Error>(stream);
                }
                warn!(log, "rejected data connection from another host";
                    "addr" => %addr);
            }
        };
        match tokio::time::timeout(self.ctx.config.accept_timeout, accept).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RfioError::Timeout("waiting for the data connection")),
        }
    }

    pub(crate) async fn handle_stat(
        &mut self,
        req: &Request,
        lstat: bool,
    ) -> Result<Flow, RfioError> {
        self.stats.stats += 1;
        let stat = match StatRequest::decode(&req.body) {
            Ok(stat) => stat,
            Err(e) => {
                let errno = answerable(e)?;
                self.send_encoded(|buf| encode_stat_reply(buf, Err(errno))).await?;
                return Ok(Flow::Continue);
            }
        };

        let identity = self.identity(stat.uid, stat.gid, "");
        let result = match authorize(self.ctx.authorizer.as_ref(), &identity, STAT_CAPABILITIES)
        {
            Err(e) => Err(e.errno()),
            Ok(_) if lstat => self.ctx.backend.lstat(&stat.path).map_err(|e| io_errno(&e)),
            Ok(_) => self.ctx.backend.stat(&stat.path).map_err(|e| io_errno(&e)),
        };
        debug!(self.log, "stat"; "path" => &stat.path, "lstat" => lstat,
            "ok" => result.is_ok());
        self.send_encoded(|buf| encode_stat_reply(buf, result.as_ref().map_err(|e| *e)))
            .await?;
        Ok(Flow::Continue)
    }

    pub(crate) async fn handle_fstat(&mut self) -> Result<Flow, RfioError> {
        self.stats.stats += 1;
        let result = match self.file.as_ref() {
            Some(file) => file.handle.fstat().map_err(|e| io_errno(&e)),
            None => Err(libc::EBADF),
        };
        self.send_encoded(|buf| encode_fstat_reply(buf, result.as_ref().map_err(|e| *e)))
            .await?;
        Ok(Flow::Continue)
    }

    pub(crate) async fn handle_lseek(&mut self, req: &Request) -> Result<Flow, RfioError> {
        self.stats.seeks += 1;
        let seek = LseekRequest::decode(&req.body)?;
        let result = match self.file.as_mut() {
            None => Err(libc::EBADF),
            Some(file) => seek_from(seek.whence, seek.offset).and_then(|pos| {
                file.handle.lseek(pos).map_err(|e| io_errno(&e))
            }),
        };
        let reply = match result {
            Ok(offset) => LseekReply {
                offset: offset as i64,
                errno: 0,
            },
            Err(errno) => LseekReply { offset: -1, errno },
        };
        self.send_encoded(|buf| reply.encode(buf)).await?;
        Ok(Flow::Continue)
    }

    /// Seek if asked to and make the I/O buffer large enough for `io.size`.
    fn prepare_read(&mut self, io: &IoRequest) -> Result<usize, i32> {
        if io.size < 0 {
            return Err(libc::EINVAL);
        }
        let size = io.size as usize;
        let file = self.file.as_mut().ok_or(libc::EBADF)?;
        if io.how != NO_SEEK {
            let pos = seek_from(io.how, io.offset)?;
            file.handle.lseek(pos).map_err(|e| io_errno(&e))?;
        }
        if let Some(capacity) = self
            .io_buf
            .ensure_capacity(size)
            .map_err(|e| io_errno(&e))?
        {
            set_socket_buffer(self.control.get_ref(), capacity, SocketBuffer::Send, &self.log);
        }
        Ok(size)
    }

    fn read_block(&mut self, size: usize) -> Result<usize, i32> {
        let file = self.file.as_mut().ok_or(libc::EBADF)?;
        read_retrying(file.handle.as_mut(), self.io_buf.get_mut(size))
            .map_err(|e| io_errno(&e))
    }

    async fn send_read_reply(&mut self, result: Result<usize, i32>) -> Result<(), RfioError> {
        let mut buf = BytesMut::new();
        match result {
            Ok(n) => {
                ReadReplyHeader {
                    status: n as i32,
                    errno: 0,
                    data_len: n,
                }
                .encode(&mut buf);
                buf.extend_from_slice(self.io_buf.get(n));
            }
            Err(errno) => ReadReplyHeader {
                status: -1,
                errno,
                data_len: 0,
            }
            .encode(&mut buf),
        }
        self.send(&buf).await
    }

    pub(crate) async fn handle_read(&mut self, req: &Request) -> Result<Flow, RfioError> {
        self.stats.reads += 1;
        let io = IoRequest::decode(&req.body)?;
        let result = self
            .prepare_read(&io)
            .and_then(|size| self.read_block(size));
        self.send_read_reply(result).await?;
        Ok(Flow::Continue)
    }

    /// Stream the file from the current position in replies of at most
    /// `io.size` bytes until end of file or an error.
    pub(crate) async fn handle_readahead(
        &mut self,
        req: &Request,
    ) -> Result<Flow, RfioError> {
        self.stats.reads += 1;
        let io = IoRequest::decode(&req.body)?;
        let size = match self.prepare_read(&io) {
            Ok(size) => size,
            Err(errno) => {
                self.send_read_reply(Err(errno)).await?;
                return Ok(Flow::Continue);
            }
        };
        let mut total = 0u64;
        loop {
            let result = self.read_block(size);
            self.send_read_reply(result).await?;
            match result {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n as u64,
            }
        }
        debug!(self.log, "read-ahead done"; "bytes" => total);
        Ok(Flow::Continue)
    }

    /// Legacy write: the payload follows the request frame on the control
    /// socket and is always consumed, even when the write is refused.
    pub(crate) async fn handle_write(&mut self, req: &Request) -> Result<Flow, RfioError> {
        self.stats.writes += 1;
        let io = IoRequest::decode(&req.body)?;
        if io.size < 0 {
            self.send_encoded(|buf| {
                StatusReply::new(Opcode::Write, Err(libc::EINVAL)).encode(buf)
            })
            .await?;
            return Ok(Flow::Continue);
        }
        let size = io.size as usize;

        match self.io_buf.ensure_capacity(size) {
            Ok(Some(capacity)) => {
                set_socket_buffer(self.control.get_ref(), capacity, SocketBuffer::Recv, &self.log)
            }
            Ok(None) => {}
            Err(e) => {
                warn!(self.log, "cannot grow I/O buffer"; "size" => size, "err" => %e);
                skip_payload(&mut self.control, size as u64).await?;
                self.send_encoded(|buf| {
                    StatusReply::new(Opcode::Write, Err(io_errno(&e))).encode(buf)
                })
                .await?;
                return Ok(Flow::Continue);
            }
        }
        read_payload(&mut self.control, self.io_buf.get_mut(size)).await?;

        let result = self.write_from_buffer(&io, size);
        if let Err(errno) = result {
            info!(self.log, "write failed"; "errno" => errno);
        }
        self.send_encoded(|buf| {
            StatusReply::new(Opcode::Write, result.map(|n| n as i32)).encode(buf)
        })
        .await?;
        Ok(Flow::Continue)
    }

    fn write_from_buffer(&mut self, io: &IoRequest, size: usize) -> Result<usize, i32> {
        let file = self.file.as_mut().ok_or(libc::EBADF)?;
        if !file.flags.write {
            return Err(libc::EBADF);
        }
        if io.how != NO_SEEK {
            let pos = seek_from(io.how, io.offset)?;
            file.handle.lseek(pos).map_err(|e| io_errno(&e))?;
        }
        let data = self.io_buf.get(size);
        write_block(file.handle.as_mut(), data)?;
        if let Some(checksum) = file.checksum.as_mut() {
            match file.handle.lseek(SeekFrom::Current(0)) {
                Ok(end) => checksum.update_at(end - size as u64, data),
                Err(_) => checksum.invalidate(),
            }
        }
        Ok(size)
    }

    pub(crate) async fn handle_lockf(&mut self, req: &Request) -> Result<Flow, RfioError> {
        self.stats.lockfs += 1;
        let lock = LockfRequest::decode(&req.body)?;
        let result = match (self.file.as_mut(), LockOp::from_wire(lock.op)) {
            (None, _) => Err(libc::EBADF),
            (Some(_), None) => Err(libc::EINVAL),
            (Some(file), Some(op)) => file
                .handle
                .lockf(op, lock.length)
                .map(|_| 0)
                .map_err(|e| io_errno(&e)),
        };
        self.send_encoded(|buf| StatusReply::new(Opcode::Lockf, result).encode(buf))
            .await?;
        Ok(Flow::Continue)
    }

    fn close_current(&mut self) -> Result<i32, i32> {
        self.data = None;
        match self.file.take() {
            Some(file) => close_file(&self.ctx, file, None, &self.log).map(|_| 0),
            None => Err(libc::EBADF),
        }
    }

    /// Legacy close. The connection stays up for further requests.
    pub(crate) async fn handle_close(&mut self) -> Result<Flow, RfioError> {
        let result = self.close_current();
        self.send_encoded(|buf| StatusReply::new(Opcode::Close, result).encode(buf))
            .await?;
        Ok(Flow::Continue)
    }

    /// v3 close without any transfer in between. Ends the session.
    pub(crate) async fn handle_close_v3(&mut self) -> Result<Flow, RfioError> {
        let result = self.close_current();
        self.send_encoded(|buf| StatusReply::new(Opcode::CloseV3, result).encode(buf))
            .await?;
        let _ = self.control.get_mut().shutdown().await;
        Ok(Flow::End)
    }

    /// Hand the open file and the data connection to the transfer state
    /// machine. The session ends with the transfer.
    pub(crate) async fn handle_transfer(&mut self, opcode: Opcode) -> Result<Flow, RfioError> {
        let (file, data) = match (self.file.take(), self.data.take()) {
            (Some(file), Some(data)) => (file, data),
            (file, data) => {
                warn!(self.log, "transfer requested without a v3 open";
                    "opcode" => ?opcode);
                self.file = file;
                self.data = data;
                self.send_encoded(|buf| encode_error(buf, libc::EBADF)).await?;
                return Ok(Flow::End);
            }
        };

        if opcode == Opcode::ReadV3 {
            self.stats.reads += 1;
        } else {
            self.stats.writes += 1;
        }
        let transfer = Transfer::new(&mut self.control, data, &self.ctx, &self.log);
        let outcome = if opcode == Opcode::ReadV3 {
            transfer.read(file).await?
        } else {
            transfer.write(file).await?
        };
        info!(self.log, "transfer finished"; "opcode" => ?opcode,
            "bytes" => outcome.bytes, "errno" => outcome.error.unwrap_or(0));
        Ok(Flow::End)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whence_mapping() {
        assert_eq!(seek_from(0, 10), Ok(SeekFrom::Start(10)));
        assert_eq!(seek_from(0, -1), Err(libc::EINVAL));
        assert_eq!(seek_from(1, -5), Ok(SeekFrom::Current(-5)));
        assert_eq!(seek_from(2, 0), Ok(SeekFrom::End(0)));
        assert_eq!(seek_from(7, 0), Err(libc::EINVAL));
    }

    #[test]
    fn only_long_strings_are_answered() {
        assert_eq!(
            answerable(RfioError::StringTooLong { capacity: 3 }).unwrap(),
            crate::error::serrno::SENAMETOOLONG
        );
        assert!(answerable(RfioError::Truncated {
            needed: 4,
            remaining: 0
        })
        .is_err());
    }

    #[tokio::test]
    async fn data_listener_stays_in_range() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = bind_data_listener(ip, (0, 0)).await.unwrap();
        let port = first.local_addr().unwrap().port();
        drop(first);

        // A range of one port that is free binds exactly that port.
        let listener = bind_data_listener(ip, (port, port)).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);

        // With that port taken the search fails rather than leaving the range.
        let err = bind_data_listener(ip, (port, port)).await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
    }

    #[tokio::test]
    async fn reversed_port_range_is_refused() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let err = bind_data_listener(ip, (40010, 40000)).await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
