// Copyright 2020 Joyent, Inc.

//! One session per accepted control connection.
//!
//! The session reads request frames off the control socket one at a time and
//! dispatches them to the handlers. It owns at most one open file and, after
//! a v3 open, the data connection that goes with it. A v3 read or write
//! request hands both over to the transfer state machine, which runs until
//! the file is closed and ends the session.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use slog::{debug, info, o, warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::auth::{Authorizer, CloseNotifier, HostAuthorizer, NoopNotifier};
use crate::backend::{Backend, FileHandle, OpenFlags};
use crate::buffer::GrowableBuffer;
use crate::checksum::WriteChecksum;
use crate::config::RfioConfig;
use crate::error::{io_errno, RfioError};
use crate::protocol::{ControlStream, Opcode, Request, RfioCodec};

/// Everything a session needs that outlives it.
pub struct ServerContext {
    pub config: RfioConfig,
    pub backend: Arc<dyn Backend>,
    pub authorizer: Arc<dyn Authorizer>,
    pub notifier: Arc<dyn CloseNotifier>,
}

impl ServerContext {
    /// A context using the host-list authorizer built from `config` and no
    /// close notification.
    pub fn new(config: RfioConfig, backend: Arc<dyn Backend>) -> ServerContext {
        let authorizer = Arc::new(HostAuthorizer::from_config(&config));
        ServerContext {
            config,
            backend,
            authorizer,
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> ServerContext {
        self.authorizer = authorizer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CloseNotifier>) -> ServerContext {
        self.notifier = notifier;
        self
    }
}

/// The file a session has open.
pub(crate) struct OpenFile {
    pub handle: Box<dyn FileHandle>,
    pub path: String,
    pub flags: OpenFlags,
    /// Checksum of data written through this session, when enabled and not
    /// handed to a consumer thread.
    pub checksum: Option<WriteChecksum>,
}

/// Per-session operation counters, logged when the session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub reads: u64,
    pub writes: u64,
    pub seeks: u64,
    pub stats: u64,
    pub lockfs: u64,
}

/// What the dispatch loop does after a request has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    End,
}

pub struct Session {
    pub(crate) control: ControlStream,
    pub(crate) peer: SocketAddr,
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) log: Logger,
    pub(crate) file: Option<OpenFile>,
    pub(crate) data: Option<TcpStream>,
    pub(crate) io_buf: GrowableBuffer,
    pub(crate) stats: SessionStats,
}

impl Session {
    pub fn new(
        control: TcpStream,
        ctx: Arc<ServerContext>,
        log: &Logger,
    ) -> Result<Session, RfioError> {
        let peer = control.peer_addr()?;
        let log = log.new(o!("peer" => peer.to_string()));
        let codec = RfioCodec::new(ctx.config.max_request_size);
        Ok(Session {
            control: FramedRead::new(control, codec),
            peer,
            ctx,
            log,
            file: None,
            data: None,
            io_buf: GrowableBuffer::new(),
            stats: SessionStats::default(),
        })
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Serve requests until the client ends the session, the connection
    /// drops, or a fatal error occurs. A file left open is closed.
    pub async fn run(mut self) -> Result<SessionStats, RfioError> {
        debug!(self.log, "session started");
        let result = self.dispatch_loop().await;

        if let Some(file) = self.file.take() {
            debug!(self.log, "closing file left open"; "path" => &file.path);
            if let Err(errno) = close_file(&self.ctx, file, None, &self.log) {
                warn!(self.log, "close at session end failed"; "errno" => errno);
            }
        }

        let stats = self.stats;
        info!(self.log, "session ended";
            "reads" => stats.reads,
            "writes" => stats.writes,
            "seeks" => stats.seeks,
            "stats" => stats.stats,
            "lockfs" => stats.lockfs);
        result.map(|_| stats)
    }

    async fn dispatch_loop(&mut self) -> Result<(), RfioError> {
        loop {
            let req = match self.control.next().await.transpose()? {
                Some(req) => req,
                None => {
                    debug!(self.log, "client closed the control connection");
                    return Ok(());
                }
            };
            let opcode = req.opcode().ok_or(RfioError::UnexpectedOpcode {
                opcode: req.header.opcode,
                state: "awaiting a request",
            })?;
            debug!(self.log, "request"; "opcode" => ?opcode, "len" => req.body.len());

            if self.dispatch(opcode, &req).await? == Flow::End {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, opcode: Opcode, req: &Request) -> Result<Flow, RfioError> {
        match opcode {
            Opcode::Open => self.handle_open(req, false).await,
            Opcode::OpenV3 => self.handle_open(req, true).await,
            Opcode::Stat => self.handle_stat(req, false).await,
            Opcode::Lstat => self.handle_stat(req, true).await,
            Opcode::Fstat => self.handle_fstat().await,
            Opcode::Lseek => self.handle_lseek(req).await,
            Opcode::Read => self.handle_read(req).await,
            Opcode::ReadAhead => self.handle_readahead(req).await,
            Opcode::Write => self.handle_write(req).await,
            Opcode::Lockf => self.handle_lockf(req).await,
            Opcode::Close => self.handle_close().await,
            Opcode::ReadV3 | Opcode::WriteV3 => self.handle_transfer(opcode).await,
            Opcode::CloseV3 => self.handle_close_v3().await,
            Opcode::End => Ok(Flow::End),
            Opcode::Error | Opcode::Eof => Err(RfioError::UnexpectedOpcode {
                opcode: opcode.as_word(),
                state: "awaiting a request",
            }),
        }
    }

    pub(crate) async fn send(&mut self, buf: &[u8]) -> Result<(), RfioError> {
        self.control.get_mut().write_all(buf).await?;
        Ok(())
    }

    pub(crate) async fn send_encoded<F>(&mut self, encode: F) -> Result<(), RfioError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut buf = BytesMut::new();
        encode(&mut buf);
        self.send(&buf).await
    }
}

/// Fill `dst` with raw bytes following the last request, starting with
/// whatever the codec has already buffered.
pub(crate) async fn read_payload(
    control: &mut ControlStream,
    dst: &mut [u8],
) -> Result<(), RfioError> {
    let buffered = control.read_buffer_mut();
    let n = buffered.len().min(dst.len());
    dst[..n].copy_from_slice(&buffered[..n]);
    buffered.advance(n);
    control.get_mut().read_exact(&mut dst[n..]).await?;
    Ok(())
}

/// Consume and drop `len` raw bytes following the last request.
pub(crate) async fn skip_payload(
    control: &mut ControlStream,
    len: u64,
) -> Result<(), RfioError> {
    let buffered = control.read_buffer_mut();
    let n = (buffered.len() as u64).min(len);
    buffered.advance(n as usize);
    let mut rest = control.get_mut().take(len - n);
    let copied = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    if copied < len - n {
        return Err(RfioError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside a write payload",
        )));
    }
    Ok(())
}

/// Close sub-protocol on the file side: flush, stat, notify, close.
///
/// `pending` is an error already known to have failed the transfer. It is
/// reported to the notifier and wins over any later failure; a notifier
/// error turns an otherwise clean close into a failed one.
pub(crate) fn close_file(
    ctx: &ServerContext,
    file: OpenFile,
    pending: Option<i32>,
    log: &Logger,
) -> Result<(), i32> {
    let OpenFile {
        mut handle,
        path,
        flags,
        checksum,
    } = file;
    let mut result = match pending {
        Some(errno) => Err(errno),
        None => Ok(()),
    };

    if let Some(mut checksum) = checksum {
        if pending.is_some() {
            checksum.invalidate();
        }
        checksum.persist(handle.as_mut(), log);
    }

    if let Err(e) = handle.fsync() {
        warn!(log, "fsync failed"; "path" => &path, "err" => %e);
        result = result.and(Err(io_errno(&e)));
    }

    match handle.fstat() {
        Ok(st) => {
            debug!(log, "file closing"; "path" => &path, "size" => st.size,
                "write" => flags.write);
            if let Err(errno) = ctx.notifier.file_closed(&path, &st, pending) {
                warn!(log, "close notification failed"; "path" => &path,
                    "errno" => errno);
                result = result.and(Err(errno));
            }
        }
        Err(e) => {
            warn!(log, "fstat at close failed"; "path" => &path, "err" => %e);
            result = result.and(Err(io_errno(&e)));
        }
    }

    if let Err(e) = handle.close() {
        warn!(log, "close failed"; "path" => &path, "err" => %e);
        result = result.and(Err(io_errno(&e)));
    }
    result
}
