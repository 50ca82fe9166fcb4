// Copyright 2020 Joyent, Inc.

//! Typed request bodies and reply layouts.
//!
//! Field order and width are fixed by existing clients and must not change.

use bytes::BytesMut;

use crate::backend::FileStat;
use crate::error::RfioError;
use crate::protocol::{
    marshal_hyper, marshal_long, marshal_string, marshal_word, Opcode,
    Unmarshaller, HYPERSIZE, LONGSIZE, MAX_PATH_LEN, MAX_USER_LEN, WORDSIZE,
};

/// Size of the stat fields shared by the stat and fstat replies, without the
/// status field of the legacy stat reply.
pub const STAT_BODY_SIZE: usize =
    WORDSIZE + HYPERSIZE + 4 * WORDSIZE + HYPERSIZE + 4 * LONGSIZE + HYPERSIZE;
pub const STAT_REPLY_SIZE: usize = STAT_BODY_SIZE + LONGSIZE;
pub const OPEN_REPLY_SIZE: usize = WORDSIZE + 3 * LONGSIZE + HYPERSIZE;
pub const FSTAT_HEADER_SIZE: usize = WORDSIZE + 3 * LONGSIZE;
pub const LSEEK_REPLY_SIZE: usize = WORDSIZE + HYPERSIZE + LONGSIZE;
pub const STATUS_REPLY_SIZE: usize = WORDSIZE + 2 * LONGSIZE;
pub const READ_REPLY_HEADER_SIZE: usize = WORDSIZE + 3 * LONGSIZE;
pub const ANNOUNCE_SIZE: usize = WORDSIZE + HYPERSIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub uid: u16,
    pub gid: u16,
    pub umask: u32,
    pub flags: u32,
    pub mode: u32,
    pub user: String,
    pub path: String,
}

impl OpenRequest {
    pub fn decode(body: &[u8]) -> Result<OpenRequest, RfioError> {
        let mut cursor = Unmarshaller::new(body);
        let uid = cursor.word()?;
        let gid = cursor.word()?;
        let umask = cursor.long()? as u32;
        let flags = cursor.long()? as u32;
        let mode = cursor.long()? as u32;
        let user = cursor.string_n(MAX_USER_LEN)?;
        let path = cursor.string_n(MAX_PATH_LEN)?;
        Ok(OpenRequest {
            uid,
            gid,
            umask,
            flags,
            mode,
            user,
            path,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        marshal_word(buf, self.uid);
        marshal_word(buf, self.gid);
        marshal_long(buf, self.umask as i32);
        marshal_long(buf, self.flags as i32);
        marshal_long(buf, self.mode as i32);
        marshal_string(buf, &self.user);
        marshal_string(buf, &self.path);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRequest {
    pub uid: u16,
    pub gid: u16,
    pub path: String,
}

impl StatRequest {
    pub fn decode(body: &[u8]) -> Result<StatRequest, RfioError> {
        let mut cursor = Unmarshaller::new(body);
        Ok(StatRequest {
            uid: cursor.word()?,
            gid: cursor.word()?,
            path: cursor.string_n(MAX_PATH_LEN)?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        marshal_word(buf, self.uid);
        marshal_word(buf, self.gid);
        marshal_string(buf, &self.path);
    }
}

/// Body of legacy read, write and read-ahead requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub size: i32,
    pub how: i32,
    pub offset: i64,
}

impl IoRequest {
    pub fn decode(body: &[u8]) -> Result<IoRequest, RfioError> {
        let mut cursor = Unmarshaller::new(body);
        Ok(IoRequest {
            size: cursor.long()?,
            how: cursor.long()?,
            offset: cursor.hyper()?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        marshal_long(buf, self.size);
        marshal_long(buf, self.how);
        marshal_hyper(buf, self.offset);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LseekRequest {
    pub offset: i64,
    pub whence: i32,
}

impl LseekRequest {
    pub fn decode(body: &[u8]) -> Result<LseekRequest, RfioError> {
        let mut cursor = Unmarshaller::new(body);
        Ok(LseekRequest {
            offset: cursor.hyper()?,
            whence: cursor.long()?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        marshal_hyper(buf, self.offset);
        marshal_long(buf, self.whence);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockfRequest {
    pub op: i32,
    pub length: i64,
}

impl LockfRequest {
    pub fn decode(body: &[u8]) -> Result<LockfRequest, RfioError> {
        let mut cursor = Unmarshaller::new(body);
        Ok(LockfRequest {
            op: cursor.long()?,
            length: cursor.hyper()?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        marshal_long(buf, self.op);
        marshal_hyper(buf, self.length);
    }
}

/// Close frame of a v3 transfer. Writers declare how many bytes they sent
/// over the data socket; readers send an empty body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseV3Request {
    pub bytes_written: Option<u64>,
}

impl CloseV3Request {
    pub fn decode(body: &[u8]) -> Result<CloseV3Request, RfioError> {
        if body.is_empty() {
            return Ok(CloseV3Request {
                bytes_written: None,
            });
        }
        let mut cursor = Unmarshaller::new(body);
        Ok(CloseV3Request {
            bytes_written: Some(cursor.hyper()? as u64),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        if let Some(n) = self.bytes_written {
            marshal_hyper(buf, n as i64);
        }
    }
}

/// Reply to open requests. The third LONG is reserved in the legacy reply
/// and carries the data port in the v3 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReply {
    pub opcode: Opcode,
    pub status: i32,
    pub errno: i32,
    pub data_port: i32,
    pub offset: i64,
}

impl OpenReply {
    pub fn failed(opcode: Opcode, errno: i32) -> OpenReply {
        OpenReply {
            opcode,
            status: -1,
            errno,
            data_port: 0,
            offset: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(OPEN_REPLY_SIZE);
        marshal_word(buf, self.opcode.as_word());
        marshal_long(buf, self.status);
        marshal_long(buf, self.errno);
        marshal_long(buf, self.data_port);
        marshal_hyper(buf, self.offset);
    }

    pub fn decode(raw: &[u8]) -> Result<OpenReply, RfioError> {
        let mut cursor = Unmarshaller::new(raw);
        let word = cursor.word()?;
        let opcode = Opcode::from_word(word).ok_or(
            RfioError::UnexpectedOpcode {
                opcode: word,
                state: "decoding an open reply",
            },
        )?;
        Ok(OpenReply {
            opcode,
            status: cursor.long()?,
            errno: cursor.long()?,
            data_port: cursor.long()?,
            offset: cursor.hyper()?,
        })
    }
}

fn encode_stat_fields(buf: &mut BytesMut, st: &FileStat) {
    marshal_word(buf, st.dev as u16);
    marshal_hyper(buf, st.ino as i64);
    marshal_word(buf, st.mode as u16);
    marshal_word(buf, st.nlink as u16);
    marshal_word(buf, st.uid as u16);
    marshal_word(buf, st.gid as u16);
    marshal_hyper(buf, st.size as i64);
    marshal_long(buf, st.atime as i32);
    marshal_long(buf, st.mtime as i32);
    marshal_long(buf, st.ctime as i32);
}

fn decode_stat_fields(cursor: &mut Unmarshaller<'_>) -> Result<FileStat, RfioError> {
    Ok(FileStat {
        dev: cursor.word()? as u64,
        ino: cursor.hyper()? as u64,
        mode: cursor.word()? as u32,
        nlink: cursor.word()? as u64,
        uid: cursor.word()? as u32,
        gid: cursor.word()? as u32,
        size: cursor.hyper()? as u64,
        atime: cursor.long()? as i64,
        mtime: cursor.long()? as i64,
        ctime: cursor.long()? as i64,
        ..FileStat::default()
    })
}

/// Legacy stat/lstat reply.
///
/// This reply has no error field: the errno travels in the status field,
/// and all other fields are zero on failure. Existing clients rely on it.
pub fn encode_stat_reply(buf: &mut BytesMut, result: Result<&FileStat, i32>) {
    buf.reserve(STAT_REPLY_SIZE);
    let (st, status) = match result {
        Ok(st) => (*st, 0),
        Err(errno) => (FileStat::default(), errno),
    };
    encode_stat_fields(buf, &st);
    marshal_long(buf, status);
    marshal_long(buf, st.blksize as i32);
    marshal_hyper(buf, st.blocks as i64);
}

/// Decode a legacy stat reply; `Err` carries the errno from the status field.
pub fn decode_stat_reply(raw: &[u8]) -> Result<Result<FileStat, i32>, RfioError> {
    let mut cursor = Unmarshaller::new(raw);
    let mut st = decode_stat_fields(&mut cursor)?;
    let status = cursor.long()?;
    st.blksize = cursor.long()? as u64;
    st.blocks = cursor.hyper()? as u64;
    if status != 0 {
        return Ok(Err(status));
    }
    Ok(Ok(st))
}

/// fstat reply: a status header followed, on success, by the stat fields.
pub fn encode_fstat_reply(buf: &mut BytesMut, result: Result<&FileStat, i32>) {
    buf.reserve(FSTAT_HEADER_SIZE + STAT_BODY_SIZE);
    marshal_word(buf, Opcode::Fstat.as_word());
    match result {
        Ok(st) => {
            marshal_long(buf, 0);
            marshal_long(buf, 0);
            marshal_long(buf, STAT_BODY_SIZE as i32);
            encode_stat_fields(buf, st);
            marshal_long(buf, st.blksize as i32);
            marshal_hyper(buf, st.blocks as i64);
        }
        Err(errno) => {
            marshal_long(buf, -1);
            marshal_long(buf, errno);
            marshal_long(buf, 0);
        }
    }
}

/// Decode the fixed fstat header into `(status, errno, body length)`.
pub fn decode_fstat_header(raw: &[u8]) -> Result<(i32, i32, usize), RfioError> {
    let mut cursor = Unmarshaller::new(raw);
    cursor.word()?;
    Ok((cursor.long()?, cursor.long()?, cursor.long()? as usize))
}

pub fn decode_fstat_body(raw: &[u8]) -> Result<FileStat, RfioError> {
    let mut cursor = Unmarshaller::new(raw);
    let mut st = decode_stat_fields(&mut cursor)?;
    st.blksize = cursor.long()? as u64;
    st.blocks = cursor.hyper()? as u64;
    Ok(st)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LseekReply {
    pub offset: i64,
    pub errno: i32,
}

impl LseekReply {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(LSEEK_REPLY_SIZE);
        marshal_word(buf, Opcode::Lseek.as_word());
        marshal_hyper(buf, self.offset);
        marshal_long(buf, self.errno);
    }

    pub fn decode(raw: &[u8]) -> Result<LseekReply, RfioError> {
        let mut cursor = Unmarshaller::new(raw);
        cursor.word()?;
        Ok(LseekReply {
            offset: cursor.hyper()?,
            errno: cursor.long()?,
        })
    }
}

/// `WORD opcode, LONG status, LONG errno`: legacy write/close/lockf replies,
/// v3 close replies and v3 error notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    pub opcode: Opcode,
    pub status: i32,
    pub errno: i32,
}

impl StatusReply {
    pub fn new(opcode: Opcode, result: Result<i32, i32>) -> StatusReply {
        match result {
            Ok(status) => StatusReply {
                opcode,
                status,
                errno: 0,
            },
            Err(errno) => StatusReply {
                opcode,
                status: -1,
                errno,
            },
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(STATUS_REPLY_SIZE);
        marshal_word(buf, self.opcode.as_word());
        marshal_long(buf, self.status);
        marshal_long(buf, self.errno);
    }

    /// Decode the fields following an already consumed opcode word.
    pub fn decode_after_opcode(
        opcode: Opcode,
        raw: &[u8],
    ) -> Result<StatusReply, RfioError> {
        let mut cursor = Unmarshaller::new(raw);
        Ok(StatusReply {
            opcode,
            status: cursor.long()?,
            errno: cursor.long()?,
        })
    }
}

/// Header of a legacy read reply; `data_len` raw bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReplyHeader {
    pub status: i32,
    pub errno: i32,
    pub data_len: usize,
}

impl ReadReplyHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(READ_REPLY_HEADER_SIZE);
        marshal_word(buf, Opcode::Read.as_word());
        marshal_long(buf, self.status);
        marshal_long(buf, self.errno);
        marshal_long(buf, self.data_len as i32);
    }

    pub fn decode(raw: &[u8]) -> Result<ReadReplyHeader, RfioError> {
        let mut cursor = Unmarshaller::new(raw);
        cursor.word()?;
        Ok(ReadReplyHeader {
            status: cursor.long()?,
            errno: cursor.long()?,
            data_len: cursor.long()? as usize,
        })
    }
}

/// Announcement sent at the start of a v3 read: the number of bytes the
/// server is about to stream.
pub fn encode_read_announcement(buf: &mut BytesMut, count: u64) {
    buf.reserve(ANNOUNCE_SIZE);
    marshal_word(buf, Opcode::ReadV3.as_word());
    marshal_hyper(buf, count as i64);
}

pub fn encode_eof(buf: &mut BytesMut) {
    marshal_word(buf, Opcode::Eof.as_word());
}

pub fn encode_error(buf: &mut BytesMut, errno: i32) {
    StatusReply {
        opcode: Opcode::Error,
        status: -1,
        errno,
    }
    .encode(buf);
}
