// Copyright 2020 Joyent, Inc.

//! Fixed-width big-endian codec for RFIO frames.
//!
//! Every request starts with an 8-byte header: a WORD magic number, a WORD
//! opcode and a LONG holding the length of the body that follows. The
//! declared length is checked against the configured maximum as soon as the
//! header is complete, before any room is made for the body.

use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error::RfioError;

pub const WORDSIZE: usize = 2;
pub const LONGSIZE: usize = 4;
pub const HYPERSIZE: usize = 8;

const RQ_OFF_MAGIC: usize = 0x0;
const RQ_OFF_OPCODE: usize = 0x2;
const RQ_OFF_LEN: usize = 0x4;

pub const RQSTSIZE: usize = 0x8;

pub const RFIO_MAGIC: u16 = 0x0100;

/// Capacity of a path string field, terminator excluded.
pub const MAX_PATH_LEN: usize = 1023;
/// Capacity of a user name string field, terminator excluded.
pub const MAX_USER_LEN: usize = 255;

/// Value of the `how` field of read/write requests meaning "do not seek".
pub const NO_SEEK: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Opcode {
    Open = 0x2001,
    Read = 0x2002,
    Write = 0x2003,
    Close = 0x2004,
    ReadAhead = 0x2005,
    Lseek = 0x2007,
    Stat = 0x2008,
    Fstat = 0x2009,
    Lstat = 0x200a,
    End = 0x200b,
    Lockf = 0x200c,
    OpenV3 = 0x3001,
    CloseV3 = 0x3002,
    ReadV3 = 0x3003,
    WriteV3 = 0x3004,
    Error = 0x4001,
    Eof = 0x4002,
}

impl Opcode {
    pub fn from_word(word: u16) -> Option<Opcode> {
        FromPrimitive::from_u16(word)
    }

    pub fn as_word(self) -> u16 {
        // Every variant fits in a WORD.
        ToPrimitive::to_u16(&self).unwrap_or_default()
    }
}

pub fn marshal_word(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

pub fn marshal_long(buf: &mut BytesMut, value: i32) {
    buf.put_i32(value);
}

pub fn marshal_hyper(buf: &mut BytesMut, value: i64) {
    buf.put_i64(value);
}

/// Append a NUL-terminated string. Bytes after an embedded NUL are not
/// representable on the wire and are dropped.
pub fn marshal_string(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    buf.put_slice(&bytes[..end]);
    buf.put_u8(0);
}

/// Cursor over a received frame body.
///
/// Unlike the C codec this never reads past the end of the buffer: running
/// out of bytes is reported as [`RfioError::Truncated`].
pub struct Unmarshaller<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unmarshaller<'a> {
    pub fn new(buf: &'a [u8]) -> Unmarshaller<'a> {
        Unmarshaller { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RfioError> {
        if self.remaining() < n {
            return Err(RfioError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn word(&mut self) -> Result<u16, RfioError> {
        Ok(BigEndian::read_u16(self.take(WORDSIZE)?))
    }

    pub fn long(&mut self) -> Result<i32, RfioError> {
        Ok(BigEndian::read_i32(self.take(LONGSIZE)?))
    }

    pub fn hyper(&mut self) -> Result<i64, RfioError> {
        Ok(BigEndian::read_i64(self.take(HYPERSIZE)?))
    }

    /// Read a NUL-terminated string into a field of `capacity` bytes.
    ///
    /// An over-long string still consumes its bytes so that the cursor
    /// stays aligned, then fails with [`RfioError::StringTooLong`].
    pub fn string_n(&mut self, capacity: usize) -> Result<String, RfioError> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|b| *b == 0).ok_or(
            RfioError::Truncated {
                needed: rest.len() + 1,
                remaining: rest.len(),
            },
        )?;
        let raw = self.take(nul + 1)?;
        if nul > capacity {
            return Err(RfioError::StringTooLong { capacity });
        }
        str::from_utf8(&raw[..nul])
            .map(String::from)
            .map_err(|_| RfioError::Protocol("string is not UTF-8".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u16,
    pub opcode: u16,
    pub length: usize,
}

impl RequestHeader {
    pub fn parse(buf: &[u8; RQSTSIZE]) -> RequestHeader {
        RequestHeader {
            magic: BigEndian::read_u16(&buf[RQ_OFF_MAGIC..RQ_OFF_OPCODE]),
            opcode: BigEndian::read_u16(&buf[RQ_OFF_OPCODE..RQ_OFF_LEN]),
            length: BigEndian::read_u32(&buf[RQ_OFF_LEN..RQSTSIZE]) as usize,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        marshal_word(buf, self.magic);
        marshal_word(buf, self.opcode);
        buf.put_u32(self.length as u32);
    }
}

/// A complete request frame: header plus its declared body.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: RequestHeader,
    pub body: Vec<u8>,
}

impl Request {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_word(self.header.opcode)
    }

    pub fn unmarshaller(&self) -> Unmarshaller<'_> {
        Unmarshaller::new(&self.body)
    }
}

/// Encode a request frame with the given body.
pub fn encode_request(opcode: Opcode, body: &[u8], buf: &mut BytesMut) {
    buf.reserve(RQSTSIZE + body.len());
    RequestHeader {
        magic: RFIO_MAGIC,
        opcode: opcode.as_word(),
        length: body.len(),
    }
    .encode(buf);
    buf.put_slice(body);
}

/// Frames requests on a control connection.
///
/// Replies have per-opcode layouts without a length field and are written
/// directly; only requests go through the codec.
#[derive(Debug, Clone, Copy)]
pub struct RfioCodec {
    max_len: usize,
}

impl RfioCodec {
    /// A codec refusing bodies longer than `max_len`.
    pub fn new(max_len: usize) -> RfioCodec {
        RfioCodec { max_len }
    }
}

impl Decoder for RfioCodec {
    type Item = Request;
    type Error = RfioError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, RfioError> {
        if buf.len() < RQSTSIZE {
            return Ok(None);
        }
        let mut raw = [0u8; RQSTSIZE];
        raw.copy_from_slice(&buf[..RQSTSIZE]);
        let header = RequestHeader::parse(&raw);
        if header.magic != RFIO_MAGIC {
            return Err(RfioError::BadMagic(header.magic));
        }
        if header.length > self.max_len {
            return Err(RfioError::RequestTooLarge {
                declared: header.length,
                max: self.max_len,
            });
        }

        let frame_len = RQSTSIZE + header.length;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }
        buf.advance(RQSTSIZE);
        let body = buf.split_to(header.length).to_vec();
        Ok(Some(Request { header, body }))
    }
}

impl Encoder<Request> for RfioCodec {
    type Error = RfioError;

    fn encode(&mut self, item: Request, buf: &mut BytesMut) -> Result<(), RfioError> {
        if item.body.len() > self.max_len {
            return Err(RfioError::RequestTooLarge {
                declared: item.body.len(),
                max: self.max_len,
            });
        }
        buf.reserve(RQSTSIZE + item.body.len());
        RequestHeader {
            length: item.body.len(),
            ..item.header
        }
        .encode(buf);
        buf.put_slice(&item.body);
        Ok(())
    }
}

/// The server side of a control connection: requests come in through the
/// codec, replies are written to the inner stream.
pub type ControlStream = FramedRead<TcpStream, RfioCodec>;
