// Copyright 2020 Joyent, Inc.

//! RFIO: a remote file I/O protocol used by tape and disk servers
//!
//! A client opens a control connection to the server and sends request
//! frames on it. The server answers each request with a reply frame, except
//! during a v3 streaming transfer, where file data flows over a separate data
//! connection and the control connection only carries notifications.
//!
//! Protocol definition
//!
//! Every request starts with a fixed 8-byte header:
//!
//! * MAGIC     2-byte big-endian integer. The only supported value is 0x0100.
//!
//! * OPCODE    2-byte big-endian integer naming the request.
//!
//! * LENGTH    4-byte big-endian unsigned integer, the number of body bytes
//!           that follow the header. Lengths above the configured maximum
//!           close the connection.
//!
//! Bodies are made of big-endian WORDs (2 bytes), LONGs (4 bytes) and
//! HYPERs (8 bytes), and of NUL-terminated strings with a per-field maximum
//! length.
//!
//! The legacy operations (open, stat, lstat, fstat, lseek, read, read-ahead,
//! write, lockf, close) each get one reply on the control connection. A
//! legacy write carries its payload right after the request frame.
//!
//! The v3 operations stream a whole file:
//!
//! * OPEN_V3   opens the file and replies with the port of a listener the
//!           client connects its data connection to.
//!
//! * READ_V3   the server announces the number of bytes it will send, then
//!           streams them on the data connection. End of file is signalled
//!           with an EOF frame on the control connection.
//!
//! * WRITE_V3  the client streams the file on the data connection, then
//!           sends CLOSE_V3 with the number of bytes it sent.
//!
//! * CLOSE_V3  ends the transfer. The server replies with the final status
//!           and closes both connections.
//!
//! An error during a v3 transfer is sent as an ERROR frame on the control
//! connection. The client must acknowledge it with a control frame; until
//! then, the server keeps reading and discarding whatever arrives on the
//! data connection.
//!
//! Large transfers can run the disk side in a worker thread that exchanges
//! buffers with the network side through a fixed ring of slots, so disk and
//! network work overlap.

#![allow(missing_docs)]

pub mod auth;
pub mod backend;
pub mod buffer;
pub mod checksum;
pub mod client;
pub mod config;
pub mod error;
mod handlers;
pub mod message;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod session;
pub mod transfer;
pub mod worker;
