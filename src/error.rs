// Copyright 2020 Joyent, Inc.

//! Error types shared by the codec, the session state machine and the
//! worker threads.

use std::io;

/// Protocol-specific error codes reported to clients next to plain `errno`
/// values.
pub mod serrno {
    pub const SENAMETOOLONG: i32 = 1008;
    pub const SEHOSTREFUSED: i32 = 1009;
    pub const SEINTERNAL: i32 = 1015;
    pub const SECHECKSUM: i32 = 1037;
}

#[derive(Debug, thiserror::Error)]
pub enum RfioError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("declared request length {declared} exceeds maximum {max}")]
    RequestTooLarge { declared: usize, max: usize },

    #[error("bad magic number {0:#06x}")]
    BadMagic(u16),

    #[error("unexpected opcode {opcode:#06x} while {state}")]
    UnexpectedOpcode { opcode: u16, state: &'static str },

    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("string exceeds field capacity of {capacity} bytes")]
    StringTooLong { capacity: usize },

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("backend error: errno {0}")]
    Backend(i32),

    #[error("worker thread failed: {0}")]
    Worker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RfioError {
    /// The errno-equivalent value reported to the peer for this error.
    pub fn errno(&self) -> i32 {
        match self {
            RfioError::Io(e) => io_errno(e),
            RfioError::RequestTooLarge { .. } => libc::E2BIG,
            RfioError::BadMagic(_)
            | RfioError::UnexpectedOpcode { .. }
            | RfioError::Truncated { .. }
            | RfioError::Protocol(_) => libc::EPROTO,
            RfioError::StringTooLong { .. } => serrno::SENAMETOOLONG,
            RfioError::Timeout(_) => libc::ETIMEDOUT,
            RfioError::Backend(errno) => *errno,
            RfioError::Worker(_) | RfioError::Config(_) => serrno::SEINTERNAL,
        }
    }
}

/// Extract an errno value from an I/O error, falling back to `EIO` for
/// errors that did not originate in a system call.
pub fn io_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::ConnectionReset => libc::ECONNRESET,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        _ => libc::EIO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_of_os_error_is_preserved() {
        let err = RfioError::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.errno(), libc::ENOSPC);
    }

    #[test]
    fn errno_of_synthetic_io_error_is_mapped() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(io_errno(&err), libc::ENOENT);
        let err = io::Error::new(io::ErrorKind::Other, "odd");
        assert_eq!(io_errno(&err), libc::EIO);
    }

    #[test]
    fn protocol_codes() {
        let err = RfioError::StringTooLong { capacity: 8 };
        assert_eq!(err.errno(), serrno::SENAMETOOLONG);
        let err = RfioError::RequestTooLarge {
            declared: 10,
            max: 1,
        };
        assert_eq!(err.errno(), libc::E2BIG);
    }
}
