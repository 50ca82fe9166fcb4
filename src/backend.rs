// Copyright 2020 Joyent, Inc.

//! Storage backend contract used by the session and the disk workers, and
//! its implementation over the local filesystem.
//!
//! Every call is blocking. A handle is only ever used by one thread at a
//! time: the session thread in single-threaded mode, the worker thread when
//! a producer or consumer has been started.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::Path;

use crate::buffer::IO_ALIGN;

/// Network-independent open flags as carried in open requests.
pub mod wire_flags {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_APPEND: u32 = 0o10;
    pub const O_CREAT: u32 = 0o1000;
    pub const O_TRUNC: u32 = 0o2000;
    pub const O_EXCL: u32 = 0o4000;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
    pub direct: bool,
}

impl OpenFlags {
    pub fn from_wire(flags: u32) -> OpenFlags {
        use wire_flags::*;

        let (read, write) = match flags & O_ACCMODE {
            O_WRONLY => (false, true),
            O_RDWR => (true, true),
            _ => (true, false),
        };
        OpenFlags {
            read,
            write,
            append: flags & O_APPEND != 0,
            create: flags & O_CREAT != 0,
            truncate: flags & O_TRUNC != 0,
            exclusive: flags & O_EXCL != 0,
            direct: false,
        }
    }

    pub fn to_wire(&self) -> u32 {
        use wire_flags::*;

        let mut flags = match (self.read, self.write) {
            (true, true) => O_RDWR,
            (false, true) => O_WRONLY,
            _ => O_RDONLY,
        };
        if self.append {
            flags |= O_APPEND;
        }
        if self.create {
            flags |= O_CREAT;
        }
        if self.truncate {
            flags |= O_TRUNC;
        }
        if self.exclusive {
            flags |= O_EXCL;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub blksize: u64,
    pub blocks: u64,
}

impl From<&std::fs::Metadata> for FileStat {
    fn from(meta: &std::fs::Metadata) -> FileStat {
        FileStat {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            blksize: meta.blksize(),
            blocks: meta.blocks(),
        }
    }
}

/// `lockf(3)` operations as carried in lockf requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Unlock,
    Lock,
    TryLock,
    Test,
}

impl LockOp {
    pub fn from_wire(op: i32) -> Option<LockOp> {
        match op {
            0 => Some(LockOp::Unlock),
            1 => Some(LockOp::Lock),
            2 => Some(LockOp::TryLock),
            3 => Some(LockOp::Test),
            _ => None,
        }
    }
}

pub trait Backend: Send + Sync {
    fn open(
        &self,
        path: &str,
        flags: &OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn FileHandle>>;

    fn stat(&self, path: &str) -> io::Result<FileStat>;

    fn lstat(&self, path: &str) -> io::Result<FileStat>;
}

pub trait FileHandle: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// A single write call. Callers treat a short count as out of space.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    fn fstat(&self) -> io::Result<FileStat>;

    fn fsync(&mut self) -> io::Result<()>;

    fn get_xattr(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    fn set_xattr(&mut self, name: &str, value: &[u8]) -> io::Result<()>;

    fn remove_xattr(&mut self, name: &str) -> io::Result<()>;

    fn lockf(&mut self, op: LockOp, len: i64) -> io::Result<()>;

    /// Reserve space for `len` bytes without changing the file size.
    fn preallocate(&mut self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Backend over the local POSIX filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

impl Backend for LocalBackend {
    fn open(
        &self,
        path: &str,
        flags: &OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn FileHandle>> {
        let file = OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .append(flags.append)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.create && flags.exclusive)
            .truncate(flags.truncate)
            .mode(mode)
            .open(Path::new(path))?;
        let mut local = LocalFile {
            file,
            append: flags.append,
            direct: false,
        };
        // Filesystems without direct I/O refuse the flag; such files stay
        // buffered.
        if flags.direct && local.set_direct(true).is_ok() {
            local.direct = true;
        }
        Ok(Box::new(local))
    }

    fn stat(&self, path: &str) -> io::Result<FileStat> {
        Ok(FileStat::from(&std::fs::metadata(path)?))
    }

    fn lstat(&self, path: &str) -> io::Result<FileStat> {
        Ok(FileStat::from(&std::fs::symlink_metadata(path)?))
    }
}

pub struct LocalFile {
    file: File,
    append: bool,
    /// `O_DIRECT` is set on the descriptor.
    direct: bool,
}

impl LocalFile {
    fn set_direct(&self, on: bool) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        let flags = if on {
            flags | libc::O_DIRECT
        } else {
            flags & !libc::O_DIRECT
        };
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
        Ok(())
    }

    /// Direct I/O needs the buffer, its length and the file offset on block
    /// boundaries. The first transfer that breaks the rule, usually the tail
    /// of a file, turns direct I/O off for the rest of the handle's life.
    fn fit_direct(&mut self, buf: *const u8, len: usize) -> io::Result<()> {
        if !self.direct {
            return Ok(());
        }
        let offset = if self.append {
            self.file.metadata()?.len()
        } else {
            self.file.stream_position()?
        };
        let aligned = buf as usize % IO_ALIGN == 0
            && len % IO_ALIGN == 0
            && offset % IO_ALIGN as u64 == 0;
        if !aligned {
            self.set_direct(false)?;
            self.direct = false;
        }
        Ok(())
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn xattr_name(name: &str) -> io::Result<std::ffi::CString> {
    std::ffi::CString::new(name)
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

impl FileHandle for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fit_direct(buf.as_ptr(), buf.len())?;
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fit_direct(buf.as_ptr(), buf.len())?;
        self.file.write(buf)
    }

    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn fstat(&self) -> io::Result<FileStat> {
        Ok(FileStat::from(&self.file.metadata()?))
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn get_xattr(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        let cname = xattr_name(name)?;
        let fd = self.file.as_raw_fd();
        let mut value = vec![0u8; 256];
        let ret = unsafe {
            libc::fgetxattr(
                fd,
                cname.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENODATA) => Ok(None),
                _ => Err(err),
            };
        }
        value.truncate(ret as usize);
        Ok(Some(value))
    }

    fn set_xattr(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        let cname = xattr_name(name)?;
        cvt(unsafe {
            libc::fsetxattr(
                self.file.as_raw_fd(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        })?;
        Ok(())
    }

    fn remove_xattr(&mut self, name: &str) -> io::Result<()> {
        let cname = xattr_name(name)?;
        let ret = unsafe {
            libc::fremovexattr(self.file.as_raw_fd(), cname.as_ptr())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENODATA) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn lockf(&mut self, op: LockOp, len: i64) -> io::Result<()> {
        let cmd = match op {
            LockOp::Unlock => libc::F_ULOCK,
            LockOp::Lock => libc::F_LOCK,
            LockOp::TryLock => libc::F_TLOCK,
            LockOp::Test => libc::F_TEST,
        };
        cvt(unsafe {
            libc::lockf(self.file.as_raw_fd(), cmd, len as libc::off_t)
        })?;
        Ok(())
    }

    fn preallocate(&mut self, len: u64) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        cvt(unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_KEEP_SIZE,
                0,
                len as libc::off_t,
            )
        })?;
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let fd = self.file.into_raw_fd();
        cvt(unsafe { libc::close(fd) })?;
        Ok(())
    }
}
