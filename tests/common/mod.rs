// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rfio::backend::{Backend, FileHandle, FileStat, LockOp, OpenFlags};
use rfio::config::{RfioConfig, StreamSettings};
use rfio::server;
use rfio::session::ServerContext;

pub const TEST_BUFSIZE: usize = 64 * 1024;

#[derive(Debug, Default, Clone)]
struct MemFile {
    data: Vec<u8>,
    xattrs: HashMap<String, Vec<u8>>,
}

type Files = Arc<Mutex<HashMap<String, MemFile>>>;

/// An in-memory backend. A capacity makes writes past that many bytes come
/// up short, like a full disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    files: Files,
    capacity: Option<u64>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    pub fn with_capacity(capacity: u64) -> MemoryBackend {
        MemoryBackend {
            files: Files::default(),
            capacity: Some(capacity),
        }
    }

    pub fn insert(&self, path: &str, data: &[u8]) {
        let mut files = self.files.lock().unwrap();
        files.entry(path.to_string()).or_default().data = data.to_vec();
    }

    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8]) {
        let mut files = self.files.lock().unwrap();
        files
            .entry(path.to_string())
            .or_default()
            .xattrs
            .insert(name.to_string(), value.to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).map(|f| f.data.clone())
    }

    pub fn xattr(&self, path: &str, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .and_then(|f| f.xattrs.get(name).cloned())
    }
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn stat_of(file: &MemFile) -> FileStat {
    FileStat {
        mode: 0o100644,
        nlink: 1,
        size: file.data.len() as u64,
        blksize: 4096,
        blocks: (file.data.len() as u64 + 511) / 512,
        ..FileStat::default()
    }
}

impl Backend for MemoryBackend {
    fn open(
        &self,
        path: &str,
        flags: &OpenFlags,
        _mode: u32,
    ) -> io::Result<Box<dyn FileHandle>> {
        let mut files = self.files.lock().unwrap();
        match files.get_mut(path) {
            Some(_) if flags.create && flags.exclusive => {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            Some(file) if flags.truncate => file.data.clear(),
            Some(_) => {}
            None if flags.create => {
                files.insert(path.to_string(), MemFile::default());
            }
            None => return Err(enoent()),
        }
        Ok(Box::new(MemHandle {
            files: self.files.clone(),
            path: path.to_string(),
            pos: 0,
            flags: *flags,
            capacity: self.capacity,
        }))
    }

    fn stat(&self, path: &str) -> io::Result<FileStat> {
        self.files.lock().unwrap().get(path).map(stat_of).ok_or_else(enoent)
    }

    fn lstat(&self, path: &str) -> io::Result<FileStat> {
        self.stat(path)
    }
}

struct MemHandle {
    files: Files,
    path: String,
    pos: u64,
    flags: OpenFlags,
    capacity: Option<u64>,
}

impl MemHandle {
    fn with_file<T>(&self, f: impl FnOnce(&mut MemFile) -> io::Result<T>) -> io::Result<T> {
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&self.path).ok_or_else(enoent)?;
        f(file)
    }
}

impl FileHandle for MemHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.flags.read {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let pos = self.pos as usize;
        let n = self.with_file(|file| {
            let available = file.data.len().saturating_sub(pos);
            let n = available.min(buf.len());
            buf[..n].copy_from_slice(&file.data[pos..pos + n]);
            Ok(n)
        })?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.flags.write {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let pos = self.pos;
        let n = match self.capacity {
            Some(cap) => (cap.saturating_sub(pos) as usize).min(buf.len()),
            None => buf.len(),
        };
        self.with_file(|file| {
            let end = pos as usize + n;
            if file.data.len() < end {
                file.data.resize(end, 0);
            }
            file.data[pos as usize..end].copy_from_slice(&buf[..n]);
            Ok(())
        })?;
        self.pos += n as u64;
        Ok(n)
    }

    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.with_file(|file| Ok(file.data.len() as i64))?;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if target < 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn fstat(&self) -> io::Result<FileStat> {
        self.with_file(|file| Ok(stat_of(file)))
    }

    fn fsync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn get_xattr(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        self.with_file(|file| Ok(file.xattrs.get(name).cloned()))
    }

    fn set_xattr(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        self.with_file(|file| {
            file.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn remove_xattr(&mut self, name: &str) -> io::Result<()> {
        self.with_file(|file| {
            file.xattrs.remove(name);
            Ok(())
        })
    }

    fn lockf(&mut self, _op: LockOp, _len: i64) -> io::Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Error,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn test_config(use_threads: bool) -> RfioConfig {
    let settings = StreamSettings {
        use_threads,
        nbuf: 3,
        buffer_size: TEST_BUFSIZE,
    };
    RfioConfig {
        read: settings,
        write: settings,
        port_range: (0, 0),
        ..RfioConfig::default()
    }
}

/// Start a server on an ephemeral loopback port.
pub async fn start_server(ctx: ServerContext) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let log = test_logger();
        server::serve(listener, Arc::new(ctx), server_cancel, Some(&log))
            .await
            .expect("server failed");
    });
    (addr, cancel)
}

/// Deterministic, non-repeating-looking test data.
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
