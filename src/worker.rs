// Copyright 2020 Joyent, Inc.

//! Disk-side worker threads.
//!
//! A producer reads the file into the ring for the session to send; a
//! consumer writes what the session received into the file. Workers never
//! touch sockets. They report to the session through the slot lengths of
//! the ring, through a mutex-guarded error slot, and finally through a
//! one-shot channel that hands the file handle back when the thread ends.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use slog::{debug, error, o, warn, Logger};
use tokio::sync::oneshot;

use crate::backend::FileHandle;
use crate::checksum::{PersistOutcome, ReadChecksum, WriteChecksum};
use crate::error::{io_errno, RfioError};
use crate::ring::{RingBuffer, RingReader, RingWriter};

/// What a worker hands back when it ends.
pub struct WorkerOutcome {
    pub handle: Box<dyn FileHandle>,
    /// Bytes read from or written to the file.
    pub bytes: u64,
    pub error: Option<i32>,
    /// Set by consumers, which store the checksum before exiting.
    pub checksum: Option<PersistOutcome>,
}

pub struct Worker {
    name: &'static str,
    thread: Option<thread::JoinHandle<()>>,
    result: oneshot::Receiver<WorkerOutcome>,
    error: Arc<Mutex<Option<i32>>>,
    stop: Arc<AtomicBool>,
    ring: Arc<RingBuffer>,
}

pub(crate) fn read_retrying(handle: &mut dyn FileHandle, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match handle.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Write `buf` with a single call. A short write is reported as `ENOSPC`
/// whatever its cause.
pub fn write_block(handle: &mut dyn FileHandle, buf: &[u8]) -> Result<(), i32> {
    loop {
        match handle.write(buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(_) => return Err(libc::ENOSPC),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_errno(&e)),
        }
    }
}

/// Read loop of the producer thread.
fn produce(
    mut handle: Box<dyn FileHandle>,
    mut writer: RingWriter,
    stop: Arc<AtomicBool>,
    mut checksum: Option<ReadChecksum>,
    log: Logger,
) -> WorkerOutcome {
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        if stop.load(Ordering::SeqCst) {
            debug!(log, "stop requested");
            break;
        }
        let mut chunk = match writer.claim_blocking() {
            Ok(chunk) => chunk,
            Err(_) => {
                debug!(log, "ring abandoned by the session");
                break;
            }
        };
        match read_retrying(handle.as_mut(), &mut chunk.data) {
            Ok(0) => {
                chunk.length = 0;
                if let Some(Err(errno)) = checksum.as_ref().map(|c| c.verify()) {
                    warn!(log, "checksum mismatch at end of file");
                    error = Some(errno);
                    chunk.length = -i64::from(errno);
                }
                writer.commit(chunk);
                break;
            }
            Ok(n) => {
                if let Some(c) = checksum.as_mut() {
                    c.update(&chunk.data[..n]);
                }
                chunk.length = n as i64;
                bytes += n as u64;
                writer.commit(chunk);
            }
            Err(e) => {
                error!(log, "read failed"; "err" => %e);
                let errno = io_errno(&e);
                error = Some(errno);
                chunk.length = -i64::from(errno);
                writer.commit(chunk);
                break;
            }
        }
    }

    debug!(log, "producer done"; "bytes" => bytes);
    WorkerOutcome {
        handle,
        bytes,
        error,
        checksum: None,
    }
}

/// Write loop of the consumer thread.
fn consume(
    mut handle: Box<dyn FileHandle>,
    mut reader: RingReader,
    error_slot: Arc<Mutex<Option<i32>>>,
    mut checksum: Option<WriteChecksum>,
    log: Logger,
) -> WorkerOutcome {
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        let chunk = match reader.next_blocking() {
            Ok(chunk) => chunk,
            Err(_) => {
                error = Some(libc::ECANCELED);
                break;
            }
        };
        if chunk.length == 0 {
            reader.release(chunk);
            break;
        }
        if let Some(errno) = chunk.errno() {
            debug!(log, "error sentinel from the session"; "errno" => errno);
            error = Some(errno);
            reader.release(chunk);
            break;
        }
        let result = write_block(handle.as_mut(), chunk.payload());
        match result {
            Ok(()) => {
                if let Some(c) = checksum.as_mut() {
                    c.update(chunk.payload());
                }
                bytes += chunk.payload().len() as u64;
                reader.release(chunk);
            }
            Err(errno) => {
                error!(log, "write failed"; "errno" => errno);
                error = Some(errno);
                // The error must be visible before the slot is released.
                set_error(&error_slot, errno);
                reader.release(chunk);
                break;
            }
        }
    }
    if let Some(errno) = error {
        set_error(&error_slot, errno);
    }
    // Nobody drains the ring any more.
    reader.ring().abandon();

    let persisted = checksum.as_mut().map(|c| {
        if error.is_some() {
            c.invalidate();
        }
        c.persist(handle.as_mut(), &log)
    });

    debug!(log, "consumer done"; "bytes" => bytes);
    WorkerOutcome {
        handle,
        bytes,
        error,
        checksum: persisted,
    }
}

fn set_error(slot: &Mutex<Option<i32>>, errno: i32) {
    let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
    guard.get_or_insert(errno);
}

/// A worker thread that could not be started. The file handle it was given
/// comes back so the file can still be closed properly.
pub struct SpawnFailed {
    pub handle: Box<dyn FileHandle>,
    pub error: RfioError,
}

/// Start a named thread running `body` on `handle`. The handle only moves to
/// the thread once it is running.
fn start<F>(
    builder: thread::Builder,
    handle: Box<dyn FileHandle>,
    body: F,
) -> Result<thread::JoinHandle<()>, SpawnFailed>
where
    F: FnOnce(Box<dyn FileHandle>) + Send + 'static,
{
    let (handoff, receive) = mpsc::sync_channel::<Box<dyn FileHandle>>(1);
    let spawned = builder.spawn(move || {
        if let Ok(handle) = receive.recv() {
            body(handle);
        }
    });
    match spawned {
        Ok(thread) => {
            // The thread holds the receiver until it gets the handle.
            let _ = handoff.send(handle);
            Ok(thread)
        }
        Err(e) => Err(SpawnFailed {
            handle,
            error: e.into(),
        }),
    }
}

impl Worker {
    /// Start a producer reading `handle` into `ring`.
    pub fn spawn_producer(
        handle: Box<dyn FileHandle>,
        ring: Arc<RingBuffer>,
        checksum: Option<ReadChecksum>,
        log: &Logger,
    ) -> Result<Worker, SpawnFailed> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        let writer = RingWriter::new(ring.clone());
        let thread_stop = stop.clone();
        let thread_log = log.new(o!("worker" => "produce"));
        let builder = thread::Builder::new().name("rfio-produce".into());
        let thread = start(builder, handle, move |handle| {
            let outcome = produce(handle, writer, thread_stop, checksum, thread_log);
            let _ = tx.send(outcome);
        })?;
        Ok(Worker {
            name: "produce",
            thread: Some(thread),
            result: rx,
            error: Arc::new(Mutex::new(None)),
            stop,
            ring,
        })
    }

    /// Start a consumer writing what arrives in `ring` to `handle`.
    pub fn spawn_consumer(
        handle: Box<dyn FileHandle>,
        ring: Arc<RingBuffer>,
        checksum: Option<WriteChecksum>,
        log: &Logger,
    ) -> Result<Worker, SpawnFailed> {
        let error = Arc::new(Mutex::new(None));
        let (tx, rx) = oneshot::channel();
        let reader = RingReader::new(ring.clone());
        let thread_error = error.clone();
        let thread_log = log.new(o!("worker" => "consume"));
        let builder = thread::Builder::new().name("rfio-consume".into());
        let thread = start(builder, handle, move |handle| {
            let outcome = consume(handle, reader, thread_error, checksum, thread_log);
            let _ = tx.send(outcome);
        })?;
        Ok(Worker {
            name: "consume",
            thread: Some(thread),
            result: rx,
            error,
            stop: Arc::new(AtomicBool::new(false)),
            ring,
        })
    }

    /// The error reported by a consumer, if it has failed.
    pub fn error(&self) -> Option<i32> {
        *self.error.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Ask a producer to stop at its next iteration, waking it if it is
    /// waiting for an empty slot.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ring.abandon();
    }

    /// Wait for the worker to finish and take back the file handle.
    ///
    /// The thread is joined off the async runtime; it has already sent its
    /// result by then, so the join only waits for it to unwind.
    pub async fn join(mut self) -> Result<WorkerOutcome, RfioError> {
        let outcome = (&mut self.result).await.map_err(|_| {
            RfioError::Worker(format!("{} worker exited without a result", self.name))
        });
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                return Err(RfioError::Worker(format!("{} worker panicked", self.name)));
            }
        }
        outcome
    }
}

impl Drop for Worker {
    /// A worker dropped without `join` is told to stop and left to exit on
    /// its own; the file handle goes with it.
    fn drop(&mut self) {
        if self.thread.take().is_some() {
            self.stop.store(true, Ordering::SeqCst);
            self.ring.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use slog::Discard;
    use tempfile::NamedTempFile;

    use crate::backend::{Backend, LocalBackend, OpenFlags};

    fn open_temp(contents: &[u8]) -> (NamedTempFile, Box<dyn FileHandle>) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        let flags = OpenFlags {
            read: true,
            ..OpenFlags::default()
        };
        let path = file.path().to_str().unwrap().to_string();
        let handle = LocalBackend.open(&path, &flags, 0).unwrap();
        (file, handle)
    }

    #[test]
    fn failed_spawn_returns_the_handle() {
        let (_file, handle) = open_temp(b"abc");
        // No address space can hold a stack this large.
        let builder = thread::Builder::new().stack_size(1 << 60);
        let failed = match start(builder, handle, |_| {}) {
            Ok(_) => panic!("thread started with an impossible stack"),
            Err(failed) => failed,
        };
        assert_eq!(failed.handle.fstat().unwrap().size, 3);
    }

    #[tokio::test]
    async fn producer_hands_back_the_handle() {
        let (_file, handle) = open_temp(&[7u8; 10_000]);
        let ring = RingBuffer::new(2, 4096).unwrap();
        let log = Logger::root(Discard, o!());
        let worker = match Worker::spawn_producer(handle, ring.clone(), None, &log) {
            Ok(worker) => worker,
            Err(failed) => panic!("spawn failed: {}", failed.error),
        };

        let mut reader = RingReader::new(ring);
        let mut total = 0i64;
        loop {
            let chunk = reader.next().await.unwrap();
            let length = chunk.length;
            reader.release(chunk);
            if length <= 0 {
                assert_eq!(length, 0);
                break;
            }
            total += length;
        }
        assert_eq!(total, 10_000);

        let outcome = worker.join().await.unwrap();
        assert_eq!(outcome.bytes, 10_000);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.handle.fstat().unwrap().size, 10_000);
    }
}
