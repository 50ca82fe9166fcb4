// Copyright 2020 Joyent, Inc.

//! Bounded ring of transfer buffers shared by the session and one disk
//! worker.
//!
//! Two counting semaphores hand slots back and forth: `empty` counts slots
//! the producer may fill, `full` counts slots the consumer may drain. The
//! semaphore handoff is the only ordering between the two sides. Each slot
//! carries a signed length: a positive value is a payload size, zero marks
//! the end of the stream and a negative value is a negated errno.
//!
//! The session side awaits the semaphores; the worker thread blocks on them
//! with `futures::executor::block_on`, which needs no runtime.

use std::io;
use std::sync::{Arc, Mutex};

use futures::executor::block_on;
use tokio::sync::Semaphore;

use crate::buffer::AlignedBuf;

/// The peer side of the ring has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingClosed;

/// A slot taken out of the ring. Its buffer is owned by whoever holds the
/// chunk until it is handed back.
#[derive(Debug)]
pub struct Chunk {
    index: usize,
    pub data: AlignedBuf,
    pub length: i64,
}

impl Chunk {
    pub fn payload(&self) -> &[u8] {
        if self.length > 0 {
            &self.data[..self.length as usize]
        } else {
            &[]
        }
    }

    /// The errno carried by an error sentinel.
    pub fn errno(&self) -> Option<i32> {
        if self.length < 0 {
            Some((-self.length) as i32)
        } else {
            None
        }
    }
}

struct Slot {
    data: AlignedBuf,
    length: i64,
}

pub struct RingBuffer {
    slots: Vec<Mutex<Slot>>,
    empty: Semaphore,
    full: Semaphore,
    buffer_size: usize,
}

impl RingBuffer {
    /// Allocate `nbuf` slots of `buffer_size` bytes each. Allocation failure
    /// is reported rather than aborting the process.
    pub fn new(
        nbuf: usize,
        buffer_size: usize,
    ) -> io::Result<Arc<RingBuffer>> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(nbuf)
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
        for _ in 0..nbuf {
            let data = AlignedBuf::try_new(buffer_size)?;
            slots.push(Mutex::new(Slot { data, length: 0 }));
        }
        Ok(Arc::new(RingBuffer {
            slots,
            empty: Semaphore::new(nbuf),
            full: Semaphore::new(0),
            buffer_size,
        }))
    }

    pub fn nbuf(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Slots currently holding data or a sentinel.
    pub fn filled(&self) -> usize {
        self.full.available_permits()
    }

    pub async fn acquire_empty(&self) -> Result<(), RingClosed> {
        self.empty.acquire().await.map_err(|_| RingClosed)?.forget();
        Ok(())
    }

    pub fn acquire_empty_blocking(&self) -> Result<(), RingClosed> {
        block_on(self.acquire_empty())
    }

    pub fn release_empty(&self) {
        self.empty.add_permits(1);
    }

    pub async fn acquire_full(&self) -> Result<(), RingClosed> {
        self.full.acquire().await.map_err(|_| RingClosed)?.forget();
        Ok(())
    }

    pub fn acquire_full_blocking(&self) -> Result<(), RingClosed> {
        block_on(self.acquire_full())
    }

    pub fn release_full(&self) {
        self.full.add_permits(1);
    }

    /// The draining side is going away: wake a producer blocked on an empty
    /// slot and make further `acquire_empty` calls fail.
    pub fn abandon(&self) {
        self.empty.close();
    }

    /// Fail every pending and future acquisition on both sides.
    pub fn shutdown(&self) {
        self.empty.close();
        self.full.close();
    }

    pub fn is_abandoned(&self) -> bool {
        self.empty.is_closed()
    }

    fn take(&self, index: usize) -> Chunk {
        let mut slot = self.lock(index);
        Chunk {
            index,
            data: std::mem::take(&mut slot.data),
            length: slot.length,
        }
    }

    fn put(&self, chunk: Chunk) {
        let mut slot = self.lock(chunk.index);
        slot.data = chunk.data;
        slot.length = chunk.length;
    }

    fn lock(&self, index: usize) -> std::sync::MutexGuard<'_, Slot> {
        // A slot is only ever touched by the side holding its permit, so a
        // poisoned lock cannot guard inconsistent data.
        self.slots[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Filling side of a ring. Owns the `produced` counter.
pub struct RingWriter {
    ring: Arc<RingBuffer>,
    produced: u64,
}

impl RingWriter {
    pub fn new(ring: Arc<RingBuffer>) -> RingWriter {
        RingWriter { ring, produced: 0 }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn index(&self) -> usize {
        (self.produced % self.ring.nbuf() as u64) as usize
    }

    /// Wait for an empty slot and take it.
    pub async fn claim(&mut self) -> Result<Chunk, RingClosed> {
        self.ring.acquire_empty().await?;
        Ok(self.ring.take(self.index()))
    }

    pub fn claim_blocking(&mut self) -> Result<Chunk, RingClosed> {
        self.ring.acquire_empty_blocking()?;
        Ok(self.ring.take(self.index()))
    }

    /// Hand a claimed slot to the consumer.
    pub fn commit(&mut self, chunk: Chunk) {
        debug_assert_eq!(chunk.index, self.index());
        self.ring.put(chunk);
        self.produced += 1;
        self.ring.release_full();
    }

    /// Push a sentinel slot: `0` for end of stream, `-errno` for an error.
    pub async fn push_sentinel(&mut self, length: i64) -> Result<(), RingClosed> {
        let mut chunk = self.claim().await?;
        chunk.length = length;
        self.commit(chunk);
        Ok(())
    }

    pub fn push_sentinel_blocking(&mut self, length: i64) -> Result<(), RingClosed> {
        let mut chunk = self.claim_blocking()?;
        chunk.length = length;
        self.commit(chunk);
        Ok(())
    }
}

/// Draining side of a ring. Owns the `consumed` counter.
pub struct RingReader {
    ring: Arc<RingBuffer>,
    consumed: u64,
}

impl RingReader {
    pub fn new(ring: Arc<RingBuffer>) -> RingReader {
        RingReader { ring, consumed: 0 }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn index(&self) -> usize {
        (self.consumed % self.ring.nbuf() as u64) as usize
    }

    /// Wait for a filled slot and take it.
    pub async fn next(&mut self) -> Result<Chunk, RingClosed> {
        self.ring.acquire_full().await?;
        Ok(self.ring.take(self.index()))
    }

    pub fn next_blocking(&mut self) -> Result<Chunk, RingClosed> {
        self.ring.acquire_full_blocking()?;
        Ok(self.ring.take(self.index()))
    }

    /// Give a drained slot back to the producer.
    pub fn release(&mut self, chunk: Chunk) {
        debug_assert_eq!(chunk.index, self.index());
        self.ring.put(chunk);
        self.consumed += 1;
        self.ring.release_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::thread;

    fn ring(nbuf: usize, size: usize) -> (RingWriter, RingReader) {
        let ring = RingBuffer::new(nbuf, size).unwrap();
        (RingWriter::new(ring.clone()), RingReader::new(ring))
    }

    #[test]
    fn slots_have_the_configured_size() {
        let ring = RingBuffer::new(3, 1024).unwrap();
        assert_eq!(ring.nbuf(), 3);
        assert_eq!(ring.buffer_size(), 1024);
        assert_eq!(ring.filled(), 0);
    }

    #[test]
    fn producer_never_runs_more_than_nbuf_ahead() {
        const NBUF: usize = 3;
        const COUNT: u64 = 2000;
        let (mut writer, mut reader) = ring(NBUF, 16);
        let produced = Arc::new(AtomicU64::new(0));
        let overrun = Arc::new(AtomicBool::new(false));

        let produced2 = produced.clone();
        let producer = thread::spawn(move || {
            for seq in 0..COUNT {
                let mut chunk = writer.claim_blocking().unwrap();
                chunk.data[..8].copy_from_slice(&seq.to_be_bytes());
                chunk.length = 8;
                writer.commit(chunk);
                produced2.store(writer.produced(), Ordering::SeqCst);
            }
            writer.push_sentinel_blocking(0).unwrap();
        });

        let mut expected = 0u64;
        loop {
            let chunk = reader.next_blocking().unwrap();
            if chunk.length == 0 {
                reader.release(chunk);
                break;
            }
            // The consumer only sees slots in the order they were committed.
            let mut seq = [0u8; 8];
            seq.copy_from_slice(chunk.payload());
            assert_eq!(u64::from_be_bytes(seq), expected);
            expected += 1;
            let ahead = produced.load(Ordering::SeqCst) - reader.consumed();
            if ahead > NBUF as u64 {
                overrun.store(true, Ordering::SeqCst);
            }
            assert!(reader.ring().filled() <= NBUF);
            reader.release(chunk);
        }
        producer.join().unwrap();
        assert_eq!(expected, COUNT);
        assert!(!overrun.load(Ordering::SeqCst));
    }

    #[test]
    fn error_sentinel_reaches_consumer_once() {
        let (mut writer, mut reader) = ring(2, 8);
        let producer = thread::spawn(move || {
            for _ in 0..5 {
                let mut chunk = writer.claim_blocking().unwrap();
                chunk.length = 8;
                writer.commit(chunk);
            }
            writer
                .push_sentinel_blocking(-(libc::EIO as i64))
                .unwrap();
        });

        let mut payloads = 0;
        let mut errors = Vec::new();
        loop {
            let chunk = reader.next_blocking().unwrap();
            if chunk.length <= 0 {
                errors.push(chunk.errno());
                reader.release(chunk);
                break;
            }
            payloads += 1;
            reader.release(chunk);
        }
        producer.join().unwrap();
        assert_eq!(payloads, 5);
        assert_eq!(errors, vec![Some(libc::EIO)]);
        assert_eq!(reader.ring().filled(), 0);
    }

    #[test]
    fn abandon_wakes_blocked_producer() {
        let (mut writer, reader) = ring(1, 8);
        let chunk = tokio_test::block_on(writer.claim()).unwrap();
        writer.commit(chunk);

        let producer = thread::spawn(move || writer.claim_blocking().map(|_| ()));
        thread::sleep(std::time::Duration::from_millis(50));
        reader.ring().abandon();
        assert_eq!(producer.join().unwrap(), Err(RingClosed));
        assert!(reader.ring().is_abandoned());
    }

    #[test]
    fn async_and_blocking_sides_interoperate() {
        let (mut writer, mut reader) = ring(2, 4);
        let consumer = thread::spawn(move || {
            let mut total = 0;
            loop {
                let chunk = reader.next_blocking().unwrap();
                let len = chunk.length;
                total += chunk.payload().len();
                reader.release(chunk);
                if len <= 0 {
                    return total;
                }
            }
        });
        tokio_test::block_on(async {
            for _ in 0..10 {
                let mut chunk = writer.claim().await.unwrap();
                chunk.data.copy_from_slice(b"abcd");
                chunk.length = 4;
                writer.commit(chunk);
            }
            writer.push_sentinel(0).await.unwrap();
        });
        assert_eq!(consumer.join().unwrap(), 40);
    }
}
