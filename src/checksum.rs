// Copyright 2020 Joyent, Inc.

//! Adler-32 checksums of transferred files.
//!
//! The running value is extended block by block. Blocks that are not
//! contiguous are joined with [`adler32_combine`], treating the skipped
//! range as zero bytes, which is what a hole in a sparse file reads as.
//! Checksums are stored in two extended attributes on the file.

use adler32::RollingAdler32;
use slog::{debug, warn, Logger};

use crate::backend::FileHandle;
use crate::config::CKSUM_TYPE_ADLER32;
use crate::error::serrno;

pub const XATTR_CKSUM_TYPE: &str = "user.castor.checksum.type";
pub const XATTR_CKSUM_VALUE: &str = "user.castor.checksum.value";

const BASE: u64 = 65521;

/// Adler-32 of the concatenation `A || B` given `adler(A)`, `adler(B)` and
/// the length of `B`.
pub fn adler32_combine(adler1: u32, adler2: u32, len2: u64) -> u32 {
    let rem = len2 % BASE;
    let mut sum1 = u64::from(adler1 & 0xffff);
    let mut sum2 = (rem * sum1) % BASE;
    sum1 += u64::from(adler2 & 0xffff) + BASE - 1;
    sum2 += u64::from(adler1 >> 16) + u64::from(adler2 >> 16) + BASE - rem;
    if sum1 >= BASE {
        sum1 -= BASE;
    }
    if sum1 >= BASE {
        sum1 -= BASE;
    }
    if sum2 >= BASE << 1 {
        sum2 -= BASE << 1;
    }
    if sum2 >= BASE {
        sum2 -= BASE;
    }
    (sum1 | (sum2 << 16)) as u32
}

/// Adler-32 of `len` zero bytes.
pub fn adler32_zeros(len: u64) -> u32 {
    (((len % BASE) as u32) << 16) | 1
}

pub fn adler32_of(data: &[u8]) -> u32 {
    let mut rolling = RollingAdler32::new();
    rolling.update_buffer(data);
    rolling.hash()
}

/// Checksum of the byte range `[0, covered)` of a file, extended as data
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningChecksum {
    value: u32,
    covered: u64,
    valid: bool,
}

impl Default for RunningChecksum {
    fn default() -> RunningChecksum {
        RunningChecksum::new()
    }
}

impl RunningChecksum {
    pub fn new() -> RunningChecksum {
        RunningChecksum {
            value: 1,
            covered: 0,
            valid: true,
        }
    }

    /// Continue from a checksum already known for `[0, covered)`.
    pub fn seeded(value: u32, covered: u64) -> RunningChecksum {
        RunningChecksum {
            value,
            covered,
            valid: true,
        }
    }

    /// A checksum that can never be completed, e.g. because the bytes
    /// before the first write are unknown.
    pub fn invalid(covered: u64) -> RunningChecksum {
        RunningChecksum {
            value: 1,
            covered,
            valid: false,
        }
    }

    pub fn covered(&self) -> u64 {
        self.covered
    }

    pub fn update(&mut self, data: &[u8]) {
        let offset = self.covered;
        self.update_at(offset, data);
    }

    /// Account for `data` written at `offset`. Skipped ranges count as
    /// zeros; rewriting an already covered range invalidates the checksum.
    pub fn update_at(&mut self, offset: u64, data: &[u8]) {
        if offset < self.covered {
            self.valid = false;
        }
        if !self.valid {
            self.covered = self.covered.max(offset + data.len() as u64);
            return;
        }
        if offset > self.covered {
            let gap = offset - self.covered;
            self.value = adler32_combine(self.value, adler32_zeros(gap), gap);
        }
        let mut rolling = RollingAdler32::from_value(self.value);
        rolling.update_buffer(data);
        self.value = rolling.hash();
        self.covered = offset + data.len() as u64;
    }

    pub fn value(&self) -> Option<u32> {
        if self.valid {
            Some(self.value)
        } else {
            None
        }
    }
}

pub fn format_checksum(value: u32) -> String {
    format!("{:x}", value)
}

pub fn parse_checksum(raw: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(raw).ok()?;
    u32::from_str_radix(text.trim_end_matches('\0').trim(), 16).ok()
}

/// The Adler-32 checksum stored on the file, if any.
pub fn stored_checksum(handle: &dyn FileHandle) -> Option<u32> {
    let kind = handle.get_xattr(XATTR_CKSUM_TYPE).ok()??;
    if kind.as_slice() != CKSUM_TYPE_ADLER32.as_bytes() {
        return None;
    }
    let value = handle.get_xattr(XATTR_CKSUM_VALUE).ok()??;
    parse_checksum(&value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored(u32),
    Removed,
}

/// Checksum accumulated by a writer, persisted when the file is closed.
#[derive(Debug, Clone)]
pub struct WriteChecksum {
    running: RunningChecksum,
    baseline: Option<Vec<u8>>,
}

impl WriteChecksum {
    /// Start tracking writes beginning at `offset`. A write into the middle
    /// of a file can only be checksummed when the stored checksum covers
    /// exactly the existing content.
    pub fn start(handle: &dyn FileHandle, offset: u64) -> WriteChecksum {
        let baseline = handle.get_xattr(XATTR_CKSUM_VALUE).ok().flatten();
        let running = if offset == 0 {
            RunningChecksum::new()
        } else {
            let size = handle.fstat().map(|st| st.size).ok();
            match stored_checksum(handle) {
                Some(value) if size == Some(offset) => {
                    RunningChecksum::seeded(value, offset)
                }
                _ => RunningChecksum::invalid(offset),
            }
        };
        WriteChecksum { running, baseline }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.running.update(data);
    }

    pub fn update_at(&mut self, offset: u64, data: &[u8]) {
        self.running.update_at(offset, data);
    }

    pub fn value(&self) -> Option<u32> {
        self.running.value()
    }

    /// The written data is incomplete; only removal is possible now.
    pub fn invalidate(&mut self) {
        self.running = RunningChecksum::invalid(self.running.covered());
    }

    /// Store the checksum on the file. If another writer stored a checksum
    /// since this one started, or the checksum does not cover the whole
    /// file, the value attribute is removed instead. Attribute failures are
    /// only logged.
    pub fn persist(
        &self,
        handle: &mut dyn FileHandle,
        log: &Logger,
    ) -> PersistOutcome {
        let current = handle.get_xattr(XATTR_CKSUM_VALUE).ok().flatten();
        let concurrent = current.is_some() && current != self.baseline;
        let size = handle.fstat().map(|st| st.size).ok();
        let whole_file = size == Some(self.running.covered());
        match self.running.value() {
            Some(value) if !concurrent && whole_file => {
                let text = format_checksum(value);
                let stored = handle
                    .set_xattr(XATTR_CKSUM_TYPE, CKSUM_TYPE_ADLER32.as_bytes())
                    .and_then(|_| {
                        handle.set_xattr(XATTR_CKSUM_VALUE, text.as_bytes())
                    });
                match stored {
                    Ok(()) => {
                        debug!(log, "stored checksum"; "adler32" => &text);
                    }
                    Err(e) => {
                        warn!(log, "failed to store checksum";
                            "adler32" => &text, "err" => %e);
                    }
                }
                PersistOutcome::Stored(value)
            }
            _ => {
                if concurrent {
                    warn!(log, "checksum changed by a concurrent writer");
                }
                if let Err(e) = handle.remove_xattr(XATTR_CKSUM_VALUE) {
                    warn!(log, "failed to remove checksum"; "err" => %e);
                }
                PersistOutcome::Removed
            }
        }
    }
}

/// Verification of a read that started at the beginning of a file with a
/// stored checksum.
#[derive(Debug, Clone)]
pub struct ReadChecksum {
    running: RunningChecksum,
    expected: u32,
}

impl ReadChecksum {
    pub fn start(handle: &dyn FileHandle, offset: u64) -> Option<ReadChecksum> {
        if offset != 0 {
            return None;
        }
        stored_checksum(handle).map(|expected| ReadChecksum {
            running: RunningChecksum::new(),
            expected,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.running.update(data);
    }

    /// `Err(SECHECKSUM)` when the data read does not match the stored value.
    pub fn verify(&self) -> Result<(), i32> {
        match self.running.value() {
            Some(v) if v == self.expected => Ok(()),
            _ => Err(serrno::SECHECKSUM),
        }
    }
}
