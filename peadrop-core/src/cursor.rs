//! Transfer cursor and throughput accounting shared by the sending and receiving roles.

use std::time::Instant;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024; // 256 KiB

/// Number of chunk frames needed to stream `total_len` bytes. Zero-length files need none.
pub fn chunk_count(total_len: u64, chunk_size: usize) -> u64 {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    } as u64;
    total_len.div_ceil(size)
}

/// Percent of the current item done: `floor(done / declared * 100)`, 100 for zero-size items.
pub fn item_progress(done: u64, declared: u64) -> u8 {
    if declared == 0 {
        return 100;
    }
    ((done.min(declared) as u128 * 100) / declared as u128) as u8
}

/// Position within an item list. Advances strictly forward; a completed item is
/// never revisited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferCursor {
    index: usize,
    total: usize,
    bytes_done: u64,
    declared: u64,
}

impl TransferCursor {
    pub fn new(total: usize) -> Self {
        Self {
            index: 0,
            total,
            bytes_done: 0,
            declared: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Raise the expected item count (the receiver learns it from the handshake).
    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.total
    }

    /// Start streaming the current item with `declared` bytes; counters reset.
    pub fn begin_item(&mut self, declared: u64) {
        self.bytes_done = 0;
        self.declared = declared;
    }

    /// Record `n` bytes of the current item. Returns false if the item overran its declared size.
    pub fn record(&mut self, n: u64) -> bool {
        self.bytes_done = self.bytes_done.saturating_add(n);
        self.bytes_done <= self.declared
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn declared(&self) -> u64 {
        self.declared
    }

    pub fn remaining(&self) -> u64 {
        self.declared.saturating_sub(self.bytes_done)
    }

    pub fn item_complete(&self) -> bool {
        self.bytes_done == self.declared
    }

    /// Move past the current item, whether it completed or was skipped.
    pub fn advance(&mut self) {
        self.index += 1;
        self.bytes_done = 0;
        self.declared = 0;
        if self.index > self.total {
            self.total = self.index;
        }
    }

    pub fn item_progress(&self) -> u8 {
        item_progress(self.bytes_done, self.declared)
    }

    /// Items completed (or skipped) out of the total, as a percentage.
    pub fn total_progress(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.index.min(self.total) * 100) / self.total) as u8
    }
}

/// Bytes-per-second meter. `speed()` reports the rate since the previous call and resets.
#[derive(Debug, Clone)]
pub struct Throughput {
    bytes_since: u64,
    last_at: Instant,
    last_speed: u64,
}

impl Throughput {
    pub fn new(now: Instant) -> Self {
        Self {
            bytes_since: 0,
            last_at: now,
            last_speed: 0,
        }
    }

    pub fn record(&mut self, n: u64) {
        self.bytes_since = self.bytes_since.saturating_add(n);
    }

    /// Bytes/sec since the previous call. If no time has elapsed, returns the previous value.
    pub fn speed(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed.is_zero() {
            return self.last_speed;
        }
        self.last_speed = (self.bytes_since as f64 / elapsed.as_secs_f64()) as u64;
        self.bytes_since = 0;
        self.last_at = now;
        self.last_speed
    }

    /// Last value computed by `speed()`, without resetting anything.
    pub fn last_speed(&self) -> u64 {
        self.last_speed
    }
}
