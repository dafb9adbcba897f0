//! Growable window accumulator.
//!
//! Samples live in one `Vec<f32>` whose length is the physical capacity; only
//! the first `len` entries are logical content. Appending past capacity grows
//! the backing store to `max(2 × needed, RING_MIN_CAPACITY)`. Consuming from
//! the front shifts the remainder down with `copy_within`, so the allocation
//! stays bounded by the largest backlog ever held rather than total history.

use crate::error::{FacecastError, Result};

/// Floor for the backing allocation: four seconds at 16 kHz.
pub const RING_MIN_CAPACITY: usize = 16_000 * 4;

#[derive(Debug, Clone)]
pub struct AudioRingBuffer {
    buf: Vec<f32>,
    len: usize,
}

impl AudioRingBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0.0; RING_MIN_CAPACITY],
            len: 0,
        }
    }

    /// Logical number of buffered samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical capacity. Never shrinks.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn has_window(&self, window_len: usize) -> bool {
        self.len >= window_len
    }

    /// Append samples at the logical end, growing the backing store if needed.
    pub fn append(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let needed = self.len + samples.len();
        if needed > self.buf.len() {
            let new_cap = (needed * 2).max(RING_MIN_CAPACITY);
            // Resizing a Vec keeps the logical prefix in place.
            self.buf.resize(new_cap, 0.0);
        }
        self.buf[self.len..needed].copy_from_slice(samples);
        self.len = needed;
    }

    /// Drop the first `n` logical samples.
    ///
    /// # Errors
    /// `FacecastError::Range` if `n` exceeds the buffered length.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(FacecastError::range(format!(
                "cannot consume {n} samples, only {} buffered",
                self.len
            )));
        }
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
        Ok(())
    }

    /// Read-only view of the first `window_len` samples.
    ///
    /// # Errors
    /// `FacecastError::Range` if fewer than `window_len` samples are buffered.
    pub fn peek_window(&self, window_len: usize) -> Result<&[f32]> {
        if window_len > self.len {
            return Err(FacecastError::range(format!(
                "window of {window_len} samples requested, only {} buffered",
                self.len
            )));
        }
        Ok(&self.buf[..window_len])
    }

    /// Forget all buffered samples. Capacity is kept.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for AudioRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
