//! Pretrigger ring of recent frame batches.
//!
//! The buffer keeps whole batches (never individual frames) until their total
//! frame count reaches the capacity. Evicting whole batches can leave fewer
//! frames than the capacity; in strict mode the oldest surviving batch is
//! trimmed from its head instead, so the count lands exactly on the capacity.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use stream_core::{FrameBatch, FramePosition};

/// Snapshot of the buffer occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PretriggerStatus {
    /// Frames held
    pub frames: u64,
    /// Index gaps between held batches (resets excluded)
    pub skipped: u64,
    /// Bytes held
    pub bytes: u64,
    /// Maximum number of frames
    pub capacity: u64,
}

/// Bounded ring of [`FrameBatch`]es.
#[derive(Debug, Clone)]
pub struct PretriggerBuffer {
    capacity: usize,
    strict_size: bool,
    clear_on_reset: bool,
    batches: VecDeque<FrameBatch>,
    current_size: usize,
}

impl PretriggerBuffer {
    /// Create an empty buffer holding up to `capacity` frames.
    pub fn new(capacity: usize, strict_size: bool, clear_on_reset: bool) -> Self {
        Self {
            capacity,
            strict_size,
            clear_on_reset,
            batches: VecDeque::new(),
            current_size: 0,
        }
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently held.
    pub fn len(&self) -> usize {
        self.current_size
    }

    /// Whether no batch is held.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of batches held.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Bytes currently held.
    pub fn nbytes(&self) -> u64 {
        self.batches.iter().map(FrameBatch::nbytes).sum()
    }

    /// Add the newest batch, evicting the oldest ones as needed.
    pub fn add_batch(&mut self, batch: FrameBatch) {
        if batch.is_empty() {
            return;
        }
        if batch.first_index() == 0 && self.clear_on_reset {
            self.clear();
        }
        self.current_size += batch.len();
        self.batches.push_back(batch);
        while let Some(oldest) = self.batches.front() {
            if self.current_size - oldest.len() < self.capacity {
                break;
            }
            self.current_size -= oldest.len();
            self.batches.pop_front();
        }
        if self.strict_size && self.current_size > self.capacity {
            let excess = self.current_size - self.capacity;
            if let Some(oldest) = self.batches.front_mut() {
                let keep = oldest.len() - excess;
                oldest.cut_to_size(keep, true);
                self.current_size -= excess;
            }
        }
    }

    /// Remove and return the oldest batch.
    pub fn pop_oldest(&mut self) -> Option<FrameBatch> {
        let batch = self.batches.pop_front()?;
        self.current_size -= batch.len();
        Some(batch)
    }

    /// Drop all batches.
    pub fn clear(&mut self) {
        self.batches.clear();
        self.current_size = 0;
    }

    /// Occupancy snapshot.
    pub fn status(&self) -> PretriggerStatus {
        let mut skipped = 0;
        let mut previous: Option<FramePosition> = None;
        for batch in &self.batches {
            skipped += batch.missing_since(previous);
            previous = Some(batch.last_position());
        }
        PretriggerStatus {
            frames: self.current_size as u64,
            skipped,
            bytes: self.nbytes(),
            capacity: self.capacity as u64,
        }
    }

    /// A new buffer of `capacity`, optionally re-filled with this buffer's
    /// batches oldest first.
    pub fn resized(mut self, capacity: usize, preserve_frames: bool) -> Self {
        let mut resized = PretriggerBuffer::new(capacity, self.strict_size, self.clear_on_reset);
        if preserve_frames {
            while let Some(batch) = self.pop_oldest() {
                resized.add_batch(batch);
            }
        }
        resized
    }
}
