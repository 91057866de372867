//! Admission control, accounting and chunking of incoming batches.
//!
//! [`SaveScheduler::submit`] decides synchronously whether a batch enters the
//! pending queue. It never waits: when the queue already holds too many bytes
//! the batch is dropped and counted as missed. Admitted batches are grouped
//! into [`Chunk`]s by capture time; the flush job pops whole chunks.
//!
//! Ledger kept by the scheduler, valid after every call:
//!
//! ```text
//! received  = scheduled + dropped
//! scheduled = saved + pending + discarded
//! ```
//!
//! `pending` covers queued chunks and the chunk(s) currently being written.
//! Queue RAM stays charged until a write completes, so bytes held by an
//! in-flight write still count against the budget.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stream_core::{BatchHeader, FrameBatch, FramePosition};

/// Running counters of one save session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveCounters {
    /// Frames offered while saving (after the batch-size cut)
    pub received: u64,
    /// Frames admitted to the queue
    pub scheduled: u64,
    /// Frames written to disk
    pub saved: u64,
    /// Frames lost to index gaps or RAM drops
    pub missed: u64,
    /// Frames rejected by the RAM budget
    pub dropped: u64,
    /// Admitted frames thrown away after a write error
    pub discarded: u64,
}

/// Admitted batches written together.
#[derive(Debug, Clone)]
pub struct Chunk {
    batches: Vec<FrameBatch>,
    start: DateTime<Utc>,
    nbytes: u64,
}

impl Chunk {
    fn new(batch: FrameBatch) -> Self {
        Self {
            start: batch.creation_time(),
            nbytes: batch.nbytes(),
            batches: vec![batch],
        }
    }

    fn push(&mut self, batch: FrameBatch) {
        self.nbytes += batch.nbytes();
        self.batches.push(batch);
    }

    /// Batches in submission order.
    pub fn batches(&self) -> &[FrameBatch] {
        &self.batches
    }

    /// Creation time of the first batch.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Pixel bytes held.
    pub fn nbytes(&self) -> u64 {
        self.nbytes
    }

    /// Number of frames held.
    pub fn frames(&self) -> u64 {
        self.batches.iter().map(|b| b.len() as u64).sum()
    }
}

/// Outcome of [`SaveScheduler::submit`].
#[derive(Debug)]
pub enum Admission {
    /// Batch queued for writing
    Queued,
    /// Batch counted, but dropped because the queue is over budget
    Dropped,
    /// Batch not taken: the scheduler is not accepting, or the session's
    /// frame limit is already reached. The batch is handed back untouched.
    Refused(FrameBatch),
}

impl Admission {
    /// Whether the session accounted for the batch (queued or dropped).
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, Admission::Refused(_))
    }
}

/// Admission control and the pending chunk queue.
#[derive(Debug)]
pub struct SaveScheduler {
    accepting: bool,
    batch_limit: Option<u64>,
    chunk_period: Duration,
    max_queue_ram: u64,
    queue: VecDeque<Chunk>,
    queue_ram: u64,
    in_flight_frames: u64,
    counters: SaveCounters,
    first_seen: Option<FramePosition>,
    last_seen: Option<FramePosition>,
    drop_reported: bool,
}

impl SaveScheduler {
    /// Scheduler that is not accepting yet.
    pub fn new(chunk_period: Duration, max_queue_ram: u64) -> Self {
        Self {
            accepting: false,
            batch_limit: None,
            chunk_period,
            max_queue_ram,
            queue: VecDeque::new(),
            queue_ram: 0,
            in_flight_frames: 0,
            counters: SaveCounters::default(),
            first_seen: None,
            last_seen: None,
            drop_reported: false,
        }
    }

    /// Reset counters and start accepting, with an optional frame limit.
    ///
    /// Any chunk still queued is discarded; callers drain first.
    pub fn start(&mut self, batch_limit: Option<u64>) {
        if !self.queue.is_empty() || self.in_flight_frames > 0 {
            tracing::warn!(
                chunks = self.queue.len(),
                "Restarting scheduler with pending chunks"
            );
        }
        self.queue.clear();
        self.queue_ram = 0;
        self.in_flight_frames = 0;
        self.counters = SaveCounters::default();
        self.first_seen = None;
        self.last_seen = None;
        self.drop_reported = false;
        self.batch_limit = batch_limit;
        self.accepting = true;
    }

    /// Stop admitting new batches. Queued chunks stay queued.
    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    /// Whether batches are admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Offer `batch` to the queue.
    pub fn submit(&mut self, mut batch: FrameBatch) -> Admission {
        if !self.accepting {
            return Admission::Refused(batch);
        }
        if let Some(limit) = self.batch_limit {
            let room = limit.saturating_sub(self.counters.scheduled);
            if room == 0 {
                return Admission::Refused(batch);
            }
            batch.cut_to_size(usize::try_from(room).unwrap_or(usize::MAX), false);
        }

        let n = batch.len() as u64;
        let nbytes = batch.nbytes();
        let gap = self.observe(&batch.header());

        if self.queue_ram + nbytes <= self.max_queue_ram {
            self.counters.missed += gap;
            self.counters.scheduled += n;
            self.queue_ram += nbytes;
            self.enqueue(batch);
            Admission::Queued
        } else {
            self.record_drop(gap, n);
            Admission::Dropped
        }
    }

    /// Count a batch whose frames were released before it reached the queue.
    ///
    /// Accounted like a RAM drop. Returns `false` if the scheduler is not
    /// accepting or the frame limit is already reached.
    pub fn shed(&mut self, mut header: BatchHeader) -> bool {
        if !self.accepting {
            return false;
        }
        if let Some(limit) = self.batch_limit {
            let room = limit.saturating_sub(self.counters.scheduled);
            if room == 0 {
                return false;
            }
            header.truncate(room);
        }
        let gap = self.observe(&header);
        self.record_drop(gap, header.len);
        true
    }

    /// Update the last-seen position; returns the gap before the batch.
    fn observe(&mut self, header: &BatchHeader) -> u64 {
        let previous = self.last_seen;
        if self.first_seen.is_none() {
            self.first_seen = Some(FramePosition {
                index: header.first_index,
                session_id: header.session_id,
            });
        }
        self.last_seen = Some(header.last_position());
        self.counters.received += header.len;
        header.missing_since(previous)
    }

    fn record_drop(&mut self, gap: u64, n: u64) {
        self.counters.missed += gap + n;
        self.counters.dropped += n;
        if !self.drop_reported {
            tracing::warn!(
                frames = n,
                queue_ram = self.queue_ram,
                max_queue_ram = self.max_queue_ram,
                "Save queue RAM budget exceeded, dropping frames"
            );
            self.drop_reported = true;
        } else {
            tracing::debug!(frames = n, "Dropped batch");
        }
    }

    fn enqueue(&mut self, batch: FrameBatch) {
        let created = batch.creation_time();
        if let Some(last) = self.queue.back_mut() {
            // Negative elapsed time (clock step) keeps the current chunk.
            let same_window = match (created - last.start).to_std() {
                Ok(elapsed) => elapsed < self.chunk_period,
                Err(_) => true,
            };
            if same_window {
                last.push(batch);
                return;
            }
        }
        self.queue.push_back(Chunk::new(batch));
    }

    /// Pop the oldest chunk for writing.
    ///
    /// Its bytes stay charged to the queue until [`finish_chunk`](Self::finish_chunk).
    pub fn pop_chunk(&mut self) -> Option<Chunk> {
        let chunk = self.queue.pop_front()?;
        self.in_flight_frames += chunk.frames();
        Some(chunk)
    }

    /// Account for a popped chunk of `frames` frames and `nbytes` bytes, of
    /// which `saved` reached the disk. The rest is discarded.
    pub fn finish_chunk(&mut self, frames: u64, nbytes: u64, saved: u64) {
        let saved = saved.min(frames);
        self.in_flight_frames = self.in_flight_frames.saturating_sub(frames);
        self.queue_ram = self.queue_ram.saturating_sub(nbytes);
        self.counters.saved += saved;
        self.counters.discarded += frames - saved;
    }

    /// Throw away every queued chunk. Returns the number of frames discarded.
    pub fn discard_queue(&mut self) -> u64 {
        let mut frames = 0;
        for chunk in self.queue.drain(..) {
            frames += chunk.frames();
            self.queue_ram = self.queue_ram.saturating_sub(chunk.nbytes);
        }
        self.counters.discarded += frames;
        frames
    }

    /// Change the admission ceiling; applies from the next submission.
    pub fn set_max_queue_ram(&mut self, max_queue_ram: u64) {
        self.max_queue_ram = max_queue_ram;
    }

    /// Admission ceiling in bytes.
    pub fn max_queue_ram(&self) -> u64 {
        self.max_queue_ram
    }

    /// Bytes charged to the queue, in-flight writes included.
    pub fn queue_ram(&self) -> u64 {
        self.queue_ram
    }

    /// Number of chunks waiting to be written.
    pub fn queued_chunks(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued or being written.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight_frames == 0
    }

    /// Admitted frames not yet saved or discarded.
    pub fn pending_frames(&self) -> u64 {
        self.queue.iter().map(Chunk::frames).sum::<u64>() + self.in_flight_frames
    }

    /// Counters of the current session.
    pub fn counters(&self) -> SaveCounters {
        self.counters
    }

    /// Frame limit of the current session.
    pub fn batch_limit(&self) -> Option<u64> {
        self.batch_limit
    }

    /// Whether the session has scheduled as many frames as its limit.
    pub fn limit_reached(&self) -> bool {
        self.batch_limit
            .is_some_and(|limit| self.counters.scheduled >= limit)
    }

    /// First frame offered this session.
    pub fn first_seen(&self) -> Option<FramePosition> {
        self.first_seen
    }

    /// Last frame offered this session, admitted or not.
    pub fn last_seen(&self) -> Option<FramePosition> {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_core::Frame;

    const FRAME_BYTES: u64 = 16 * 16 * 2;

    fn batch(first: u64, n: usize) -> FrameBatch {
        let frames = (0..n)
            .map(|_| Frame::from_u16(16, 16, &[0u16; 256]).unwrap())
            .collect();
        FrameBatch::new(frames, first).unwrap()
    }

    fn started(max_queue_ram: u64) -> SaveScheduler {
        let mut s = SaveScheduler::new(Duration::from_millis(200), max_queue_ram);
        s.start(None);
        s
    }

    #[test]
    fn test_contiguous_then_gap() {
        let mut s = started(u64::MAX);
        for first in [0, 10, 20] {
            assert!(matches!(s.submit(batch(first, 10)), Admission::Queued));
        }
        let c = s.counters();
        assert_eq!((c.received, c.scheduled, c.missed), (30, 30, 0));

        s.submit(batch(35, 10));
        assert_eq!(s.counters().missed, 5);
        assert_eq!(s.counters().scheduled, 40);
    }

    #[test]
    fn test_ram_budget_drops_second_batch() {
        let mut s = started(10 * FRAME_BYTES);
        assert!(matches!(s.submit(batch(1, 10)), Admission::Queued));
        let second = s.submit(batch(11, 10));
        assert!(matches!(second, Admission::Dropped));
        assert!(second.is_scheduled());

        let c = s.counters();
        assert_eq!(c.received, 20);
        assert_eq!(c.scheduled, 10);
        assert_eq!(c.missed, 10);
        assert_eq!(c.dropped, 10);
        assert!(s.queue_ram() <= s.max_queue_ram());
    }

    #[test]
    fn test_drop_counts_gap_before_dropped_batch() {
        let mut s = started(10 * FRAME_BYTES);
        s.submit(batch(1, 10));
        s.submit(batch(15, 10));
        // 11..14 skipped plus the 10 dropped frames.
        assert_eq!(s.counters().missed, 14);
        // The next admitted batch is measured against the dropped one.
        let chunk = s.pop_chunk().unwrap();
        s.finish_chunk(chunk.frames(), chunk.nbytes(), 10);
        s.submit(batch(25, 10));
        assert_eq!(s.counters().missed, 14);
    }

    #[test]
    fn test_shed_batch_counted_as_dropped() {
        let mut s = SaveScheduler::new(Duration::from_millis(200), u64::MAX);
        assert!(!s.shed(batch(1, 4).header()));
        s.start(Some(12));
        s.submit(batch(1, 4));
        assert!(s.shed(batch(8, 20).header()));
        let c = s.counters();
        // 5..7 skipped, then the shed frames cut to the remaining room of 8.
        assert_eq!(c.received, 12);
        assert_eq!(c.dropped, 8);
        assert_eq!(c.missed, 11);
        assert_eq!(s.pending_frames(), 4);
        assert_eq!(s.queue_ram(), 4 * FRAME_BYTES);
        assert_eq!(s.last_seen().unwrap().index, 15);

        s.submit(batch(16, 20));
        assert!(s.limit_reached());
        assert!(!s.shed(batch(48, 2).header()));
    }

    #[test]
    fn test_reset_not_counted() {
        let mut s = started(u64::MAX);
        s.submit(batch(100, 10));
        s.submit(batch(0, 10));
        assert_eq!(s.counters().missed, 0);
        s.submit(batch(50, 10).with_session_id(3));
        assert_eq!(s.counters().missed, 0);
    }

    #[test]
    fn test_batch_limit_cuts_and_refuses() {
        let mut s = SaveScheduler::new(Duration::from_millis(200), u64::MAX);
        s.start(Some(15));
        s.submit(batch(0, 10));
        assert!(!s.limit_reached());
        s.submit(batch(10, 10));
        assert_eq!(s.counters().scheduled, 15);
        assert_eq!(s.counters().received, 15);
        assert!(s.limit_reached());
        match s.submit(batch(20, 10)) {
            Admission::Refused(b) => assert_eq!(b.len(), 10),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[test]
    fn test_not_accepting_refuses() {
        let mut s = SaveScheduler::new(Duration::from_millis(200), u64::MAX);
        assert!(!s.submit(batch(0, 1)).is_scheduled());
        s.start(None);
        s.stop_accepting();
        assert!(!s.submit(batch(0, 1)).is_scheduled());
        assert_eq!(s.counters().received, 0);
    }

    #[test]
    fn test_chunks_group_by_creation_time() {
        let mut s = started(u64::MAX);
        let t0 = Utc::now();
        s.submit(batch(1, 2).with_creation_time(t0));
        s.submit(batch(3, 2).with_creation_time(t0 + chrono::Duration::milliseconds(150)));
        s.submit(batch(5, 2).with_creation_time(t0 + chrono::Duration::milliseconds(250)));
        assert_eq!(s.queued_chunks(), 2);
        let first = s.pop_chunk().unwrap();
        assert_eq!(first.batches().len(), 2);
        assert_eq!(first.frames(), 4);
        assert_eq!(first.nbytes(), 4 * FRAME_BYTES);
        assert_eq!(first.start(), t0);
    }

    #[test]
    fn test_ram_released_after_write() {
        let mut s = started(u64::MAX);
        s.submit(batch(1, 4));
        let chunk = s.pop_chunk().unwrap();
        assert_eq!(s.queue_ram(), 4 * FRAME_BYTES);
        assert_eq!(s.pending_frames(), 4);
        s.finish_chunk(chunk.frames(), chunk.nbytes(), 3);
        assert_eq!(s.queue_ram(), 0);
        let c = s.counters();
        assert_eq!((c.saved, c.discarded), (3, 1));
        assert!(s.is_idle());
    }

    #[test]
    fn test_discard_queue() {
        let mut s = started(u64::MAX);
        let t0 = Utc::now();
        s.submit(batch(1, 4).with_creation_time(t0));
        s.submit(batch(5, 4).with_creation_time(t0 + chrono::Duration::seconds(1)));
        assert_eq!(s.discard_queue(), 8);
        assert_eq!(s.queue_ram(), 0);
        let c = s.counters();
        assert_eq!(c.scheduled, c.saved + s.pending_frames() + c.discarded);
    }
}
