//! Bounded pool of fixed-size buffers cycling through the pipeline.
//!
//! Every buffer is always in exactly one state. Queued states (`Empty`,
//! `PendingTest`, `TestedGood`) live inside the pool; held states
//! (`Filling`, `Testing`, `Draining`) mean one stage owns the bytes through a
//! [`Buffer`] handle. Ownership moves with the handle, so no two stages can
//! ever touch the same bytes. Filled buffers reach the sink in the order they
//! were filled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::warn;
use serde::Serialize;

use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferState {
    Empty,
    Filling,
    PendingTest,
    Testing,
    TestedGood,
    TestedBad,
    Draining,
}

/// Outcome of testing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Exclusive handle to one pool buffer.
#[derive(Debug)]
pub struct Buffer {
    pool_id: u64,
    index: usize,
    seq: u64,
    state: BufferState,
    data: Box<[u8]>,
    fill_len: usize,
    entropy_estimate_bits: u64,
}

impl Buffer {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Position in fill order; assigned by [`BufferPool::commit_filled`].
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn fill_len(&self) -> usize {
        self.fill_len
    }

    /// The valid bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.fill_len]
    }

    /// The whole backing storage, for the source to write into.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn entropy_estimate_bits(&self) -> u64 {
        self.entropy_estimate_bits
    }

    pub fn set_entropy_estimate_bits(&mut self, bits: u64) {
        self.entropy_estimate_bits = bits;
    }
}

/// Number of buffers in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCensus {
    pub empty: usize,
    pub filling: usize,
    pub pending_test: usize,
    pub testing: usize,
    pub tested_good: usize,
    pub draining: usize,
}

impl PoolCensus {
    pub fn total(&self) -> usize {
        self.empty + self.filling + self.pending_test + self.testing + self.tested_good + self.draining
    }
}

#[derive(Clone, Copy)]
enum Queue {
    Empty,
    Pending,
    Ready,
}

impl Queue {
    fn queued_state(self) -> BufferState {
        match self {
            Self::Empty => BufferState::Empty,
            Self::Pending => BufferState::PendingTest,
            Self::Ready => BufferState::TestedGood,
        }
    }

    fn held_state(self) -> BufferState {
        match self {
            Self::Empty => BufferState::Filling,
            Self::Pending => BufferState::Testing,
            Self::Ready => BufferState::Draining,
        }
    }
}

struct Slot {
    state: BufferState,
    data: Option<Box<[u8]>>,
    fill_len: usize,
    seq: u64,
}

struct PoolInner {
    slots: Vec<Slot>,
    empty: VecDeque<usize>,
    pending: VecDeque<usize>,
    ready: VecDeque<usize>,
    next_seq: u64,
    ready_lowmark: usize,
    closed: bool,
}

impl PoolInner {
    fn queue_mut(&mut self, queue: Queue) -> &mut VecDeque<usize> {
        match queue {
            Queue::Empty => &mut self.empty,
            Queue::Pending => &mut self.pending,
            Queue::Ready => &mut self.ready,
        }
    }

    fn push(&mut self, queue: Queue, index: usize) {
        self.slots[index].state = queue.queued_state();
        self.queue_mut(queue).push_back(index);
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub struct BufferPool {
    id: u64,
    capacity: usize,
    size: usize,
    inner: Mutex<PoolInner>,
    empty_cv: Condvar,
    pending_cv: Condvar,
    ready_cv: Condvar,
}

impl BufferPool {
    /// A pool of `buffers` buffers of `capacity` bytes, all empty.
    pub fn new(buffers: usize, capacity: usize) -> Self {
        let slots = (0..buffers)
            .map(|_| Slot {
                state: BufferState::Empty,
                data: Some(vec![0u8; capacity].into_boxed_slice()),
                fill_len: 0,
                seq: 0,
            })
            .collect();
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            size: buffers,
            inner: Mutex::new(PoolInner {
                slots,
                empty: (0..buffers).collect(),
                pending: VecDeque::with_capacity(buffers),
                ready: VecDeque::with_capacity(buffers),
                next_seq: 0,
                ready_lowmark: buffers.saturating_sub(1),
                closed: false,
            }),
            empty_cv: Condvar::new(),
            pending_cv: Condvar::new(),
            ready_cv: Condvar::new(),
        }
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes per buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// Block until an empty buffer is available; it becomes `Filling`.
    pub fn acquire_empty(&self) -> Result<Buffer, PoolError> {
        self.acquire_blocking(Queue::Empty)
    }

    pub fn acquire_empty_timeout(&self, timeout: Duration) -> Result<Option<Buffer>, PoolError> {
        self.acquire(Queue::Empty, Some(timeout))
    }

    /// Block until the oldest filled buffer is available; it becomes `Testing`.
    pub fn acquire_for_test(&self) -> Result<Buffer, PoolError> {
        self.acquire_blocking(Queue::Pending)
    }

    pub fn acquire_for_test_timeout(&self, timeout: Duration) -> Result<Option<Buffer>, PoolError> {
        self.acquire(Queue::Pending, Some(timeout))
    }

    /// Block until the oldest tested-good buffer is available; it becomes `Draining`.
    pub fn acquire_for_sink(&self) -> Result<Buffer, PoolError> {
        self.acquire_blocking(Queue::Ready)
    }

    /// Like [`acquire_for_sink`](Self::acquire_for_sink), giving up after
    /// `timeout` with `Ok(None)` so the caller can count starvation.
    pub fn acquire_for_sink_timeout(&self, timeout: Duration) -> Result<Option<Buffer>, PoolError> {
        self.acquire(Queue::Ready, Some(timeout))
    }

    fn acquire_blocking(&self, queue: Queue) -> Result<Buffer, PoolError> {
        match self.acquire(queue, None)? {
            Some(buf) => Ok(buf),
            None => Err(PoolError::Closed),
        }
    }

    fn acquire(&self, queue: Queue, timeout: Option<Duration>) -> Result<Option<Buffer>, PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let cv = self.condvar(queue);
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(PoolError::Closed);
            }
            if let Some(index) = inner.queue_mut(queue).pop_front() {
                if let Queue::Ready = queue {
                    inner.ready_lowmark = inner.ready_lowmark.min(inner.ready.len());
                }
                return Ok(Some(self.take(&mut inner, index, queue.held_state())));
            }
            inner = match deadline {
                None => cv.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    cv.wait_timeout(inner, deadline - now).unwrap().0
                }
            };
        }
    }

    fn take(&self, inner: &mut PoolInner, index: usize, state: BufferState) -> Buffer {
        let slot = &mut inner.slots[index];
        slot.state = state;
        let data = slot
            .data
            .take()
            .unwrap_or_else(|| vec![0u8; self.capacity].into_boxed_slice());
        Buffer {
            pool_id: self.id,
            index,
            seq: slot.seq,
            state,
            data,
            fill_len: slot.fill_len,
            entropy_estimate_bits: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Commit / release
    // -----------------------------------------------------------------------

    /// Hand a filled buffer on to the tester. Returns its fill sequence number.
    pub fn commit_filled(&self, buf: Buffer, fill_len: usize) -> Result<u64, PoolError> {
        if fill_len > buf.capacity() {
            let err = PoolError::Overfill {
                len: fill_len,
                capacity: buf.capacity(),
            };
            self.recycle(buf)?;
            return Err(err);
        }
        let mut inner = self.lock();
        self.check(&inner, &buf, &[BufferState::Filling], BufferState::PendingTest)
            .inspect_err(|_| self.restore_empty(&mut inner, buf_parts(&buf)))?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let index = buf.index;
        let slot = &mut inner.slots[index];
        slot.data = Some(buf.data);
        slot.fill_len = fill_len;
        slot.seq = seq;
        inner.push(Queue::Pending, index);
        drop(inner);
        self.pending_cv.notify_one();
        Ok(seq)
    }

    /// Record the test outcome. Passing buffers queue for the sink; failing
    /// ones are discarded and go straight back to `Empty`.
    pub fn commit_tested(&self, buf: Buffer, verdict: Verdict) -> Result<(), PoolError> {
        let to = match verdict {
            Verdict::Pass => BufferState::TestedGood,
            Verdict::Fail => BufferState::TestedBad,
        };
        let mut inner = self.lock();
        self.check(&inner, &buf, &[BufferState::Testing], to)
            .inspect_err(|_| self.restore_empty(&mut inner, buf_parts(&buf)))?;
        let index = buf.index;
        let slot = &mut inner.slots[index];
        slot.data = Some(buf.data);
        match verdict {
            Verdict::Pass => {
                inner.push(Queue::Ready, index);
                drop(inner);
                self.ready_cv.notify_one();
            }
            Verdict::Fail => {
                slot.fill_len = 0;
                inner.push(Queue::Empty, index);
                drop(inner);
                self.empty_cv.notify_one();
            }
        }
        Ok(())
    }

    /// Return a buffer to `Empty`. Used by the sink after submission, and by
    /// any stage abandoning a buffer it holds (e.g. on shutdown).
    pub fn release_empty(&self, buf: Buffer) -> Result<(), PoolError> {
        let mut inner = self.lock();
        self.check(
            &inner,
            &buf,
            &[BufferState::Draining, BufferState::Filling, BufferState::Testing],
            BufferState::Empty,
        )?;
        let index = buf.index;
        let slot = &mut inner.slots[index];
        slot.data = Some(buf.data);
        slot.fill_len = 0;
        inner.push(Queue::Empty, index);
        drop(inner);
        self.empty_cv.notify_one();
        Ok(())
    }

    /// Put a buffer back as `Empty` without state checks beyond ownership.
    fn recycle(&self, buf: Buffer) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if buf.pool_id != self.id || buf.index >= inner.slots.len() {
            return Err(PoolError::ForeignBuffer { index: buf.index });
        }
        let index = buf.index;
        inner.slots[index].data = Some(buf.data);
        inner.slots[index].fill_len = 0;
        inner.push(Queue::Empty, index);
        drop(inner);
        self.empty_cv.notify_one();
        Ok(())
    }

    fn check(
        &self,
        inner: &PoolInner,
        buf: &Buffer,
        allowed: &[BufferState],
        to: BufferState,
    ) -> Result<(), PoolError> {
        if buf.pool_id != self.id || buf.index >= inner.slots.len() {
            return Err(PoolError::ForeignBuffer { index: buf.index });
        }
        let slot_state = inner.slots[buf.index].state;
        if !allowed.contains(&buf.state) || slot_state != buf.state {
            return Err(PoolError::InvalidTransition {
                index: buf.index,
                from: buf.state,
                to,
            });
        }
        Ok(())
    }

    /// After a rejected transition, the slot's bytes are gone with the handle;
    /// give the slot fresh storage so the pool keeps all of its buffers.
    fn restore_empty(&self, inner: &mut PoolInner, (pool_id, index): (u64, usize)) {
        if pool_id != self.id || index >= inner.slots.len() {
            return;
        }
        let slot = &inner.slots[index];
        let queued = matches!(
            slot.state,
            BufferState::Empty | BufferState::PendingTest | BufferState::TestedGood
        );
        if queued || slot.data.is_some() {
            return;
        }
        warn!("buffer {index} misused, returning it to the pool empty");
        inner.slots[index].data = Some(vec![0u8; self.capacity].into_boxed_slice());
        inner.slots[index].fill_len = 0;
        inner.push(Queue::Empty, index);
        self.empty_cv.notify_one();
    }

    // -----------------------------------------------------------------------
    // Shutdown and introspection
    // -----------------------------------------------------------------------

    /// Close the pool. Every blocked and future acquire fails with
    /// [`PoolError::Closed`]; commits and releases still work.
    pub fn close(&self) {
        self.lock().closed = true;
        self.empty_cv.notify_all();
        self.pending_cv.notify_all();
        self.ready_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn census(&self) -> PoolCensus {
        let inner = self.lock();
        let mut census = PoolCensus::default();
        for slot in &inner.slots {
            match slot.state {
                BufferState::Empty | BufferState::TestedBad => census.empty += 1,
                BufferState::Filling => census.filling += 1,
                BufferState::PendingTest => census.pending_test += 1,
                BufferState::Testing => census.testing += 1,
                BufferState::TestedGood => census.tested_good += 1,
                BufferState::Draining => census.draining += 1,
            }
        }
        census
    }

    /// Tested-good buffers waiting for the sink.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Lowest ready-queue depth seen by the sink since the last call.
    /// Resets the mark to `len() - 1`.
    pub fn take_ready_lowmark(&self) -> usize {
        let mut inner = self.lock();
        let mark = inner.ready_lowmark;
        inner.ready_lowmark = self.size.saturating_sub(1);
        mark
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap()
    }

    fn condvar(&self, queue: Queue) -> &Condvar {
        match queue {
            Queue::Empty => &self.empty_cv,
            Queue::Pending => &self.pending_cv,
            Queue::Ready => &self.ready_cv,
        }
    }
}

fn buf_parts(buf: &Buffer) -> (u64, usize) {
    (buf.pool_id, buf.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn fill(pool: &BufferPool, byte: u8) -> u64 {
        let mut buf = pool.acquire_empty().unwrap();
        let n = buf.capacity();
        buf.space_mut().fill(byte);
        pool.commit_filled(buf, n).unwrap()
    }

    fn pass_one(pool: &BufferPool) {
        let buf = pool.acquire_for_test().unwrap();
        pool.commit_tested(buf, Verdict::Pass).unwrap();
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn test_full_cycle() {
        let pool = BufferPool::new(3, 16);
        assert_eq!(pool.census().empty, 3);

        let mut buf = pool.acquire_empty().unwrap();
        assert_eq!(buf.state(), BufferState::Filling);
        buf.space_mut()[..4].copy_from_slice(b"abcd");
        assert_eq!(pool.census().filling, 1);
        pool.commit_filled(buf, 4).unwrap();
        assert_eq!(pool.census().pending_test, 1);

        let buf = pool.acquire_for_test().unwrap();
        assert_eq!(buf.state(), BufferState::Testing);
        assert_eq!(buf.filled(), b"abcd");
        pool.commit_tested(buf, Verdict::Pass).unwrap();
        assert_eq!(pool.census().tested_good, 1);

        let buf = pool.acquire_for_sink().unwrap();
        assert_eq!(buf.state(), BufferState::Draining);
        assert_eq!(buf.fill_len(), 4);
        pool.release_empty(buf).unwrap();

        let census = pool.census();
        assert_eq!(census.empty, 3);
        assert_eq!(census.total(), 3);
    }

    #[test]
    fn test_failed_buffer_goes_back_to_empty() {
        let pool = BufferPool::new(2, 8);
        fill(&pool, 0);
        let buf = pool.acquire_for_test().unwrap();
        pool.commit_tested(buf, Verdict::Fail).unwrap();
        let census = pool.census();
        assert_eq!(census.empty, 2);
        assert_eq!(census.tested_good, 0);
        assert!(pool.acquire_for_sink_timeout(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_fifo_order_by_fill_sequence() {
        let pool = BufferPool::new(4, 8);
        let seqs: Vec<u64> = (1..=4).map(|b| fill(&pool, b)).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        for _ in 0..4 {
            pass_one(&pool);
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            let buf = pool.acquire_for_sink().unwrap();
            seen.push((buf.seq(), buf.filled()[0]));
            pool.release_empty(buf).unwrap();
        }
        assert_eq!(seen, vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
    }

    #[test]
    fn test_census_always_totals_n() {
        let pool = BufferPool::new(3, 8);
        let a = pool.acquire_empty().unwrap();
        let b = pool.acquire_empty().unwrap();
        assert_eq!(pool.census().total(), 3);
        pool.commit_filled(a, 8).unwrap();
        let t = pool.acquire_for_test().unwrap();
        assert_eq!(pool.census().total(), 3);
        pool.commit_tested(t, Verdict::Pass).unwrap();
        pool.release_empty(b).unwrap();
        let census = pool.census();
        assert_eq!(census.total(), 3);
        assert_eq!(census.tested_good, 1);
        assert_eq!(census.empty, 2);
    }

    // -----------------------------------------------------------------------
    // Misuse
    // -----------------------------------------------------------------------

    #[test]
    fn test_overfill_rejected_and_recycled() {
        let pool = BufferPool::new(2, 8);
        let buf = pool.acquire_empty().unwrap();
        assert_eq!(
            pool.commit_filled(buf, 9),
            Err(PoolError::Overfill { len: 9, capacity: 8 })
        );
        assert_eq!(pool.census().empty, 2);
    }

    #[test]
    fn test_wrong_transition_rejected() {
        let pool = BufferPool::new(2, 8);
        let buf = pool.acquire_empty().unwrap();
        let err = pool.commit_tested(buf, Verdict::Pass).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidTransition {
                from: BufferState::Filling,
                to: BufferState::TestedGood,
                ..
            }
        ));
        // The pool still owns both buffers.
        assert_eq!(pool.census().total(), 2);
        assert_eq!(pool.census().empty, 2);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let a = BufferPool::new(2, 8);
        let b = BufferPool::new(2, 8);
        let buf = a.acquire_empty().unwrap();
        assert_eq!(b.release_empty(buf), Err(PoolError::ForeignBuffer { index: 0 }));
        assert_eq!(b.census().empty, 2);
    }

    // -----------------------------------------------------------------------
    // Blocking, timeouts and close
    // -----------------------------------------------------------------------

    #[test]
    fn test_acquire_timeout_returns_none() {
        let pool = BufferPool::new(2, 8);
        let started = Instant::now();
        assert!(pool.acquire_for_test_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(pool.acquire_for_sink_timeout(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_source_blocks_when_all_buffers_full() {
        let pool = Arc::new(BufferPool::new(2, 8));
        fill(&pool, 1);
        fill(&pool, 2);
        assert!(pool.acquire_empty_timeout(Duration::from_millis(20)).unwrap().is_none());

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let buf = pool.acquire_empty().unwrap();
                tx.send(buf.index()).unwrap();
                pool.release_empty(buf).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let buf = pool.acquire_for_test().unwrap();
        pool.commit_tested(buf, Verdict::Fail).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
    }

    #[test]
    fn test_close_wakes_all_waiters() {
        let pool = Arc::new(BufferPool::new(2, 8));
        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || match i {
                    0 => pool.acquire_for_test().map(|_| ()),
                    1 => pool.acquire_for_sink().map(|_| ()),
                    _ => pool.acquire_for_sink_timeout(Duration::from_secs(30)).map(|_| ()),
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(30));
        pool.close();
        for w in waiters {
            assert_eq!(w.join().unwrap(), Err(PoolError::Closed));
        }
        assert!(pool.is_closed());
        assert_eq!(pool.acquire_empty().unwrap_err(), PoolError::Closed);
    }

    #[test]
    fn test_release_after_close_still_accounted() {
        let pool = BufferPool::new(2, 8);
        let buf = pool.acquire_empty().unwrap();
        pool.close();
        pool.release_empty(buf).unwrap();
        assert_eq!(pool.census().empty, 2);
    }

    // -----------------------------------------------------------------------
    // Low-water mark
    // -----------------------------------------------------------------------

    #[test]
    fn test_ready_lowmark_tracks_and_resets() {
        let pool = BufferPool::new(4, 8);
        assert_eq!(pool.take_ready_lowmark(), 3);
        fill(&pool, 1);
        fill(&pool, 2);
        pass_one(&pool);
        pass_one(&pool);
        assert_eq!(pool.ready_len(), 2);
        let buf = pool.acquire_for_sink().unwrap();
        pool.release_empty(buf).unwrap();
        assert_eq!(pool.take_ready_lowmark(), 1);
        let buf = pool.acquire_for_sink().unwrap();
        pool.release_empty(buf).unwrap();
        assert_eq!(pool.take_ready_lowmark(), 0);
        assert_eq!(pool.take_ready_lowmark(), 3);
    }
}
