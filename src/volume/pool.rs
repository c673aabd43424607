//! Bounded pool of reusable volume buffers
//!
//! At most `capacity` buffers are checked out at any time. Acquirers block on
//! a condition variable until a buffer is released or their timeout elapses.
//! Waiters hold a ticket and are served strictly in arrival order, so a busy
//! producer can not starve a slower one.

use log::{trace, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::types::{Shape, Volume};
use crate::error::{Error, Result};

/// Handle to a shared buffer pool. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    /// Buffers returned to the pool, ready for reuse
    free: Vec<Vec<u8>>,
    /// Ids of buffers currently lent out
    checked_out: HashSet<u64>,
    next_id: u64,
    /// Tickets of blocked acquirers, oldest first
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// Proof that a volume buffer was lent by a given pool.
pub(crate) struct Lease {
    pool: Weak<PoolShared>,
    pub(crate) id: u64,
}

impl Lease {
    pub(crate) fn pool(&self) -> Option<BufferPool> {
        self.pool.upgrade().map(|shared| BufferPool { shared })
    }

    /// Return the buffer without reporting to the caller; used on drop.
    pub(crate) fn give_back(self, shape: Shape, data: Vec<u8>) {
        if let Some(pool) = self.pool.upgrade() {
            if let Err(e) = pool.check_in(self.id, data) {
                warn!("BufferPool: could not take back {} buffer: {}", shape, e);
            }
        }
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_in(&self, id: u64, data: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        if !state.checked_out.remove(&id) {
            return Err(Error::NotCheckedOut { id });
        }
        state.free.push(data);
        drop(state);
        self.available.notify_all();
        Ok(())
    }
}

impl PoolState {
    /// Reuse a free buffer of the right size, or resize any free one, or allocate.
    fn take_buffer(&mut self, len: usize) -> Vec<u8> {
        if let Some(pos) = self.free.iter().position(|buffer| buffer.len() == len) {
            return self.free.swap_remove(pos);
        }
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.resize(len, 0);
                buffer
            }
            None => vec![0; len],
        }
    }
}

impl BufferPool {
    /// Create an empty pool lending at most `capacity` buffers (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity: capacity.max(1),
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    checked_out: HashSet::new(),
                    next_id: 0,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Create a pool and pre-allocate every buffer for `shape`.
    pub fn preallocated(capacity: usize, shape: Shape) -> Result<Self> {
        let len = shape.checked_byte_len()?;
        let pool = Self::new(capacity);
        {
            let mut state = pool.shared.lock();
            for _ in 0..pool.shared.capacity {
                state.free.push(vec![0; len]);
            }
        }
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of buffers currently lent out
    pub fn checked_out(&self) -> usize {
        self.shared.lock().checked_out.len()
    }

    /// Number of buffers sitting in the free list
    pub fn free(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// Acquire a buffer for `shape`, waiting at most `timeout`.
    ///
    /// The content of the returned buffer is unspecified; callers overwrite it.
    pub fn acquire(&self, timeout: Duration, shape: Shape) -> Result<Volume> {
        let len = shape.checked_byte_len()?;
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            let first_in_line = state.waiters.front() == Some(&ticket);
            if first_in_line && state.checked_out.len() < self.shared.capacity {
                state.waiters.pop_front();
                let id = state.next_id;
                state.next_id += 1;
                state.checked_out.insert(id);
                let data = state.take_buffer(len);
                drop(state);

                // the next waiter may be servable as well
                self.shared.available.notify_all();
                trace!("BufferPool: lent buffer {} ({})", id, shape);

                let lease = Lease {
                    pool: Arc::downgrade(&self.shared),
                    id,
                };
                return Ok(Volume::leased(shape, data, lease));
            }

            let now = Instant::now();
            if now >= deadline {
                state.waiters.retain(|waiting| *waiting != ticket);
                drop(state);
                self.shared.available.notify_all();
                return Err(Error::PoolExhausted { timeout });
            }

            state = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Give a checked-out volume back to this pool.
    ///
    /// Releasing a volume this pool did not lend, or one that is no longer
    /// checked out, is reported as an error.
    pub fn release(&self, mut volume: Volume) -> Result<()> {
        let ours = volume
            .lease()
            .is_some_and(|lease| Weak::ptr_eq(&lease.pool, &Arc::downgrade(&self.shared)));
        if !ours {
            warn!("BufferPool: release of a volume lent by another pool");
            return Err(Error::ForeignVolume);
        }

        let Some(lease) = volume.take_lease() else {
            return Err(Error::ForeignVolume);
        };
        let data = volume.take_data();
        self.shared.check_in(lease.id, data).inspect_err(|e| {
            warn!("BufferPool: {}", e);
        })
    }

    #[cfg(test)]
    pub(crate) fn lease_for(&self, id: u64) -> Lease {
        Lease {
            pool: Arc::downgrade(&self.shared),
            id,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BufferPool")
            .field("capacity", &self.shared.capacity)
            .field("checked_out", &state.checked_out.len())
            .field("free", &state.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::ElementType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn shape() -> Shape {
        Shape::new(ElementType::U8, 1, 4, 4, 4)
    }

    #[test]
    fn test_acquire_and_release() {
        let pool = BufferPool::new(2);

        let volume = pool.acquire(Duration::from_millis(10), shape()).unwrap();
        assert_eq!(volume.byte_len(), 64);
        assert_eq!(pool.checked_out(), 1);

        pool.release(volume).unwrap();
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.free(), 1);
    }

    #[test]
    fn test_exhaustion_times_out() {
        let pool = BufferPool::new(1);
        let _held = pool.acquire(Duration::from_millis(10), shape()).unwrap();

        let started = Instant::now();
        let result = pool.acquire(Duration::from_millis(50), shape());
        assert!(matches!(result, Err(Error::PoolExhausted { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_oversized_shape_is_rejected() {
        let pool = BufferPool::new(1);
        let huge = Shape::new(ElementType::U8, 1, 1 << 21, 1 << 21, 1 << 22);

        let result = pool.acquire(Duration::from_millis(10), huge);
        assert!(matches!(result, Err(Error::Oversized(_))));
        assert_eq!(pool.checked_out(), 0);
        assert!(pool.acquire(Duration::from_millis(10), shape()).is_ok());
    }

    #[test]
    fn test_drop_returns_buffer() {
        let pool = BufferPool::new(1);
        {
            let _volume = pool.acquire(Duration::from_millis(10), shape()).unwrap();
            assert_eq!(pool.checked_out(), 1);
        }
        assert_eq!(pool.checked_out(), 0);
        assert!(pool.acquire(Duration::from_millis(10), shape()).is_ok());
    }

    #[test]
    fn test_buffers_are_reused_and_resized() {
        let pool = BufferPool::preallocated(1, shape()).unwrap();
        assert_eq!(pool.free(), 1);

        let bigger = Shape::new(ElementType::U16, 1, 8, 8, 8);
        let volume = pool.acquire(Duration::from_millis(10), bigger).unwrap();
        assert_eq!(volume.byte_len(), 1024);
        assert_eq!(pool.free(), 0);
    }

    #[test]
    fn test_release_to_foreign_pool_is_reported() {
        let lender = BufferPool::new(1);
        let other = BufferPool::new(1);

        let volume = lender.acquire(Duration::from_millis(10), shape()).unwrap();
        assert!(matches!(other.release(volume), Err(Error::ForeignVolume)));
        // the rejected volume was dropped and found its way home
        assert_eq!(lender.checked_out(), 0);

        let unpooled = Volume::unpooled(shape()).unwrap();
        assert!(matches!(lender.release(unpooled), Err(Error::ForeignVolume)));
    }

    #[test]
    fn test_double_release_is_reported() {
        let pool = BufferPool::new(1);
        let volume = pool.acquire(Duration::from_millis(10), shape()).unwrap();
        let id = volume.buffer_id().unwrap();
        let duplicate = Volume::counterfeit(shape(), pool.lease_for(id));

        pool.release(volume).unwrap();
        assert!(matches!(
            pool.release(duplicate),
            Err(Error::NotCheckedOut { id: dup }) if dup == id
        ));
        assert_eq!(pool.free(), 1);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = BufferPool::new(1);
        let held = pool.acquire(Duration::from_millis(10), shape()).unwrap();

        let waiter_pool = pool.clone();
        let waiter =
            thread::spawn(move || waiter_pool.acquire(Duration::from_secs(5), shape()).is_ok());

        thread::sleep(Duration::from_millis(50));
        pool.release(held).unwrap();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_checked_out_never_exceeds_capacity() {
        const CAPACITY: usize = 3;
        let pool = BufferPool::new(CAPACITY);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let outstanding = outstanding.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        if let Ok(volume) = pool.acquire(Duration::from_millis(200), shape()) {
                            let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            assert!(pool.checked_out() <= CAPACITY);
                            thread::sleep(Duration::from_micros(200));
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                            pool.release(volume).unwrap();
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.checked_out(), 0);
        assert!(pool.free() <= CAPACITY);
    }
}
