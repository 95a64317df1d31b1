use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::buffers::fixed_buffer::FixedBuf;

/// The process-wide pool of packet buffers. All buffers are allocated up front when the arena
///  is created, and the arena never allocates or frees buffer memory after that.
///
/// Buffers are handed out as move-only [ArenaBuf] handles. A handle goes back into its slot
///  when it is dropped (or passed to [BufferArena::release]), so a connection's buffers are
///  returned simply by dropping the data structures holding them.
pub struct BufferArena {
    buf_size: usize,
    capacity: usize,
    slots: Mutex<ArenaSlots>,
    released: Notify,
}

struct ArenaSlots {
    slots: Vec<Option<FixedBuf>>,
    free: Vec<usize>,
    is_shut_down: bool,
}

impl BufferArena {
    pub fn new(buf_size: usize, capacity: usize) -> anyhow::Result<Arc<BufferArena>> {
        if buf_size == 0 {
            bail!("arena buffer size must be positive");
        }
        if capacity == 0 {
            bail!("arena capacity must be positive");
        }

        debug!("allocating buffer arena with {} buffers of {} bytes", capacity, buf_size);

        Ok(Arc::new(BufferArena {
            buf_size,
            capacity,
            slots: Mutex::new(ArenaSlots {
                slots: (0..capacity).map(|_| Some(FixedBuf::new(buf_size))).collect(),
                // reversed so that low slot numbers are handed out first
                free: (0..capacity).rev().collect(),
                is_shut_down: false,
            }),
            released: Notify::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ArenaSlots> {
        // the slot bookkeeping is consistent after every statement, so a panic while holding
        //  the lock leaves nothing to repair
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a buffer from the arena without waiting, returning `None` if all buffers are in use
    pub fn acquire(self: &Arc<Self>) -> Option<ArenaBuf> {
        let mut slots = self.lock();
        if slots.is_shut_down {
            return None;
        }

        let slot = slots.free.pop()?;
        let buf = slots.slots[slot].take()?;
        trace!("acquired arena buffer #{}", slot);

        Some(ArenaBuf {
            slot,
            buf,
            arena: self.clone(),
        })
    }

    /// Take a buffer from the arena, waiting up to `timeout` for one to be released if the
    ///  arena is exhausted
    pub async fn acquire_within(self: &Arc<Self>, timeout: Duration) -> Option<ArenaBuf> {
        let deadline = Instant::now() + timeout;
        loop {
            let released = self.buffer_released();
            if let Some(buf) = self.acquire() {
                return Some(buf);
            }
            if self.lock().is_shut_down {
                return None;
            }
            if timeout_at(deadline, released).await.is_err() {
                return None;
            }
        }
    }

    /// Return a buffer to the arena. This is equivalent to dropping the handle, but it checks
    ///  that the handle actually belongs to this arena.
    pub fn release(&self, buf: ArenaBuf) {
        assert!(std::ptr::eq(self, Arc::as_ptr(&buf.arena)), "released arena buffer #{} into a foreign arena", buf.slot);
        drop(buf);
    }

    fn put_back(&self, slot: usize, mut buf: FixedBuf) {
        buf.clear();
        {
            let mut slots = self.lock();
            assert!(slots.slots[slot].is_none(), "arena slot #{} is not vacant - this is a bug", slot);
            slots.slots[slot] = Some(buf);
            slots.free.push(slot);
        }
        trace!("released arena buffer #{}", slot);
        self.released.notify_waiters();
    }

    /// Wake-up signal that fires whenever a buffer is returned to the arena. The returned future
    ///  registers for notification when it is created, so callers should create it *before*
    ///  checking for available buffers to avoid missing a release.
    pub fn buffer_released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Refuse all further acquisition. Returns the number of buffers that are still held by
    ///  someone, which should be zero after an orderly shutdown.
    pub fn shut_down(&self) -> usize {
        let outstanding = {
            let mut slots = self.lock();
            slots.is_shut_down = true;
            self.capacity - slots.free.len()
        };
        if outstanding > 0 {
            warn!("buffer arena shut down with {} buffers still in use", outstanding);
        }
        else {
            debug!("buffer arena shut down, all buffers were returned");
        }
        self.released.notify_waiters();
        outstanding
    }
}

/// Move-only handle to one of the arena's buffers, carrying its slot index
pub struct ArenaBuf {
    slot: usize,
    buf: FixedBuf,
    arena: Arc<BufferArena>,
}

impl ArenaBuf {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for ArenaBuf {
    type Target = FixedBuf;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for ArenaBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl std::fmt::Debug for ArenaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArenaBuf#{}{:?}", self.slot, self.buf)
    }
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        // a zero-capacity FixedBuf does not allocate
        let buf = std::mem::replace(&mut self.buf, FixedBuf::new(0));
        self.arena.put_back(self.slot, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;
    use tokio::runtime::Builder;

    #[rstest]
    #[case::zero_size(0, 5)]
    #[case::zero_capacity(100, 0)]
    fn test_new_rejects_empty(#[case] buf_size: usize, #[case] capacity: usize) {
        assert!(BufferArena::new(buf_size, capacity).is_err());
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let arena = BufferArena::new(16, 3).unwrap();

        let a = arena.acquire().unwrap();
        let b = arena.acquire().unwrap();
        let c = arena.acquire().unwrap();
        assert_eq!(arena.in_use(), 3);
        assert_eq!(arena.available(), 0);
        assert!(arena.acquire().is_none());

        assert_eq!(vec![a.slot(), b.slot(), c.slot()], vec![0, 1, 2]);
        assert_eq!(a.capacity(), 16);
    }

    #[test]
    fn test_drop_returns_buffer() {
        let arena = BufferArena::new(16, 1).unwrap();

        let buf = arena.acquire().unwrap();
        assert!(arena.acquire().is_none());
        drop(buf);

        assert_eq!(arena.available(), 1);
        assert!(arena.acquire().is_some());
    }

    #[test]
    fn test_released_buffer_is_cleared() {
        let arena = BufferArena::new(16, 1).unwrap();

        let mut buf = arena.acquire().unwrap();
        buf.put_slice(b"abc");
        arena.release(buf);

        assert!(arena.acquire().unwrap().is_empty());
    }

    #[test]
    #[should_panic]
    fn test_release_into_foreign_arena() {
        let arena = BufferArena::new(16, 1).unwrap();
        let other = BufferArena::new(16, 1).unwrap();

        let buf = other.acquire().unwrap();
        arena.release(buf);
    }

    #[test]
    fn test_in_use_never_exceeds_capacity() {
        let arena = BufferArena::new(8, 5).unwrap();

        let mut held = Vec::new();
        for i in 0..20 {
            if i % 3 == 2 {
                held.pop();
            }
            if let Some(buf) = arena.acquire() {
                held.push(buf);
            }
            assert!(arena.in_use() <= arena.capacity());
            assert_eq!(arena.in_use(), held.len());
        }
    }

    #[test]
    fn test_shut_down() {
        let arena = BufferArena::new(8, 4).unwrap();

        let buf = arena.acquire().unwrap();
        assert_eq!(arena.shut_down(), 1);
        assert!(arena.acquire().is_none());

        drop(buf);
        assert_eq!(arena.available(), 4);
        assert!(arena.acquire().is_none());
    }

    #[test]
    fn test_acquire_within_woken_by_release() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let arena = BufferArena::new(8, 1).unwrap();
            let buf = arena.acquire().unwrap();

            let arena2 = arena.clone();
            let waiter = tokio::spawn(async move {
                let start = Instant::now();
                let result = arena2.acquire_within(Duration::from_secs(10)).await;
                (result.is_some(), start.elapsed())
            });

            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(buf);

            let (acquired, elapsed) = waiter.await.unwrap();
            assert!(acquired);
            assert_eq!(elapsed, Duration::from_millis(50));
        });
    }

    #[test]
    fn test_acquire_within_times_out() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let arena = BufferArena::new(8, 1).unwrap();
            let _buf = arena.acquire().unwrap();

            let start = Instant::now();
            assert!(arena.acquire_within(Duration::from_millis(30)).await.is_none());
            assert_eq!(start.elapsed(), Duration::from_millis(30));
        });
    }
}
