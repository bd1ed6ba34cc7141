// ABOUTME: Bounded pool of fixed-size byte frames with atomic use-count recycling
// ABOUTME: Frames are handed out exclusively, shared by reference count, and self-return on release

use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use tokio::sync::Semaphore;

/// Single contiguous backing allocation for every frame in a pool.
///
/// The memory is carved into `frame_count` disjoint slots of `frame_size`
/// bytes each. Slot pointers are derived straight from the raw allocation so
/// that no reference to the whole buffer is ever materialized; each `Frame`
/// only ever forms references to its own slot.
struct SlabMemory {
    ptr: *mut [u8],
}

impl SlabMemory {
    fn new(len: usize) -> Self {
        Self {
            ptr: Box::into_raw(vec![0u8; len].into_boxed_slice()),
        }
    }

    fn slot_ptr(&self, offset: usize) -> *mut u8 {
        // Pointer arithmetic only; the caller decides whether a shared or
        // exclusive reference over the slot is permitted right now.
        unsafe { self.ptr.cast::<u8>().add(offset) }
    }
}

impl Drop for SlabMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Box::into_raw` in `new` and is dropped
        // exactly once, when the owning pool goes away.
        unsafe { drop(Box::from_raw(self.ptr)) }
    }
}

// SAFETY: the raw allocation is plain bytes. Which task may touch which slot
// is governed by the acquire/use-count protocol, not by these impls.
unsafe impl Send for SlabMemory {}
unsafe impl Sync for SlabMemory {}

/// Per-slot bookkeeping. `uses` counts outstanding logical holders; `filled`
/// is the number of leading payload bytes valid for the current occupancy.
struct SlotState {
    uses: AtomicIsize,
    filled: AtomicUsize,
}

struct PoolInner {
    frame_size: usize,
    frame_count: usize,
    mem: SlabMemory,
    slots: Box<[SlotState]>,
    /// Indices of slots currently free. FIFO among returners, lock-free.
    free: SegQueue<usize>,
    /// One permit per free slot. Closing the semaphore closes the pool.
    vacancies: Semaphore,
}

impl PoolInner {
    /// Put a slot back into circulation. The permit is added after the index
    /// is queued so an unblocked acquirer always finds a slot waiting.
    fn recycle(&self, slot: usize) {
        self.free.push(slot);
        self.vacancies.add_permits(1);
    }
}

/// Snapshot of pool occupancy. Approximate: the free count is sampled without
/// excluding concurrent acquires and releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStat {
    pub total_bytes: usize,
    pub used_bytes: usize,
}

/// Bounded pool of pre-allocated, fixed-size byte frames.
///
/// All frames share one contiguous backing buffer allocated at construction;
/// nothing is allocated per acquire. A frame leaves the pool through
/// [`FramePool::acquire`] with a use count of one and re-enters automatically
/// when [`Frame::adjust_uses`] drives the count back to zero.
///
/// The pool handle is cheap to clone; clones refer to the same pool.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Create a pool of `frame_count` frames of `frame_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero.
    pub fn new(frame_size: usize, frame_count: usize) -> Self {
        assert!(frame_size > 0, "frame_size must be > 0");
        assert!(frame_count > 0, "frame_count must be > 0");

        let free = SegQueue::new();
        let mut slots = Vec::with_capacity(frame_count);
        for slot in 0..frame_count {
            free.push(slot);
            slots.push(SlotState {
                uses: AtomicIsize::new(0),
                filled: AtomicUsize::new(0),
            });
        }

        Self {
            inner: Arc::new(PoolInner {
                frame_size,
                frame_count,
                mem: SlabMemory::new(frame_size * frame_count),
                slots: slots.into_boxed_slice(),
                free,
                vacancies: Semaphore::new(frame_count),
            }),
        }
    }

    /// Take a free frame, waiting until one returns to the pool if none is
    /// free right now. The returned frame carries exactly one use.
    ///
    /// Returns `None` once the pool has been closed; pending waiters are
    /// unblocked with `None` at that point. Callers that must also react to
    /// other events race this future in a `select!`.
    pub async fn acquire(&self) -> Option<Frame> {
        let permit = self.inner.vacancies.acquire().await.ok()?;
        permit.forget();
        Some(self.take_free_slot())
    }

    /// Non-blocking variant of [`FramePool::acquire`]. Returns `None` when
    /// the pool is exhausted or closed.
    pub fn try_acquire(&self) -> Option<Frame> {
        let permit = self.inner.vacancies.try_acquire().ok()?;
        permit.forget();
        Some(self.take_free_slot())
    }

    fn take_free_slot(&self) -> Frame {
        // A forgotten permit always has a matching queued index: indices are
        // pushed before permits are added in `recycle`.
        let slot = self
            .inner
            .free
            .pop()
            .expect("pool permit granted with an empty free queue");
        let state = &self.inner.slots[slot];
        state.filled.store(0, Ordering::Relaxed);
        state.uses.store(1, Ordering::Release);
        Frame {
            pool: Arc::clone(&self.inner),
            slot,
        }
    }

    /// Occupancy snapshot, O(1) and lock-free.
    pub fn stat(&self) -> PoolStat {
        let free = self
            .inner
            .vacancies
            .available_permits()
            .min(self.inner.frame_count);
        PoolStat {
            total_bytes: self.inner.frame_count * self.inner.frame_size,
            used_bytes: (self.inner.frame_count - free) * self.inner.frame_size,
        }
    }

    /// Close the pool. Idempotent. Pending and future acquires return `None`;
    /// frames still in flight keep their backing memory until released.
    pub fn close(&self) {
        self.inner.vacancies.close();
    }

    /// Size of each frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }

    /// Number of frames in the pool.
    pub fn frame_count(&self) -> usize {
        self.inner.frame_count
    }
}

/// Handle to one slab of a [`FramePool`].
///
/// A `Frame` is exclusive custody right after acquisition (`uses == 1`): the
/// acquirer may fill [`Frame::data_mut`] and record the valid length with
/// [`Frame::set_filled`]. Once published to other holders the slab is
/// read-only; everyone consumes [`Frame::payload`] and drops their hold with
/// `adjust_uses(-1)`.
///
/// Cloning copies the handle without touching the use count. A holder that
/// wants to hand the frame to `k` more parties calls `adjust_uses(k)` first
/// and gives each party a clone; every party releases exactly once. Dropping
/// a handle without releasing its use leaks the slab from the pool.
pub struct Frame {
    pool: Arc<PoolInner>,
    slot: usize,
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            slot: self.slot,
        }
    }
}

impl Frame {
    fn state(&self) -> &SlotState {
        &self.pool.slots[self.slot]
    }

    fn slot_base(&self) -> *mut u8 {
        self.pool.mem.slot_ptr(self.slot * self.pool.frame_size)
    }

    /// Full writable region of the frame, `frame_size` bytes.
    ///
    /// Only the sole holder of a freshly acquired frame may write here; after
    /// the frame has been shared the slab must be treated as read-only.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: the pool hands each slot to exactly one acquirer at a time,
        // and that acquirer holds the only handle until it shares the frame.
        // The exclusive reference therefore cannot alias any other reference
        // to this slot.
        unsafe { slice::from_raw_parts_mut(self.slot_base(), self.pool.frame_size) }
    }

    /// Record how many leading bytes of the frame are valid payload.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the frame size.
    pub fn set_filled(&self, n: usize) {
        assert!(
            n <= self.pool.frame_size,
            "filled length {n} exceeds frame size {}",
            self.pool.frame_size
        );
        self.state().filled.store(n, Ordering::Release);
    }

    /// Number of valid payload bytes for the current occupancy.
    pub fn filled(&self) -> usize {
        self.state().filled.load(Ordering::Acquire)
    }

    /// The valid payload, `data[..filled]`.
    pub fn payload(&self) -> &[u8] {
        // SAFETY: holders of a shared frame only ever read, and the slot
        // cannot be re-acquired for writing while this handle still holds a
        // use keeping it out of the free queue.
        unsafe { slice::from_raw_parts(self.slot_base(), self.filled()) }
    }

    /// Full frame size in bytes.
    pub fn size(&self) -> usize {
        self.pool.frame_size
    }

    /// Atomically add `delta` to the use count.
    ///
    /// When the count reaches zero the slab re-enters the free queue before
    /// this call returns, and this handle (and any clone of it) must not be
    /// touched again. A count below zero is an unbalanced release in the
    /// caller and is fatal by design.
    pub fn adjust_uses(&self, delta: isize) {
        let post = self.state().uses.fetch_add(delta, Ordering::AcqRel) + delta;
        if post < 0 {
            panic!(
                "frame use count fell below zero (slot {}): unbalanced release",
                self.slot
            );
        }
        if post == 0 {
            self.pool.recycle(self.slot);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("slot", &self.slot)
            .field("filled", &self.filled())
            .field("uses", &self.state().uses.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn pool_starts_fully_free() {
        let pool = FramePool::new(1024, 4);
        assert_eq!(
            pool.stat(),
            PoolStat {
                total_bytes: 4096,
                used_bytes: 0
            }
        );
    }

    #[test]
    fn acquired_frame_round_trips_payload() {
        let pool = FramePool::new(8, 2);
        let mut frame = pool.try_acquire().unwrap();

        frame.data_mut()[..3].copy_from_slice(b"abc");
        frame.set_filled(3);

        assert_eq!(frame.payload(), b"abc");
        assert_eq!(frame.size(), 8);
        frame.adjust_uses(-1);
    }

    #[test]
    fn release_returns_frame_to_pool() {
        let pool = FramePool::new(16, 1);
        let frame = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.stat().used_bytes, 16);

        frame.adjust_uses(-1);
        assert_eq!(pool.stat().used_bytes, 0);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn fan_out_releases_balance_to_zero() {
        let pool = FramePool::new(16, 2);
        let frame = pool.try_acquire().unwrap();

        // One +3 paired with three -1s, plus the initial acquire hold.
        frame.adjust_uses(3);
        let holders = [frame.clone(), frame.clone(), frame.clone()];
        frame.adjust_uses(-1);
        assert_eq!(pool.stat().used_bytes, 16);
        for holder in &holders {
            holder.adjust_uses(-1);
        }

        assert_eq!(pool.stat().used_bytes, 0);
    }

    #[test]
    fn payload_visible_through_cloned_handles() {
        let pool = FramePool::new(8, 1);
        let mut frame = pool.try_acquire().unwrap();
        frame.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        frame.set_filled(4);

        frame.adjust_uses(1);
        let other = frame.clone();
        frame.adjust_uses(-1);

        assert_eq!(other.payload(), &[1, 2, 3, 4]);
        other.adjust_uses(-1);
    }

    #[test]
    fn repeated_cycles_conserve_every_frame() {
        let pool = FramePool::new(4, 3);
        for round in 0..64 {
            let frames: Vec<Frame> = (0..3).map(|_| pool.try_acquire().unwrap()).collect();
            assert!(pool.try_acquire().is_none(), "round {round}");
            for frame in frames {
                frame.adjust_uses(2);
                frame.adjust_uses(-1);
                frame.adjust_uses(-1);
                frame.adjust_uses(-1);
            }
            assert_eq!(pool.stat().used_bytes, 0, "round {round}");
        }
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn unbalanced_release_is_fatal() {
        let pool = FramePool::new(4, 1);
        let frame = pool.try_acquire().unwrap();
        frame.adjust_uses(-2);
    }

    #[tokio::test]
    async fn acquire_blocks_until_a_frame_returns() {
        let pool = FramePool::new(4, 1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        // Saturated pool: the waiter must still be pending.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        held.adjust_uses(-1);
        let frame = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire did not unblock")
            .unwrap();
        assert!(frame.is_some());
    }

    #[tokio::test]
    async fn close_unblocks_pending_acquirers() {
        let pool = FramePool::new(4, 1);
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close();

        let acquired = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("close did not unblock the waiter")
            .unwrap();
        assert!(acquired.is_none());
        assert!(pool.acquire().await.is_none());

        // Closing again is fine.
        pool.close();
    }
}
