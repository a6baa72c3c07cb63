//! Bounded single-producer/single-consumer packet queue.
//!
//! Each camera owns one of these between its network receive task (producer)
//! and its decode task (consumer). Capacity is rounded up to a power of two
//! so slot lookup reduces to masking; head and tail are unbounded counters
//! on separate cache lines. The producer's backpressure strategy is
//! [`BoundedQueue::push_or_drop_oldest`], which discards the oldest entry
//! instead of blocking.
//!
//! The queue is not safe for multiple producers or multiple consumers.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_CAPACITY: usize = 60;

/// Fixed-capacity SPSC ring buffer with drop-oldest overflow.
pub struct BoundedQueue<T> {
    /// Usable capacity; always a power of two.
    capacity: usize,
    /// `capacity - 1`, for index masking.
    mask: usize,
    slots: Box<[UnsafeCell<Option<T>>]>,
    /// Consumer index. Normally advanced only by `pop`, but the producer's
    /// drop-oldest path may also advance it, so every claim goes through
    /// compare-exchange.
    head: CachePadded<AtomicUsize>,
    /// Producer index.
    tail: CachePadded<AtomicUsize>,
}

// Slots are only touched by the single producer and the single consumer, at
// disjoint indices established by the head/tail protocol below.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at least `capacity` items (rounded up to the
    /// next power of two; zero is treated as the default of 60 -> 64).
    pub fn with_capacity(capacity: usize) -> Self {
        let requested = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let capacity = requested.next_power_of_two();
        // The mask arithmetic below is only valid for power-of-two sizes.
        debug_assert!(capacity.is_power_of_two());

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            capacity,
            mask: capacity - 1,
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Push one item. Producer-only. Fails without blocking when the queue
    /// is full, handing the rejected item back.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.capacity {
            return Err(item);
        }

        // Writing the slot may drop a stale value left behind by a previous
        // drop-oldest discard; the consumer never reads behind `head`.
        unsafe {
            *self.slots[tail & self.mask].get() = Some(item);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Push one item, discarding the oldest entry when full. Producer-only;
    /// always succeeds.
    pub fn push_or_drop_oldest(&self, item: T) {
        let mut item = item;
        loop {
            match self.push(item) {
                Ok(()) => return,
                Err(rejected) => {
                    item = rejected;
                    self.discard_oldest();
                }
            }
        }
    }

    /// Pop the oldest item. Consumer-only; fails on empty without blocking.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);

            if head == tail {
                return None;
            }

            // Claim the slot before reading it: the producer's drop-oldest
            // path also advances `head`, so a plain store could lose an
            // update. Once claimed, the slot cannot be overwritten until the
            // producer travels the full ring past it.
            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return unsafe { (*self.slots[head & self.mask].get()).take() };
            }
        }
    }

    /// Advance `head` past the oldest entry without taking it. The stale
    /// value is dropped when its slot is next overwritten.
    fn discard_oldest(&self) {
        let head = self.head.load(Ordering::Acquire);
        if head != self.tail.load(Ordering::Acquire) {
            // A failed exchange means the consumer popped concurrently and
            // space exists now; the caller retries its push either way.
            let _ = self.head.compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Approximate number of queued items. Wait-free.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity)
    }

    /// Approximate emptiness check. Wait-free.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Approximate fullness check. Wait-free.
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) >= self.capacity
    }

    /// Usable capacity (power of two).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pop and drop everything currently queued. Consumer-side.
    pub fn drain(&self) {
        while self.pop().is_some() {}
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_capacity_up() {
        let queue: BoundedQueue<u32> = BoundedQueue::with_capacity(3);
        assert_eq!(queue.capacity(), 4);
        let queue: BoundedQueue<u32> = BoundedQueue::with_capacity(60);
        assert_eq!(queue.capacity(), 64);
        let queue: BoundedQueue<u32> = BoundedQueue::with_capacity(0);
        assert_eq!(queue.capacity(), 64);
    }

    #[test]
    fn push_pop_order() {
        let queue = BoundedQueue::with_capacity(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_on_full_fails() {
        let queue = BoundedQueue::with_capacity(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.push(99), Err(99));
    }

    #[test]
    fn drop_oldest_overflow() {
        let queue = BoundedQueue::with_capacity(3);
        assert_eq!(queue.capacity(), 4);
        for i in 1..=4 {
            queue.push(i).unwrap();
        }
        queue.push_or_drop_oldest(5);
        assert_eq!(queue.len(), 4);
        for expected in 2..=5 {
            assert_eq!(queue.pop(), Some(expected));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn wraps_around() {
        let queue = BoundedQueue::with_capacity(4);
        for round in 0..10 {
            for i in 0..3 {
                queue.push(round * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(queue.pop(), Some(round * 10 + i));
            }
        }
    }
}
