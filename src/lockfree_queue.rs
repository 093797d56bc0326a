//! Michael-Scott queue on top of the node arena and a hazard domain.
//!
//! `head` always names a dummy node: the payload of the oldest element lives in `head.next`,
//! and a successful dequeue turns that node into the next dummy. `tail` is the last node or
//! lags one behind, every operation that sees it lagging helps it forward.

use crate::arena::{NodeArena, NodeRef};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::{Error, PushError};
use crate::hazard_domain::{self, DomainStats, HazardDomain, LeaseGuard};
use crate::util::WrappedAlign64Type;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const HP_FIRST: usize = 0;
const HP_NEXT: usize = 1;

/// Lock-free FIFO queue.
///
/// # Examples
///
/// ```
/// use hp_lockfree::lockfree_queue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.enqueue("a");
/// queue.enqueue("b");
/// assert_eq!(queue.dequeue(), Some("a"));
/// assert_eq!(queue.dequeue(), Some("b"));
/// assert_eq!(queue.dequeue(), None);
/// ```
pub struct LockFreeQueue<T> {
    domain: Arc<HazardDomain>,
    arena: NodeArena<T>,
    head: WrappedAlign64Type<AtomicU64>,
    tail: WrappedAlign64Type<AtomicU64>,
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    pub fn new() -> Self {
        Self::with_domain(HazardDomain::default_new())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        Ok(Self::with_domain(HazardDomain::new(config)?))
    }

    fn with_domain(domain: Arc<HazardDomain>) -> Self {
        let arena = NodeArena::new(domain.config().max_nodes);
        let dummy = match arena.alloc_empty() {
            Some(node) => node,
            None => unreachable!("empty arena has no room for the dummy node"),
        };
        LockFreeQueue {
            domain,
            arena,
            head: WrappedAlign64Type(AtomicU64::new(dummy.raw())),
            tail: WrappedAlign64Type(AtomicU64::new(dummy.raw())),
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    pub fn stats(&self) -> DomainStats {
        self.domain.stats()
    }

    /// Nodes allocated and not yet recycled, the dummy included.
    pub fn live_nodes(&self) -> usize {
        self.arena.live()
    }

    /// Needs no lease: a recycled head cannot come back with the same generation, so seeing
    /// `head` unchanged around the read of its `next` proves the read was consistent.
    pub fn is_empty(&self) -> bool {
        loop {
            let first = self.load_head(Ordering::Acquire);
            let next = self.arena.load_next(first, Ordering::Acquire);
            if self.load_head(Ordering::Acquire) == first {
                return next.is_null();
            }
        }
    }

    /// Append `value`. Panics only if the node arena or the thread table is exhausted.
    pub fn enqueue(&self, value: T) {
        if let Err(e) = self.try_enqueue(value) {
            panic!("lock-free queue enqueue failed: {}", e.kind());
        }
    }

    pub fn try_enqueue(&self, value: T) -> Result<(), PushError<T>> {
        let node = hazard_domain::alloc_node(&self.domain, &self.arena, value)?;
        match hazard_domain::with_lease(&self.domain, |guard| self.link(guard, node)) {
            Ok(()) => Ok(()),
            Err(e) => {
                // never linked, nobody else can see it
                let value = unsafe { self.arena.take(node) };
                unsafe { self.arena.free(node) };
                Err(PushError::new(value, e))
            }
        }
    }

    /// Remove the oldest value, `None` if the queue is empty. Panics only if the thread table
    /// is exhausted.
    pub fn dequeue(&self) -> Option<T> {
        match self.try_dequeue() {
            Ok(ret) => ret,
            Err(e) => panic!("lock-free queue dequeue failed: {}", e),
        }
    }

    pub fn try_dequeue(&self) -> Result<Option<T>, Error> {
        hazard_domain::with_lease(&self.domain, |guard| self.unlink(guard))
    }

    #[inline]
    fn load_head(&self, order: Ordering) -> NodeRef {
        NodeRef::from_raw(self.head.load(order))
    }

    #[inline]
    fn load_tail(&self, order: Ordering) -> NodeRef {
        NodeRef::from_raw(self.tail.load(order))
    }

    /// Move `tail` from `last` to `next` if nobody did it yet.
    #[inline]
    fn swing_tail(&self, last: NodeRef, next: NodeRef) {
        let _ = self.tail.compare_exchange(
            last.raw(),
            next.raw(),
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    fn link(&self, guard: &LeaseGuard, node: NodeRef) {
        let backoff = Backoff::new(self.domain.config().backoff);
        loop {
            let last = self.load_tail(Ordering::Acquire);
            guard.publish(HP_FIRST, last);
            if self.load_tail(Ordering::SeqCst) != last {
                continue;
            }
            debug_assert!(self.arena.is_current(last));
            let next = self.arena.load_next(last, Ordering::Acquire);
            if self.load_tail(Ordering::Acquire) != last {
                continue;
            }
            if next.is_null() {
                if self
                    .arena
                    .compare_exchange_next(
                        last,
                        NodeRef::NULL,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.swing_tail(last, node);
                    guard.clear(HP_FIRST);
                    return;
                }
            } else {
                self.swing_tail(last, next);
            }
            backoff.snooze();
        }
    }

    fn unlink(&self, guard: &LeaseGuard) -> Option<T> {
        let backoff = Backoff::new(self.domain.config().backoff);
        loop {
            let first = self.load_head(Ordering::Acquire);
            guard.publish(HP_FIRST, first);
            if self.load_head(Ordering::SeqCst) != first {
                continue;
            }
            let last = self.load_tail(Ordering::Acquire);
            let next = self.arena.load_next(first, Ordering::Acquire);
            guard.publish(HP_NEXT, next);
            if self.load_head(Ordering::SeqCst) != first {
                continue;
            }
            if first == last {
                if next.is_null() {
                    guard.clear_all();
                    return None;
                }
                self.swing_tail(last, next);
                backoff.snooze();
                continue;
            }
            debug_assert!(!next.is_null());
            debug_assert!(self.arena.is_current(next));
            // Copied before the CAS: once `next` is the dummy a racing dequeue may move the
            // payload out and retire it. Only the winner keeps the copy.
            let value = unsafe { self.arena.peek(next) };
            if self
                .head
                .compare_exchange(
                    first.raw(),
                    next.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                guard.clear_all();
                guard.retire(first, &self.arena);
                return Some(unsafe { value.assume_init() });
            }
            backoff.snooze();
        }
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        let dummy = NodeRef::from_raw(*self.head.get_mut());
        let mut cur = self.arena.load_next(dummy, Ordering::Relaxed);
        while !cur.is_null() {
            let next = self.arena.load_next(cur, Ordering::Relaxed);
            unsafe {
                drop(self.arena.take(cur));
            }
            cur = next;
        }
        self.domain.close();
    }
}

#[cfg(test)]
mod test {
    use crate::config::Config;
    use crate::error::Error;
    use crate::lockfree_queue::LockFreeQueue;
    use std::cell::RefCell;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    struct Node<'a, T> {
        cnt: &'a RefCell<i32>,
        v: T,
    }

    impl<'a, T> Drop for Node<'a, T> {
        fn drop(&mut self) {
            *self.cnt.borrow_mut() += 1;
        }
    }

    #[test]
    fn test_base() {
        let queue = LockFreeQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
        queue.enqueue(1);
        assert!(!queue.is_empty());
        assert_eq!(queue.dequeue().unwrap(), 1);
        let test_num = 100;
        for i in 0..test_num {
            queue.enqueue(i);
        }
        for i in 0..test_num {
            assert_eq!(queue.dequeue().unwrap(), i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_three_dequeue_four() {
        let queue = LockFreeQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_not_empty_after_none() {
        let queue = LockFreeQueue::new();
        assert_eq!(queue.dequeue(), None);
        queue.enqueue(String::from("x"));
        assert_eq!(queue.dequeue().as_ref().map(String::as_str), Some("x"));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_memory_leak() {
        let cnt = RefCell::new(0);
        let queue = LockFreeQueue::new();
        let test_num = 100;
        for i in 0..test_num {
            queue.enqueue(Node { cnt: &cnt, v: i });
        }
        assert_eq!(*cnt.borrow(), 0);
        for i in 0..test_num {
            assert_eq!(queue.dequeue().unwrap().v, i);
        }
        assert_eq!(*cnt.borrow(), test_num);
        // retired dummies never drop a payload
        drop(queue);
        assert_eq!(*cnt.borrow(), test_num);
    }

    #[test]
    fn test_drop_releases_values() {
        let cnt = RefCell::new(0);
        {
            let queue = LockFreeQueue::new();
            for i in 0..10 {
                queue.enqueue(Node { cnt: &cnt, v: i });
            }
            assert_eq!(queue.dequeue().unwrap().v, 0);
            assert_eq!(*cnt.borrow(), 1);
        }
        assert_eq!(*cnt.borrow(), 10);
    }

    #[test]
    fn test_arena_exhausted() {
        let config = Config::default()
            .with_max_nodes(4)
            .with_scan_threshold(1, 1_000);
        let queue = LockFreeQueue::with_config(config).unwrap();
        // one slot is the dummy
        for i in 0..3 {
            assert!(queue.try_enqueue(i).is_ok());
        }
        let err = queue.try_enqueue(3).unwrap_err();
        assert_eq!(err.kind(), Error::ArenaExhausted);
        assert_eq!(err.into_inner(), 3);

        assert_eq!(queue.dequeue(), Some(0));
        assert_eq!(queue.live_nodes(), 4);
        assert!(queue.try_enqueue(4).is_ok());
        assert_eq!(queue.live_nodes(), 4);
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(4));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_retired_dummies_are_recycled() {
        let config = Config::default().with_scan_threshold(1, 8);
        let queue = LockFreeQueue::with_config(config).unwrap();
        for i in 0..1_000 {
            queue.enqueue(i);
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert!(queue.live_nodes() <= 9);
        assert!(queue.stats().reclaimed >= 990);
    }

    #[test]
    fn test_exhaustion_drains_idle_thread() {
        let queue = Arc::new(LockFreeQueue::with_config(Config::default().with_max_nodes(8)).unwrap());
        let (done_tx, done_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let helper = {
            let queue = queue.clone();
            thread::spawn(move || {
                // one slot is the dummy
                for i in 0..7 {
                    queue.enqueue(i);
                }
                while queue.dequeue().is_some() {}
                done_tx.send(()).unwrap();
                exit_rx.recv().unwrap();
            })
        };
        done_rx.recv().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.live_nodes(), 8);
        assert_eq!(queue.stats().retired_pending, 7);

        assert!(queue.try_enqueue(99).is_ok());
        assert_eq!(queue.stats().retired_pending, 0);
        assert_eq!(queue.dequeue(), Some(99));

        exit_tx.send(()).unwrap();
        helper.join().unwrap();
    }
}
