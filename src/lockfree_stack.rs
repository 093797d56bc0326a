//! Treiber stack whose pop is protected by hazard pointers.

use crate::arena::{NodeArena, NodeRef};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::{Error, PushError};
use crate::hazard_domain::{self, DomainStats, HazardDomain, LeaseGuard};
use crate::util::WrappedAlign64Type;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hazard slot used by `pop` for the observed head.
const HP_HEAD: usize = 0;

/// Lock-free LIFO stack.
///
/// # Examples
///
/// ```
/// use hp_lockfree::lockfree_stack::LockFreeStack;
///
/// let stack = LockFreeStack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct LockFreeStack<T> {
    domain: Arc<HazardDomain>,
    arena: NodeArena<T>,
    head: WrappedAlign64Type<AtomicU64>,
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeStack<T> {
    pub fn new() -> Self {
        Self::with_domain(HazardDomain::default_new())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        Ok(Self::with_domain(HazardDomain::new(config)?))
    }

    fn with_domain(domain: Arc<HazardDomain>) -> Self {
        LockFreeStack {
            arena: NodeArena::new(domain.config().max_nodes),
            domain,
            head: WrappedAlign64Type(AtomicU64::new(NodeRef::NULL.raw())),
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    pub fn stats(&self) -> DomainStats {
        self.domain.stats()
    }

    /// Nodes allocated and not yet recycled, linked or waiting in a retire list.
    pub fn live_nodes(&self) -> usize {
        self.arena.live()
    }

    pub fn is_empty(&self) -> bool {
        NodeRef::from_raw(self.head.load(Ordering::Acquire)).is_null()
    }

    /// Push `value`. Panics only if the node arena or the thread table is exhausted.
    pub fn push(&self, value: T) {
        if let Err(e) = self.try_push(value) {
            panic!("lock-free stack push failed: {}", e.kind());
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let node = hazard_domain::alloc_node(&self.domain, &self.arena, value)?;
        let backoff = Backoff::new(self.domain.config().backoff);
        let mut head = NodeRef::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            self.arena.store_next(node, head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head.raw(),
                node.raw(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(cur) => {
                    head = NodeRef::from_raw(cur);
                    backoff.snooze();
                }
            }
        }
    }

    /// Pop the most recently pushed value, `None` if the stack is empty. Panics only if the
    /// thread table is exhausted.
    pub fn pop(&self) -> Option<T> {
        match self.try_pop() {
            Ok(ret) => ret,
            Err(e) => panic!("lock-free stack pop failed: {}", e),
        }
    }

    pub fn try_pop(&self) -> Result<Option<T>, Error> {
        hazard_domain::with_lease(&self.domain, |guard| self.inner_pop(guard))
    }

    fn inner_pop(&self, guard: &LeaseGuard) -> Option<T> {
        let backoff = Backoff::new(self.domain.config().backoff);
        let mut head = NodeRef::from_raw(self.head.load(Ordering::Acquire));
        loop {
            if head.is_null() {
                return None;
            }
            guard.publish(HP_HEAD, head);
            let check = NodeRef::from_raw(self.head.load(Ordering::SeqCst));
            if check != head {
                head = check;
                continue;
            }
            debug_assert!(self.arena.is_current(head));
            let next = self.arena.load_next(head, Ordering::Acquire);
            match self.head.compare_exchange_weak(
                head.raw(),
                next.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let ret = unsafe { self.arena.take(head) };
                    guard.clear(HP_HEAD);
                    guard.retire(head, &self.arena);
                    return Some(ret);
                }
                Err(cur) => {
                    guard.clear(HP_HEAD);
                    head = NodeRef::from_raw(cur);
                    backoff.snooze();
                }
            }
        }
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        let mut cur = NodeRef::from_raw(*self.head.get_mut());
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
