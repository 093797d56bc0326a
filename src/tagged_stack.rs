//! Treiber stack guarded by a version tag instead of hazard pointers.
//!
//! Popped nodes go straight back to the arena. A thread that read a head which was popped and
//! pushed again in the meantime holds the same index with an older tag, so its CAS fails. Slot
//! memory stays mapped for the lifetime of the arena, which makes the stale read of `next` that
//! precedes such a failed CAS harmless.

use crate::arena::{NodeArena, NodeRef};
use crate::backoff::Backoff;
use crate::config::{BackoffPolicy, Config};
use crate::error::{Error, PushError};
use crate::tagged::{AtomicTagged, Tagged};
use crate::util::WrappedAlign64Type;
use std::sync::atomic::Ordering;

pub struct TaggedStack<T> {
    arena: NodeArena<T>,
    head: WrappedAlign64Type<AtomicTagged>,
    backoff: BackoffPolicy,
}

#[inline]
fn link(index: u32) -> NodeRef {
    NodeRef::new(index, 0)
}

impl<T> Default for TaggedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaggedStack<T> {
    pub fn new() -> Self {
        Self::build(&Config::default())
    }

    /// Only `max_nodes` and `backoff` of `config` apply, there is no reclamation to tune.
    pub fn with_config(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::build(&config))
    }

    fn build(config: &Config) -> Self {
        TaggedStack {
            arena: NodeArena::new(config.max_nodes),
            head: WrappedAlign64Type(AtomicTagged::new(Tagged::nil())),
            backoff: config.backoff,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_nil()
    }

    pub fn live_nodes(&self) -> usize {
        self.arena.live()
    }

    /// Times the head tag wrapped around. Each wrap reopens a one-in-`2^32` ABA window for a
    /// thread preempted across it.
    pub fn tag_wraps(&self) -> u64 {
        self.head.wrap_count()
    }

    pub fn push(&self, value: T) {
        if let Err(e) = self.try_push(value) {
            panic!("tagged stack push failed: {}", e.kind());
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let node = match self.arena.alloc(value) {
            Ok(node) => node,
            Err(value) => {
                warn!(
                    "node arena exhausted, capacity={}",
                    self.arena.capacity()
                );
                return Err(PushError::new(value, Error::ArenaExhausted));
            }
        };
        let backoff = Backoff::new(self.backoff);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            self.arena
                .store_next(node, link(head.index()), Ordering::Relaxed);
            match self.head.compare_exchange(
                head,
                node.index(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(cur) => {
                    head = cur;
                    backoff.snooze();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new(self.backoff);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_nil() {
                return None;
            }
            // may be garbage if `head` was popped meanwhile, the CAS below rejects it then
            let next = self.arena.load_next(link(head.index()), Ordering::Acquire);
            match self.head.compare_exchange(
                head,
                next.index(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let node = self.arena.current(head.index());
                    let ret = unsafe { self.arena.take(node) };
                    unsafe { self.arena.free(node) };
                    return Some(ret);
                }
                Err(cur) => {
                    head = cur;
                    backoff.snooze();
                }
            }
        }
    }
}

impl<T> Drop for TaggedStack<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_nil() {
            let node = self.arena.current(cur.index());
            let next = self.arena.load_next(node, Ordering::Relaxed);
            unsafe {
                drop(self.arena.take(node));
            }
            cur = Tagged::new(next.index(), 0);
        }
    }
}
