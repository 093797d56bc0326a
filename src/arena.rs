//! Index based node storage shared by the stack and the queue.
//!
//! Slots live in chunks of doubling size that are allocated lazily and only handed back to the
//! allocator when the arena is dropped, so reading the atomic fields of a stale slot is always
//! memory safe. Each slot carries a generation that is bumped on every free: a `NodeRef` names
//! one incarnation of a slot and never compares equal to a reference to a later one.
//!
//! Generations are 32 bits wide and wrap. A reference held across exactly `2^32` reuses of its
//! slot would match again; wraps are counted by `generation_wraps` and logged.
//!
//! The arena never drops payloads. Whoever unlinks a node moves the payload out before freeing
//! it, and the owning structure drops whatever is still linked when it goes away.

use crate::backoff::Backoff;
use crate::config::BackoffPolicy;
use crate::hazard_domain::Reclaim;
use crate::tagged::{AtomicTagged, Tagged, NIL_INDEX};
use crate::util::WrappedAlign64Type;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const FIRST_CHUNK_SHIFT: u32 = 6;
const FIRST_CHUNK_LEN: usize = 1 << FIRST_CHUNK_SHIFT;
const CHUNK_COUNT: usize = 26;

/// Largest number of slots an arena can hold.
pub const MAX_ARENA_CAPACITY: u32 =
    ((1u64 << (FIRST_CHUNK_SHIFT as usize + CHUNK_COUNT)) - FIRST_CHUNK_LEN as u64) as u32;

/// Slot index and generation packed in one word.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(u64);

impl NodeRef {
    pub const NULL: NodeRef = NodeRef(u64::max_value());

    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        NodeRef((u64::from(generation) << 32) | u64::from(index))
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.index() == NIL_INDEX
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        NodeRef(raw)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "NodeRef(null)")
        } else {
            write!(f, "NodeRef({}@{})", self.index(), self.generation())
        }
    }
}

struct Slot<T> {
    generation: AtomicU32,
    next: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            generation: AtomicU32::new(0),
            next: AtomicU64::new(NodeRef::NULL.raw()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

pub struct NodeArena<T> {
    chunks: [AtomicPtr<Slot<T>>; CHUNK_COUNT],
    free_head: WrappedAlign64Type<AtomicTagged>,
    fresh: WrappedAlign64Type<AtomicU32>,
    live: WrappedAlign64Type<AtomicUsize>,
    generation_wraps: AtomicU64,
    capacity: u32,
}

unsafe impl<T: Send> Send for NodeArena<T> {}

unsafe impl<T: Send> Sync for NodeArena<T> {}

#[inline]
fn locate(index: u32) -> (usize, usize) {
    let v = u64::from(index) + FIRST_CHUNK_LEN as u64;
    let chunk = (63 - v.leading_zeros() - FIRST_CHUNK_SHIFT) as usize;
    let offset = (v - ((FIRST_CHUNK_LEN as u64) << chunk)) as usize;
    (chunk, offset)
}

#[inline]
fn chunk_len(chunk: usize) -> usize {
    FIRST_CHUNK_LEN << chunk
}

impl<T> NodeArena<T> {
    pub fn new(capacity: u32) -> Self {
        assert!(0 < capacity && capacity <= MAX_ARENA_CAPACITY);
        NodeArena {
            chunks: Default::default(),
            free_head: WrappedAlign64Type(AtomicTagged::new(Tagged::nil())),
            fresh: WrappedAlign64Type(AtomicU32::new(0)),
            live: WrappedAlign64Type(AtomicUsize::new(0)),
            generation_wraps: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of nodes allocated and not yet freed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Number of slots ever handed out, that is the high-water mark of the arena.
    pub fn touched(&self) -> u32 {
        self.fresh.load(Ordering::Relaxed)
    }

    /// Times a slot generation wrapped back to zero.
    pub fn generation_wraps(&self) -> u64 {
        self.generation_wraps.load(Ordering::Relaxed)
    }

    /// Allocate a node holding `value`. The value comes back if the arena is full.
    pub fn alloc(&self, value: T) -> Result<NodeRef, T> {
        match self.alloc_slot() {
            Some(index) => {
                let slot = self.slot(index);
                unsafe {
                    (*slot.value.get()).as_mut_ptr().write(value);
                }
                Ok(self.init_slot(index, slot))
            }
            None => Err(value),
        }
    }

    /// Allocate a node without payload, used as the queue's dummy.
    pub fn alloc_empty(&self) -> Option<NodeRef> {
        self.alloc_slot().map(|index| self.init_slot(index, self.slot(index)))
    }

    #[inline]
    fn init_slot(&self, index: u32, slot: &Slot<T>) -> NodeRef {
        slot.next.store(NodeRef::NULL.raw(), Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        NodeRef::new(index, slot.generation.load(Ordering::Relaxed))
    }

    /// Return a node's slot to the free list and bump its generation.
    ///
    /// # Safety
    ///
    /// `node` must be unlinked, not freed before, no longer hazardous, and its payload must have
    /// been moved out (the payload is not dropped here).
    pub unsafe fn free(&self, node: NodeRef) {
        let slot = self.slot(node.index());
        debug_assert_eq!(slot.generation.load(Ordering::Relaxed), node.generation());
        if slot.generation.fetch_add(1, Ordering::Release) == u32::max_value() {
            let wraps = self.generation_wraps.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "slot generation wrapped around, wraps={}, index={}",
                wraps,
                node.index()
            );
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.push_free(node.index(), slot);
    }

    /// True if `node` still names the current incarnation of its slot.
    #[inline]
    pub fn is_current(&self, node: NodeRef) -> bool {
        self.slot(node.index()).generation.load(Ordering::Acquire) == node.generation()
    }

    /// Reference to the current incarnation of slot `index`. Only meaningful to a thread that
    /// owns the slot, otherwise the generation may move right after the load.
    #[inline]
    pub fn current(&self, index: u32) -> NodeRef {
        NodeRef::new(
            index,
            self.slot(index).generation.load(Ordering::Acquire),
        )
    }

    #[inline]
    pub fn load_next(&self, node: NodeRef, order: Ordering) -> NodeRef {
        NodeRef::from_raw(self.slot(node.index()).next.load(order))
    }

    #[inline]
    pub fn store_next(&self, node: NodeRef, next: NodeRef, order: Ordering) {
        self.slot(node.index()).next.store(next.raw(), order);
    }

    #[inline]
    pub fn compare_exchange_next(
        &self,
        node: NodeRef,
        current: NodeRef,
        new: NodeRef,
        success: Ordering,
        failure: Ordering,
    ) -> Result<NodeRef, NodeRef> {
        self.slot(node.index())
            .next
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .map(NodeRef::from_raw)
            .map_err(NodeRef::from_raw)
    }

    /// Move the payload out of `node`.
    ///
    /// # Safety
    ///
    /// The caller must own `node` exclusively (it won the CAS that unlinked it) and the payload
    /// must not have been taken before.
    #[inline]
    pub unsafe fn take(&self, node: NodeRef) -> T {
        let slot = self.slot(node.index());
        debug_assert_eq!(slot.generation.load(Ordering::Relaxed), node.generation());
        ptr::read((*slot.value.get()).as_ptr())
    }

    /// Bitwise copy of the payload that does not transfer ownership. Only the thread whose CAS
    /// later succeeds may `assume_init` the copy, everybody else must discard it.
    ///
    /// # Safety
    ///
    /// `node` must be protected from reclamation and its payload must be initialized.
    #[inline]
    pub unsafe fn peek(&self, node: NodeRef) -> MaybeUninit<T> {
        let slot = self.slot(node.index());
        debug_assert_eq!(slot.generation.load(Ordering::Acquire), node.generation());
        ptr::read(slot.value.get())
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot<T> {
        let (chunk, offset) = locate(index);
        let base = self.chunks[chunk].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "slot {} was never allocated", index);
        unsafe { &*base.add(offset) }
    }

    fn alloc_slot(&self) -> Option<u32> {
        if let Some(index) = self.pop_free() {
            return Some(index);
        }
        let mut cur = self.fresh.load(Ordering::Relaxed);
        loop {
            if cur >= self.capacity {
                return None;
            }
            match self.fresh.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
        self.ensure_chunk(cur);
        Some(cur)
    }

    fn ensure_chunk(&self, index: u32) {
        let (chunk, _) = locate(index);
        if !self.chunks[chunk].load(Ordering::Acquire).is_null() {
            return;
        }
        let len = chunk_len(chunk);
        let mut slots: Vec<Slot<T>> = Vec::with_capacity(len);
        slots.extend((0..len).map(|_| Slot::new()));
        let new = Box::into_raw(slots.into_boxed_slice()) as *mut Slot<T>;
        if self.chunks[chunk]
            .compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unsafe {
                drop(Box::from_raw(slice::from_raw_parts_mut(new, len)));
            }
        } else {
            debug!("arena chunk {} allocated, len={}", chunk, len);
        }
    }

    fn pop_free(&self) -> Option<u32> {
        let backoff = Backoff::new(BackoffPolicy::default());
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            if head.is_nil() {
                return None;
            }
            // The slot may be popped and reused concurrently; the tag makes the CAS fail then.
            let next = self.load_next(NodeRef::new(head.index(), 0), Ordering::Acquire);
            match self.free_head.compare_exchange(
                head,
                next.index(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head.index()),
                Err(cur) => {
                    head = cur;
                    backoff.spin();
                }
            }
        }
    }

    fn push_free(&self, index: u32, slot: &Slot<T>) {
        let backoff = Backoff::new(BackoffPolicy::default());
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            slot.next
                .store(NodeRef::new(head.index(), 0).raw(), Ordering::Relaxed);
            match self.free_head.compare_exchange(
                head,
                index,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => {
                    head = cur;
                    backoff.spin();
                }
            }
        }
    }
}

impl<T> Reclaim for NodeArena<T> {
    fn reclaim(&self, node: NodeRef) {
        unsafe { self.free(node) }
    }
}

impl<T> Drop for NodeArena<T> {
    fn drop(&mut self) {
        for (chunk, ptr) in self.chunks.iter().enumerate() {
            let base = ptr.load(Ordering::Relaxed);
            if !base.is_null() {
                unsafe {
                    drop(Box::from_raw(slice::from_raw_parts_mut(
                        base,
                        chunk_len(chunk),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_locate() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));
        assert_eq!(locate(MAX_ARENA_CAPACITY - 1), (CHUNK_COUNT - 1, chunk_len(CHUNK_COUNT - 1) - 1));
        assert!(MAX_ARENA_CAPACITY < NIL_INDEX);
    }

    #[test]
    fn test_node_ref() {
        let n = NodeRef::new(7, 3);
        assert_eq!(n.index(), 7);
        assert_eq!(n.generation(), 3);
        assert!(!n.is_null());
        assert!(NodeRef::NULL.is_null());
        assert_eq!(NodeRef::from_raw(n.raw()), n);
        assert_eq!(format!("{:?}", n), "NodeRef(7@3)");
    }

    #[test]
    fn test_free_bumps_generation() {
        let arena = NodeArena::new(16);
        let a = arena.alloc(String::from("a")).unwrap();
        assert_eq!(arena.live(), 1);
        assert_eq!(unsafe { arena.take(a) }, "a");
        unsafe { arena.free(a) };
        assert!(!arena.is_current(a));
        assert_eq!(arena.live(), 0);
        let b = arena.alloc(String::from("b")).unwrap();
        assert_eq!(b.index(), a.index());
        assert_eq!(b.generation(), a.generation() + 1);
        assert_ne!(a, b);
        assert_eq!(unsafe { arena.take(b) }, "b");
        unsafe { arena.free(b) };
    }

    #[test]
    fn test_generation_wrap_is_counted() {
        let arena = NodeArena::new(4);
        let a = arena.alloc(1).unwrap();
        arena
            .slot(a.index())
            .generation
            .store(u32::max_value(), Ordering::Relaxed);
        let a = arena.current(a.index());
        assert_eq!(unsafe { arena.take(a) }, 1);
        unsafe { arena.free(a) };
        assert_eq!(arena.generation_wraps(), 1);
        let b = arena.alloc(2).unwrap();
        assert_eq!(b.index(), a.index());
        assert_eq!(b.generation(), 0);
        assert_ne!(a, b);
        assert!(!arena.is_current(a));
        assert_eq!(arena.generation_wraps(), 1);
    }

    #[test]
    fn test_capacity() {
        let arena = NodeArena::new(3);
        let nodes: Vec<_> = (0..3).map(|i| arena.alloc(i).unwrap()).collect();
        assert_eq!(arena.alloc(3), Err(3));
        assert!(arena.alloc_empty().is_none());
        unsafe {
            arena.take(nodes[1]);
            arena.free(nodes[1]);
        }
        let again = arena.alloc(4).unwrap();
        assert_eq!(again.index(), nodes[1].index());
        assert_eq!(arena.touched(), 3);
    }

    #[test]
    fn test_grows_across_chunks() {
        let arena = NodeArena::new(1000);
        let nodes: Vec<_> = (0..500u32).map(|i| arena.alloc(i).unwrap()).collect();
        let indices: HashSet<_> = nodes.iter().map(|n| n.index()).collect();
        assert_eq!(indices.len(), 500);
        for (i, n) in nodes.iter().enumerate() {
            assert_eq!(unsafe { arena.take(*n) }, i as u32);
        }
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let arena = Arc::new(NodeArena::new(64));
        let mut threads = vec![];
        for t in 0..4u64 {
            let arena = arena.clone();
            threads.push(thread::spawn(move || {
                for i in 0..20_000u64 {
                    let v = t * 1_000_000 + i;
                    let n = arena.alloc(v).unwrap();
                    assert_eq!(unsafe { arena.take(n) }, v);
                    unsafe { arena.free(n) };
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(arena.live(), 0);
        assert!(arena.touched() <= 4);
    }
}
