use crate::arena::NodeRef;
use crate::backoff::Backoff;
use crate::config::{BackoffPolicy, HAZARDS_PER_THREAD};
use crate::util::WrappedAlign64Type;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Set in `ThreadRecord::state` while the owner is inside an operation.
const BUSY: u64 = 1;

/// Set while another thread drains the retire list of an idle or free record.
const BORROWED: u64 = 2;

const FLAG_BITS: u32 = 2;

/// Record state when no lease owns it.
const FREE: u64 = 0;

#[inline]
fn idle_state(incarnation: u64) -> u64 {
    incarnation << FLAG_BITS
}

pub(crate) enum Enter {
    Entered,
    /// The owner is already inside an operation.
    Busy,
    /// The record now belongs to another incarnation or is free.
    Lost,
}

/// One row of the hazard table: the hazard slots a thread publishes and the nodes it retired.
///
/// `state` is `0` when free, otherwise the owning lease's incarnation shifted left by two with
/// `BUSY` in the low bit. Hazards are only published while `BUSY` is set, so a record that is
/// owned but idle carries no hazard and can be taken back safely. The retire list belongs to
/// whoever set `BUSY`, or to the thread that set `BORROWED` on a record without `BUSY`. The two
/// flags are never set together.
pub(crate) struct ThreadRecord {
    state: WrappedAlign64Type<AtomicU64>,
    last_active_us: AtomicI64,
    hazards: WrappedAlign64Type<[AtomicU64; HAZARDS_PER_THREAD]>,
    retired: UnsafeCell<Vec<NodeRef>>,
    retired_count: AtomicUsize,
}

unsafe impl Sync for ThreadRecord {}

unsafe impl Send for ThreadRecord {}

impl Default for ThreadRecord {
    fn default() -> Self {
        ThreadRecord::new()
    }
}

impl ThreadRecord {
    fn new() -> ThreadRecord {
        ThreadRecord {
            state: WrappedAlign64Type(AtomicU64::new(FREE)),
            last_active_us: AtomicI64::new(0),
            hazards: WrappedAlign64Type([
                AtomicU64::new(NodeRef::NULL.raw()),
                AtomicU64::new(NodeRef::NULL.raw()),
            ]),
            retired: UnsafeCell::new(Vec::new()),
            retired_count: AtomicUsize::new(0),
        }
    }

    pub fn is_free(&self) -> bool {
        self.state.load(Ordering::Acquire) == FREE
    }

    pub fn try_claim(&self, incarnation: u64, now_us: i64) -> bool {
        if self
            .state
            .compare_exchange(
                FREE,
                idle_state(incarnation),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.last_active_us.store(now_us, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Give the record back if `incarnation` still owns it and is idle.
    pub fn release(&self, incarnation: u64) -> bool {
        let idle = idle_state(incarnation);
        let backoff = Backoff::new(BackoffPolicy::default());
        loop {
            match self
                .state
                .compare_exchange(idle, FREE, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(cur) if cur == idle | BORROWED => backoff.snooze(),
                Err(_) => return false,
            }
        }
    }

    /// Free the record if its owner has been idle since before `deadline_us`.
    pub fn try_expire(&self, deadline_us: i64) -> Option<u64> {
        let state = self.state.load(Ordering::Acquire);
        if state == FREE || state & (BUSY | BORROWED) != 0 {
            return None;
        }
        if self.last_active_us.load(Ordering::Relaxed) >= deadline_us {
            return None;
        }
        match self
            .state
            .compare_exchange(state, FREE, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => Some(state >> FLAG_BITS),
            Err(_) => None,
        }
    }

    /// Mark the record busy for `incarnation`. Waits while a borrower drains the retire list,
    /// which only happens when a node arena ran full.
    pub fn enter(&self, incarnation: u64) -> Enter {
        let idle = idle_state(incarnation);
        let backoff = Backoff::new(BackoffPolicy::default());
        loop {
            match self.state.compare_exchange(
                idle,
                idle | BUSY,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Enter::Entered,
                Err(cur) if cur == idle | BUSY => return Enter::Busy,
                Err(cur) if cur == idle | BORROWED => backoff.snooze(),
                Err(_) => return Enter::Lost,
            }
        }
    }

    /// Take the retire list of a record that is free or idle, so that a thread short of nodes
    /// can scan it. Returns the state to restore with `end_borrow`.
    pub fn try_borrow(&self) -> Option<u64> {
        if self.retired_count() == 0 {
            return None;
        }
        let state = self.state.load(Ordering::Acquire);
        if state & (BUSY | BORROWED) != 0 {
            return None;
        }
        self.state
            .compare_exchange(
                state,
                state | BORROWED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
    }

    pub fn end_borrow(&self, state: u64) {
        self.state.store(state, Ordering::Release);
    }

    pub fn exit(&self, incarnation: u64, now_us: Option<i64>) {
        self.clear_all();
        if let Some(now_us) = now_us {
            self.last_active_us.store(now_us, Ordering::Relaxed);
        }
        self.state.store(idle_state(incarnation), Ordering::Release);
    }

    #[inline]
    pub fn publish(&self, idx: usize, node: NodeRef) {
        self.hazards[idx].store(node.raw(), Ordering::SeqCst);
    }

    #[inline]
    pub fn clear(&self, idx: usize) {
        self.hazards[idx].store(NodeRef::NULL.raw(), Ordering::Release);
    }

    pub fn clear_all(&self) {
        for idx in 0..HAZARDS_PER_THREAD {
            self.clear(idx);
        }
    }

    /// Push the published hazards of this record into `out`.
    pub fn collect_hazards(&self, out: &mut Vec<u64>) {
        for hazard in self.hazards.iter() {
            let v = hazard.load(Ordering::Acquire);
            if !NodeRef::from_raw(v).is_null() {
                out.push(v);
            }
        }
    }

    pub fn protects(&self, node: NodeRef) -> bool {
        !node.is_null()
            && self
                .hazards
                .iter()
                .any(|hazard| hazard.load(Ordering::Acquire) == node.raw())
    }

    pub fn retired_count(&self) -> usize {
        self.retired_count.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// Only the thread that has the record entered (`BUSY` set by its lease) or borrowed may call
    /// this, and the returned reference must be gone before `exit` or `end_borrow`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn retired_mut(&self) -> &mut Vec<NodeRef> {
        &mut *self.retired.get()
    }

    pub fn sync_retired_count(&self, count: usize) {
        self.retired_count.store(count, Ordering::Relaxed);
    }
}
