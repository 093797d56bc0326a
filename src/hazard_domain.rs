//! Definition and implementations of `HazardDomain`
//!
//! A domain owns the hazard table of one data structure: `MAX_THREAD_COUNT` records, each with
//! `HAZARDS_PER_THREAD` hazard slots and a private retire list. Threads do not index the table
//! with a global thread id; they register and receive a `ThreadLease` that owns one record until
//! it is dropped. Every hazard operation goes through a `LeaseGuard`, obtained from
//! `ThreadLease::activate`, which marks the record busy for the length of one operation.
//!
//! Removal follows the usual protocol: publish the node in a hazard slot, verify that it is
//! still reachable, dereference, unlink with a CAS, clear the slot, and retire the node. A
//! retired node is handed to a `Reclaim` implementation only after a scan has seen no hazard
//! slot anywhere holding it.

use crate::arena::{NodeArena, NodeRef};
use crate::config::{Config, HAZARDS_PER_THREAD, MAX_THREAD_COUNT};
use crate::error::{Error, PushError};
use crate::hazard_pointer::{Enter, ThreadRecord};
use crate::util::{self, WrappedAlign64Type};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// An idle record's activity stamp is refreshed every this many operations.
const HEARTBEAT_OPS: u32 = 64;

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Receives nodes that a scan proved unreachable and unprotected.
pub trait Reclaim {
    fn reclaim(&self, node: NodeRef);
}

/// Outcome of one `scan_and_reclaim`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub reclaimed: usize,
    pub kept: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DomainStats {
    /// Records currently owned by a lease
    pub registered: usize,
    /// Retired nodes waiting for a scan, over all records
    pub retired_pending: usize,
    pub reclaimed: u64,
    pub scans: u64,
    /// Leases taken back by `reclaim_expired_leases`
    pub expired_leases: u64,
}

pub struct HazardDomain {
    id: u64,
    config: Config,
    records: Box<[ThreadRecord]>,
    incarnation: AtomicU64,
    registered: WrappedAlign64Type<AtomicUsize>,
    retired_pending: WrappedAlign64Type<AtomicUsize>,
    reclaimed: AtomicU64,
    scans: AtomicU64,
    expired_leases: AtomicU64,
    closed: AtomicBool,
}

impl HazardDomain {
    /// Build a domain with a validated `config`.
    ///
    /// # Examples
    ///
    /// ```
    /// use hp_lockfree::config::Config;
    /// use hp_lockfree::hazard_domain::HazardDomain;
    ///
    /// let domain = HazardDomain::new(Config::default()).unwrap();
    /// assert_eq!(domain.stats().registered, 0);
    /// ```
    pub fn new(config: Config) -> Result<Arc<Self>, Error> {
        config.validate()?;
        Ok(Arc::new(Self::build(config)))
    }

    /// Return `Self::new(Config::default())`
    pub fn default_new() -> Arc<Self> {
        Arc::new(Self::build(Config::default()))
    }

    fn build(config: Config) -> Self {
        let mut records = Vec::with_capacity(MAX_THREAD_COUNT);
        records.extend((0..MAX_THREAD_COUNT).map(|_| ThreadRecord::default()));
        HazardDomain {
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
            config,
            records: records.into_boxed_slice(),
            incarnation: AtomicU64::new(1),
            registered: WrappedAlign64Type(AtomicUsize::new(0)),
            retired_pending: WrappedAlign64Type(AtomicUsize::new(0)),
            reclaimed: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            expired_leases: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True if any hazard slot of any thread currently holds `node`.
    pub fn is_hazardous(&self, node: NodeRef) -> bool {
        atomic::fence(Ordering::SeqCst);
        self.records.iter().any(|r| r.protects(node))
    }

    pub fn stats(&self) -> DomainStats {
        DomainStats {
            registered: self.registered.load(Ordering::Relaxed),
            retired_pending: self.retired_pending.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            expired_leases: self.expired_leases.load(Ordering::Relaxed),
        }
    }

    /// Free every record whose lease has been idle for longer than `lease_timeout_us`. The
    /// former holder notices on its next activation and registers again; the retire list stays
    /// with the record and is adopted by its next owner. Returns the number of records freed.
    pub fn reclaim_expired_leases(&self) -> usize {
        if self.config.lease_timeout_us == 0 {
            return 0;
        }
        let deadline = util::get_cur_microseconds_time() - self.config.lease_timeout_us;
        let mut count = 0;
        for (idx, record) in self.records.iter().enumerate() {
            if let Some(incarnation) = record.try_expire(deadline) {
                self.registered.fetch_sub(1, Ordering::Relaxed);
                self.expired_leases.fetch_add(1, Ordering::Relaxed);
                info!(
                    "lease expired, record={}, incarnation={}, retired={}",
                    idx,
                    incarnation,
                    record.retired_count()
                );
                count += 1;
            }
        }
        count
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Every published hazard, sorted.
    fn snapshot_hazards(&self) -> Vec<u64> {
        atomic::fence(Ordering::SeqCst);
        let mut hazards = Vec::with_capacity(HAZARDS_PER_THREAD * 4);
        for record in self.records.iter() {
            record.collect_hazards(&mut hazards);
        }
        hazards.sort_unstable();
        hazards
    }

    /// The caller must have `record` entered or borrowed.
    fn drain_retired<R>(
        &self,
        record: &ThreadRecord,
        hazards: &[u64],
        reclaimer: &R,
    ) -> ScanReport
    where
        R: Reclaim + ?Sized,
    {
        let retired = unsafe { record.retired_mut() };
        let before = retired.len();
        retired.retain(|node| {
            if hazards.binary_search(&node.raw()).is_ok() {
                true
            } else {
                reclaimer.reclaim(*node);
                false
            }
        });
        let kept = retired.len();
        let reclaimed = before - kept;
        record.sync_retired_count(kept);
        self.retired_pending.fetch_sub(reclaimed, Ordering::Relaxed);
        self.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        ScanReport { reclaimed, kept }
    }

    fn scan_threshold(&self) -> usize {
        self.config
            .scan_threshold(self.registered.load(Ordering::Relaxed))
    }

    fn try_claim_any(&self, incarnation: u64, now_us: i64) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.is_free() && r.try_claim(incarnation, now_us))
    }

    fn claim_record(&self) -> Result<(usize, u64), Error> {
        let incarnation = self.incarnation.fetch_add(1, Ordering::Relaxed);
        let now_us = util::get_cur_microseconds_time();
        let mut claimed = self.try_claim_any(incarnation, now_us);
        if claimed.is_none() && self.reclaim_expired_leases() > 0 {
            claimed = self.try_claim_any(incarnation, now_us);
        }
        match claimed {
            Some(idx) => {
                self.registered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "lease registered, domain={}, record={}, incarnation={}",
                    self.id, idx, incarnation
                );
                Ok((idx, incarnation))
            }
            None => {
                warn!(
                    "thread number overflow, domain={}, max={}",
                    self.id, MAX_THREAD_COUNT
                );
                Err(Error::ThreadNumOverflow)
            }
        }
    }
}

/// Ownership of one record of a `HazardDomain`, held by one thread.
pub struct ThreadLease {
    domain: Arc<HazardDomain>,
    record: Cell<usize>,
    incarnation: Cell<u64>,
    ops: Cell<u32>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadLease {
    /// Claim a free record of `domain` for the calling thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use hp_lockfree::hazard_domain::{HazardDomain, ThreadLease};
    ///
    /// let domain = HazardDomain::default_new();
    /// let lease = ThreadLease::register(&domain).unwrap();
    /// assert_eq!(domain.stats().registered, 1);
    /// drop(lease);
    /// assert_eq!(domain.stats().registered, 0);
    /// ```
    pub fn register(domain: &Arc<HazardDomain>) -> Result<ThreadLease, Error> {
        let (record, incarnation) = domain.claim_record()?;
        Ok(ThreadLease {
            domain: domain.clone(),
            record: Cell::new(record),
            incarnation: Cell::new(incarnation),
            ops: Cell::new(0),
            _not_send: PhantomData,
        })
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    pub fn record_index(&self) -> usize {
        self.record.get()
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.get()
    }

    /// Enter one operation. Hazards can only be published through the returned guard, and all
    /// of them are cleared when it is dropped.
    pub fn activate(&self) -> Result<LeaseGuard, Error> {
        loop {
            let record = &self.domain.records[self.record.get()];
            match record.enter(self.incarnation.get()) {
                Enter::Entered => {
                    return Ok(LeaseGuard {
                        lease: self,
                        record,
                    })
                }
                Enter::Busy => {
                    warn!(
                        "lease is already active, record={}",
                        self.record.get()
                    );
                    return Err(Error::Busy);
                }
                Enter::Lost => {
                    info!(
                        "lease lost its record, registering again, record={}, incarnation={}",
                        self.record.get(),
                        self.incarnation.get()
                    );
                    let (record, incarnation) = self.domain.claim_record()?;
                    self.record.set(record);
                    self.incarnation.set(incarnation);
                }
            }
        }
    }
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        let record = &self.domain.records[self.record.get()];
        if record.release(self.incarnation.get()) {
            self.domain.registered.fetch_sub(1, Ordering::Relaxed);
            debug!(
                "lease released, domain={}, record={}, retired={}",
                self.domain.id,
                self.record.get(),
                record.retired_count()
            );
        }
    }
}

/// A lease inside one operation.
pub struct LeaseGuard<'a> {
    lease: &'a ThreadLease,
    record: &'a ThreadRecord,
}

impl<'a> LeaseGuard<'a> {
    pub fn domain(&self) -> &HazardDomain {
        &self.lease.domain
    }

    /// Announce that this thread may dereference `node` through hazard slot `idx`. The store is
    /// sequentially consistent: a re-read of the source location after `publish` that still
    /// finds `node` proves that no scan can have missed the hazard.
    #[inline]
    pub fn publish(&self, idx: usize, node: NodeRef) {
        debug_assert!(idx < HAZARDS_PER_THREAD);
        self.record.publish(idx, node);
    }

    #[inline]
    pub fn clear(&self, idx: usize) {
        debug_assert!(idx < HAZARDS_PER_THREAD);
        self.record.clear(idx);
    }

    #[inline]
    pub fn clear_all(&self) {
        self.record.clear_all();
    }

    /// Number of nodes in this thread's retire list.
    pub fn retired_count(&self) -> usize {
        self.record.retired_count()
    }

    /// Hand an unlinked node over to deferred reclamation; scans once the retire list reaches
    /// the domain's threshold.
    pub fn retire<R>(&self, node: NodeRef, reclaimer: &R) -> Option<ScanReport>
    where
        R: Reclaim + ?Sized,
    {
        let len = {
            let retired = unsafe { self.record.retired_mut() };
            retired.push(node);
            retired.len()
        };
        self.record.sync_retired_count(len);
        self.lease
            .domain
            .retired_pending
            .fetch_add(1, Ordering::Relaxed);
        if len >= self.lease.domain.scan_threshold() {
            Some(self.scan_and_reclaim(reclaimer))
        } else {
            None
        }
    }

    /// Reclaim every node of this thread's retire list that no hazard slot holds.
    pub fn scan_and_reclaim<R>(&self, reclaimer: &R) -> ScanReport
    where
        R: Reclaim + ?Sized,
    {
        let domain = &self.lease.domain;
        let hazards = domain.snapshot_hazards();
        let report = domain.drain_retired(self.record, &hazards, reclaimer);
        domain.scans.fetch_add(1, Ordering::Relaxed);
        trace!(
            "scan done, record={}, hazards={}, reclaimed={}, kept={}",
            self.lease.record.get(),
            hazards.len(),
            report.reclaimed,
            report.kept
        );
        report
    }

    /// Like `scan_and_reclaim`, but also drains the retire lists of every record that is free
    /// or idle. Nodes that other threads retired below their scan threshold are otherwise out of
    /// reach until those threads retire again. Owners entering a record meanwhile wait for the
    /// drain to finish.
    pub fn reclaim_all<R>(&self, reclaimer: &R) -> ScanReport
    where
        R: Reclaim + ?Sized,
    {
        let domain = &self.lease.domain;
        // borrow first: the hazard snapshot must be younger than every retirement it judges
        let borrowed: Vec<_> = domain
            .records
            .iter()
            .filter_map(|record| record.try_borrow().map(|state| (record, state)))
            .collect();
        let hazards = domain.snapshot_hazards();
        let mut report = domain.drain_retired(self.record, &hazards, reclaimer);
        for (record, state) in borrowed.iter() {
            let r = domain.drain_retired(record, &hazards, reclaimer);
            record.end_borrow(*state);
            report.reclaimed += r.reclaimed;
            report.kept += r.kept;
        }
        domain.scans.fetch_add(1, Ordering::Relaxed);
        debug!(
            "full scan done, record={}, borrowed={}, reclaimed={}, kept={}",
            self.lease.record.get(),
            borrowed.len(),
            report.reclaimed,
            report.kept
        );
        report
    }
}

impl<'a> Drop for LeaseGuard<'a> {
    fn drop(&mut self) {
        let ops = self.lease.ops.get().wrapping_add(1);
        self.lease.ops.set(ops);
        let stamp = if ops % HEARTBEAT_OPS == 0 {
            Some(util::get_cur_microseconds_time())
        } else {
            None
        };
        self.record.exit(self.lease.incarnation.get(), stamp);
    }
}

thread_local! {
    static LEASES: RefCell<Vec<Rc<ThreadLease>>> = RefCell::new(Vec::new());
}

/// The calling thread's lease on `domain`, registered on first use and released when the thread
/// exits. Leases of closed domains are dropped whenever a new one is registered.
pub(crate) fn cached_lease(domain: &Arc<HazardDomain>) -> Result<Rc<ThreadLease>, Error> {
    let found = LEASES.try_with(|leases| {
        leases
            .borrow()
            .iter()
            .find(|l| l.domain.id == domain.id)
            .cloned()
    });
    match found {
        Ok(Some(lease)) => Ok(lease),
        Ok(None) => {
            let lease = Rc::new(ThreadLease::register(domain)?);
            let cached = lease.clone();
            let _ = LEASES.try_with(move |leases| {
                let mut leases = leases.borrow_mut();
                leases.retain(|l| !l.domain.is_closed());
                leases.push(cached);
            });
            Ok(lease)
        }
        // thread-local storage is being torn down, use a lease for this one operation
        Err(_) => Ok(Rc::new(ThreadLease::register(domain)?)),
    }
}

/// Run `f` inside one operation of the calling thread's cached lease on `domain`.
pub(crate) fn with_lease<R, F>(domain: &Arc<HazardDomain>, f: F) -> Result<R, Error>
where
    F: FnOnce(&LeaseGuard) -> R,
{
    let lease = cached_lease(domain)?;
    let guard = lease.activate()?;
    let ret = f(&guard);
    drop(guard);
    Ok(ret)
}

/// Allocate a node for `value`. A full arena is retried once after draining every retire list
/// that can be reached, since retired nodes are the only ones that can be waiting to go back.
pub(crate) fn alloc_node<T>(
    domain: &Arc<HazardDomain>,
    arena: &NodeArena<T>,
    value: T,
) -> Result<NodeRef, PushError<T>> {
    let value = match arena.alloc(value) {
        Ok(node) => return Ok(node),
        Err(value) => value,
    };
    if let Err(e) = with_lease(domain, |guard| guard.reclaim_all(arena)) {
        return Err(PushError::new(value, e));
    }
    arena.alloc(value).map_err(|value| {
        warn!(
            "node arena exhausted, domain={}, capacity={}",
            domain.id,
            arena.capacity()
        );
        PushError::new(value, Error::ArenaExhausted)
    })
}
