//! Bounded exponential backoff for CAS retry loops.

use crate::config::BackoffPolicy;
use crate::util;
use std::cell::Cell;
use std::thread;

/// Each failed CAS advances one step: the first `spin_limit` steps spin `2^step` times, the
/// following ones yield the time slice to the scheduler.
pub struct Backoff {
    step: Cell<u32>,
    policy: BackoffPolicy,
}

impl Backoff {
    #[inline]
    pub fn new(policy: BackoffPolicy) -> Self {
        Backoff {
            step: Cell::new(0),
            policy,
        }
    }

    #[inline]
    pub fn step(&self) -> u32 {
        self.step.get()
    }

    /// Spin only, for retries that are expected to succeed right away.
    #[inline]
    pub fn spin(&self) {
        let step = self.step.get().min(self.policy.spin_limit);
        for _ in 0..1u32 << step {
            util::pause();
        }
        if self.step.get() <= self.policy.spin_limit {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Spin while under `spin_limit`, yield afterwards.
    #[inline]
    pub fn snooze(&self) {
        if self.step.get() <= self.policy.spin_limit {
            for _ in 0..1u32 << self.step.get() {
                util::pause();
            }
        } else {
            thread::yield_now();
        }
        if self.step.get() <= self.policy.yield_limit {
            self.step.set(self.step.get() + 1);
        }
    }
}
