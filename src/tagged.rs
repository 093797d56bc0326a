//! Index and version tag installed as one atomic word.
//!
//! Every successful `compare_exchange` installs `tag + 1`, so two loads that see the same index
//! but different tags are distinguishable and a stale CAS fails even if the index came back (ABA).
//! The tag is 32 bits wide and wraps: a thread that stays preempted across exactly `2^32`
//! updates of the same word while the same index is on top would be fooled. Wraps are counted
//! and logged so that the gap is never silent.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index value meaning "no node".
pub const NIL_INDEX: u32 = u32::max_value();

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tagged {
    index: u32,
    tag: u32,
}

impl Tagged {
    #[inline]
    pub fn new(index: u32, tag: u32) -> Self {
        Tagged { index, tag }
    }

    #[inline]
    pub fn nil() -> Self {
        Tagged::new(NIL_INDEX, 0)
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.index == NIL_INDEX
    }

    /// The word that replaces `self` when `index` is installed over it.
    #[inline]
    pub fn successor(&self, index: u32) -> Tagged {
        Tagged::new(index, self.tag.wrapping_add(1))
    }

    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.tag) << 32) | u64::from(self.index)
    }

    #[inline]
    fn unpack(v: u64) -> Self {
        Tagged::new(v as u32, (v >> 32) as u32)
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Tagged(nil, tag={})", self.tag)
        } else {
            write!(f, "Tagged({}, tag={})", self.index, self.tag)
        }
    }
}

pub struct AtomicTagged {
    word: AtomicU64,
    wraps: AtomicU64,
}

impl AtomicTagged {
    pub fn new(v: Tagged) -> Self {
        AtomicTagged {
            word: AtomicU64::new(v.pack()),
            wraps: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Tagged {
        Tagged::unpack(self.word.load(order))
    }

    /// Install `index` with the next tag if the word still equals `current`. On failure the
    /// freshly observed word is returned.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Tagged,
        index: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Tagged, Tagged> {
        let new = current.successor(index);
        match self
            .word
            .compare_exchange(current.pack(), new.pack(), success, failure)
        {
            Ok(_) => {
                if new.tag == 0 {
                    let wraps = self.wraps.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "version tag wrapped around, wraps={}, index={}",
                        wraps, index
                    );
                }
                Ok(new)
            }
            Err(v) => Err(Tagged::unpack(v)),
        }
    }

    /// Number of times the tag wrapped back to zero.
    pub fn wrap_count(&self) -> u64 {
        self.wraps.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stale_cas_fails_after_aba() {
        let w = AtomicTagged::new(Tagged::new(1, 0));
        let stale = w.load(Ordering::Acquire);
        let a = w
            .compare_exchange(stale, 2, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();
        let b = w
            .compare_exchange(a, 1, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();
        assert_eq!(b.index(), stale.index());
        assert_ne!(b, stale);
        let err = w
            .compare_exchange(stale, 3, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_err();
        assert_eq!(err, Tagged::new(1, 2));
    }

    #[test]
    fn test_wrap_is_counted() {
        let w = AtomicTagged::new(Tagged::new(5, u32::max_value()));
        assert_eq!(w.wrap_count(), 0);
        let cur = w.load(Ordering::Relaxed);
        let new = w
            .compare_exchange(cur, 6, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();
        assert_eq!(new, Tagged::new(6, 0));
        assert_eq!(w.wrap_count(), 1);
    }

    #[test]
    fn test_nil() {
        let n = Tagged::nil();
        assert!(n.is_nil());
        assert!(!n.successor(0).is_nil());
        assert_eq!(format!("{:?}", n), "Tagged(nil, tag=0)");
    }
}
