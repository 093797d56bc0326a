//! Lock-free stack and queue with `Hazard Pointers` memory reclamation
//!
//! [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf): a thread
//! publishes the node it is about to dereference in a slot that every other thread can read, and
//! a removed node is only recycled once no slot holds it. That makes it safe to read a node that
//! a concurrent operation is unlinking, and it prevents the [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem)
//! on the removal path.
//!
//! Nodes live in a `NodeArena` and are named by `NodeRef`, a slot index paired with a
//! generation that changes on every reuse. Slot memory is never given back while the structure
//! is alive, so a stale reference can only lead to a failed comparison, never to a wild read.
//!
//! `LockFreeStack` (Treiber) and `LockFreeQueue` (Michael-Scott) are built on a `HazardDomain`.
//! Threads are registered on first use through a `ThreadLease` that is released when the thread
//! exits. `TaggedStack` is the alternative that relies on a version tag alone.
//!
//! ```
//! use hp_lockfree::{LockFreeQueue, LockFreeStack};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let queue = Arc::new(LockFreeQueue::new());
//! let producer = {
//!     let queue = queue.clone();
//!     thread::spawn(move || (0..100).for_each(|i| queue.enqueue(i)))
//! };
//! producer.join().unwrap();
//! assert_eq!(queue.dequeue(), Some(0));
//!
//! let stack = LockFreeStack::new();
//! stack.push("a");
//! assert_eq!(stack.pop(), Some("a"));
//! ```

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

mod hazard_pointer;
pub mod util;
pub mod error;
pub mod config;
pub mod backoff;
pub mod tagged;
pub mod arena;
pub mod hazard_domain;
pub mod lockfree_stack;
pub mod lockfree_queue;
pub mod tagged_stack;

pub use crate::config::Config;
pub use crate::error::{Error, PushError};
pub use crate::hazard_domain::{HazardDomain, ThreadLease};
pub use crate::lockfree_queue::LockFreeQueue;
pub use crate::lockfree_stack::LockFreeStack;
pub use crate::tagged_stack::TaggedStack;
