//! egress-snat engine: turns pod change events into SNAT rule table mutations.
//!
//! Keys are sharded onto a fixed set of workers; each worker owns a [`Reconciler`] holding the
//! last-applied rule for its keys. A periodic resync re-derives every desired rule from the cache,
//! heals drift in the table and prunes owned rules nothing asks for.

#![forbid(unsafe_code)]

mod dispatch;
pub mod locks;
pub mod reconcile;
mod resync;

pub use dispatch::{Engine, EngineError, EngineHandle, EngineOptions};
pub use locks::{AddressGuard, AddressLocks};
pub use reconcile::{desired_rule, KeyState, Outcome, Reconciler, ResyncReport};
