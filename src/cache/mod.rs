//! Local caching subsystem.
//!
//! - [`LocalCache`] — per-instance map of key → value + expiry consulted
//!   before the shared store. A read-through shadow only; lease state
//!   always comes from the store.
//!
//! - [`cleanup`] — background task that periodically removes expired
//!   entries from the [`LocalCache`].

pub mod cleanup;
pub mod local;

pub use cleanup::{CleanupHandle, spawn_cleanup};
pub use local::LocalCache;
