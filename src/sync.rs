//! Synchronization vocabulary for the cache.
//!
//! Everything the crate locks or fences goes through here: the linkage
//! mutex, the link-time-filled dispatch tables, and the atomic words of the
//! cache entries themselves. Readers of a published entry never block; locks
//! guard only writers and class linking, so the real primitives are used
//! unconditionally.

pub use parking_lot::{Mutex, MutexGuard, RwLock};

pub use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};
