//! Deduplicated file-handle cache
//!
//! Many concurrent listeners of one logical file share a single open
//! descriptor, format state and bitrate meter through a reference-counted
//! handle. This module defines the handles, their (mount, flags) keys and
//! the ordered cache that deduplicates them.

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{Expiry, FileHandle, HandleState, ListenerEntry};
pub use key::{FInfo, HandleFlags, HandleKey};
pub use store::{HandleCache, Presence};
