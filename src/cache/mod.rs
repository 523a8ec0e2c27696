//! Client-side request cache shared by the views of a session.
//!
//! This module provides an in-memory cache that:
//! - Keys responses by resource name plus a canonicalized parameter set
//! - Invalidates every parameter variant of a resource in one call
//! - Patches a single record in place across all cached pages of a resource
//! - Publishes a version counter that changes only on invalidation and patches
//! - Shares one in-flight fetch between concurrent callers that miss

mod flight;
mod key;
mod patch;
mod store;
mod traits;

pub use key::{belongs_to, derive_key, Params, SEPARATOR};
pub use store::{CacheOptions, RequestCache, Resources};
pub use traits::{CacheEntry, CacheResult, CacheSource, PayloadShape};
