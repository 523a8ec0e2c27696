//! Client-side request cache for API-backed applications.
//!
//! Views read through a [`cache::RequestCache`] keyed by resource name and
//! query parameters, fetch through an [`api::ApiGateway`] on a miss, and keep
//! every cached page consistent after mutations via targeted item patches or
//! resource-wide invalidation. A [`session::Session`] owns the cache and
//! clears it whenever the signed-in identity changes.

pub mod api;
pub mod cache;
pub mod config;
pub mod session;
