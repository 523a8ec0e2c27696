pub mod cached_client;
pub mod client;

pub use cached_client::CachedClient;
pub use client::{ApiGateway, HttpGateway};
