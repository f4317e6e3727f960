//! Network interception layer.
//!
//! Every outbound request is classified and served by a per-class caching
//! strategy. The layer runs as its own task; the foreground reaches it only
//! through an [`InterceptorHandle`].

mod cache;
mod classify;
mod policy;
mod worker;

pub use cache::{tile_generation, CacheBucket, CachedResponse, ResponseCache};
pub use classify::{Classifier, ResourceClass};
pub use policy::{CachePolicy, ResponseSource, Served};
pub use worker::{InterceptorHandle, InterceptorWorker};
