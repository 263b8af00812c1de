//! Client-side query cache with optimistic-update support.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Keys fetched collections by resource + canonical parameters
//! - Lets mutations patch cached collections in place and roll them back
//! - Marks resources stale on invalidation (stale-while-revalidate)
//! - Provides basic offline mode (serve cached data when the network fails)

mod invalidation;
mod key;
mod layer;
mod store;
mod traits;

pub use invalidation::{Invalidation, InvalidationBus};
pub use key::{ParamValue, QueryKey, QueryParams, Resource};
pub use layer::CacheLayer;
pub use store::{CacheEntry, CollectionResult, QueryCache, Snapshot};
pub use traits::{CacheResult, CacheSource, Cacheable};
