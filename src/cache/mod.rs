//! The query registry.
//!
//! A [`QueryCache`] maps canonical key hashes to shared queries, creates
//! them on first use, drops them when their retention window runs out and
//! publishes every change as a [`QueryCacheEvent`].

mod events;
mod filters;
mod query_cache;

pub use events::QueryCacheEvent;
pub use filters::{QueryFilters, RefetchMode};
pub use query_cache::{QueryCache, DEFAULT_EVENT_CAPACITY};
