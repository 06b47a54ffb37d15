//! One-shot write operations.
//!
//! A [`Mutation`] runs its function through the same retry loop as queries
//! and calls `on_mutate`, `on_success`, `on_error` and `on_settled` around
//! it, which is enough to build optimistic updates with rollback on top of
//! the query cache. The [`MutationCache`] keeps every mutation it built.

mod cache;
#[allow(clippy::module_inception)]
mod mutation;

pub use cache::{MutationCache, MutationCacheEvent, MutationFilters};
pub use mutation::{Mutation, MutationEntry, MutationFn, MutationOptions, MutationState, MutationStatus};
