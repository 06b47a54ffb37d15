//! Client-side data synchronization and caching.
//!
//! Queries are keyed by structural [`QueryKey`]s. Concurrent fetches for the
//! same key are coalesced, fetched data ages according to its stale time,
//! unobserved queries are evicted after their cache time, and settled data
//! can be persisted and restored across restarts.
//!
//! ```ignore
//! let client: QueryClient<Vec<Todo>, ApiError> = QueryClient::new();
//! let todos = client
//!   .fetch_query(client.query_options(query_key!["todos"]).query_fn(|_| api.todos()))
//!   .await?;
//! client
//!   .invalidate_queries(QueryFilters::key(query_key!["todos"]), RefetchMode::Active)
//!   .await;
//! ```

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod infinite;
pub mod key;
pub mod logging;
pub mod mutation;
pub mod observer;
pub mod options;
pub mod persist;
pub mod query;
pub mod retry;
pub mod state;
pub mod store;
pub mod subscription;

pub use cache::{QueryCache, QueryCacheEvent, QueryFilters, RefetchMode};
pub use cancel::CancellationToken;
pub use client::{QueryClient, QueryClientBuilder};
pub use config::QueryClientConfig;
pub use error::{QueryError, QueryResult};
pub use infinite::{InfiniteData, InfiniteQuery, InfiniteQueryOptions, InfiniteQueryState};
pub use key::{KeyPart, QueryKey};
pub use mutation::{Mutation, MutationCache, MutationOptions, MutationState, MutationStatus};
pub use observer::{QueryObserver, QueryObserverResult};
pub use options::{query_fn, CacheTime, QueryFn, QueryFnContext, QueryOptions, StaleTime};
pub use persist::{InMemoryPersister, PersistOptions, PersistedQuery, PersistenceManager, Persister, SqlitePersister};
pub use query::Query;
pub use retry::{Retry, RetryDelay};
pub use state::{FetchStatus, QueryState, QueryStatus};
pub use store::QueryStore;
pub use subscription::Subscription;

/// Bound shared by payloads, errors, variables and page params.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}
