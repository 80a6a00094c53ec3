//! Durable execution memory across pools.
//!
//! - `store`: MemoryStore contract and record schema
//! - `libsql_store`: libSQL implementation with migrations
//! - `relevance`: lexical scoring shared by store and live overlay
//! - `aggregator`: periodic sync and cross-pool search

pub mod aggregator;
pub mod libsql_store;
pub mod migrations;
pub mod relevance;
pub mod store;

pub use aggregator::{MemoryAggregator, SyncFailure, SyncHandle, SyncStats};
pub use libsql_store::LibSqlMemoryStore;
pub use store::{HitSource, MemoryRecord, MemoryStore, SearchFilters, SearchHit, StoreAck};
