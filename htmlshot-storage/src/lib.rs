//! htmlshot Storage - Image Cache and Auth Replica
//!
//! Two process-local stores sit in front of the render pipeline:
//!
//! - [`cache`]: a content-addressed memory + disk image cache
//! - [`replica`]: an LMDB copy of API key and quota facts pushed by the
//!   origin service
//!
//! Both are plain owned structs. The binary constructs them once and hands
//! `Arc`s to request handlers and background jobs.

pub mod cache;
pub mod replica;

pub use cache::{
    spawn_sweepers, CacheEntry, CacheStats, CacheTier, DiskCacheError, DiskTier, InsertOutcome,
    MemoryTier, SweepConfig, TieredCache,
};
pub use replica::{AuthDenial, AuthReplica, Authorized, ReplicaError, ReplicaStatus};
