//! Background jobs for the htmlshot API.
//!
//! - [`snapshot_feed`]: keeps the auth replica in sync with the origin
//!
//! Cache sweepers live in `htmlshot-storage` and are spawned from `main`.

pub mod snapshot_feed;

pub use snapshot_feed::{spawn_snapshot_feed, SnapshotFeedConfig};
