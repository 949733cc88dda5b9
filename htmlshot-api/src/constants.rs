//! Constants for the htmlshot API
//!
//! Defaults for every tunable the service reads from the environment.

// ============================================================================
// SIGNING
// ============================================================================

/// Minimum signing secret length outside development
pub const MIN_SIGNING_SECRET_LENGTH: usize = 32;

/// Default lifetime of a minted URL (7 days)
pub const DEFAULT_URL_TTL_SECS: u64 = 7 * 24 * 3600;

/// Longest lifetime a caller may request (365 days)
pub const MAX_URL_TTL_SECS: u64 = 365 * 24 * 3600;

// ============================================================================
// HTTP
// ============================================================================

/// `Cache-Control` for every image response. Content is addressed by hash,
/// so it never changes.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Header reporting whether the bytes came from the cache (`0` or `1`)
pub const RENDER_CACHED_HEADER: &str = "x-render-cached";

/// Upper bound on a mint request, end to end
pub const DEFAULT_MINT_TIMEOUT_SECS: u64 = 10;

/// Requests in flight across the whole router
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Development server URL
pub const DEV_PUBLIC_URL: &str = "http://localhost:3000";

// ============================================================================
// RENDERING
// ============================================================================

pub const DEFAULT_COMPOSITOR_COMMAND: &str = "htmlshot-compositor";

pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_MAX_CONCURRENT_RENDERS: usize = 4;

/// Largest width or height accepted for an image
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;

// ============================================================================
// CACHE
// ============================================================================

pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 500;

pub const DEFAULT_MEMORY_CACHE_TTL_SECS: u64 = 3600;

/// Disk entries never expire unless configured
pub const DEFAULT_DISK_CACHE_TTL_SECS: u64 = 0;

pub const DEFAULT_DISK_CACHE_DIR: &str = "./.cache/images";

pub const DEFAULT_MEMORY_SWEEP_SECS: u64 = 60;

pub const DEFAULT_DISK_SWEEP_SECS: u64 = 3600;

// ============================================================================
// REPLICA
// ============================================================================

pub const DEFAULT_REPLICA_PATH: &str = "./.data/replica";

pub const DEFAULT_REPLICA_MAP_SIZE_MB: usize = 64;

pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;

pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

pub const DEFAULT_RECONNECT_MULTIPLIER: f64 = 2.0;

pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 250;

// ============================================================================
// ORIGIN
// ============================================================================

pub const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 5;
