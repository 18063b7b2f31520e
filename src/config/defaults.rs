//! Default constants for unicontact configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default HTTP listen port, bound on loopback
pub const DEFAULT_LISTEN_PORT: u16 = 3000;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default number of contacts kept in the persistent store's read cache
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Identify Defaults
// =============================================================================

/// Deadline for one identify request, covering every store round trip and
/// every identity lock wait.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// How many times cluster locks are re-validated before giving up when
/// concurrent merges keep moving the candidate clusters.
pub const DEFAULT_MAX_LOCK_RETRIES: usize = 8;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "UNICONTACT_";
