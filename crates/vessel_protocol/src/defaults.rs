//! Canonical default values shared across host and worker.

/// Hard ceiling on concurrently live processes.
pub const DEFAULT_MAX_PROCESSES: usize = 10;

/// Soft memory hint for the worker domain, in bytes (512 MiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

/// Budget for a correlated host -> worker request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Budget for an in-sandbox HTTP handler to call `end`.
pub const HTTP_BRIDGE_TIMEOUT_MS: u64 = 30_000;

/// Advisory high-water mark for simulated socket writes (16 KiB).
pub const SOCKET_HIGH_WATER_MARK: usize = 16 * 1024;

/// Retention window for the rolling request log.
pub const REQUEST_LOG_WINDOW_SECS: u64 = 5 * 60;

/// Window for the requests-per-minute aggregate.
pub const REQUEST_RATE_WINDOW_SECS: u64 = 60;

/// Cadence of request-log pruning inside the worker.
pub const REQUEST_LOG_CLEANUP_SECS: u64 = 60;

/// Exit code recorded for terminated processes.
pub const EXIT_CODE_TERMINATED: i32 = -1;
