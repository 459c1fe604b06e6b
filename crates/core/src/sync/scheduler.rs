//! Scheduler constants for the background sync loop.

/// Foreground sync cadence in seconds.
pub const SYNC_FOREGROUND_INTERVAL_SECS: u64 = 45;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Fast-path delay (milliseconds) when pending outbox events exist.
pub const SYNC_PENDING_FAST_DELAY_MS: u64 = 2_000;

/// Retention window for acknowledged outbox events before purge, in hours.
pub const ACKNOWLEDGED_RETENTION_HOURS: i64 = 168;
