//! Default values shared by the manager and its configuration.
//!
//! Most of these are defaults that [`crate::Config`] can override.

/// First id handed out to server-accepted connections.
///
/// Controller-assigned ids are expected to stay well below this value.
/// The allocator additionally skips any id that is currently in use.
pub const ACCEPT_ID_SEED: u32 = 5000;

/// Read buffer size per connected socket (64KB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a single outbound connect attempt, in milliseconds.
pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// How long a graceful close may spend flushing queued writes before the
/// socket is torn down, in milliseconds.
pub const CLOSE_TIMEOUT_MS: u64 = 5_000;

/// Host used by `connect` when the controller passes none.
pub const DEFAULT_CONNECT_HOST: &str = "localhost";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "SOCKMUX_";
