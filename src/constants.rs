//! # Orchestrator Constants
//!
//! Directory layout, timing defaults, error codes and resource bounds for
//! the native unit orchestrator. Configuration may override the timing
//! values; everything else is fixed.
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Uses the timing values as serde defaults
//! - [`crate::artifact`]: Uses the size limits during download and extraction
//! - [`crate::supervisor`]: Uses the grace periods for PID recovery and escalation
//! - [`crate::dispatch`]: Uses the back-off values and error codes

use std::time::Duration;

// =============================================================================
// Filesystem Layout
// =============================================================================
//
//   <base>/apps/<definition>/            staged artifact (shared by siblings)
//   <base>/apps/<definition>/<name>/     instance directory
//   <base>/apps/<instance>.pid           store-level PID file
//   <base>/logs/native_<instance>.log    combined stdout/stderr
// =============================================================================

/// Directory (under the base dir) holding staged definitions.
pub const APPS_DIR: &str = "apps";

/// Directory (under the base dir) holding instance logs.
pub const LOGS_DIR: &str = "logs";

/// Prefix of every instance log file name.
pub const LOG_FILE_PREFIX: &str = "native_";

/// Suffix appended to the instance id to form the launcher script name.
pub const SCRIPT_SUFFIX: &str = "_run";

/// Extension of PID files.
pub const PID_FILE_EXT: &str = "pid";

/// Default base directory when none is configured.
pub const DEFAULT_BASE_DIR: &str = "/var/lib/magiknative";

/// Default node configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/magiknative/config.yaml";

// =============================================================================
// Timing
// =============================================================================

/// Wait between spawning a launcher script and reading back its PID file.
pub const PID_FILE_GRACE: Duration = Duration::from_secs(1);

/// Wait between the group interrupt and the direct interrupt.
pub const INTERRUPT_SETTLE: Duration = Duration::from_millis(100);

/// Wait between the last interrupt and the kill.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(3);

/// Back-off before removing the remote record after a not-found failure.
pub const NOT_FOUND_BACKOFF: Duration = Duration::from_secs(10);

/// Back-off before republishing status after a generic failure.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound for a single artifact download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Error Codes
// =============================================================================

/// Instance already defined.
pub const ERROR_CODE_DUPLICATE: i32 = 0;

/// Operation not supported by the native plugin.
pub const ERROR_CODE_UNSUPPORTED: i32 = 7;

/// Instance unknown while handling a notification.
pub const ERROR_CODE_NOT_FOUND: i32 = 9;

/// Any other failure.
pub const ERROR_CODE_GENERIC: i32 = 10;

// =============================================================================
// Resource Bounds
// =============================================================================

/// Maximum size of a downloaded or copied artifact (1 GiB).
///
/// **Attack Vector**: a hostile server streaming an unbounded body.
pub const MAX_ARTIFACT_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum total extracted size of an artifact (4 GiB).
///
/// **Attack Vector**: compression bombs.
pub const MAX_EXTRACTED_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of live instances on one node.
pub const MAX_INSTANCES: usize = 1024;

/// Maximum length of a Linux interface name (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Exit code offset for processes killed by a signal.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;
