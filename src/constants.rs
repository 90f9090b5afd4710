//! Constants for the pod supervisor.
//!
//! All channel depths, timeouts, and host-tool figures are defined here
//! to ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Channel Depths
// =============================================================================

/// Depth of the controller event bus.
///
/// Producers block when the bus is full; sends to a closed bus are
/// silently discarded.
pub const EVENT_BUS_DEPTH: usize = 128;

/// Depth of the guest-agent TTY outbound channel.
pub const TTY_OUTBOUND_DEPTH: usize = 256;

/// Depth of the QMP session queue.
pub const QMP_SESSION_DEPTH: usize = 32;

/// Depth of the guest-agent command queue.
pub const AGENT_OUTBOUND_DEPTH: usize = 32;

// =============================================================================
// Timeouts & Retries
// =============================================================================

/// Grace period between sending `SHUTDOWN` to the guest agent and
/// escalating to a QMP `quit`.
pub const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(3);

/// Attempts when connecting to a socket QEMU creates asynchronously.
pub const SOCKET_CONNECT_ATTEMPTS: usize = 5;

/// Delay between socket connect attempts.
pub const SOCKET_CONNECT_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// Volumes
// =============================================================================

/// Size of a freshly allocated thin data volume (10 GiB).
pub const DEFAULT_VOLUME_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Sector size used for dmsetup table arithmetic.
pub const SECTOR_SIZE: u64 = 512;

/// Thin-allocation figure in the dmsetup table.
pub const THIN_CHUNK_SECTORS: u64 = 100;

/// Length of the random alphabetic subpath used for bind-mounted volumes.
pub const VOLUME_MOUNT_SUFFIX_LEN: usize = 10;

/// Base directory for host-backed volume directories.
pub const HOST_VOLUME_DIR: &str = "/var/tmp/vmpod";

// =============================================================================
// Terminals
// =============================================================================

/// Sentinel input byte (Ctrl-]) that detaches a terminal subscriber
/// without closing the underlying stream.
pub const EXIT_CHAR: u8 = 0x1d;

// =============================================================================
// Paths
// =============================================================================

/// Base runtime directory for per-VM sockets and shared directories.
pub const RUN_BASE_DIR: &str = "/var/run/vmpod";

/// 9p mount tag under which the guest sees the shared directory.
pub const SHARE_DIR_TAG: &str = "share_dir";
