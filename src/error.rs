//! Error types for the pod supervisor.

use std::time::Duration;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising a pod VM.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Context Errors
    // =========================================================================
    /// VM context could not be constructed (sockets, directories).
    #[error("vm context init failed: {0}")]
    ContextInit(String),

    /// Pod spec failed validation.
    #[error("invalid pod spec: {0}")]
    InvalidSpec(String),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    /// Container rootfs provisioning failed.
    #[error("image provisioning failed for container {index}: {reason}")]
    ImageProvision { index: usize, reason: String },

    /// Volume provisioning failed.
    #[error("volume '{volume}' provisioning failed: {reason}")]
    VolumeProvision { volume: String, reason: String },

    /// Network interface allocation failed.
    #[error("network interface {index} creation fail")]
    NicProvision { index: usize },

    /// Serial port attach failed.
    #[error("serial port {index} provisioning failed: {reason}")]
    SerialProvision { index: usize, reason: String },

    // =========================================================================
    // Channel Errors
    // =========================================================================
    /// Guest-agent wire protocol violation.
    #[error("agent protocol error: {0}")]
    AgentProtocol(String),

    /// QMP command or socket failure.
    #[error("qmp error: {0}")]
    Qmp(String),

    /// The hypervisor process exited unexpectedly.
    #[error("hypervisor exit: {0}")]
    HypervisorExit(String),

    // =========================================================================
    // Terminal Errors
    // =========================================================================
    /// A subscriber id is already attached to this terminal.
    #[error("attach id {0} already attached to this tty")]
    DuplicateAttach(u64),

    /// Named container does not exist in the pod.
    #[error("unknown container: {0}")]
    UnknownContainer(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// JSON serialization or parsing failed.
    #[error("json error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
