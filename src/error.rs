//! Error types for iSCSI volume operations

use std::path::{Path, PathBuf};
use thiserror::Error;

/// iSCSI volume errors
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The attach tool is not installed on this host. Plugins decline the
    /// volume instead of failing the workload.
    #[error("Unsupported environment: {tool} not found")]
    UnsupportedEnvironment { tool: String },

    #[error("Attach error for {iqn} at {portal}: {reason}")]
    Attach {
        portal: String,
        iqn: String,
        reason: String,
    },

    #[error("Mount error during {operation} at {}: {reason}", .path.display())]
    Mount {
        operation: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("Probe error reading mounts for {}: {reason}", .path.display())]
    Probe { path: PathBuf, reason: String },

    #[error("Detach error for {iqn} at {portal}: {reason}")]
    Detach {
        portal: String,
        iqn: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl VolumeError {
    pub(crate) fn mount(operation: &'static str, path: &Path, reason: impl ToString) -> Self {
        VolumeError::Mount {
            operation,
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn probe(path: &Path, reason: impl ToString) -> Self {
        VolumeError::Probe {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Whether the orchestration layer above may retry the failed call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VolumeError::Attach { .. }
                | VolumeError::Detach { .. }
                | VolumeError::Mount { .. }
                | VolumeError::Probe { .. }
                | VolumeError::Io(_)
        )
    }
}

/// Result type for volume operations
pub type VolumeResult<T> = Result<T, VolumeError>;

/// open-iscsi exit statuses the disk manager reacts to
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const SESSION_NOT_FOUND: i32 = 2;
    pub const TRANSPORT: i32 = 4;
    pub const LOGIN: i32 = 5;
    pub const TRANSPORT_TIMEOUT: i32 = 8;
    pub const ACCESS: i32 = 13;
    pub const SESSION_EXISTS: i32 = 15;
    pub const NO_OBJECTS_FOUND: i32 = 21;
    pub const LOGIN_AUTH_FAILED: i32 = 24;
}

/// Decode an iscsiadm exit status into an actionable message
pub fn decode_iscsiadm_exit(code: i32) -> &'static str {
    match code {
        0 => "Command completed successfully",
        1 => "Generic iscsiadm failure - check iscsid logs",
        2 => "Session not found - the target is not logged in",
        3 => "iscsiadm ran out of memory",
        4 => "Transport error - check the portal address and network reachability",
        5 => "Login failed - the target rejected the session",
        6 => "Node database error - inspect /etc/iscsi/nodes",
        7 => "Invalid argument passed to iscsiadm",
        8 => "Connection timed out - the portal did not answer",
        9 => "Internal iscsiadm error",
        10 => "Logout failed",
        11 => "PDU timed out - the target stopped responding",
        12 => "Transport module not found - load iscsi_tcp",
        13 => "Permission denied - iscsiadm must run as root",
        14 => "Transport does not support the requested operation",
        15 => "Session already exists - the target is already logged in",
        16 => "Invalid management request",
        17 => "iSNS service unavailable",
        18 => "Could not communicate with iscsid - is the daemon running?",
        19 => "Fatal login error - the target will not accept this initiator",
        20 => "iscsid is not connected",
        21 => "No records found - the target has no node entry or session",
        22 => "sysfs lookup failed",
        23 => "Host not found",
        24 => "Authentication failed - check CHAP username and password",
        25 => "iSNS query failed",
        26 => "iSNS registration failed",
        _ => "Unknown iscsiadm exit status",
    }
}
