//! Error types shared across the recovery pipeline.

use std::fmt::{self, Display, Formatter};

use crate::dev::DeviceError;

/// Errors that abort an operation against the filesystem image.
///
/// Per-inode failures are deliberately absent: a candidate inode that cannot
/// be recovered is skipped, not reported. Only problems with the device or
/// with filesystem-level metadata surface here.
#[derive(Debug)]
pub enum RecoveryError {
    /// The device reader failed underneath a metadata or content read.
    Device(DeviceError),

    /// An on-disk structure did not match its expected layout.
    Validation {
        /// Which structure failed (superblock, agf, agi, btree block, ...).
        component: &'static str,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A content read request did not intersect any recovered extent.
    UnrecoveredRange,
}

impl RecoveryError {
    pub(crate) fn validation(component: &'static str, reason: &'static str) -> Self {
        RecoveryError::Validation { component, reason }
    }
}

impl Display for RecoveryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::Device(err) => Display::fmt(err, f),
            RecoveryError::Validation { component, reason } => {
                f.write_fmt(format_args!("invalid {component}: {reason}"))
            }
            RecoveryError::UnrecoveredRange => {
                f.write_str("requested range does not overlap any recovered extent")
            }
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecoveryError::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DeviceError> for RecoveryError {
    fn from(err: DeviceError) -> Self {
        RecoveryError::Device(err)
    }
}
