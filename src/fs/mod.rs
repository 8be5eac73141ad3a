//! File-system related code.
//!
//! Holds the XFS on-disk decoding layer and the deleted-inode recovery
//! pipeline built on top of it. Everything in here is read-only against the
//! device: the recovery walk never mutates the image.

use crate::errors::RecoveryError;

pub mod xfs;

pub type IOResult<T> = Result<T, RecoveryError>;
