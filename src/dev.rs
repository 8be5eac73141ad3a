//! Device access primitives.
//!
//! The recovery pipeline never touches a file descriptor directly: it is
//! written against [`BlockDevice`], a positioned-read capability injected by
//! the caller. Exactness is part of the contract: a read either fills the
//! whole buffer or fails, so callers never have to reason about short reads.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io;

/// Errors raised by a [`BlockDevice`] implementation.
///
/// Running off the end of the device is reported separately from a failing
/// read primitive, so the walker can tell a truncated image from a bad disk.
#[derive(Debug)]
pub enum DeviceError {
    /// The requested range lies (partly) beyond the end of the device.
    OutOfBounds {
        /// Absolute byte offset of the rejected read.
        offset: u64,
        /// Length of the rejected read, in bytes.
        len: usize,
    },

    /// The underlying read primitive failed.
    Io(io::Error),
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfBounds { offset, len } => f.write_fmt(format_args!(
                "read of {len} bytes at offset {offset:#x} is beyond the end of the device"
            )),
            DeviceError::Io(err) => f.write_fmt(format_args!("device read failed: {err}")),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Io(err) => Some(err),
            DeviceError::OutOfBounds { .. } => None,
        }
    }
}

/// A read-only device addressed by absolute byte offset.
///
/// Implementations must tolerate concurrent positional reads from distinct
/// callers; `read_at` takes `&self` and implies no ordering.
pub trait BlockDevice {
    /// Reads exactly `buf.len()` bytes starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the range cannot be filled completely; partial reads are
    /// errors for every caller in this crate.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        (**self).read_at(offset, buf)
    }
}

#[cfg(unix)]
impl BlockDevice for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        use std::os::unix::fs::FileExt;

        self.read_exact_at(buf, offset).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                DeviceError::OutOfBounds {
                    offset,
                    len: buf.len(),
                }
            } else {
                DeviceError::Io(err)
            }
        })
    }
}

impl BlockDevice for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let oob = DeviceError::OutOfBounds {
            offset,
            len: buf.len(),
        };

        let start = match usize::try_from(offset) {
            Ok(start) => start,
            Err(_) => return Err(oob),
        };
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.get(start..end))
            .ok_or(oob)?;

        buf.copy_from_slice(src);
        Ok(())
    }
}

impl BlockDevice for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.as_slice().read_at(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_read_within_bounds() {
        let data = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let mut buf = [0u8; 3];

        data.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4]);
    }

    #[test]
    fn slice_read_past_the_end_is_rejected() {
        let data = [0u8; 8];
        let mut buf = [0u8; 4];

        let err = data.read_at(6, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfBounds { offset: 6, len: 4 }
        ));
    }

    #[test]
    fn reference_forwarding() {
        let data = vec![9u8; 16];
        let by_ref: &Vec<u8> = &data;
        let mut buf = [0u8; 2];

        by_ref.read_at(14, &mut buf).unwrap();
        assert_eq!(buf, [9, 9]);
    }
}
