//! Inode-related structures.
//!
//! Only the fixed-size leading portion of an inode slot (the "core") is
//! decoded; the remainder of the slot holds the inline data fork, which for
//! recovery purposes is an array of packed extent records.
//!
//! A deleted inode keeps its magic, version, timestamps and inode number,
//! while the mode, link count and size are zeroed. That combination is the
//! signature [`InodeCore::validate`] looks for: anything else is a live
//! inode, an unused slot, or debris not worth chasing.

use core::fmt::{self, Display, Formatter};
use core::mem;

use bytemuck::{Pod, Zeroable};

use crate::dev::DeviceError;
use crate::errors::RecoveryError;

/// Inode core magic, "IN".
pub(crate) const XFS_DINODE_MAGIC: u16 = 0x494e;

/// Data-fork format value for an inline packed extent array.
pub(crate) const XFS_DINODE_FMT_EXTENTS: u8 = 2;

/// Inode version written by v5 filesystems.
const XFS_DINODE_VERSION_3: u8 = 3;

/// Size of the v3 inode core, in bytes.
pub(crate) const INODE_CORE_LEN: usize = mem::size_of::<InodeCore>();

/// On-disk timestamp: big-endian seconds and nanoseconds.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskTimestamp {
    t_sec: u32,
    t_nsec: u32,
}

impl DiskTimestamp {
    fn decode(&self) -> Timestamp {
        Timestamp {
            secs: i32::from_be(self.t_sec as i32),
            nanos: u32::from_be(self.t_nsec),
        }
    }
}

/// A decoded inode timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: i32,
    /// Nanosecond remainder.
    pub nanos: u32,
}

/// The four timestamps a deleted inode still carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MacTimes {
    /// Last content modification (mtime).
    pub modified: Timestamp,
    /// Last access (atime).
    pub accessed: Timestamp,
    /// Last inode change (ctime); on deletion this is the deletion time.
    pub changed: Timestamp,
    /// Creation time (crtime), v3 inodes only.
    pub created: Timestamp,
}

/// On-disk inode core (v3 layout, 176 bytes).
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct InodeCore {
    pub(crate) di_magic: u16,
    pub(crate) di_mode: u16,
    pub(crate) di_version: u8,
    pub(crate) di_format: u8,
    pub(crate) di_onlink: u16,
    pub(crate) di_uid: u32,
    pub(crate) di_gid: u32,
    pub(crate) di_nlink: u32,
    pub(crate) di_projid_lo: u16,
    pub(crate) di_projid_hi: u16,
    pub(crate) di_pad: [u8; 6],
    pub(crate) di_flushiter: u16,
    pub(crate) di_atime: DiskTimestamp,
    pub(crate) di_mtime: DiskTimestamp,
    pub(crate) di_ctime: DiskTimestamp,
    pub(crate) di_size: u64,
    pub(crate) di_nblocks: u64,
    pub(crate) di_extsize: u32,
    pub(crate) di_nextents: u32,
    pub(crate) di_anextents: u16,
    pub(crate) di_forkoff: u8,
    pub(crate) di_aformat: u8,
    pub(crate) di_dmevmask: u32,
    pub(crate) di_dmstate: u16,
    pub(crate) di_flags: u16,
    pub(crate) di_gen: u32,
    pub(crate) di_next_unlinked: u32,
    pub(crate) di_crc: u32,
    pub(crate) di_changecount: u64,
    pub(crate) di_lsn: u64,
    pub(crate) di_flags2: u64,
    pub(crate) di_cowextsize: u32,
    pub(crate) di_pad2: [u8; 12],
    pub(crate) di_crtime: DiskTimestamp,
    pub(crate) di_ino: u64,
    pub(crate) di_uuid: [u8; 16],
}

impl InodeCore {
    /// Checks the recoverable-deleted signature.
    ///
    /// # Errors
    ///
    /// Returns the first disqualifying property; the caller skips the slot.
    pub(crate) fn validate(&self) -> Result<(), SkipReason> {
        if u16::from_be(self.di_magic) != XFS_DINODE_MAGIC {
            return Err(SkipReason::BadMagic);
        }
        if u16::from_be(self.di_mode) != 0 {
            return Err(SkipReason::NonZeroMode);
        }
        if self.di_version != XFS_DINODE_VERSION_3 {
            return Err(SkipReason::UnsupportedVersion(self.di_version));
        }
        if self.di_format != XFS_DINODE_FMT_EXTENTS {
            return Err(SkipReason::NotExtentsFormat(self.di_format));
        }
        if u32::from_be(self.di_nlink) != 0 {
            return Err(SkipReason::StillLinked);
        }

        Ok(())
    }

    /// Inode number recorded in the core. Survives deletion on v3 inodes.
    pub(crate) fn ino(&self) -> u64 {
        u64::from_be(self.di_ino)
    }

    pub(crate) fn mac_times(&self) -> MacTimes {
        MacTimes {
            modified: self.di_mtime.decode(),
            accessed: self.di_atime.decode(),
            changed: self.di_ctime.decode(),
            created: self.di_crtime.decode(),
        }
    }
}

/// Inode B+tree record: one chunk of 64 consecutive inode slots.
///
/// `ir_u` holds a 4-byte free count in the full record format, or a hole
/// mask, an inode count and a 1-byte free count in the sparse format. Only
/// the hole mask is consumed here, and only when SPINODES is active.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct InobtRec {
    pub(crate) ir_startino: u32,
    pub(crate) ir_u: [u8; 4],
    pub(crate) ir_free: u64,
}

impl InobtRec {
    /// First AG-relative inode number of the chunk.
    pub(crate) fn startino(&self) -> u32 {
        u32::from_be(self.ir_startino)
    }

    /// Free-slot bitmap; bit k set means slot k is free.
    pub(crate) fn free_mask(&self) -> u64 {
        u64::from_be(self.ir_free)
    }

    /// Sparse-format hole mask; bit k covers 4 consecutive slots that do
    /// not physically exist.
    pub(crate) fn hole_mask(&self) -> u16 {
        u16::from_be_bytes([self.ir_u[0], self.ir_u[1]])
    }
}

/// Why a candidate inode slot was passed over.
///
/// Local bookkeeping for best-effort recovery: logged at trace level,
/// never surfaced to the consumer.
#[derive(Debug)]
pub(crate) enum SkipReason {
    BadMagic,
    NonZeroMode,
    UnsupportedVersion(u8),
    NotExtentsFormat(u8),
    StillLinked,
    NoValidExtents,
    NoLeadingExtent,
    Device(DeviceError),
    FreeSpaceWalk(RecoveryError),
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BadMagic => f.write_str("bad magic"),
            SkipReason::NonZeroMode => f.write_str("non-zero mode"),
            SkipReason::UnsupportedVersion(v) => {
                f.write_fmt(format_args!("version {v} is not 3"))
            }
            SkipReason::NotExtentsFormat(code) => {
                f.write_fmt(format_args!("format {code} is not EXTENTS"))
            }
            SkipReason::StillLinked => f.write_str("non-zero nlink"),
            SkipReason::NoValidExtents => f.write_str("no recoverable extents"),
            SkipReason::NoLeadingExtent => f.write_str("no extent at file offset 0"),
            SkipReason::Device(err) => f.write_fmt(format_args!("device read failed: {err}")),
            SkipReason::FreeSpaceWalk(err) => {
                f.write_fmt(format_args!("free-space walk failed: {err}"))
            }
        }
    }
}

impl From<DeviceError> for SkipReason {
    fn from(err: DeviceError) -> Self {
        SkipReason::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted_core() -> InodeCore {
        let mut core = InodeCore::zeroed();
        core.di_magic = XFS_DINODE_MAGIC.to_be();
        core.di_version = XFS_DINODE_VERSION_3;
        core.di_format = XFS_DINODE_FMT_EXTENTS;
        core.di_ino = 64u64.to_be();
        core
    }

    #[test]
    fn core_layout_matches_the_on_disk_size() {
        assert_eq!(INODE_CORE_LEN, 176);
    }

    #[test]
    fn a_deleted_core_validates() {
        assert!(deleted_core().validate().is_ok());
    }

    #[test]
    fn live_or_garbage_cores_are_rejected() {
        let mut bad_magic = deleted_core();
        bad_magic.di_magic = 0;
        assert!(matches!(bad_magic.validate(), Err(SkipReason::BadMagic)));

        let mut live = deleted_core();
        live.di_mode = 0o100644u16.to_be();
        assert!(matches!(live.validate(), Err(SkipReason::NonZeroMode)));

        let mut v2 = deleted_core();
        v2.di_version = 2;
        assert!(matches!(
            v2.validate(),
            Err(SkipReason::UnsupportedVersion(2))
        ));

        let mut local_fmt = deleted_core();
        local_fmt.di_format = 1;
        assert!(matches!(
            local_fmt.validate(),
            Err(SkipReason::NotExtentsFormat(1))
        ));

        let mut linked = deleted_core();
        linked.di_nlink = 1u32.to_be();
        assert!(matches!(linked.validate(), Err(SkipReason::StillLinked)));
    }

    #[test]
    fn timestamps_decode_from_big_endian() {
        let mut core = deleted_core();
        core.di_mtime = DiskTimestamp {
            t_sec: 1_700_000_000u32.to_be(),
            t_nsec: 42u32.to_be(),
        };
        core.di_crtime = DiskTimestamp {
            t_sec: 1_600_000_000u32.to_be(),
            t_nsec: 7u32.to_be(),
        };

        let times = core.mac_times();
        assert_eq!(times.modified.secs, 1_700_000_000);
        assert_eq!(times.modified.nanos, 42);
        assert_eq!(times.created.secs, 1_600_000_000);
        assert_eq!(times.created.nanos, 7);
        assert_eq!(times.accessed, Timestamp::default());
    }

    #[test]
    fn inobt_record_masks_decode() {
        let rec = InobtRec {
            ir_startino: 64u32.to_be(),
            ir_u: [0x00, 0x03, 64, 2],
            ir_free: 0x8000_0000_0000_0001u64.to_be(),
        };

        assert_eq!(rec.startino(), 64);
        assert_eq!(rec.hole_mask(), 0x0003);
        assert_eq!(rec.free_mask(), 0x8000_0000_0000_0001);
    }
}
