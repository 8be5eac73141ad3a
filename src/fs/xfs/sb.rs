//! XFS superblock related structures.
//!
//! The superblock occupies the first sector of the device (each allocation
//! group carries a backup copy, only the primary is read here). It fixes the
//! geometry everything else depends on: block size, allocation-group size
//! and count, inode size, and the feature bits that change how the rest of
//! the metadata has to be interpreted.

use bytemuck::{Pod, Zeroable};
use log::info;

use crate::dev::BlockDevice;
use crate::errors::RecoveryError;
use crate::fs::xfs::read_pod;
use crate::fs::IOResult;

/// Superblock magic, "XFSB".
pub(crate) const XFS_SB_MAGIC: u32 = 0x5846_5342;

/// Mask of the version-family bits in `sb_versionnum`.
const XFS_SB_VERSION_NUMBITS: u16 = 0x000f;

/// Defines a standard structure for the superblock's feature-flag words.
macro_rules! xfs_flag_field {
    ($struct_name:ident, $size:ty, $desc:literal) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        #[repr(transparent)]
        #[doc = $desc]
        pub struct $struct_name(pub(crate) $size);

        impl $struct_name {
            /// Checks if this set carries the given flag.
            pub fn contains(self, flag: Self) -> bool {
                self.0 & flag.0 != 0
            }
        }
    };
}

xfs_flag_field!(
    VersionFlags,
    u16,
    "Feature bits stored in the high bits of `sb_versionnum`, next to the \
version family itself."
);

impl VersionFlags {
    /// Extended attributes have been used.
    pub const ATTR: Self = Self(0x0010);

    /// Inodes carry 32-bit link counts.
    pub const NLINK: Self = Self(0x0020);

    /// Quotas are enabled on the filesystem.
    pub const QUOTA: Self = Self(0x0040);

    /// Inode chunk alignment is in use.
    pub const ALIGN: Self = Self(0x0080);

    /// Stripe-aligned data allocation.
    pub const DALIGN: Self = Self(0x0100);

    /// Filesystem was shared between hosts (obsolete).
    pub const SHARED: Self = Self(0x0200);

    /// Version 2 journaling log.
    pub const LOGV2: Self = Self(0x0400);

    /// `sb_sectsize` is not 512 bytes.
    pub const SECTOR: Self = Self(0x0800);

    /// Unwritten extents are tracked (always set on modern images).
    pub const EXTFLG: Self = Self(0x1000);

    /// Version 2 directories.
    pub const DIRV2: Self = Self(0x2000);

    /// ASCII-only case-insensitive names.
    pub const BORG: Self = Self(0x4000);

    /// `sb_features2` holds more feature bits.
    pub const MOREBITS: Self = Self(0x8000);
}

xfs_flag_field!(
    Features2,
    u32,
    "Additional feature bits, valid when `VersionFlags::MOREBITS` is set."
);

impl Features2 {
    /// Lazy global counters; the AG headers are authoritative.
    pub const LAZYSBCOUNT: Self = Self(0x0000_0002);

    /// Reworked inline extended attributes.
    pub const ATTR2: Self = Self(0x0000_0008);

    /// Parent pointers.
    pub const PARENT: Self = Self(0x0000_0010);

    /// 32-bit project identifiers.
    pub const PROJID32: Self = Self(0x0000_0080);

    /// Metadata checksumming (always set on v5).
    pub const CRC: Self = Self(0x0000_0100);

    /// Directory entries carry the file type.
    pub const FTYPE: Self = Self(0x0000_0200);
}

xfs_flag_field!(
    RoCompatFeatures,
    u32,
    "Read-only compatible feature set: unknown bits still allow mounting \
read-only, which is all a recovery pass needs."
);

impl RoCompatFeatures {
    /// Free inode B+tree is present in each AG.
    pub const FINOBT: Self = Self(1 << 0);

    /// Reverse-mapping B+tree.
    pub const RMAPBT: Self = Self(1 << 1);

    /// Reflinked files.
    pub const REFLINK: Self = Self(1 << 2);
}

xfs_flag_field!(
    IncompatFeatures,
    u32,
    "Incompatible feature set: these change the meaning of on-disk metadata."
);

impl IncompatFeatures {
    /// Directory entries carry the file type.
    pub const FTYPE: Self = Self(1 << 0);

    /// Sparse inode chunks: inode B+tree records carry a hole mask.
    pub const SPINODES: Self = Self(1 << 1);

    /// Metadata UUID is separate from the user-visible UUID.
    pub const META_UUID: Self = Self(1 << 2);
}

/// On-disk superblock.
///
/// All multi-byte integers are stored big-endian; fields are kept raw and
/// converted in the accessors. Only the fields up to `sb_meta_uuid` exist on
/// every v5 image, which is all this layout covers.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    pub(crate) sb_magicnum: u32,
    pub(crate) sb_blocksize: u32,
    pub(crate) sb_dblocks: u64,
    pub(crate) sb_rblocks: u64,
    pub(crate) sb_rextents: u64,
    pub(crate) sb_uuid: [u8; 16],
    pub(crate) sb_logstart: u64,
    pub(crate) sb_rootino: u64,
    pub(crate) sb_rbmino: u64,
    pub(crate) sb_rsumino: u64,
    pub(crate) sb_rextsize: u32,
    pub(crate) sb_agblocks: u32,
    pub(crate) sb_agcount: u32,
    pub(crate) sb_rbmblocks: u32,
    pub(crate) sb_logblocks: u32,
    pub(crate) sb_versionnum: u16,
    pub(crate) sb_sectsize: u16,
    pub(crate) sb_inodesize: u16,
    pub(crate) sb_inopblock: u16,
    pub(crate) sb_fname: [u8; 12],
    pub(crate) sb_blocklog: u8,
    pub(crate) sb_sectlog: u8,
    pub(crate) sb_inodelog: u8,
    pub(crate) sb_inopblog: u8,
    pub(crate) sb_agblklog: u8,
    pub(crate) sb_rextslog: u8,
    pub(crate) sb_inprogress: u8,
    pub(crate) sb_imax_pct: u8,
    pub(crate) sb_icount: u64,
    pub(crate) sb_ifree: u64,
    pub(crate) sb_fdblocks: u64,
    pub(crate) sb_frextents: u64,
    pub(crate) sb_uquotino: u64,
    pub(crate) sb_gquotino: u64,
    pub(crate) sb_qflags: u16,
    pub(crate) sb_flags: u8,
    pub(crate) sb_shared_vn: u8,
    pub(crate) sb_inoalignmt: u32,
    pub(crate) sb_unit: u32,
    pub(crate) sb_width: u32,
    pub(crate) sb_dirblklog: u8,
    pub(crate) sb_logsectlog: u8,
    pub(crate) sb_logsectsize: u16,
    pub(crate) sb_logsunit: u32,
    pub(crate) sb_features2: u32,
    pub(crate) sb_bad_features2: u32,
    pub(crate) sb_features_compat: u32,
    pub(crate) sb_features_ro_compat: u32,
    pub(crate) sb_features_incompat: u32,
    pub(crate) sb_features_log_incompat: u32,
    pub(crate) sb_crc: u32,
    pub(crate) sb_spino_align: u32,
    pub(crate) sb_pquotino: u64,
    pub(crate) sb_lsn: u64,
    pub(crate) sb_meta_uuid: [u8; 16],
}

impl Superblock {
    /// Loads the primary superblock from sector 0 of the device and
    /// validates it.
    ///
    /// # Errors
    ///
    /// Fails if the device cannot serve the first sector, if the magic does
    /// not read "XFSB", or if the version family is unknown.
    pub(crate) fn load<D: BlockDevice>(device: &D) -> IOResult<Self> {
        let sb: Superblock = read_pod(device, 0)?;

        if u32::from_be(sb.sb_magicnum) != XFS_SB_MAGIC {
            return Err(RecoveryError::validation("superblock", "magic mismatch"));
        }
        sb.check_version()?;
        sb.check_geometry()?;
        sb.log_features();

        Ok(sb)
    }

    fn check_version(&self) -> IOResult<()> {
        match self.version() {
            1..=5 => Ok(()),
            _ => Err(RecoveryError::validation("superblock", "unknown version")),
        }
    }

    fn check_geometry(&self) -> IOResult<()> {
        let block_size = self.block_size();
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(RecoveryError::validation("superblock", "bad block size"));
        }

        // an AG-relative block number must fit below the AG shift
        let shift = self.ag_block_log();
        if shift >= 64 || (1u64 << shift) < u64::from(self.ag_blocks()) {
            return Err(RecoveryError::validation("superblock", "bad AG block shift"));
        }

        Ok(())
    }

    /// Version family, the low four bits of `sb_versionnum`.
    pub fn version(&self) -> u16 {
        u16::from_be(self.sb_versionnum) & XFS_SB_VERSION_NUMBITS
    }

    /// Filesystem block size, in bytes. Always a power of two.
    pub fn block_size(&self) -> u32 {
        u32::from_be(self.sb_blocksize)
    }

    /// Sector size, in bytes. The AG headers are laid out in sectors.
    pub fn sector_size(&self) -> u16 {
        u16::from_be(self.sb_sectsize)
    }

    /// Size of one inode slot, in bytes. The slot is larger than the inode
    /// core; the remainder holds the inline forks.
    pub fn inode_size(&self) -> u16 {
        u16::from_be(self.sb_inodesize)
    }

    /// Number of blocks in each allocation group.
    pub fn ag_blocks(&self) -> u32 {
        u32::from_be(self.sb_agblocks)
    }

    /// Number of allocation groups.
    pub fn ag_count(&self) -> u32 {
        u32::from_be(self.sb_agcount)
    }

    /// Number of data blocks in the filesystem.
    pub fn data_blocks(&self) -> u64 {
        u64::from_be(self.sb_dblocks)
    }

    /// log2 of `ag_blocks`, rounded up. A filesystem block number carries
    /// the AG index above this bit position.
    pub fn ag_block_log(&self) -> u8 {
        self.sb_agblklog
    }

    pub fn has_version(&self, flag: VersionFlags) -> bool {
        VersionFlags(u16::from_be(self.sb_versionnum)).contains(flag)
    }

    pub fn has_features2(&self, flag: Features2) -> bool {
        Features2(u32::from_be(self.sb_features2)).contains(flag)
    }

    pub fn has_ro_compat(&self, flag: RoCompatFeatures) -> bool {
        RoCompatFeatures(u32::from_be(self.sb_features_ro_compat)).contains(flag)
    }

    pub fn has_incompat(&self, flag: IncompatFeatures) -> bool {
        IncompatFeatures(u32::from_be(self.sb_features_incompat)).contains(flag)
    }

    /// Absolute byte offset of the start of allocation group `agno`.
    pub(crate) fn ag_byte_offset(&self, agno: u32) -> u64 {
        u64::from(agno) * u64::from(self.ag_blocks()) * u64::from(self.block_size())
    }

    /// Splits a packed filesystem block number into its AG index and
    /// AG-relative block number.
    pub(crate) fn fsblock_to_ag(&self, fsblock: u64) -> (u32, u32) {
        let agno = (fsblock >> self.ag_block_log()) as u32;
        let agbno = (fsblock & ((1u64 << self.ag_block_log()) - 1)) as u32;
        (agno, agbno)
    }

    /// Linearises an (AG index, AG-relative block) pair into an absolute
    /// block number, directly multipliable by the block size.
    pub(crate) fn ag_linear_block(&self, agno: u32, agbno: u32) -> u64 {
        u64::from(agno) * u64::from(self.ag_blocks()) + u64::from(agbno)
    }

    fn log_features(&self) {
        info!(target: "xfs", "superblock version {}", self.version());

        let mut version: Vec<&str> = Vec::new();
        if self.has_version(VersionFlags::ATTR) {
            version.push("attr");
        }
        if self.has_version(VersionFlags::NLINK) {
            version.push("nlink");
        }
        if self.has_version(VersionFlags::QUOTA) {
            version.push("quota");
        }
        if self.has_version(VersionFlags::ALIGN) {
            version.push("align");
        }
        if self.has_version(VersionFlags::DALIGN) {
            version.push("dalign");
        }
        if self.has_version(VersionFlags::SHARED) {
            version.push("shared");
        }
        if self.has_version(VersionFlags::LOGV2) {
            version.push("logv2");
        }
        if self.has_version(VersionFlags::SECTOR) {
            version.push("sector");
        }
        if self.has_version(VersionFlags::EXTFLG) {
            version.push("extflg");
        }
        if self.has_version(VersionFlags::DIRV2) {
            version.push("dirv2");
        }
        if self.has_version(VersionFlags::BORG) {
            version.push("borg");
        }
        if self.has_version(VersionFlags::MOREBITS) {
            version.push("morebits");
            if self.has_features2(Features2::LAZYSBCOUNT) {
                version.push("lazysbcount");
            }
            if self.has_features2(Features2::ATTR2) {
                version.push("attr2");
            }
            if self.has_features2(Features2::PARENT) {
                version.push("parent");
            }
            if self.has_features2(Features2::PROJID32) {
                version.push("projid32");
            }
            if self.has_features2(Features2::CRC) {
                version.push("crc");
            }
            if self.has_features2(Features2::FTYPE) {
                version.push("ftype");
            }
        }

        let mut rocompat: Vec<&str> = Vec::new();
        if self.has_ro_compat(RoCompatFeatures::FINOBT) {
            rocompat.push("finobt");
        }
        if self.has_ro_compat(RoCompatFeatures::RMAPBT) {
            rocompat.push("rmapbt");
        }
        if self.has_ro_compat(RoCompatFeatures::REFLINK) {
            rocompat.push("reflink");
        }

        let mut incompat: Vec<&str> = Vec::new();
        if self.has_incompat(IncompatFeatures::FTYPE) {
            incompat.push("ftype");
        }
        if self.has_incompat(IncompatFeatures::SPINODES) {
            incompat.push("spinodes");
        }
        if self.has_incompat(IncompatFeatures::META_UUID) {
            incompat.push("meta_uuid");
        }

        info!(
            target: "xfs",
            "superblock features: version: {}  rocompat: {}  incompat: {}",
            version.join(" "),
            rocompat.join(" "),
            incompat.join(" ")
        );
    }
}
