//! Allocation-group header pair.
//!
//! Each allocation group opens with four sectors of metadata. Recovery needs
//! two of them: the free-space header (AGF, second sector) for the roots of
//! the free-space B+trees, and the inode-management header (AGI, third
//! sector) for the roots of the inode B+trees. Both are verified by magic
//! before any of their fields are trusted.

use bytemuck::{Pod, Zeroable};

use crate::dev::BlockDevice;
use crate::errors::RecoveryError;
use crate::fs::xfs::read_pod;
use crate::fs::xfs::sb::Superblock;
use crate::fs::IOResult;

/// AGF magic, "XAGF".
pub(crate) const XFS_AGF_MAGIC: u32 = 0x5841_4746;

/// AGI magic, "XAGI".
pub(crate) const XFS_AGI_MAGIC: u32 = 0x5841_4749;

/// Index of the by-block-number tree in `agf_roots`/`agf_levels`.
const BTNUM_BNO: usize = 0;

/// On-disk free-space header (second sector of the AG).
///
/// Tracks free space through two B+trees, one ordered by block number and
/// one by extent size. Only the by-block-number tree is used here.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct AgfHeader {
    pub(crate) agf_magicnum: u32,
    pub(crate) agf_versionnum: u32,
    pub(crate) agf_seqno: u32,
    pub(crate) agf_length: u32,
    pub(crate) agf_roots: [u32; 3],
    pub(crate) agf_levels: [u32; 3],
    pub(crate) agf_flfirst: u32,
    pub(crate) agf_fllast: u32,
    pub(crate) agf_flcount: u32,
    pub(crate) agf_freeblks: u32,
    pub(crate) agf_longest: u32,
    pub(crate) agf_btreeblks: u32,
    pub(crate) agf_uuid: [u8; 16],
    pub(crate) agf_rmap_blocks: u32,
    pub(crate) agf_refcount_blocks: u32,
    pub(crate) agf_refcount_root: u32,
    pub(crate) agf_refcount_level: u32,
    pub(crate) agf_spare64: [u64; 14],
    pub(crate) agf_lsn: u64,
    pub(crate) agf_crc: u32,
    pub(crate) agf_spare2: u32,
}

impl AgfHeader {
    /// Reads and verifies the AGF of allocation group `agno`.
    ///
    /// # Errors
    ///
    /// Fails on a device error or when the sector does not carry the AGF
    /// magic.
    pub(crate) fn load<D: BlockDevice>(
        device: &D,
        sb: &Superblock,
        agno: u32,
    ) -> IOResult<Self> {
        let offset = sb.ag_byte_offset(agno) + u64::from(sb.sector_size());
        let agf: AgfHeader = read_pod(device, offset)?;

        if u32::from_be(agf.agf_magicnum) != XFS_AGF_MAGIC {
            return Err(RecoveryError::validation("agf", "magic mismatch"));
        }

        Ok(agf)
    }

    /// Size of the allocation group, in blocks.
    pub(crate) fn length(&self) -> u32 {
        u32::from_be(self.agf_length)
    }

    /// Root block of the free-space-by-block-number B+tree, AG relative.
    pub(crate) fn bno_root(&self) -> u32 {
        u32::from_be(self.agf_roots[BTNUM_BNO])
    }
}

/// On-disk inode-management header (third sector of the AG).
///
/// Inodes are located by interpreting the inode number, so the AGI only has
/// to expose the B+tree roots used to enumerate inode chunks.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct AgiHeader {
    pub(crate) agi_magicnum: u32,
    pub(crate) agi_versionnum: u32,
    pub(crate) agi_seqno: u32,
    pub(crate) agi_length: u32,
    pub(crate) agi_count: u32,
    pub(crate) agi_root: u32,
    pub(crate) agi_level: u32,
    pub(crate) agi_freecount: u32,
    pub(crate) agi_newino: u32,
    pub(crate) agi_dirino: u32,
    pub(crate) agi_unlinked: [u32; 64],
    pub(crate) agi_uuid: [u8; 16],
    pub(crate) agi_crc: u32,
    pub(crate) agi_pad32: u32,
    pub(crate) agi_lsn: u64,
    pub(crate) agi_free_root: u32,
    pub(crate) agi_free_level: u32,
}

impl AgiHeader {
    /// Reads and verifies the AGI of allocation group `agno`.
    ///
    /// # Errors
    ///
    /// Fails on a device error or when the sector does not carry the AGI
    /// magic.
    pub(crate) fn load<D: BlockDevice>(
        device: &D,
        sb: &Superblock,
        agno: u32,
    ) -> IOResult<Self> {
        let offset = sb.ag_byte_offset(agno) + 2 * u64::from(sb.sector_size());
        let agi: AgiHeader = read_pod(device, offset)?;

        if u32::from_be(agi.agi_magicnum) != XFS_AGI_MAGIC {
            return Err(RecoveryError::validation("agi", "magic mismatch"));
        }

        Ok(agi)
    }

    /// Root block of the all-inode B+tree, AG relative.
    pub(crate) fn inode_root(&self) -> u32 {
        u32::from_be(self.agi_root)
    }

    /// Root block of the free-inode B+tree, AG relative. Only meaningful
    /// when the FINOBT feature is set.
    pub(crate) fn free_inode_root(&self) -> u32 {
        u32::from_be(self.agi_free_root)
    }
}
