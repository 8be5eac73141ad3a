//! XFS deleted-file recovery.
//!
//! The pipeline follows the on-disk metadata top-down: superblock, then per
//! allocation group the AGF/AGI header pair, then the inode B+tree (or the
//! free-inode B+tree when the filesystem has one). Every free inode slot is
//! a candidate: its core is validated against the deleted-file signature,
//! the inline extent records are unpacked, and each extent is intersected
//! with the AG's free-space tree so only still-unoverwritten ranges remain.
//! Survivors reach the consumer callback as [`RecoveredInode`] handles.
//!
//! Recovery is best effort by construction: a slot that fails any check is
//! skipped silently, a broken allocation group is abandoned with an error
//! log, and the walk moves on.

use core::mem;
use core::ops::ControlFlow;

use bytemuck::AnyBitPattern;
use log::{error, info, trace};

use crate::dev::{BlockDevice, DeviceError};
use crate::fs::IOResult;

pub(crate) mod ag;
pub(crate) mod alloc;
pub(crate) mod btree;
pub(crate) mod extent;
mod file;
pub(crate) mod inode;
pub(crate) mod sb;

pub use self::file::RecoveredInode;
pub use self::inode::{MacTimes, Timestamp};
pub use self::sb::{Features2, IncompatFeatures, RoCompatFeatures, Superblock, VersionFlags};

use self::ag::{AgfHeader, AgiHeader};
use self::extent::{PackedExtent, EXTENT_RECORD_LEN};
use self::inode::{InobtRec, InodeCore, SkipReason, INODE_CORE_LEN};

/// Reads one on-disk structure at an absolute byte offset.
pub(crate) fn read_pod<D, T>(device: &D, offset: u64) -> Result<T, DeviceError>
where
    D: BlockDevice,
    T: AnyBitPattern,
{
    let mut buf = vec![0u8; mem::size_of::<T>()];
    device.read_at(offset, &mut buf)?;
    Ok(bytemuck::pod_read_unaligned(&buf))
}

/// An opened XFS filesystem image, ready for a recovery walk.
///
/// Holds the injected device capability and the validated superblock; no
/// other state survives between callbacks.
#[derive(Debug)]
pub struct XfsFs<D: BlockDevice> {
    device: D,
    superblock: Superblock,
}

impl<D: BlockDevice> XfsFs<D> {
    /// Opens a filesystem image: loads and validates the superblock.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot serve the first sector, or when the
    /// superblock magic or version family is wrong. Superblock problems are
    /// fatal; there is nothing to walk without trusted geometry.
    pub fn open(device: D) -> IOResult<Self> {
        let superblock = Superblock::load(&device)?;

        info!(
            target: "xfs",
            "opened xfs filesystem: {} AGs of {} blocks, block size {}, inode size {}",
            superblock.ag_count(),
            superblock.ag_blocks(),
            superblock.block_size(),
            superblock.inode_size()
        );

        Ok(Self { device, superblock })
    }

    /// The validated superblock, for geometry queries.
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Walks every allocation group for recoverable deleted inodes and
    /// hands each one to `callback`.
    ///
    /// Returning [`ControlFlow::Break`] from the callback stops the whole
    /// dump promptly; the dump still counts as successful.
    ///
    /// Within one AG, inodes arrive in B+tree traversal order. An AG whose
    /// headers or trees are broken is logged and abandoned; the remaining
    /// AGs are still attempted.
    ///
    /// # Errors
    ///
    /// None at present beyond what `open` already guarantees against, but
    /// the signature reserves the right.
    pub fn dump_inodes<F>(&self, mut callback: F) -> IOResult<()>
    where
        F: FnMut(RecoveredInode<'_, D>) -> ControlFlow<()>,
    {
        for agno in 0..self.superblock.ag_count() {
            match self.dump_ag(agno, &mut callback) {
                Ok(ControlFlow::Break(())) => {
                    info!(target: "xfs", "consumer stopped the dump in ag#{agno}");
                    return Ok(());
                }
                Ok(ControlFlow::Continue(())) => {}
                Err(err) => error!(target: "xfs", "ag#{agno} walk failed: {err}"),
            }
        }

        Ok(())
    }

    fn dump_ag<F>(&self, agno: u32, callback: &mut F) -> IOResult<ControlFlow<()>>
    where
        F: FnMut(RecoveredInode<'_, D>) -> ControlFlow<()>,
    {
        let agf = AgfHeader::load(&self.device, &self.superblock, agno)?;
        let agi = AgiHeader::load(&self.device, &self.superblock, agno)?;

        // the free-inode tree enumerates exactly the slots recovery wants;
        // fall back to the all-inode tree on filesystems without one
        let (root, magic) = if self.superblock.has_ro_compat(RoCompatFeatures::FINOBT) {
            info!(target: "xfs", "dumping finobt in ag#{agno}");
            (agi.free_inode_root(), btree::XFS_FIBT_CRC_MAGIC)
        } else {
            info!(target: "xfs", "dumping inobt in ag#{agno}");
            (agi.inode_root(), btree::XFS_IBT_CRC_MAGIC)
        };

        btree::walk::<D, InobtRec, _>(
            &self.device,
            &self.superblock,
            agno,
            root,
            magic,
            &mut |rec| self.scan_chunk(agno, &agf, rec, callback),
        )
    }

    /// Iterates the 64 inode slots of one inode B+tree record, attempting
    /// recovery for every slot marked free.
    fn scan_chunk<F>(
        &self,
        agno: u32,
        agf: &AgfHeader,
        rec: &InobtRec,
        callback: &mut F,
    ) -> IOResult<ControlFlow<()>>
    where
        F: FnMut(RecoveredInode<'_, D>) -> ControlFlow<()>,
    {
        let sparse = self.superblock.has_incompat(IncompatFeatures::SPINODES);
        let start = rec.startino();
        let mut cur = start;
        let mut free = rec.free_mask();
        let mut holes = rec.hole_mask();

        while free != 0 {
            // each hole-mask bit voids 4 consecutive slots
            if sparse && holes & 1 != 0 {
                holes >>= 1;
                free >>= 4;
                cur += 4;
                continue;
            }

            if free & 1 != 0 {
                trace!(target: "xfs", "[{cur}] attempting recovery");
                match self.recover_inode(agno, agf, cur) {
                    Ok(entry) => {
                        if callback(entry).is_break() {
                            return Ok(ControlFlow::Break(()));
                        }
                    }
                    Err(skip) => trace!(target: "xfs", "[{cur}] skipped: {skip}"),
                }
            }

            free >>= 1;
            cur += 1;
            if (cur - start) % 4 == 0 {
                holes >>= 1;
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Attempts recovery of the free inode slot `agino`.
    fn recover_inode(
        &self,
        agno: u32,
        agf: &AgfHeader,
        agino: u32,
    ) -> Result<RecoveredInode<'_, D>, SkipReason> {
        let sb = &self.superblock;
        let inode_size = u64::from(sb.inode_size());
        let seek = sb.ag_byte_offset(agno) + u64::from(agino) * inode_size;

        let core: InodeCore = read_pod(&self.device, seek)?;
        core.validate()?;

        // the rest of the slot is the inline data fork: packed extents
        let record_count = (inode_size as usize).saturating_sub(INODE_CORE_LEN) / EXTENT_RECORD_LEN;
        let mut raw = vec![0u8; record_count * EXTENT_RECORD_LEN];
        self.device.read_at(seek + INODE_CORE_LEN as u64, &mut raw)?;

        let mut extents = Vec::new();
        let mut has_leading = false;
        for chunk in raw.chunks_exact(EXTENT_RECORD_LEN) {
            let packed: PackedExtent = bytemuck::pod_read_unaligned(chunk);
            let candidate = packed.unpack();
            if !candidate.is_valid(sb) {
                continue;
            }

            let survivors = alloc::free_sub_extents(&self.device, sb, agno, agf, &candidate)
                .map_err(SkipReason::FreeSpaceWalk)?;
            for sub in survivors {
                if sub.file_offset == 0 {
                    has_leading = true;
                }
                extents.push(sub);
            }
        }

        if extents.is_empty() {
            return Err(SkipReason::NoValidExtents);
        }
        // a reconstruction missing the start of the file is useless and
        // almost certainly a false positive
        if !has_leading {
            return Err(SkipReason::NoLeadingExtent);
        }

        Ok(RecoveredInode::new(
            &self.device,
            sb.block_size(),
            core.ino(),
            core.mac_times(),
            extents,
        ))
    }
}
