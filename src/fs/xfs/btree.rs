//! Short-format B+tree blocks.
//!
//! Every per-AG index (inode chunks, free inodes, free space) is a
//! "short-format" B+tree: pointers are 32-bit AG-relative block numbers.
//! This module holds the CRC-enabled block header common to all of them and
//! a generic walker that descends interior nodes and hands every leaf
//! record slot to a callback.
//!
//! The walker sizes its reads from the block geometry, not from
//! `bb_numrecs`: slots past the live count still hold whatever records were
//! there before the last shrink, and those stale slots are exactly where
//! deleted inode chunks linger. Consumers must cope with duplicate and
//! garbage records.

use core::mem;
use core::ops::ControlFlow;

use bytemuck::{AnyBitPattern, Pod, Zeroable};

use crate::dev::BlockDevice;
use crate::errors::RecoveryError;
use crate::fs::xfs::read_pod;
use crate::fs::xfs::sb::Superblock;
use crate::fs::IOResult;

/// Inode B+tree leaf/node magic, "IAB3".
pub(crate) const XFS_IBT_CRC_MAGIC: u32 = 0x4941_4233;

/// Free-inode B+tree leaf/node magic, "FIB3".
pub(crate) const XFS_FIBT_CRC_MAGIC: u32 = 0x4649_4233;

/// Free-space-by-block B+tree leaf/node magic, "AB3B".
pub(crate) const XFS_ABTB_CRC_MAGIC: u32 = 0x4142_3342;

/// Length of a short-format CRC-enabled block header.
pub(crate) const SHORT_HEADER_LEN: usize = mem::size_of::<BtreeBlockHeader>();

/// Width of a short-format tree pointer.
const SHORT_PTR_LEN: usize = mem::size_of::<u32>();

/// On-disk header of a short-format CRC-enabled B+tree block.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct BtreeBlockHeader {
    pub(crate) bb_magic: u32,
    pub(crate) bb_level: u16,
    pub(crate) bb_numrecs: u16,
    pub(crate) bb_leftsib: u32,
    pub(crate) bb_rightsib: u32,
    pub(crate) bb_blkno: u64,
    pub(crate) bb_lsn: u64,
    pub(crate) bb_uuid: [u8; 16],
    pub(crate) bb_owner: u32,
    pub(crate) bb_crc: u32,
}

impl BtreeBlockHeader {
    /// Depth of this block; 0 is a leaf.
    pub(crate) fn level(&self) -> u16 {
        u16::from_be(self.bb_level)
    }

    /// Count of live records in this block.
    pub(crate) fn numrecs(&self) -> u16 {
        u16::from_be(self.bb_numrecs)
    }
}

/// Reads a block header at `seek` and verifies its magic.
pub(crate) fn load_block_header<D: BlockDevice>(
    device: &D,
    seek: u64,
    expected_magic: u32,
) -> IOResult<BtreeBlockHeader> {
    let header: BtreeBlockHeader = read_pod(device, seek)?;

    if u32::from_be(header.bb_magic) != expected_magic {
        return Err(RecoveryError::validation("btree block", "magic mismatch"));
    }

    Ok(header)
}

/// Walks the short-format B+tree rooted at AG-relative block `root`,
/// invoking `visit` on every leaf record slot in traversal order.
///
/// `Break` from the callback unwinds the whole descent immediately.
///
/// # Errors
///
/// Fails on a device error or when a visited block does not carry
/// `magic`; both abort the walk of this tree.
pub(crate) fn walk<D, R, F>(
    device: &D,
    sb: &Superblock,
    agno: u32,
    root: u32,
    magic: u32,
    visit: &mut F,
) -> IOResult<ControlFlow<()>>
where
    D: BlockDevice,
    R: AnyBitPattern,
    F: FnMut(&R) -> IOResult<ControlFlow<()>>,
{
    walk_node::<D, R, F>(device, sb, agno, root, magic, visit)
}

fn walk_node<D, R, F>(
    device: &D,
    sb: &Superblock,
    agno: u32,
    ptr: u32,
    magic: u32,
    visit: &mut F,
) -> IOResult<ControlFlow<()>>
where
    D: BlockDevice,
    R: AnyBitPattern,
    F: FnMut(&R) -> IOResult<ControlFlow<()>>,
{
    let block_size = u64::from(sb.block_size());
    let seek = block_size * (u64::from(sb.ag_blocks()) * u64::from(agno) + u64::from(ptr));

    let header = load_block_header(device, seek, magic)?;

    if header.level() > 0 {
        walk_pointers::<D, R, F>(device, sb, agno, seek, magic, visit)
    } else {
        walk_records::<D, R, F>(device, sb, seek, visit)
    }
}

/// Interior node: the pointer array occupies the second half of the block.
fn walk_pointers<D, R, F>(
    device: &D,
    sb: &Superblock,
    agno: u32,
    seek: u64,
    magic: u32,
    visit: &mut F,
) -> IOResult<ControlFlow<()>>
where
    D: BlockDevice,
    R: AnyBitPattern,
    F: FnMut(&R) -> IOResult<ControlFlow<()>>,
{
    let block_size = sb.block_size() as usize;
    let capacity = (block_size - SHORT_HEADER_LEN) / (2 * SHORT_PTR_LEN);
    let ptr_offset = (SHORT_HEADER_LEN as u64 + block_size as u64) / 2;

    let mut raw = vec![0u8; capacity * SHORT_PTR_LEN];
    device.read_at(seek + ptr_offset, &mut raw)?;

    for chunk in raw.chunks_exact(SHORT_PTR_LEN) {
        let child = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if walk_node::<D, R, F>(device, sb, agno, child, magic, visit)?.is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }

    Ok(ControlFlow::Continue(()))
}

/// Leaf node: a dense record array follows the header.
fn walk_records<D, R, F>(
    device: &D,
    sb: &Superblock,
    seek: u64,
    visit: &mut F,
) -> IOResult<ControlFlow<()>>
where
    D: BlockDevice,
    R: AnyBitPattern,
    F: FnMut(&R) -> IOResult<ControlFlow<()>>,
{
    let block_size = sb.block_size() as usize;
    let record_len = mem::size_of::<R>();
    let capacity = (block_size - SHORT_HEADER_LEN) / record_len;

    let mut raw = vec![0u8; capacity * record_len];
    device.read_at(seek + SHORT_HEADER_LEN as u64, &mut raw)?;

    for chunk in raw.chunks_exact(record_len) {
        let record: R = bytemuck::pod_read_unaligned(chunk);
        if visit(&record)?.is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }

    Ok(ControlFlow::Continue(()))
}
