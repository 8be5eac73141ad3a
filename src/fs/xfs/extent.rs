//! Extent records.
//!
//! XFS maps file space with extents: a logical file offset, a starting
//! filesystem block, a length in blocks, and a written/unwritten flag. In an
//! EXTENTS-format inode the records sit inline in the data fork, packed into
//! 128 bits each:
//!
//! ```text
//! l0:63           extent flag (1 = unwritten/preallocated)
//! l0:9-62         logical file offset, in blocks (54 bits)
//! l0:0-8 l1:21-63 start block, agno packed in the high bits (52 bits)
//! l1:0-20         block count (21 bits)
//! ```
//!
//! Field boundaries straddle the two words, so decoding is mask-and-shift
//! over the byteswapped halves, never a struct overlay.

use core::mem;

use bytemuck::{Pod, Zeroable};

use crate::fs::xfs::sb::Superblock;

/// Size of one packed extent record, in bytes.
pub(crate) const EXTENT_RECORD_LEN: usize = mem::size_of::<PackedExtent>();

const STARTOFF_MASK: u64 = (1 << 54) - 1;
const STARTBLOCK_LOW_BITS: u32 = 43;
const BLOCKCOUNT_BITS: u32 = 21;
const BLOCKCOUNT_MASK: u64 = (1 << BLOCKCOUNT_BITS) - 1;

/// Written state of an extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExtentState {
    /// Normal, written data.
    Normal,
    /// Preallocated but never written; carries no recoverable content.
    Unwritten,
}

/// On-disk packed extent record, two big-endian 64-bit words.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct PackedExtent {
    pub(crate) l0: u64,
    pub(crate) l1: u64,
}

impl PackedExtent {
    /// Decodes the four packed fields.
    pub(crate) fn unpack(&self) -> Extent {
        let l0 = u64::from_be(self.l0);
        let l1 = u64::from_be(self.l1);

        let state = if l0 >> 63 != 0 {
            ExtentState::Unwritten
        } else {
            ExtentState::Normal
        };

        Extent {
            file_offset: (l0 >> 9) & STARTOFF_MASK,
            start_block: ((l0 & 0x1ff) << STARTBLOCK_LOW_BITS) | (l1 >> BLOCKCOUNT_BITS),
            block_count: l1 & BLOCKCOUNT_MASK,
            state,
        }
    }
}

/// A decoded extent.
///
/// Straight out of [`PackedExtent::unpack`], `start_block` is the packed
/// filesystem block number (AG index in the high bits). Sub-extents emitted
/// by the free-space intersection instead carry the linearised absolute
/// block number, which the content reader multiplies by the block size
/// directly. `file_offset` is in blocks throughout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Extent {
    pub(crate) file_offset: u64,
    pub(crate) start_block: u64,
    pub(crate) block_count: u64,
    pub(crate) state: ExtentState,
}

impl Extent {
    /// Splits `start_block` into (AG index, AG-relative block).
    pub(crate) fn ag_components(&self, sb: &Superblock) -> (u32, u32) {
        sb.fsblock_to_ag(self.start_block)
    }

    /// Whether this extent is worth intersecting at all: written, non-empty
    /// and entirely inside the data area of the filesystem.
    pub(crate) fn is_valid(&self, sb: &Superblock) -> bool {
        if self.state == ExtentState::Unwritten {
            return false;
        }
        if self.block_count == 0 {
            return false;
        }

        let (agno, agbno) = self.ag_components(sb);
        let linear = sb.ag_linear_block(agno, agbno);
        linear + self.block_count <= sb.data_blocks()
    }
}
