//! Free-space intersection.
//!
//! A deleted inode's extents point at blocks that may have been handed out
//! again since the deletion. The allocation group's free-space-by-block
//! B+tree is the arbiter: any sub-range of a candidate extent still present
//! in that tree has not been re-allocated and is presumed intact. Everything
//! else is treated as overwritten and dropped.
//!
//! Node layout differs from the walker's trees: an interior node holds
//! `max_key_count` keys followed by `max_key_count` pointers, where
//! `max_key_count` fills the block. The descent needs a single path because
//! the keys partition the block space.

use core::mem;

use bytemuck::{Pod, Zeroable};
use log::trace;

use crate::dev::BlockDevice;
use crate::fs::xfs::ag::AgfHeader;
use crate::fs::xfs::btree::{load_block_header, SHORT_HEADER_LEN, XFS_ABTB_CRC_MAGIC};
use crate::fs::xfs::extent::{Extent, ExtentState};
use crate::fs::xfs::sb::Superblock;
use crate::fs::IOResult;

/// Free-space record; the interior keys share the same layout.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct AllocRec {
    pub(crate) ar_startblock: u32,
    pub(crate) ar_blockcount: u32,
}

impl AllocRec {
    /// First free block of the run, AG relative.
    fn startblock(&self) -> u64 {
        u64::from(u32::from_be(self.ar_startblock))
    }

    /// Length of the run, in blocks.
    fn blockcount(&self) -> u64 {
        u64::from(u32::from_be(self.ar_blockcount))
    }
}

/// Size of one free-space record or key, in bytes.
const ALLOC_RECORD_LEN: usize = mem::size_of::<AllocRec>();

/// Width of a free-space tree pointer.
const ALLOC_PTR_LEN: usize = mem::size_of::<u32>();

/// Emits the sub-ranges of `extent` still marked free in `agno`'s
/// free-space tree, in ascending file-offset order.
///
/// Emitted sub-extents carry linearised absolute start blocks, directly
/// multipliable by the block size.
///
/// # Errors
///
/// Fails on a device error or a malformed tree block; the caller treats
/// either as grounds to skip the inode under recovery.
pub(crate) fn free_sub_extents<D: BlockDevice>(
    device: &D,
    sb: &Superblock,
    agno: u32,
    agf: &AgfHeader,
    extent: &Extent,
) -> IOResult<Vec<Extent>> {
    let mut found = Vec::new();

    let (ext_agno, ext_agbno) = extent.ag_components(sb);
    if ext_agno != agno || ext_agbno > agf.length() {
        trace!(target: "xfs", "extent start is beyond this AG");
        return Ok(found);
    }

    let begin = u64::from(ext_agbno);
    let mut window = (begin, begin + extent.block_count);
    descend(
        device,
        sb,
        agno,
        agf.bno_root(),
        extent,
        begin,
        &mut window,
        &mut found,
    )?;

    Ok(found)
}

#[allow(clippy::too_many_arguments)]
fn descend<D: BlockDevice>(
    device: &D,
    sb: &Superblock,
    agno: u32,
    node: u32,
    extent: &Extent,
    rb_start: u64,
    window: &mut (u64, u64),
    out: &mut Vec<Extent>,
) -> IOResult<()> {
    let block_size = u64::from(sb.block_size());
    let seek = sb.ag_byte_offset(agno) + u64::from(node) * block_size;

    let header = load_block_header(device, seek, XFS_ABTB_CRC_MAGIC)?;
    let numrecs = usize::from(header.numrecs());
    if numrecs == 0 {
        return Ok(());
    }

    if header.level() > 0 {
        let child = pick_child(device, sb, seek, numrecs, window)?;
        return descend(device, sb, agno, child, extent, rb_start, window, out);
    }

    scan_leaf(device, sb, agno, seek, numrecs, extent, rb_start, window, out)
}

/// Interior node: binary search the key array for the subtree covering the
/// start of the still-unmatched window. On an overlap match the right index
/// is the chosen child; between two keys the right neighbour wins.
fn pick_child<D: BlockDevice>(
    device: &D,
    sb: &Superblock,
    seek: u64,
    numrecs: usize,
    window: &(u64, u64),
) -> IOResult<u32> {
    let mut raw_keys = vec![0u8; numrecs * ALLOC_RECORD_LEN];
    device.read_at(seek + SHORT_HEADER_LEN as u64, &mut raw_keys)?;
    let keys: Vec<u64> = raw_keys
        .chunks_exact(ALLOC_RECORD_LEN)
        .map(|chunk| bytemuck::pod_read_unaligned::<AllocRec>(chunk).startblock())
        .collect();

    let capacity = (sb.block_size() as usize - SHORT_HEADER_LEN) / (ALLOC_RECORD_LEN + ALLOC_PTR_LEN);
    let ptrs_offset = (SHORT_HEADER_LEN + capacity * ALLOC_RECORD_LEN) as u64;
    let mut raw_ptrs = vec![0u8; numrecs * ALLOC_PTR_LEN];
    device.read_at(seek + ptrs_offset, &mut raw_ptrs)?;

    let mut left = 0isize;
    let mut right = numrecs as isize - 1;
    while left <= right {
        let middle = (left + right) / 2;
        let key = keys[middle as usize];
        if window.0 > key {
            left = middle + 1;
        } else if window.1 < key {
            right = middle - 1;
        } else {
            right = middle;
            break;
        }
    }

    let chosen = right.clamp(0, numrecs as isize - 1) as usize;
    let at = chosen * ALLOC_PTR_LEN;
    Ok(u32::from_be_bytes([
        raw_ptrs[at],
        raw_ptrs[at + 1],
        raw_ptrs[at + 2],
        raw_ptrs[at + 3],
    ]))
}

/// Leaf node: locate one record overlapping the window, then sweep right
/// emitting every overlap until the window is spent. Window space left of
/// the first overlap is discarded as overwritten.
#[allow(clippy::too_many_arguments)]
fn scan_leaf<D: BlockDevice>(
    device: &D,
    sb: &Superblock,
    agno: u32,
    seek: u64,
    numrecs: usize,
    extent: &Extent,
    rb_start: u64,
    window: &mut (u64, u64),
    out: &mut Vec<Extent>,
) -> IOResult<()> {
    let mut raw = vec![0u8; numrecs * ALLOC_RECORD_LEN];
    device.read_at(seek + SHORT_HEADER_LEN as u64, &mut raw)?;
    let records: Vec<(u64, u64)> = raw
        .chunks_exact(ALLOC_RECORD_LEN)
        .map(|chunk| {
            let rec = bytemuck::pod_read_unaligned::<AllocRec>(chunk);
            (rec.startblock(), rec.startblock() + rec.blockcount())
        })
        .collect();

    let mut left = 0isize;
    let mut right = numrecs as isize - 1;
    let mut first_overlap = None;
    while left <= right {
        let middle = (left + right) / 2;
        let (rec_begin, rec_end) = records[middle as usize];
        if window.0 > rec_end {
            left = middle + 1;
        } else if window.1 < rec_begin {
            right = middle - 1;
        } else {
            first_overlap = Some(middle as usize);
            break;
        }
    }
    let Some(first) = first_overlap else {
        return Ok(());
    };

    for &(rec_begin, rec_end) in &records[first..] {
        if window.0 == window.1 {
            break;
        }

        let sub_begin = window.0.max(rec_begin);
        let sub_end = window.1.min(rec_end);
        if sub_begin >= sub_end {
            // zero-length overlap terminates the sweep
            break;
        }

        trace!(
            target: "xfs",
            "free overlap [{rec_begin}, {rec_end}) yields [{sub_begin}, {sub_end})"
        );
        out.push(Extent {
            file_offset: extent.file_offset + (sub_begin - rb_start),
            start_block: sb.ag_linear_block(agno, sub_begin as u32),
            block_count: sub_end - sub_begin,
            state: ExtentState::Normal,
        });
        window.0 = sub_end;
    }

    Ok(())
}
