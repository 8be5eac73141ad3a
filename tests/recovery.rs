//! End-to-end recovery scenarios over synthetic XFS images.
//!
//! Each fixture lays out just enough metadata for the walk: a superblock,
//! per-AG AGF/AGI headers, an inode (or free-inode) B+tree leaf, deleted
//! inode slots with inline packed extents, and a free-space-by-block leaf.

use std::ops::ControlFlow;

use xfsalvage::errors::RecoveryError;
use xfsalvage::fs::xfs::XfsFs;

const BLOCK_SIZE: usize = 4096;
const SECTOR_SIZE: usize = 512;
const INODE_SIZE: usize = 512;
const AG_BLOCKS: usize = 1024;
const BTREE_HEADER_LEN: usize = 56;
const INODE_CORE_LEN: usize = 176;

const SB_MAGIC: u32 = 0x5846_5342;
const AGF_MAGIC: u32 = 0x5841_4746;
const AGI_MAGIC: u32 = 0x5841_4749;
const IBT_MAGIC: u32 = 0x4941_4233;
const FIBT_MAGIC: u32 = 0x4649_4233;
const ABTB_MAGIC: u32 = 0x4142_3342;

const RO_COMPAT_FINOBT: u32 = 1 << 0;
const INCOMPAT_SPINODES: u32 = 1 << 1;

const MTIME: u32 = 1_700_000_001;
const ATIME: u32 = 1_700_000_002;
const CTIME: u32 = 1_700_000_003;
const CRTIME: u32 = 1_700_000_004;

struct ImageBuilder {
    data: Vec<u8>,
    ag_count: usize,
}

impl ImageBuilder {
    fn new(ag_count: usize) -> Self {
        ImageBuilder {
            data: vec![0u8; ag_count * AG_BLOCKS * BLOCK_SIZE],
            ag_count,
        }
    }

    fn be16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn be32(&mut self, at: usize, v: u32) {
        self.data[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn be64(&mut self, at: usize, v: u64) {
        self.data[at..at + 8].copy_from_slice(&v.to_be_bytes());
    }

    fn ag_base(ag: usize) -> usize {
        ag * AG_BLOCKS * BLOCK_SIZE
    }

    fn superblock(&mut self, ro_compat: u32, incompat: u32) -> &mut Self {
        self.be32(0, SB_MAGIC);
        self.be32(4, BLOCK_SIZE as u32);
        self.be64(8, (self.ag_count * AG_BLOCKS) as u64);
        self.be32(84, AG_BLOCKS as u32);
        self.be32(88, self.ag_count as u32);
        self.be16(100, 5 | 0x8000);
        self.be16(102, SECTOR_SIZE as u16);
        self.be16(104, INODE_SIZE as u16);
        self.be16(106, (BLOCK_SIZE / INODE_SIZE) as u16);
        self.data[124] = 10; // log2(AG_BLOCKS)
        self.be32(200, 0x0100); // features2: crc
        self.be32(212, ro_compat);
        self.be32(216, incompat);
        self
    }

    fn agf(&mut self, ag: usize, bno_root: u32) -> &mut Self {
        let base = Self::ag_base(ag) + SECTOR_SIZE;
        self.be32(base, AGF_MAGIC);
        self.be32(base + 12, AG_BLOCKS as u32);
        self.be32(base + 16, bno_root);
        self
    }

    fn agi(&mut self, ag: usize, inobt_root: u32, finobt_root: u32) -> &mut Self {
        let base = Self::ag_base(ag) + 2 * SECTOR_SIZE;
        self.be32(base, AGI_MAGIC);
        self.be32(base + 20, inobt_root);
        self.be32(base + 328, finobt_root);
        self
    }

    fn btree_header(&mut self, ag: usize, block: usize, magic: u32, numrecs: u16) -> &mut Self {
        let base = Self::ag_base(ag) + block * BLOCK_SIZE;
        self.be32(base, magic);
        self.be16(base + 4, 0); // leaf
        self.be16(base + 6, numrecs);
        self
    }

    fn inobt_rec(
        &mut self,
        ag: usize,
        block: usize,
        slot: usize,
        startino: u32,
        holemask: u16,
        free: u64,
    ) -> &mut Self {
        let base = Self::ag_base(ag) + block * BLOCK_SIZE + BTREE_HEADER_LEN + slot * 16;
        self.be32(base, startino);
        self.be16(base + 4, holemask);
        self.be64(base + 8, free);
        self
    }

    fn free_rec(&mut self, ag: usize, block: usize, slot: usize, start: u32, count: u32) -> &mut Self {
        let base = Self::ag_base(ag) + block * BLOCK_SIZE + BTREE_HEADER_LEN + slot * 8;
        self.be32(base, start);
        self.be32(base + 4, count);
        self
    }

    /// Writes a deleted-inode core plus packed inline extents at slot
    /// `agino`. `extents` entries are (file offset, start block, count) in
    /// blocks; the start block carries the AG index in its high bits.
    fn deleted_inode(
        &mut self,
        ag: usize,
        agino: usize,
        ino: u64,
        extents: &[(u64, u64, u64)],
    ) -> &mut Self {
        let base = Self::ag_base(ag) + agino * INODE_SIZE;
        self.be16(base, 0x494e);
        self.data[base + 4] = 3; // version
        self.data[base + 5] = 2; // format: extents
        self.be32(base + 32, ATIME);
        self.be32(base + 40, MTIME);
        self.be32(base + 48, CTIME);
        self.be32(base + 144, CRTIME);
        self.be64(base + 152, ino);

        for (slot, &(file_offset, start_block, block_count)) in extents.iter().enumerate() {
            let l0 = ((file_offset & ((1 << 54) - 1)) << 9) | (start_block >> 43);
            let l1 = ((start_block & ((1 << 43) - 1)) << 21) | (block_count & ((1 << 21) - 1));
            let at = base + INODE_CORE_LEN + slot * 16;
            self.be64(at, l0);
            self.be64(at + 8, l1);
        }
        self
    }

    fn fill_blocks(&mut self, ag: usize, start_block: usize, count: usize, byte: u8) -> &mut Self {
        let base = Self::ag_base(ag) + start_block * BLOCK_SIZE;
        self.data[base..base + count * BLOCK_SIZE].fill(byte);
        self
    }

    fn build(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

/// One recovered inode, flattened out of the callback.
#[derive(Debug)]
struct Dumped {
    ino: u64,
    size: u64,
    extents: Vec<(u64, u64)>,
    mtime_secs: i32,
    crtime_secs: i32,
}

fn dump_all(image: &[u8]) -> Vec<Dumped> {
    let fs = XfsFs::open(image).unwrap();
    let mut out = Vec::new();

    fs.dump_inodes(|mut inode| {
        let mut extents = Vec::new();
        while let Some(pair) = inode.next_extent() {
            extents.push(pair);
        }
        out.push(Dumped {
            ino: inode.inode_number(),
            size: inode.size(),
            extents,
            mtime_secs: inode.mac_times().modified.secs,
            crtime_secs: inode.mac_times().created.secs,
        });
        ControlFlow::Continue(())
    })
    .unwrap();

    out
}

#[test]
fn recovers_a_single_extent_file() {
    let image = ImageBuilder::new(1)
        .superblock(0, 0)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 1)
        .inobt_rec(0, 16, 0, 64, 0, 0x1)
        .deleted_inode(0, 64, 64, &[(0, 100, 4)])
        .btree_header(0, 24, ABTB_MAGIC, 1)
        .free_rec(0, 24, 0, 100, 4)
        .fill_blocks(0, 100, 4, 0x5A)
        .build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].ino, 64);
    assert_eq!(dumped[0].size, 16384);
    assert_eq!(dumped[0].extents, vec![(0, 16384)]);
    assert_eq!(dumped[0].mtime_secs, MTIME as i32);
    assert_eq!(dumped[0].crtime_secs, CRTIME as i32);

    // and the content is readable end to end
    let fs = XfsFs::open(image.as_slice()).unwrap();
    fs.dump_inodes(|inode| {
        let mut content = vec![0u8; inode.size() as usize];
        assert_eq!(inode.read(&mut content, 0).unwrap(), 16384);
        assert!(content.iter().all(|&b| b == 0x5A));
        ControlFlow::Continue(())
    })
    .unwrap();
}

#[test]
fn rejects_an_inode_whose_file_start_was_overwritten() {
    // free space only covers the tail of the extent, so no surviving
    // sub-extent reaches file offset 0
    let image = ImageBuilder::new(1)
        .superblock(0, 0)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 1)
        .inobt_rec(0, 16, 0, 64, 0, 0x1)
        .deleted_inode(0, 64, 64, &[(0, 100, 4)])
        .btree_header(0, 24, ABTB_MAGIC, 1)
        .free_rec(0, 24, 0, 102, 2)
        .build();

    assert!(dump_all(&image).is_empty());
}

#[test]
fn splits_an_extent_across_two_free_records() {
    let image = ImageBuilder::new(1)
        .superblock(0, 0)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 1)
        .inobt_rec(0, 16, 0, 64, 0, 0x1)
        .deleted_inode(0, 64, 64, &[(0, 100, 10)])
        .btree_header(0, 24, ABTB_MAGIC, 2)
        .free_rec(0, 24, 0, 100, 3)
        .free_rec(0, 24, 1, 105, 4)
        .fill_blocks(0, 100, 3, 0x11)
        .fill_blocks(0, 105, 4, 0x22)
        .build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].size, 7 * 4096);
    assert_eq!(dumped[0].extents, vec![(0, 12288), (20480, 16384)]);

    let fs = XfsFs::open(image.as_slice()).unwrap();
    fs.dump_inodes(|inode| {
        let mut head = vec![0u8; 12288];
        assert_eq!(inode.read(&mut head, 0).unwrap(), 12288);
        assert!(head.iter().all(|&b| b == 0x11));

        let mut tail = vec![0u8; 16384];
        assert_eq!(inode.read(&mut tail, 20480).unwrap(), 16384);
        assert!(tail.iter().all(|&b| b == 0x22));

        // reading across the hole stops at the hole
        let mut whole = vec![0u8; 7 * 4096];
        assert_eq!(inode.read(&mut whole, 0).unwrap(), 12288);
        ControlFlow::Continue(())
    })
    .unwrap();
}

#[test]
fn sparse_chunks_skip_the_holed_slots() {
    // hole mask bit 0 voids slots 64..=67; slot 64 holds a perfectly
    // recoverable inode that must never be attempted
    let image = ImageBuilder::new(1)
        .superblock(0, INCOMPAT_SPINODES)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 1)
        .inobt_rec(0, 16, 0, 64, 0b1, u64::MAX)
        .deleted_inode(0, 64, 64, &[(0, 100, 1)])
        .deleted_inode(0, 68, 68, &[(0, 104, 1)])
        .btree_header(0, 24, ABTB_MAGIC, 2)
        .free_rec(0, 24, 0, 100, 1)
        .free_rec(0, 24, 1, 104, 1)
        .build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].ino, 68);
}

#[test]
fn an_unknown_superblock_version_fails_open() {
    let mut builder = ImageBuilder::new(1);
    builder.superblock(0, 0);
    builder.be16(100, 7);
    let image = builder.build();

    let err = XfsFs::open(image.as_slice()).unwrap_err();
    assert!(matches!(
        err,
        RecoveryError::Validation {
            component: "superblock",
            reason: "unknown version"
        }
    ));
}

#[test]
fn a_stopping_callback_ends_the_dump_early() {
    let mut builder = ImageBuilder::new(1);
    builder
        .superblock(0, 0)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 1)
        .inobt_rec(0, 16, 0, 64, 0, 0x3ff)
        .btree_header(0, 24, ABTB_MAGIC, 1)
        .free_rec(0, 24, 0, 100, 40);
    for k in 0..10u64 {
        builder.deleted_inode(0, 64 + k as usize, 64 + k, &[(0, 100 + 4 * k, 4)]);
    }
    let image = builder.build();

    let fs = XfsFs::open(image.as_slice()).unwrap();
    let mut seen = 0usize;
    fs.dump_inodes(|_| {
        seen += 1;
        if seen == 3 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .unwrap();

    assert_eq!(seen, 3);
}

#[test]
fn prefers_the_free_inode_btree_when_present() {
    // the all-inode root is left dangling on purpose: with FINOBT set it
    // must never be read
    let image = ImageBuilder::new(1)
        .superblock(RO_COMPAT_FINOBT, 0)
        .agf(0, 24)
        .agi(0, 0, 20)
        .btree_header(0, 20, FIBT_MAGIC, 1)
        .inobt_rec(0, 20, 0, 64, 0, 0x1)
        .deleted_inode(0, 64, 64, &[(0, 100, 4)])
        .btree_header(0, 24, ABTB_MAGIC, 1)
        .free_rec(0, 24, 0, 100, 4)
        .build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].ino, 64);
}

#[test]
fn recovers_from_a_second_allocation_group() {
    let image = ImageBuilder::new(2)
        .superblock(0, 0)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 0)
        .btree_header(0, 24, ABTB_MAGIC, 0)
        .agf(1, 24)
        .agi(1, 16, 0)
        .btree_header(1, 16, IBT_MAGIC, 1)
        .inobt_rec(1, 16, 0, 64, 0, 0x1)
        .deleted_inode(1, 64, 9999, &[(0, (1 << 10) | 100, 4)])
        .btree_header(1, 24, ABTB_MAGIC, 1)
        .free_rec(1, 24, 0, 100, 4)
        .fill_blocks(1, 100, 4, 0x77)
        .build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].ino, 9999);
    assert_eq!(dumped[0].extents, vec![(0, 16384)]);

    // content comes back from the absolute position past the AG boundary
    let fs = XfsFs::open(image.as_slice()).unwrap();
    fs.dump_inodes(|inode| {
        let mut content = vec![0u8; 16384];
        assert_eq!(inode.read(&mut content, 0).unwrap(), 16384);
        assert!(content.iter().all(|&b| b == 0x77));
        ControlFlow::Continue(())
    })
    .unwrap();
}

#[test]
fn a_broken_ag_does_not_stop_the_others() {
    // AG 0 has no valid AGF at all; AG 1 still dumps
    let image = ImageBuilder::new(2)
        .superblock(0, 0)
        .agf(1, 24)
        .agi(1, 16, 0)
        .btree_header(1, 16, IBT_MAGIC, 1)
        .inobt_rec(1, 16, 0, 64, 0, 0x1)
        .deleted_inode(1, 64, 9999, &[(0, (1 << 10) | 100, 4)])
        .btree_header(1, 24, ABTB_MAGIC, 1)
        .free_rec(1, 24, 0, 100, 4)
        .build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].ino, 9999);
}

#[test]
fn unwritten_and_overlong_extents_never_surface() {
    // slot carries one unwritten extent, one past the data area, and one
    // good extent; only the good one survives
    let unwritten_l0_flag = 1u64 << 63;
    let mut builder = ImageBuilder::new(1);
    builder
        .superblock(0, 0)
        .agf(0, 24)
        .agi(0, 16, 0)
        .btree_header(0, 16, IBT_MAGIC, 1)
        .inobt_rec(0, 16, 0, 64, 0, 0x1)
        .deleted_inode(0, 64, 64, &[(0, 100, 4), (8, 2000, 4)])
        .btree_header(0, 24, ABTB_MAGIC, 1)
        .free_rec(0, 24, 0, 100, 40);
    // hand-pack an unwritten extent into the third record slot
    let base = 64 * INODE_SIZE + INODE_CORE_LEN + 2 * 16;
    let l0 = unwritten_l0_flag | ((4u64 & ((1 << 54) - 1)) << 9);
    let l1 = (120u64 << 21) | 4;
    builder.be64(base, l0);
    builder.be64(base + 8, l1);
    let image = builder.build();

    let dumped = dump_all(&image);
    assert_eq!(dumped.len(), 1);
    // 2000 + 4 > 1024 data blocks, and the unwritten extent is dropped
    assert_eq!(dumped[0].extents, vec![(0, 16384)]);
}
