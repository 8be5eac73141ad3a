//! Recovery of recently deleted files from XFS filesystem images.
//!
//! XFS does not scrub an inode when it is deleted: the inode core keeps its
//! magic and timestamps, and the inline extent array keeps pointing at the
//! blocks the file used to own. This crate walks the allocation-group
//! metadata of an XFS v5 image, picks up every inode slot marked free whose
//! core still carries the deleted-file signature, rebuilds its extent list
//! and keeps only the sub-ranges that are still marked free in the
//! allocation group's free-space B+tree. Anything re-allocated since the
//! deletion is presumed overwritten.
//!
//! The entry point is [`fs::xfs::XfsFs`]: open it over any
//! [`dev::BlockDevice`] and drive [`fs::xfs::XfsFs::dump_inodes`] with a
//! callback. Each invocation hands over a [`fs::xfs::RecoveredInode`]
//! carrying the inode number, MAC times, the recoverable size and a
//! positioned read over the surviving content.
//!
//! Deleted inodes do not retain names; recovery is anonymous by design.

pub mod dev;
pub mod errors;
pub mod fs;
