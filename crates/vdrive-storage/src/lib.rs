//! Byte-addressed storage primitives used by the vdrive media driver.
//!
//! The media driver works on whole virtual disks, while host storage is a resizable byte store.
//! This crate provides the pieces in between:
//!
//! - [`StorageBackend`]: resizable byte store ([`MemBackend`], [`StdFileBackend`])
//! - [`VirtualDisk`]: fixed-capacity, byte-addressed disk
//! - [`RawDisk`]: maps a backend 1:1 onto a disk (raw images)
//! - [`ByteRange`]: half-open byte range, used for discard requests
//!
//! Image formats, caching and request tracking live in `vdrive-media`.

mod backend;
mod disk;
mod error;
mod range;
mod util;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use disk::{RawDisk, VirtualDisk};
pub use error::{DiskError, Result};
pub use range::ByteRange;
pub use util::checked_range;

#[cfg(test)]
mod proptests;
