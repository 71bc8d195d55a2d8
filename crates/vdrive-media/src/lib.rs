//! Media driver for vdrive virtual disks.
//!
//! A [`MediaDriver`] sits between a virtual storage controller and the disk container of one
//! attached medium. It offers two interfaces:
//!
//! - the request engine (`io_req_*`): controller-allocated requests identified by an ID,
//!   tracked through a lock-free lifecycle, dispatched to the container or a [`BlockCache`],
//!   cancelable by ID, and completed exactly once through the controller's [`MediaExPort`];
//! - a synchronous interface for BIOS-style callers, fronted by the boot-acceleration
//!   read-ahead buffer.
//!
//! Image merges are serialized against both through a reader/writer gate.
//!
//! Containers are consumed through [`DiskContainer`]. [`DiskImage`] adapts any
//! `vdrive_storage::VirtualDisk`; [`EndpointImage`] adapts a completion-based
//! [`AsyncEndpoint`] such as the tokio-backed [`BackendEndpoint`].

mod adapter;
mod block_cache;
mod boot_accel;
mod buffer;
mod config;
mod container;
mod driver;
mod endpoint;
mod error;
mod keys;
mod merge;
mod port;
mod registry;
mod request;
mod state;

pub use block_cache::{
    BlockCache, BlockCacheStats, LruBlockCache, DEFAULT_CACHE_BLOCKS, DEFAULT_CACHE_BLOCK_SIZE,
};
pub use buffer::{AllocError, BufferPolicy, IoBufAllocator, IoBuffer, PAGE_SIZE};
pub use config::{ConfigError, MediaConfig, DEFAULT_BOOT_ACCEL_BUFFER};
pub use container::{AsyncIo, DiskContainer, DiskImage, DiskResult, IoCompletion, IoOutcome};
pub use driver::{IoStatus, MediaDriver, MediaDriverBuilder};
pub use endpoint::{
    open_raw_file, AsyncEndpoint, BackendEndpoint, EndpointImage, EndpointOp, EndpointStorage,
};
pub use error::{MediaError, Result};
pub use keys::{MemKeyStore, SecKeyHelper, SecKeyStore};
pub use port::MediaExPort;
pub use registry::REQ_BINS;
pub use request::{IoReqFlags, IoReqHandle, IoReqKind};
pub use state::ReqState;
