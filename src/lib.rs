//! Virtual disk media driver.
//!
//! [`media`] holds the request engine and synchronous media interface; [`storage`] the byte
//! stores and disks it runs on.

pub use vdrive_media as media;
pub use vdrive_storage as storage;
