use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Default size of the boot-acceleration read-ahead buffer.
pub const DEFAULT_BOOT_ACCEL_BUFFER: usize = 16 * 1024;

/// Attach-time options of one media driver instance.
///
/// Keys are PascalCase to match the attachment configuration they are read from, and every
/// key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase", deny_unknown_fields)]
pub struct MediaConfig {
    /// Image format of the base image.
    pub format: String,

    /// Path of the base image, when the image is file backed.
    pub path: Option<PathBuf>,

    pub read_only: bool,

    /// Refuse writes until the VM powers on. Used while another host still owns the image.
    pub temp_read_only: bool,

    /// The image may be attached to several VMs concurrently.
    pub shareable: bool,

    /// Bandwidth group the container's I/O is accounted to.
    pub bw_group: Option<String>,

    pub boot_acceleration: bool,

    /// Boot-acceleration buffer size in bytes.
    pub boot_acceleration_buffer: usize,

    /// Route request-engine I/O through a block cache.
    pub block_cache: bool,

    /// Accept discard requests.
    pub discard: bool,

    /// Arm a one-shot merge of `merge_source` into `merge_target`.
    pub setup_merge: bool,

    pub merge_source: u32,

    pub merge_target: u32,

    /// Flush the container after this many bytes were written through the synchronous
    /// interface; `0` disables periodic flushing.
    pub flush_interval: u64,

    /// Complete synchronous flushes without touching the container.
    pub ignore_flush: bool,

    /// Complete flush requests without touching the container.
    pub ignore_flush_async: bool,

    /// The image is encrypted and needs keys from the secure key store.
    pub encrypted: bool,

    /// Identifier of the data encryption key in the secure key store.
    pub key_id: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            format: "RAW".to_string(),
            path: None,
            read_only: false,
            temp_read_only: false,
            shareable: false,
            bw_group: None,
            boot_acceleration: false,
            boot_acceleration_buffer: DEFAULT_BOOT_ACCEL_BUFFER,
            block_cache: false,
            discard: false,
            setup_merge: false,
            merge_source: 0,
            merge_target: 0,
            flush_interval: 0,
            ignore_flush: true,
            ignore_flush_async: false,
            encrypted: false,
            key_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ReadOnly and TempReadOnly are mutually exclusive")]
    ReadOnlyAndTempReadOnly,

    #[error("a merge cannot be set up on a read-only medium")]
    MergeOnReadOnly,

    #[error("discard cannot be enabled on a read-only medium")]
    DiscardOnReadOnly,

    #[error("merge source and target are both image {0}")]
    MergeSameImage(u32),

    #[error("boot acceleration needs a non-empty buffer")]
    EmptyBootAccelBuffer,

    #[error("an encrypted medium needs a KeyId")]
    MissingKeyId,
}

impl MediaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_only && self.temp_read_only {
            return Err(ConfigError::ReadOnlyAndTempReadOnly);
        }
        if self.read_only && self.setup_merge {
            return Err(ConfigError::MergeOnReadOnly);
        }
        if self.read_only && self.discard {
            return Err(ConfigError::DiscardOnReadOnly);
        }
        if self.setup_merge && self.merge_source == self.merge_target {
            return Err(ConfigError::MergeSameImage(self.merge_source));
        }
        if self.boot_acceleration && self.boot_acceleration_buffer == 0 {
            return Err(ConfigError::EmptyBootAccelBuffer);
        }
        if self.encrypted && self.key_id.is_none() {
            return Err(ConfigError::MissingKeyId);
        }
        Ok(())
    }

    /// The block cache is not coherent across hosts, skips discards and would hold plaintext
    /// of encrypted images.
    pub fn block_cache_allowed(&self) -> bool {
        self.block_cache && !self.shareable && !self.discard && !self.encrypted
    }

    /// Boot acceleration is never used on shareable media.
    pub fn boot_acceleration_allowed(&self) -> bool {
        self.boot_acceleration && !self.shareable
    }

    /// Merge indices to arm at attach, if any.
    pub fn merge_request(&self) -> Option<(u32, u32)> {
        self.setup_merge
            .then_some((self.merge_source, self.merge_target))
    }
}
