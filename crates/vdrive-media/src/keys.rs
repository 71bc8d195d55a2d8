use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::{MediaError, Result};

/// Secure key store consulted for encrypted images.
///
/// Every successful retain must be paired with a release of the same identifier.
pub trait SecKeyStore: Send + Sync {
    fn key_retain(&self, id: &str) -> Result<Arc<Zeroizing<Vec<u8>>>>;

    fn key_release(&self, id: &str) -> Result<()>;

    fn password_retain(&self, id: &str) -> Result<Arc<Zeroizing<String>>>;

    fn password_release(&self, id: &str) -> Result<()>;
}

/// Notified when encrypted I/O is attempted without a key store.
pub trait SecKeyHelper: Send + Sync {
    fn key_missing_notify(&self);
}

struct KeyEntry {
    key: Arc<Zeroizing<Vec<u8>>>,
    password: Option<Arc<Zeroizing<String>>>,
    refs: u32,
}

/// In-memory key store with per-identifier reference counts.
#[derive(Default)]
pub struct MemKeyStore {
    entries: Mutex<HashMap<String, KeyEntry>>,
}

impl MemKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, id: &str, key: Vec<u8>, password: Option<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            id.to_string(),
            KeyEntry {
                key: Arc::new(Zeroizing::new(key)),
                password: password.map(|p| Arc::new(Zeroizing::new(p))),
                refs: 0,
            },
        );
    }

    /// Drops a key nobody holds any more.
    pub fn remove_key(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(id) {
            None => Err(MediaError::KeyNotFound(id.to_string())),
            Some(entry) if entry.refs > 0 => Err(MediaError::KeyBusy(id.to_string())),
            Some(_) => {
                entries.remove(id);
                Ok(())
            }
        }
    }

    pub fn refs(&self, id: &str) -> u32 {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(id).map_or(0, |entry| entry.refs)
    }

    fn with_entry<R>(&self, id: &str, f: impl FnOnce(&mut KeyEntry) -> Result<R>) -> Result<R> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| MediaError::KeyNotFound(id.to_string()))?;
        f(entry)
    }

    fn release(entry: &mut KeyEntry, id: &str) -> Result<()> {
        entry.refs = entry
            .refs
            .checked_sub(1)
            .ok_or(MediaError::InvalidState("key released more often than retained"))
            .inspect_err(|_| tracing::warn!(id, "unbalanced key release"))?;
        Ok(())
    }
}

impl SecKeyStore for MemKeyStore {
    fn key_retain(&self, id: &str) -> Result<Arc<Zeroizing<Vec<u8>>>> {
        self.with_entry(id, |entry| {
            entry.refs += 1;
            Ok(Arc::clone(&entry.key))
        })
    }

    fn key_release(&self, id: &str) -> Result<()> {
        self.with_entry(id, |entry| Self::release(entry, id))
    }

    fn password_retain(&self, id: &str) -> Result<Arc<Zeroizing<String>>> {
        self.with_entry(id, |entry| {
            let password = entry
                .password
                .clone()
                .ok_or_else(|| MediaError::KeyNotFound(id.to_string()))?;
            entry.refs += 1;
            Ok(password)
        })
    }

    fn password_release(&self, id: &str) -> Result<()> {
        self.with_entry(id, |entry| Self::release(entry, id))
    }
}
