//! Reference-counted record of what this node has mounted.
//!
//! Every `(volume id, target path)` pair gets its own async lock so that
//! publish and unpublish for one target are linearized while unrelated
//! targets proceed in parallel. Slots are pruned once they are empty and
//! nobody else is waiting on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::credentials::KeyFile;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountKey {
    pub volume_id: String,
    pub target_path: PathBuf,
}

impl MountKey {
    pub fn new(volume_id: impl Into<String>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            volume_id: volume_id.into(),
            target_path: target_path.into(),
        }
    }
}

/// A live mount and the credentials it was made with.
#[derive(Debug)]
pub struct MountEntry {
    pub bucket: String,
    pub target_path: PathBuf,
    pub ref_count: u32,
    pub flags: Vec<String>,
    pub read_only: bool,
    pub key_file: KeyFile,
}

type Slot = Arc<tokio::sync::Mutex<Option<MountEntry>>>;

#[derive(Debug, Default)]
pub struct MountTable {
    slots: Mutex<HashMap<MountKey, Slot>>,
    active: AtomicUsize,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<MountKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: MountKey) -> MountGuard<'_> {
        let slot = self.slots().entry(key.clone()).or_default().clone();
        let guard = slot.lock_owned().await;
        MountGuard {
            table: self,
            key,
            guard: Some(guard),
        }
    }

    /// Reference count for a target, zero when it is not tracked.
    pub async fn ref_count(&self, volume_id: &str, target_path: &Path) -> u32 {
        self.lock(MountKey::new(volume_id, target_path))
            .await
            .entry()
            .map(|e| e.ref_count)
            .unwrap_or(0)
    }

    /// Number of live entries.
    pub fn active_mounts(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of keys currently holding a slot, live or locked.
    pub fn tracked(&self) -> usize {
        self.slots().len()
    }

    fn release(&self, key: &MountKey) {
        let mut slots = self.slots();
        let idle = slots.get(key).is_some_and(|slot| {
            // Only the map holds it, so nobody can be waiting
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|entry| entry.is_none())
        });
        if idle {
            slots.remove(key);
        }
    }
}

/// Exclusive access to one mount table slot.
pub struct MountGuard<'a> {
    table: &'a MountTable,
    key: MountKey,
    guard: Option<OwnedMutexGuard<Option<MountEntry>>>,
}

impl MountGuard<'_> {
    pub fn key(&self) -> &MountKey {
        &self.key
    }

    pub fn entry(&self) -> Option<&MountEntry> {
        self.guard.as_ref().and_then(|g| g.as_ref())
    }

    pub fn entry_mut(&mut self) -> Option<&mut MountEntry> {
        self.guard.as_mut().and_then(|g| g.as_mut())
    }

    pub fn insert(&mut self, entry: MountEntry) {
        if let Some(guard) = self.guard.as_mut()
            && guard.replace(entry).is_none()
        {
            self.table.active.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn take(&mut self) -> Option<MountEntry> {
        let entry = self.guard.as_mut().and_then(|g| g.take());
        if entry.is_some() {
            self.table.active.fetch_sub(1, Ordering::Relaxed);
        }
        entry
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let empty = guard.is_none();
            drop(guard);
            if empty {
                self.table.release(&self.key);
            }
        }
    }
}
