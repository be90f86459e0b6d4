//! The concurrent-safe mapping from channel id to channel handle.
//!
//! The registry is the single source of truth for which channels exist in
//! this process. Insertion is conflict-checked: two concurrent proposals that
//! resolve to the same channel id produce exactly one registered handle, the
//! loser observes [Error::Conflict].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::channel::{ChannelHandle, ChannelId};
use crate::error::Error;

#[derive(Debug, Default)]
pub struct Registry {
    channels: RwLock<HashMap<ChannelId, Arc<ChannelHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a handle atomically.
    ///
    /// Fails with [Error::Conflict] if a handle for the same id is already
    /// present, unless `recovery` is set (startup restore may legitimately
    /// replace a handle it just reconstructed).
    pub fn register(&self, handle: Arc<ChannelHandle>, recovery: bool) -> Result<(), Error> {
        let id = handle.id();
        let mut channels = self.write();
        match channels.entry(id) {
            Entry::Occupied(mut entry) => {
                if !recovery {
                    return Err(Error::Conflict(id));
                }
                entry.insert(handle);
                debug!(?id, "re-registered recovered channel");
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                debug!(?id, "registered channel");
                Ok(())
            }
        }
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        self.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        let removed = self.write().remove(&id);
        if removed.is_some() {
            debug!(?id, "removed channel");
        }
        removed
    }

    /// Snapshot of all registered handles, for restore and shutdown. The read
    /// lock is only held while cloning the `Arc`s out, so iterating the
    /// result cannot deadlock with concurrent register/remove.
    pub fn list(&self) -> Vec<Arc<ChannelHandle>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ChannelId, Arc<ChannelHandle>>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ChannelId, Arc<ChannelHandle>>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Address, Asset, Params, Phase, State};

    fn test_handle(nonce: u64) -> Arc<ChannelHandle> {
        let params = Params {
            challenge_duration: 60,
            nonce: nonce.into(),
            participants: vec![Address([1; 20]), Address([2; 20])],
            assets: vec![Asset::default()],
        };
        let state = State::new(&params, vec![vec![100.into(), 100.into()]]);
        Arc::new(ChannelHandle::new(
            params,
            0,
            Address([2; 20]),
            state,
            Phase::Active,
        ))
    }

    #[test]
    fn register_get_remove() {
        let registry = Registry::new();
        let handle = test_handle(1);
        let id = handle.id();

        registry.register(handle.clone(), false).unwrap();
        assert!(registry.get(id).is_some());
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn second_registration_conflicts() {
        let registry = Registry::new();
        let handle = test_handle(1);
        let id = handle.id();

        registry.register(handle.clone(), false).unwrap();
        let err = registry.register(test_handle(1), false).unwrap_err();
        assert!(matches!(err, Error::Conflict(conflict) if conflict == id));

        // The recovery path may replace the handle.
        registry.register(test_handle(1), true).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_registration_has_exactly_one_winner() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(std::thread::spawn(move || {
                registry.register(test_handle(1), false).is_ok()
            }));
        }
        let wins: usize = tasks
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_snapshots_all_handles() {
        let registry = Registry::new();
        registry.register(test_handle(1), false).unwrap();
        registry.register(test_handle(2), false).unwrap();

        let snapshot = registry.list();
        assert_eq!(snapshot.len(), 2);
        // Mutating while holding the snapshot must not deadlock.
        registry.remove(snapshot[0].id());
        assert_eq!(registry.len(), 1);
    }
}
