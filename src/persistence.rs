//! Durable snapshots of channel state.
//!
//! Every accepted state transition is written through the [Store] before the
//! peer observes our acceptance; at startup [Store::load_all] rebuilds the
//! registry. The bundled [FileStore] keeps one bincode-encoded record per
//! channel and makes single-key writes atomic with a temp-file rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uint::hex::{FromHex, ToHex};

use crate::channel::{Address, ChannelId, Params, PartIdx, Phase, Signature, State};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence not enabled")]
    NotEnabled,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}

/// Durable encoding of one channel, keyed by its id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub params: Params,
    pub state: State,
    pub signatures: Vec<Option<Signature>>,
    pub phase: Phase,
    pub part_idx: PartIdx,
    pub peer: Address,
}

/// Key-value backing store for channel records.
///
/// `save` must be atomic per key; per-key write ordering is guaranteed by the
/// callers, which hold the channel's sequence point while saving.
pub trait Store: Send + Sync + std::fmt::Debug + 'static {
    fn save(&self, id: ChannelId, record: &PersistedRecord) -> Result<(), PersistenceError>;

    /// Full scan, used once at startup.
    fn load_all(&self) -> Result<Vec<(ChannelId, PersistedRecord)>, PersistenceError>;

    fn delete(&self, id: ChannelId) -> Result<(), PersistenceError>;
}

const RECORD_EXT: &str = "chan";

/// One file per channel under a directory, written via temp file + rename so
/// a crash mid-write never corrupts the previous record.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: ChannelId) -> PathBuf {
        let name: String = id.0.encode_hex();
        self.dir.join(format!("{name}.{RECORD_EXT}"))
    }
}

impl Store for FileStore {
    fn save(&self, id: ChannelId, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let bytes = bincode::serialize(record)?;
        let path = self.record_path(id);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(ChannelId, PersistedRecord)>, PersistenceError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(id) = channel_id_from_path(&path) else {
                warn!(?path, "skipping record with malformed file name");
                continue;
            };
            let bytes = fs::read(&path)?;
            let record: PersistedRecord = bincode::deserialize(&bytes)?;
            records.push((id, record));
        }
        Ok(records)
    }

    fn delete(&self, id: ChannelId) -> Result<(), PersistenceError> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn channel_id_from_path(path: &Path) -> Option<ChannelId> {
    let stem = path.file_stem()?.to_str()?;
    <[u8; 32]>::from_hex(stem).ok().map(ChannelId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Asset;

    fn test_record(nonce: u64, version_bump: bool) -> (ChannelId, PersistedRecord) {
        let params = Params {
            challenge_duration: 60,
            nonce: nonce.into(),
            participants: vec![Address([1; 20]), Address([2; 20])],
            assets: vec![Asset::default()],
        };
        let mut state = State::new(&params, vec![vec![100.into(), 100.into()]]);
        if version_bump {
            state = state.make_next();
            state.balances = vec![vec![99.into(), 101.into()]];
        }
        let id = params.channel_id();
        let record = PersistedRecord {
            params,
            state,
            signatures: vec![Some(Signature([9; 65])), None],
            phase: Phase::Active,
            part_idx: 0,
            peer: Address([2; 20]),
        };
        (id, record)
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (id_a, record_a) = test_record(1, false);
        let (id_b, record_b) = test_record(2, true);
        store.save(id_a, &record_a).unwrap();
        store.save(id_b, &record_b).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by_key(|(id, _)| id.0);
        let mut expected = vec![(id_a, record_a), (id_b, record_b)];
        expected.sort_by_key(|(id, _)| id.0);
        assert_eq!(loaded, expected);
    }

    #[test]
    fn save_overwrites_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (id, old) = test_record(1, false);
        let (_, new) = test_record(1, true);
        store.save(id, &old).unwrap();
        store.save(id, &new).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.state.version(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (id, record) = test_record(1, false);
        store.save(id, &record).unwrap();
        store.delete(id).unwrap();
        store.delete(id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
