//! In-memory key/value store behind the log.
//!
//! Everything durable lives in the WAL; this map is the applied state and is
//! rebuilt from the log at startup.

use std::collections::HashMap;

use keel_repl::{CommandApplier, StreamDecoder};
use keel_storage::{Position, ReplayReader};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Shared in-memory store.
#[derive(Debug, Default)]
pub struct KvStore {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Rebuilds state by replaying the WAL from the beginning.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read. Torn or corrupt records
    /// stop the replay at the last valid prefix.
    pub fn recover(&self, reader: ReplayReader) -> Result<Position, keel_storage::WalError> {
        let mut decoder = StreamDecoder::new();
        let mut count = 0usize;
        let mut position = Position::ZERO;
        for record in reader {
            let (pos, payload) = record?;
            decoder.feed(&payload);
            while let Some(decoded) = decoder
                .next()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
            {
                self.apply(&decoded.argv);
                count += 1;
            }
            position = pos;
        }
        info!(count, "recovered state from WAL");
        Ok(position)
    }
}

impl CommandApplier for KvStore {
    fn apply(&self, argv: &[Vec<u8>]) {
        let Some(command) = argv.first() else {
            return;
        };
        match command.to_ascii_lowercase().as_slice() {
            b"set" if argv.len() == 3 => {
                self.map.write().insert(argv[1].clone(), argv[2].clone());
            }
            b"del" if argv.len() == 2 => {
                self.map.write().remove(&argv[1]);
            }
            other => {
                warn!(command = %String::from_utf8_lossy(other), "unknown command in log, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_repl::protocol::encode_command;
    use keel_storage::{WalConfig, WalStore};
    use tempfile::TempDir;

    #[test]
    fn test_set_get_del() {
        let kv = KvStore::new();
        kv.apply(&[b"set".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert_eq!(kv.get(b"k"), Some(b"v".to_vec()));
        kv.apply(&[b"del".to_vec(), b"k".to_vec()]);
        assert_eq!(kv.get(b"k"), None);
    }

    #[test]
    fn test_unknown_command_skipped() {
        let kv = KvStore::new();
        kv.apply(&[b"bogus".to_vec()]);
        assert!(kv.is_empty());
    }

    #[test]
    fn test_recover_from_wal() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = WalStore::open(WalConfig::new(temp_dir.path())).unwrap();
        store.append(&encode_command(&[b"set", b"a", b"1"])).unwrap();
        store.append(&encode_command(&[b"set", b"b", b"2"])).unwrap();
        store.append(&encode_command(&[b"del", b"a"])).unwrap();

        let kv = KvStore::new();
        kv.recover(store.open_for_replay(Position::ZERO).unwrap())
            .unwrap();
        assert_eq!(kv.get(b"a"), None);
        assert_eq!(kv.get(b"b"), Some(b"2".to_vec()));
    }
}
