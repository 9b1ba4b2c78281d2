//! Persistence Module
//!
//! Durability for ledgerkv comes from a single append-only file. Each
//! successful SET or DEL is written to it before the store changes, and
//! [`restore`] replays the file into an empty store at startup.
//!
//! EXPIRE is never logged, so a restart forgets every TTL.

pub mod aof;

pub use aof::{Aof, AofError, AofFsync, Record, Replay};

use crate::storage::StorageEngine;
use tracing::{info, warn};

/// Outcome of replaying the append-only file at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records read from the file
    pub records: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Records with a verb other than SET or DEL
    pub skipped: u64,
}

/// Replays every record of `aof` into `storage`, in file order.
///
/// SET and DEL are applied directly to the store, never re-appended. Records
/// with any other verb are skipped with a warning. A SET or DEL without
/// enough arguments, or a file that cannot be decoded, aborts the restore.
pub fn restore(aof: &mut Aof, storage: &StorageEngine) -> Result<ReplaySummary, AofError> {
    let mut summary = ReplaySummary::default();

    for record in aof.replay()? {
        let Record { offset, command } = record?;
        summary.records += 1;

        if command.is("SET") {
            let [_, key, value, ..] = command.args() else {
                return Err(invalid_arity(offset, "SET", command.len()));
            };
            storage.set(key.clone(), value.clone());
            summary.sets += 1;
        } else if command.is("DEL") {
            let [_, key, ..] = command.args() else {
                return Err(invalid_arity(offset, "DEL", command.len()));
            };
            storage.delete(key);
            summary.deletes += 1;
        } else {
            warn!(offset, command = %command, "Skipping unrecognized AOF record");
            summary.skipped += 1;
        }
    }

    info!(
        path = %aof.path().display(),
        records = summary.records,
        keys = storage.len(),
        "AOF replay complete"
    );

    Ok(summary)
}

fn invalid_arity(offset: u64, verb: &str, len: usize) -> AofError {
    AofError::InvalidRecord {
        offset,
        reason: format!("{} record has {} arguments", verb, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use bytes::Bytes;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "ledgerkv_restore_{}_{}.aof",
            std::process::id(),
            n
        ))
    }

    #[test]
    fn test_restore_rebuilds_state() {
        let path = temp_path();
        {
            let aof = Aof::open(&path, AofFsync::No).unwrap();
            for args in [
                &["SET", "a", "1"][..],
                &["SET", "a", "2"][..],
                &["DEL", "b"][..],
                &["set", "b", "3"][..],
                &["SET", "gone", "x"][..],
                &["del", "gone"][..],
            ] {
                aof.append(&Command::from_strs(args)).unwrap();
            }
        }

        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        let len_before = aof.len();
        let storage = StorageEngine::new();
        let summary = restore(&mut aof, &storage).unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                records: 6,
                sets: 4,
                deletes: 2,
                skipped: 0
            }
        );
        assert_eq!(storage.get(&Bytes::from("a")), Some(Bytes::from("2")));
        assert_eq!(storage.get(&Bytes::from("b")), Some(Bytes::from("3")));
        assert!(storage.get(&Bytes::from("gone")).is_none());
        assert_eq!(storage.len(), 2);

        // Nothing was written back during replay
        assert_eq!(aof.len(), len_before);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_restore_empty_file() {
        let path = temp_path();
        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        let storage = StorageEngine::new();

        let summary = restore(&mut aof, &storage).unwrap();
        assert_eq!(summary, ReplaySummary::default());
        assert!(storage.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_restore_skips_unknown_verbs() {
        let path = temp_path();
        {
            let aof = Aof::open(&path, AofFsync::No).unwrap();
            aof.append(&Command::from_strs(&["SET", "k", "v"])).unwrap();
            aof.append(&Command::from_strs(&["FLUSHALL"])).unwrap();
            aof.append(&Command::new(Vec::new())).unwrap();
        }

        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        let storage = StorageEngine::new();
        let summary = restore(&mut aof, &storage).unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(storage.get(&Bytes::from("k")), Some(Bytes::from("v")));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_restore_rejects_short_set() {
        let path = temp_path();
        fs::write(&path, b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n").unwrap();

        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        let storage = StorageEngine::new();
        let result = restore(&mut aof, &storage);

        assert!(matches!(
            result,
            Err(AofError::InvalidRecord { offset: 0, .. })
        ));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_restore_fails_on_truncated_tail() {
        let path = temp_path();
        fs::write(&path, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nDE").unwrap();

        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        let storage = StorageEngine::new();
        let result = restore(&mut aof, &storage);

        assert!(matches!(result, Err(AofError::Truncated { offset: 27 })));

        let _ = fs::remove_file(&path);
    }
}
