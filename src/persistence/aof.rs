//! AOF (Append Only File) persistence.
//!
//! Every mutating command is logged to the file in array-of-bulk-strings
//! form, the same framing clients use. At startup the file is read back front
//! to back with the regular command decoder and replayed into the store.
//!
//! # Fsync Policies
//!
//! - **Always**: Fsync after every record (safest, slowest)
//! - **EverySec**: Fsync at most once per second, checked on append
//! - **No**: Let the OS handle fsyncing (fastest). A record is still handed
//!   to the OS before the client sees its reply.

use crate::protocol::types::prefix;
use crate::protocol::{parse_command, Command, ParseError};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Size of each read while replaying
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Errors raised by the append-only file.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("AOF I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be decoded
    #[error("corrupt AOF record at offset {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: ParseError,
    },

    /// The file ends in the middle of a record
    #[error("AOF truncated: incomplete record at offset {offset}")]
    Truncated { offset: u64 },

    /// A record decoded fine but cannot be applied
    #[error("invalid AOF record at offset {offset}: {reason}")]
    InvalidRecord { offset: u64, reason: String },

    /// A failed record could not be removed from the file, so nothing more
    /// can safely be appended after it
    #[error("AOF is unusable after a failed rollback at offset {offset}, restart required")]
    Poisoned { offset: u64 },
}

/// AOF fsync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AofFsync {
    /// Fsync after every record
    Always,
    /// Fsync once per second
    #[value(name = "everysec")]
    EverySec,
    /// Never explicitly fsync (let the OS decide)
    #[default]
    No,
}

impl fmt::Display for AofFsync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AofFsync::Always => "always",
            AofFsync::EverySec => "everysec",
            AofFsync::No => "no",
        };
        f.write_str(name)
    }
}

/// The file handle and fsync bookkeeping, guarded by the [`Aof`] mutex.
#[derive(Debug)]
struct AofWriter {
    file: File,
    fsync_policy: AofFsync,
    last_fsync: Instant,
    needs_fsync: bool,
    /// Length of the file, i.e. the offset the next record lands at
    len: u64,
    /// Set when a failed record could not be rolled back
    poisoned: bool,
}

impl AofWriter {
    /// Writes one record and fsyncs it according to the policy.
    ///
    /// On error the record is cut back out of the file, so a record is
    /// either fully logged and reported as such, or not in the file at all.
    fn write_record(&mut self, record: &[u8]) -> Result<(), AofError> {
        if self.poisoned {
            return Err(AofError::Poisoned { offset: self.len });
        }

        if let Err(e) = self.write_and_sync(record) {
            self.rollback();
            return Err(e.into());
        }

        self.len += record.len() as u64;
        Ok(())
    }

    fn write_and_sync(&mut self, record: &[u8]) -> io::Result<()> {
        self.file.write_all(record)?;
        self.needs_fsync = true;

        match self.fsync_policy {
            AofFsync::Always => self.fsync(),
            AofFsync::EverySec => {
                if self.last_fsync.elapsed() >= Duration::from_secs(1) {
                    self.fsync()
                } else {
                    Ok(())
                }
            }
            AofFsync::No => Ok(()),
        }
    }

    /// Truncates the file back to the end of the last good record.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len) {
            // Whatever is past `len` now would corrupt every later record
            error!(
                error = %e,
                offset = self.len,
                "Failed to roll back AOF record, refusing further appends"
            );
            self.poisoned = true;
        }
    }

    fn fsync(&mut self) -> io::Result<()> {
        if self.needs_fsync {
            self.file.sync_data()?;
            self.last_fsync = Instant::now();
            self.needs_fsync = false;
        }
        Ok(())
    }
}

/// The append-only file.
///
/// Appends are serialized by an internal mutex, so an `Aof` can be shared
/// behind an `Arc` by every connection. Replay needs `&mut self`, which
/// rules out a concurrent append at compile time.
///
/// # Example
///
/// ```no_run
/// use ledgerkv::persistence::{Aof, AofFsync};
/// use ledgerkv::protocol::Command;
///
/// let mut aof = Aof::open("database.aof", AofFsync::No)?;
/// for record in aof.replay()? {
///     println!("{}", record?.command);
/// }
///
/// aof.append(&Command::from_strs(&["SET", "name", "Ariz"]))?;
/// # Ok::<(), ledgerkv::persistence::AofError>(())
/// ```
#[derive(Debug)]
pub struct Aof {
    path: PathBuf,
    writer: Mutex<AofWriter>,
}

impl Aof {
    /// Opens the file for reading and appending, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P, fsync_policy: AofFsync) -> Result<Self, AofError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        debug!(path = %path.display(), bytes = len, fsync = %fsync_policy, "Opened AOF");

        Ok(Self {
            path,
            writer: Mutex::new(AofWriter {
                file,
                fsync_policy,
                last_fsync: Instant::now(),
                needs_fsync: false,
                len,
                poisoned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the file in bytes.
    pub fn len(&self) -> u64 {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, AofWriter> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends one command to the end of the file.
    pub fn append(&self, command: &Command) -> Result<(), AofError> {
        self.append_with(command, || ())
    }

    /// Appends `command`, then runs `apply` while still holding the log lock.
    ///
    /// Every mutation goes through here, so records land in the file in the
    /// same order their mutations reach the store. If the append fails,
    /// `apply` never runs and the store stays in step with the file.
    pub fn append_with<F, R>(&self, command: &Command, apply: F) -> Result<R, AofError>
    where
        F: FnOnce() -> R,
    {
        let record = command.serialize();
        let mut writer = self.lock();

        writer.write_record(&record)?;
        trace!(bytes = record.len(), "Appended AOF record");

        Ok(apply())
    }

    /// Flushes appended records to disk regardless of the fsync policy.
    pub fn sync(&self) -> Result<(), AofError> {
        self.lock().fsync()?;
        Ok(())
    }

    /// Reads the file from the start, yielding one [`Record`] per logged command.
    ///
    /// The iterator stops after the first error. Calling `replay` again
    /// starts over from the beginning of the file.
    pub fn replay(&mut self) -> Result<Replay<'_>, AofError> {
        let writer = self.writer.get_mut().unwrap_or_else(|e| e.into_inner());
        writer.file.seek(SeekFrom::Start(0))?;

        Ok(Replay {
            reader: &mut writer.file,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            offset: 0,
            eof: false,
            done: false,
        })
    }
}

/// A command read back from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Byte offset of the record in the file
    pub offset: u64,
    pub command: Command,
}

/// Iterator over the records of an [`Aof`], see [`Aof::replay`].
pub struct Replay<'a> {
    reader: &'a mut File,
    buffer: BytesMut,
    /// File offset of the first byte in `buffer`
    offset: u64,
    eof: bool,
    done: bool,
}

impl Replay<'_> {
    fn next_record(&mut self) -> Result<Option<Record>, AofError> {
        loop {
            if let Some(&first) = self.buffer.first() {
                // Records are always written as arrays, never inline
                if first != prefix::ARRAY {
                    return Err(AofError::Corrupt {
                        offset: self.offset,
                        source: ParseError::ProtocolError(format!(
                            "expected array record, got {:#04x}",
                            first
                        )),
                    });
                }
            }

            match parse_command(&self.buffer) {
                Ok(Some((command, consumed))) => {
                    let offset = self.offset;
                    self.buffer.advance(consumed);
                    self.offset += consumed as u64;
                    return Ok(Some(Record { offset, command }));
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(AofError::Corrupt {
                        offset: self.offset,
                        source,
                    })
                }
            }

            if self.eof {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(AofError::Truncated {
                        offset: self.offset,
                    })
                };
            }

            self.fill()?;
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let n = loop {
            match self.reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}

impl Iterator for Replay<'_> {
    type Item = Result<Record, AofError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.next_record().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("ledgerkv_aof_{}_{}.aof", std::process::id(), n))
    }

    fn commands(aof: &mut Aof) -> Vec<Command> {
        aof.replay()
            .unwrap()
            .map(|record| record.unwrap().command)
            .collect()
    }

    #[test]
    fn test_fsync_names() {
        use clap::ValueEnum;
        assert_eq!(AofFsync::from_str("always", true), Ok(AofFsync::Always));
        assert_eq!(AofFsync::from_str("EVERYSEC", true), Ok(AofFsync::EverySec));
        assert_eq!(AofFsync::from_str("no", false), Ok(AofFsync::No));
        assert!(AofFsync::from_str("sometimes", true).is_err());
        assert_eq!(AofFsync::EverySec.to_string(), "everysec");
    }

    #[test]
    fn test_append_writes_array_records() {
        let path = temp_path();
        let aof = Aof::open(&path, AofFsync::No).unwrap();

        aof.append(&Command::from_strs(&["SET", "key", "value"])).unwrap();
        aof.append(&Command::from_strs(&["DEL", "key"])).unwrap();

        let contents = fs::read(&path).unwrap();
        assert_eq!(
            contents,
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n*2\r\n$3\r\nDEL\r\n$3\r\nkey\r\n"
        );
        assert_eq!(aof.len(), contents.len() as u64);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_empty_file() {
        let path = temp_path();
        let mut aof = Aof::open(&path, AofFsync::No).unwrap();

        assert!(aof.is_empty());
        assert!(commands(&mut aof).is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_in_order_with_offsets() {
        let path = temp_path();
        let mut aof = Aof::open(&path, AofFsync::Always).unwrap();
        let logged = vec![
            Command::from_strs(&["SET", "a", "1"]),
            Command::from_strs(&["SET", "a", "2"]),
            Command::from_strs(&["DEL", "b"]),
        ];
        for cmd in &logged {
            aof.append(cmd).unwrap();
        }

        let records: Vec<Record> = aof.replay().unwrap().map(Result::unwrap).collect();
        let replayed: Vec<Command> = records.iter().map(|r| r.command.clone()).collect();
        assert_eq!(replayed, logged);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].offset, logged[0].serialize().len() as u64);

        // Replay is restartable, and appends after it still go to the end
        assert_eq!(commands(&mut aof), logged);
        aof.append(&Command::from_strs(&["SET", "c", "3"])).unwrap();
        assert_eq!(commands(&mut aof).len(), 4);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let path = temp_path();
        {
            let aof = Aof::open(&path, AofFsync::No).unwrap();
            aof.append(&Command::from_strs(&["SET", "k", "v"])).unwrap();
            aof.sync().unwrap();
        }

        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        assert_eq!(commands(&mut aof), vec![Command::from_strs(&["SET", "k", "v"])]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_spans_read_chunks() {
        let path = temp_path();
        let mut aof = Aof::open(&path, AofFsync::No).unwrap();
        let big = "x".repeat(READ_CHUNK_SIZE * 2 + 17);
        aof.append(&Command::from_strs(&["SET", "big", &big])).unwrap();
        aof.append(&Command::from_strs(&["SET", "small", "v"])).unwrap();

        let replayed = commands(&mut aof);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].args()[2].len(), big.len());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_truncated_record() {
        let path = temp_path();
        fs::write(&path, b"*2\r\n$3\r\nDEL\r\n$1\r\na\r\n*3\r\n$3\r\nSET\r\n$1\r\nb").unwrap();
        let mut aof = Aof::open(&path, AofFsync::No).unwrap();

        let mut replay = aof.replay().unwrap();
        assert!(replay.next().unwrap().is_ok());
        match replay.next() {
            Some(Err(AofError::Truncated { offset })) => assert_eq!(offset, 20),
            other => panic!("expected truncation error, got {:?}", other),
        }
        assert!(replay.next().is_none());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_corrupt_record() {
        let path = temp_path();
        fs::write(&path, b"*2\r\n$3\r\nDEL\r\n$x\r\na\r\n").unwrap();
        let mut aof = Aof::open(&path, AofFsync::No).unwrap();

        let result: Result<Vec<Record>, AofError> = aof.replay().unwrap().collect();
        assert!(matches!(
            result,
            Err(AofError::Corrupt {
                offset: 0,
                source: ParseError::InvalidInteger(_)
            })
        ));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_rejects_inline_record() {
        let path = temp_path();
        fs::write(&path, b"SET a 1\r\n").unwrap();
        let mut aof = Aof::open(&path, AofFsync::No).unwrap();

        let result: Result<Vec<Record>, AofError> = aof.replay().unwrap().collect();
        assert!(matches!(result, Err(AofError::Corrupt { offset: 0, .. })));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_append_with_returns_apply_result() {
        let path = temp_path();
        let aof = Aof::open(&path, AofFsync::No).unwrap();

        let applied = aof
            .append_with(&Command::from_strs(&["SET", "k", "v"]), || 42)
            .unwrap();
        assert_eq!(applied, 42);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_fsync_always_syncs_every_record() {
        let path = temp_path();
        let aof = Aof::open(&path, AofFsync::Always).unwrap();

        let before = aof.lock().last_fsync;
        aof.append(&Command::from_strs(&["SET", "k", "v"])).unwrap();

        let writer = aof.lock();
        assert!(!writer.needs_fsync);
        assert!(writer.last_fsync > before);
        drop(writer);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_fsync_everysec_waits_for_the_second() {
        let path = temp_path();
        let aof = Aof::open(&path, AofFsync::EverySec).unwrap();
        let opened_at = aof.lock().last_fsync;

        // Within the first second nothing is synced
        aof.append(&Command::from_strs(&["SET", "a", "1"])).unwrap();
        aof.append(&Command::from_strs(&["SET", "b", "2"])).unwrap();
        {
            let writer = aof.lock();
            assert!(writer.needs_fsync);
            assert_eq!(writer.last_fsync, opened_at);
        }

        // Pretend the last sync was long ago
        let stale = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap_or(opened_at);
        aof.lock().last_fsync = stale;

        aof.append(&Command::from_strs(&["SET", "c", "3"])).unwrap();
        {
            let writer = aof.lock();
            assert!(!writer.needs_fsync);
            assert!(writer.last_fsync > stale);
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_fsync_no_leaves_it_to_sync() {
        let path = temp_path();
        let aof = Aof::open(&path, AofFsync::No).unwrap();

        aof.append(&Command::from_strs(&["SET", "k", "v"])).unwrap();
        assert!(aof.lock().needs_fsync);

        aof.sync().unwrap();
        assert!(!aof.lock().needs_fsync);

        let _ = fs::remove_file(&path);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_fsync_is_not_counted() {
        // Writes to /dev/null succeed but fdatasync fails
        let aof = Aof::open("/dev/null", AofFsync::Always).unwrap();

        let applied = aof.append_with(&Command::from_strs(&["SET", "k", "v"]), || true);
        assert!(matches!(applied, Err(AofError::Io(_))));
        assert_eq!(aof.len(), 0);

        // /dev/null cannot be truncated either, so the writer refuses
        // anything further
        let result = aof.append(&Command::from_strs(&["DEL", "k"]));
        assert!(matches!(result, Err(AofError::Poisoned { offset: 0 })));
        assert_eq!(aof.len(), 0);
    }

    #[test]
    fn test_rollback_truncates_to_last_good_record() {
        let path = temp_path();
        let aof = Aof::open(&path, AofFsync::No).unwrap();
        aof.append(&Command::from_strs(&["SET", "k", "v"])).unwrap();
        let good_len = aof.len();

        {
            let mut writer = aof.lock();
            writer.file.write_all(b"*3\r\n$3\r\nSET").unwrap();
            writer.rollback();
            assert!(!writer.poisoned);
        }

        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        aof.append(&Command::from_strs(&["DEL", "k"])).unwrap();

        let mut aof = aof;
        assert_eq!(commands(&mut aof).len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let path = temp_path();
        let aof = Arc::new(Aof::open(&path, AofFsync::No).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let aof = Arc::clone(&aof);
                thread::spawn(move || {
                    for j in 0..50 {
                        let value = format!("{}-{}", i, "v".repeat(j));
                        aof.append(&Command::from_strs(&["SET", "k", &value])).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut aof = Arc::try_unwrap(aof).unwrap();
        let replayed = commands(&mut aof);
        assert_eq!(replayed.len(), 400);
        assert!(replayed.iter().all(|cmd| cmd.is("SET") && cmd.len() == 3));

        let _ = fs::remove_file(&path);
    }
}
