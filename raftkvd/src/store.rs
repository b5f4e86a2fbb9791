//! On-disk artifacts: changelog and snapshot files, plus the vote record.
//!
//! All files live flat in the data dir. `changelog.<n>` starts with the
//! node's durable ts at open time, then length-prefixed records.
//! `snapshot.<ts>` starts with the FSM entry count and the applied ts, then
//! one single-op record per entry. `vote` holds the last cast vote and is
//! replaced atomically. Nothing here deletes files; pruning below the newest
//! complete snapshot is an external janitor's job.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raftkvd_api::{LogIndex, LogRecord, Operation, VoteRequest};
use thiserror::Error;
use tracing::debug;

use crate::ioutil::{fatal, BufferedFile};

pub const CHANGELOG_PREFIX: &str = "changelog.";
pub const SNAPSHOT_PREFIX: &str = "snapshot.";
pub const VOTE_FILE: &str = "vote";

pub fn changelog_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{CHANGELOG_PREFIX}{number}"))
}

pub fn snapshot_path(dir: &Path, ts: LogIndex) -> PathBuf {
    dir.join(format!("{SNAPSHOT_PREFIX}{}", ts.0))
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("not a dir")]
    NotADir,
    #[error("can not list the data dir")]
    CanNotList(#[source] io::Error),
    #[error("io error")]
    Io(#[from] io::Error),
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Find all `<prefix><number>` files, returning the numbers sorted ascending.
fn scan_numbered(dir: &Path, prefix: &str) -> ScanResult<Vec<u64>> {
    if !dir.is_dir() {
        Err(ScanError::NotADir)?
    }
    let mut numbers = vec![];

    for entry in fs::read_dir(dir).map_err(ScanError::CanNotList)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(prefix) else {
            continue;
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            debug!(name, "ignoring data dir entry");
            continue;
        }
        let Ok(number) = suffix.parse::<u64>() else {
            debug!(name, "ignoring data dir entry");
            continue;
        };
        numbers.push(number);
    }

    numbers.sort_unstable();
    Ok(numbers)
}

pub fn discover_changelogs(dir: &Path) -> ScanResult<Vec<u64>> {
    scan_numbered(dir, CHANGELOG_PREFIX)
}

pub fn discover_snapshots(dir: &Path) -> ScanResult<Vec<u64>> {
    scan_numbered(dir, SNAPSHOT_PREFIX)
}

pub struct Snapshot {
    pub applied_ts: LogIndex,
    pub fsm: BTreeMap<String, String>,
}

/// Read a snapshot, returning `None` unless the whole body parses cleanly.
pub fn read_snapshot(path: &Path) -> Option<Snapshot> {
    let mut io = BufferedFile::open(path).ok()?;
    let size = io.read_i64()?;
    let applied_ts = io.read_i64()?;

    let mut fsm = BTreeMap::new();
    for _ in 0..size {
        let record = io.read_log_record()?;
        for op in record.operations {
            fsm.insert(op.key, op.value);
        }
    }

    Some(Snapshot {
        applied_ts: LogIndex(applied_ts),
        fsm,
    })
}

/// Serialize a point-in-time FSM view and fsync it.
pub fn write_snapshot(path: &Path, applied_ts: LogIndex, fsm: &BTreeMap<String, String>) {
    let mut io = BufferedFile::create(path);
    io.write_i64(fsm.len() as i64);
    io.write_i64(applied_ts.0);
    for (key, value) in fsm {
        io.write_log_record(&LogRecord {
            ts: LogIndex::ZERO,
            operations: vec![Operation {
                key: key.clone(),
                value: value.clone(),
            }],
        });
    }
    io.sync();
}

/// Open a changelog for reading. `Ok(None)` if the file has no complete
/// header; the returned reader is positioned at the first record.
pub fn open_changelog(path: &Path) -> io::Result<Option<(LogIndex, BufferedFile)>> {
    let mut io = BufferedFile::open(path)?;
    let Some(header_ts) = io.read_i64() else {
        return Ok(None);
    };
    Ok(Some((LogIndex(header_ts), io)))
}

/// Stores the last cast vote via write-new + fsync + rename; the rename is
/// the commit point.
pub struct VoteStore {
    path: PathBuf,
}

impl VoteStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(VOTE_FILE),
        }
    }

    pub fn store(&self, vote: &VoteRequest) {
        let tmp = self.path.with_extension("tmp");
        let encoded = vote.encode();
        let res = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&(encoded.len() as i64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.sync_data()?;
            drop(file);
            fs::rename(&tmp, &self.path)
        })();
        if let Err(err) = res {
            fatal("vote store", err);
        }
    }

    pub fn recover(&self) -> Option<VoteRequest> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => fatal("vote read", err),
        };
        let Some(size_bytes) = bytes.get(..8) else {
            fatal("vote parse", "vote file shorter than its size header");
        };
        let size = i64::from_le_bytes(size_bytes.try_into().expect("can't fail"));
        let Some(payload) = usize::try_from(size)
            .ok()
            .and_then(|size| bytes[8..].get(..size))
        else {
            fatal("vote parse", "vote file shorter than its recorded size");
        };
        match VoteRequest::decode(payload) {
            Ok(vote) => Some(vote),
            Err(err) => fatal("vote parse", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftkvd_api::{NodeId, TermId};

    #[test]
    fn scan_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "changelog.3",
            "changelog.1",
            "changelog.x",
            "changelog.",
            "snapshot.17",
            "vote",
            "other",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        assert_eq!(discover_changelogs(dir.path()).unwrap(), vec![1, 3]);
        assert_eq!(discover_snapshots(dir.path()).unwrap(), vec![17]);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), LogIndex(9));

        let mut fsm = BTreeMap::new();
        for i in 0..50 {
            fsm.insert(format!("key-{i:03}"), format!("value-{i}"));
        }
        write_snapshot(&path, LogIndex(9), &fsm);

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.applied_ts, LogIndex(9));
        assert_eq!(snapshot.fsm, fsm);
    }

    #[test]
    fn snapshot_rewrite_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = snapshot_path(dir.path(), LogIndex(1));
        let second = snapshot_path(dir.path(), LogIndex(2));

        let mut fsm = BTreeMap::new();
        fsm.insert("a".to_string(), "1".to_string());
        fsm.insert("b".to_string(), "2".to_string());

        write_snapshot(&first, LogIndex(1), &fsm);
        let loaded = read_snapshot(&first).unwrap();
        write_snapshot(&second, LogIndex(1), &loaded.fsm);

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn partial_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), LogIndex(5));

        let mut fsm = BTreeMap::new();
        fsm.insert("a".to_string(), "1".to_string());
        fsm.insert("b".to_string(), "2".to_string());
        write_snapshot(&path, LogIndex(5), &fsm);

        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 2]).unwrap();

        assert!(read_snapshot(&path).is_none());
    }

    #[test]
    fn replaying_a_changelog_over_its_snapshot_rebuilds_the_fsm() {
        let dir = tempfile::tempdir().unwrap();

        // state as of ts=1
        let mut fsm = BTreeMap::new();
        fsm.insert("a".to_string(), "1".to_string());
        fsm.insert("b".to_string(), "2".to_string());
        write_snapshot(&snapshot_path(dir.path(), LogIndex(1)), LogIndex(1), &fsm);

        // changelog opened when durable_ts was 1, carrying ts 2..=4
        let log_path = changelog_path(dir.path(), 2);
        let mut log = BufferedFile::create(&log_path);
        log.write_i64(1);
        for (ts, key, value) in [(2, "a", "override"), (3, "c", "3"), (4, "b", "fresh")] {
            log.write_log_record(&LogRecord {
                ts: LogIndex(ts),
                operations: vec![Operation {
                    key: key.into(),
                    value: value.into(),
                }],
            });
        }
        log.sync();

        let snapshot = read_snapshot(&snapshot_path(dir.path(), LogIndex(1))).unwrap();
        let mut fsm = snapshot.fsm;
        let (header_ts, mut reader) = open_changelog(&log_path).unwrap().unwrap();
        assert_eq!(header_ts, LogIndex(1));
        while let Some(record) = reader.read_log_record() {
            for op in record.operations {
                fsm.insert(op.key, op.value);
            }
        }

        let expected: BTreeMap<String, String> = [
            ("a".to_string(), "override".to_string()),
            ("b".to_string(), "fresh".to_string()),
            ("c".to_string(), "3".to_string()),
        ]
        .into();
        assert_eq!(fsm, expected);
    }

    #[test]
    fn vote_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = VoteStore::new(dir.path());

        assert!(store.recover().is_none());

        let vote = VoteRequest {
            term: TermId(4),
            ts: LogIndex(10),
            vote_for: NodeId(2),
        };
        store.store(&vote);
        assert_eq!(store.recover(), Some(vote));

        let newer = VoteRequest {
            term: TermId(5),
            ts: LogIndex(11),
            vote_for: NodeId(0),
        };
        store.store(&newer);
        assert_eq!(store.recover(), Some(newer));
        assert!(!dir.path().join("vote.tmp").exists());
    }
}
