//! Turn log: the durable, replayable record of every store write
//!
//! One [`LogEntry`] per created version, in allocation order. The log alone
//! is enough to rebuild a store; [`TurnLog::verify`] checks the structural
//! properties replay relies on.

use crate::delta::Delta;
use crate::hash::StateHash;
use crate::world::Version;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// How a version was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Version 0
    Genesis,
    /// Linear successor of the head
    Linear,
    /// Sibling branch off any existing version
    Branch,
}

/// One logged write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Version created by this write
    pub version: Version,
    /// Version the delta was applied to
    pub parent_version: Option<Version>,
    /// Linear commit, branch or genesis
    pub kind: EntryKind,
    /// The applied delta
    pub delta: Delta,
    /// Wall-clock time of the write
    pub timestamp: DateTime<Utc>,
    /// Hash of the resulting snapshot; optional for hand-transcribed logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<StateHash>,
}

/// Durable destination for log entries
pub trait LogSink: Send + Sync + std::fmt::Debug {
    /// Persist one entry; called once per write, in version order
    ///
    /// # Errors
    /// Returns error if the entry could not be made durable
    fn append(&self, entry: &LogEntry) -> Result<(), LogError>;
}

/// Appends one JSON object per line, flushing after each record
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending
    ///
    /// # Errors
    /// Returns error if the file cannot be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// File being written
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonLinesSink {
    fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        let line = serde_json::to_string(entry)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// In-memory ordered log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnLog {
    entries: Vec<LogEntry>,
}

impl TurnLog {
    /// Empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing entries without checking them
    #[inline]
    #[must_use]
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    /// Load a JSON-lines file; blank lines are skipped
    ///
    /// # Errors
    /// Returns error on I/O failure or a malformed line
    pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|source| LogError::Malformed {
                line: idx + 1,
                source,
            })?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Write every entry to `path` as JSON lines, replacing its contents
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<(), LogError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for entry in &self.entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// All entries in order
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has been logged
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry that created `version`
    #[must_use]
    pub fn entry(&self, version: Version) -> Option<&LogEntry> {
        usize::try_from(version.get())
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .filter(|e| e.version == version)
    }

    /// Check the structure replay depends on
    ///
    /// # Errors
    /// Returns the first entry that breaks an ordering or parent rule
    pub fn verify(&self) -> Result<(), LogError> {
        let mut head = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let expected = Version(idx as u64);
            if entry.version != expected {
                return Err(LogError::Integrity {
                    version: entry.version,
                    reason: format!("expected {expected}"),
                });
            }
            match (entry.kind, entry.parent_version) {
                (EntryKind::Genesis, None) if idx == 0 => {}
                (EntryKind::Genesis, _) | (_, None) => {
                    return Err(LogError::Integrity {
                        version: entry.version,
                        reason: "genesis must be the only parentless entry, at v0".to_string(),
                    });
                }
                (_, Some(parent)) if parent >= entry.version => {
                    return Err(LogError::Integrity {
                        version: entry.version,
                        reason: format!("parent {parent} does not precede it"),
                    });
                }
                (EntryKind::Linear, Some(parent)) if Some(parent) != head => {
                    return Err(LogError::Integrity {
                        version: entry.version,
                        reason: format!("linear parent {parent} is not the head"),
                    });
                }
                _ => {}
            }
            if matches!(entry.kind, EntryKind::Genesis | EntryKind::Linear) {
                head = Some(entry.version);
            }
        }
        Ok(())
    }
}

/// Errors reading, writing or checking logs
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Underlying I/O failure
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure
    #[error("log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unparseable line
    #[error("malformed log line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Structural violation
    #[error("log integrity violation at {version}: {reason}")]
    Integrity { version: Version, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: u64, parent: Option<u64>, kind: EntryKind) -> LogEntry {
        LogEntry {
            version: Version(version),
            parent_version: parent.map(Version),
            kind,
            delta: Delta::new(),
            timestamp: Utc::now(),
            state_hash: None,
        }
    }

    #[test]
    fn well_formed_log_verifies() {
        let log = TurnLog::from_entries(vec![
            entry(0, None, EntryKind::Genesis),
            entry(1, Some(0), EntryKind::Linear),
            entry(2, Some(0), EntryKind::Branch),
            entry(3, Some(1), EntryKind::Linear),
        ]);
        assert!(log.verify().is_ok());
        assert_eq!(log.entry(Version(2)).unwrap().kind, EntryKind::Branch);
    }

    #[test]
    fn linear_entry_must_extend_head() {
        let log = TurnLog::from_entries(vec![
            entry(0, None, EntryKind::Genesis),
            entry(1, Some(0), EntryKind::Linear),
            entry(2, Some(0), EntryKind::Linear),
        ]);
        assert!(matches!(
            log.verify(),
            Err(LogError::Integrity { version: Version(2), .. })
        ));
    }

    #[test]
    fn gaps_and_forward_parents_rejected() {
        let gap = TurnLog::from_entries(vec![
            entry(0, None, EntryKind::Genesis),
            entry(2, Some(0), EntryKind::Linear),
        ]);
        assert!(gap.verify().is_err());

        let forward = TurnLog::from_entries(vec![
            entry(0, None, EntryKind::Genesis),
            entry(1, Some(1), EntryKind::Branch),
        ]);
        assert!(forward.verify().is_err());
    }

    #[test]
    fn jsonl_sink_appends_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turns.jsonl");

        let sink = JsonLinesSink::open(&path).unwrap();
        sink.append(&entry(0, None, EntryKind::Genesis)).unwrap();
        assert_eq!(TurnLog::read_jsonl(&path).unwrap().len(), 1);

        sink.append(&entry(1, Some(0), EntryKind::Linear)).unwrap();
        let log = TurnLog::read_jsonl(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.verify().is_ok());
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "\n{not json}\n").unwrap();
        assert!(matches!(
            TurnLog::read_jsonl(&path),
            Err(LogError::Malformed { line: 2, .. })
        ));
    }
}
