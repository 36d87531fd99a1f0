use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::{Fingerprint, SourceKey};
use crate::error::ManifestError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub key: SourceKey,
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub converted_at: String,
    pub tool: String,
    pub version: u32,
    pub supersedes: Option<u32>,
}

impl ManifestRecord {
    pub fn new(
        key: SourceKey,
        source: Utf8PathBuf,
        destination: Utf8PathBuf,
        fingerprint: Fingerprint,
        size: u64,
    ) -> Self {
        Self {
            key,
            source,
            destination,
            fingerprint,
            size,
            converted_at: Utc::now().to_rfc3339(),
            tool: format!("ukb2bids/{}", env!("CARGO_PKG_VERSION")),
            version: 0,
            supersedes: None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    arena: Vec<ManifestRecord>,
    latest: HashMap<SourceKey, usize>,
    by_destination: HashMap<Utf8PathBuf, SourceKey>,
    file: Option<File>,
    /// Byte length of the log up to its last complete record, set when the
    /// log ends in a torn write that must be cut before appending.
    truncate_to: Option<u64>,
}

impl Inner {
    fn index(&mut self, record: ManifestRecord) {
        let position = self.arena.len();
        if let Some(previous) = self.latest.get(&record.key).map(|idx| &self.arena[*idx]) {
            if self.by_destination.get(&previous.destination) == Some(&record.key) {
                self.by_destination.remove(&previous.destination);
            }
        }
        self.by_destination
            .insert(record.destination.clone(), record.key.clone());
        self.latest.insert(record.key.clone(), position);
        self.arena.push(record);
    }
}

#[derive(Debug)]
pub struct ManifestStore {
    path: Option<Utf8PathBuf>,
    inner: Mutex<Inner>,
}

impl ManifestStore {
    pub fn open(path: &Utf8Path) -> Result<Self, ManifestError> {
        let mut inner = Inner::default();
        if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| ManifestError::Io(format!("{path}: {err}")))?;
            let mut offset = 0u64;
            let mut lines = content.split_inclusive('\n').enumerate().peekable();
            while let Some((index, line)) = lines.next() {
                let is_last = lines.peek().is_none();
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    offset += line.len() as u64;
                    continue;
                }
                match serde_json::from_str::<ManifestRecord>(trimmed) {
                    Ok(record) => {
                        check_sequence(path, index + 1, &inner, &record)?;
                        inner.index(record);
                    }
                    Err(err) if is_last && !line.ends_with('\n') => {
                        tracing::warn!(
                            "discarding incomplete trailing manifest record in {path}: {err}"
                        );
                        inner.truncate_to = Some(offset);
                        break;
                    }
                    Err(err) => {
                        return Err(ManifestError::Corrupt {
                            path: path.to_path_buf(),
                            line: index + 1,
                            message: err.to_string(),
                        });
                    }
                }
                offset += line.len() as u64;
            }
            tracing::debug!(records = inner.arena.len(), "manifest loaded from {path}");
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(inner),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn lookup(&self, key: &SourceKey) -> Option<ManifestRecord> {
        let inner = self.lock();
        inner.latest.get(key).map(|idx| inner.arena[*idx].clone())
    }

    pub fn history(&self, key: &SourceKey) -> Vec<ManifestRecord> {
        self.lock()
            .arena
            .iter()
            .filter(|record| &record.key == key)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<ManifestRecord> {
        let inner = self.lock();
        let mut records = inner
            .latest
            .values()
            .map(|idx| inner.arena[*idx].clone())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn owner_of(&self, destination: &Utf8Path) -> Option<SourceKey> {
        self.lock().by_destination.get(destination).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a new version of `record.key`. `expected` is the version the
    /// caller planned against (`None` for a key never committed); any other
    /// current version means someone else committed in between, and nothing
    /// is written.
    pub fn commit(
        &self,
        mut record: ManifestRecord,
        expected: Option<u32>,
    ) -> Result<ManifestRecord, ManifestError> {
        let mut inner = self.lock();
        let current = inner
            .latest
            .get(&record.key)
            .map(|idx| inner.arena[*idx].version);
        if current != expected {
            return Err(ManifestError::ConcurrentModification {
                key: record.key.to_string(),
                expected,
                found: current,
            });
        }
        record.version = current.unwrap_or(0) + 1;
        record.supersedes = current;

        if let Some(path) = &self.path {
            let mut line =
                serde_json::to_vec(&record).map_err(|err| ManifestError::Io(err.to_string()))?;
            line.push(b'\n');
            let file = append_handle(path, &mut inner)?;
            let start = file
                .metadata()
                .map_err(|err| ManifestError::Io(format!("{path}: {err}")))?
                .len();
            if let Err(err) = file.write_all(&line).and_then(|_| file.sync_data()) {
                inner.truncate_to = Some(start);
                return Err(ManifestError::Io(format!("{path}: {err}")));
            }
        }

        inner.index(record.clone());
        Ok(record)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn append_handle<'a>(path: &Utf8Path, inner: &'a mut Inner) -> Result<&'a mut File, ManifestError> {
    if inner.file.is_none() {
        let io_err = |err: std::io::Error| ManifestError::Io(format!("{path}: {err}"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(io_err)?;
        inner.file = Some(file);
    }
    let file = inner
        .file
        .as_mut()
        .ok_or_else(|| ManifestError::Io(format!("{path}: manifest not open")))?;
    if let Some(len) = inner.truncate_to {
        file.set_len(len)
            .map_err(|err| ManifestError::Io(format!("{path}: {err}")))?;
        inner.truncate_to = None;
    }
    Ok(file)
}

fn check_sequence(
    path: &Utf8Path,
    line: usize,
    inner: &Inner,
    record: &ManifestRecord,
) -> Result<(), ManifestError> {
    let current = inner
        .latest
        .get(&record.key)
        .map(|idx| inner.arena[*idx].version);
    if record.version != current.unwrap_or(0) + 1 || record.supersedes != current {
        return Err(ManifestError::Corrupt {
            path: path.to_path_buf(),
            line,
            message: format!(
                "version {} of {} does not follow {:?}",
                record.version, record.key, current
            ),
        });
    }
    Ok(())
}
