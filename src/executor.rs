use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::config::RetryPolicy;
use crate::domain::{Fingerprint, SourceKey};
use crate::error::ExecutionError;
use crate::fs_util::fingerprint_file;
use crate::manifest::{ManifestRecord, ManifestStore};
use crate::planner::{ConversionPlanEntry, Plan, PlanNote, PlanStatus};
use crate::transfer::TransferPrimitive;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub apply_drift: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Transferred,
    Recommitted,
    Restored,
    Unchanged,
    Amended,
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub key: SourceKey,
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub status: PlanStatus,
    pub action: Action,
    pub version: Option<u32>,
    pub message: Option<String>,
    #[serde(skip)]
    pub error: Option<ExecutionError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<EntryOutcome>,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn count(&self, action: Action) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.action == action)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.action == Action::Failed)
    }
}

pub struct Executor<'a, T: TransferPrimitive> {
    source_root: &'a Utf8Path,
    destination_root: &'a Utf8Path,
    manifest: &'a ManifestStore,
    transfer: &'a T,
    pool: &'a ThreadPool,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl<'a, T: TransferPrimitive> Executor<'a, T> {
    pub fn new(
        source_root: &'a Utf8Path,
        destination_root: &'a Utf8Path,
        manifest: &'a ManifestStore,
        transfer: &'a T,
        pool: &'a ThreadPool,
    ) -> Self {
        Self {
            source_root,
            destination_root,
            manifest,
            transfer,
            pool,
            retry: RetryPolicy::none(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn execute(
        &self,
        plan: &Plan,
        options: ExecuteOptions,
        sink: &dyn ProgressSink,
    ) -> ExecutionReport {
        let total = plan.entries.len();
        let done = AtomicUsize::new(0);
        let outcomes = self.pool.install(|| {
            plan.entries
                .par_iter()
                .map(|entry| {
                    let outcome = self.run_entry(entry, options);
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Execute; {finished}/{total} {:?} {}",
                            outcome.action, outcome.destination
                        ),
                        elapsed: None,
                    });
                    outcome
                })
                .collect::<Vec<_>>()
        });

        for (entry, outcome) in plan.entries.iter().zip(&outcomes) {
            if outcome.action != Action::Amended {
                continue;
            }
            if let Some((previous, fingerprint)) = superseded(entry) {
                self.remove_superseded(plan, previous, fingerprint);
            }
        }

        let cancelled = outcomes
            .iter()
            .any(|outcome| outcome.action == Action::Cancelled);
        if cancelled {
            tracing::warn!("execution cancelled before all entries started");
        }
        ExecutionReport {
            outcomes,
            cancelled,
        }
    }

    fn run_entry(&self, entry: &ConversionPlanEntry, options: ExecuteOptions) -> EntryOutcome {
        if self.cancel.is_cancelled() {
            return outcome(entry, Action::Cancelled, entry.prior_version, None);
        }

        let result = match entry.status {
            PlanStatus::Conflict => Ok((Action::Skipped, entry.prior_version)),
            PlanStatus::Unchanged if entry.is_duplicate() => {
                Ok((Action::Skipped, entry.prior_version))
            }
            PlanStatus::Unchanged => self.ensure_unchanged(entry),
            PlanStatus::New => self.apply_new(entry),
            PlanStatus::Drift if options.apply_drift => self.apply_drift(entry),
            PlanStatus::Drift => Ok((Action::Skipped, entry.prior_version)),
        };

        match result {
            Ok((action, version)) => {
                tracing::debug!("{action:?} {} -> {}", entry.key, entry.destination);
                outcome(entry, action, version, None)
            }
            Err(err) => {
                tracing::warn!("failed {} -> {}: {err}", entry.key, entry.destination);
                outcome(entry, Action::Failed, entry.prior_version, Some(err))
            }
        }
    }

    fn ensure_unchanged(
        &self,
        entry: &ConversionPlanEntry,
    ) -> Result<(Action, Option<u32>), ExecutionError> {
        let destination = self.destination_root.join(&entry.destination);
        match fingerprint_at(&destination)? {
            Some(found) if found == entry.fingerprint => Ok((Action::Unchanged, entry.prior_version)),
            Some(_) => Err(ExecutionError::DestinationModified(entry.destination.clone())),
            None => {
                self.transfer_verified(entry, &destination)?;
                Ok((Action::Restored, entry.prior_version))
            }
        }
    }

    fn apply_new(
        &self,
        entry: &ConversionPlanEntry,
    ) -> Result<(Action, Option<u32>), ExecutionError> {
        let destination = self.destination_root.join(&entry.destination);
        match fingerprint_at(&destination)? {
            Some(found) if found == entry.fingerprint => {
                let record = self.commit(entry)?;
                Ok((Action::Recommitted, Some(record.version)))
            }
            Some(_) => Err(ExecutionError::DestinationOccupied(entry.destination.clone())),
            None => {
                self.transfer_verified(entry, &destination)?;
                let record = self.commit(entry)?;
                Ok((Action::Transferred, Some(record.version)))
            }
        }
    }

    fn apply_drift(
        &self,
        entry: &ConversionPlanEntry,
    ) -> Result<(Action, Option<u32>), ExecutionError> {
        let destination = self.destination_root.join(&entry.destination);
        if fingerprint_at(&destination)?.as_ref() != Some(&entry.fingerprint) {
            self.transfer_verified(entry, &destination)?;
        }
        let record = self.commit(entry)?;
        Ok((Action::Amended, Some(record.version)))
    }

    fn remove_superseded(&self, plan: &Plan, relative: &Utf8Path, fingerprint: &Fingerprint) {
        if self.manifest.owner_of(relative).is_some()
            || plan.entries.iter().any(|entry| entry.destination.as_path() == relative)
        {
            return;
        }
        let path = self.destination_root.join(relative);
        match fingerprint_at(&path) {
            Ok(Some(found)) if &found == fingerprint => {
                if let Err(err) = fs::remove_file(path.as_std_path()) {
                    tracing::warn!("could not remove superseded file {path}: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("could not inspect superseded file {path}: {err}"),
        }
    }

    fn transfer_verified(
        &self,
        entry: &ConversionPlanEntry,
        destination: &Utf8Path,
    ) -> Result<(), ExecutionError> {
        let source = self.source_root.join(&entry.source);
        let mut attempt = 0;
        loop {
            match self.transfer.transfer(&source, destination) {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "transient failure on {}, retry {attempt} in {delay:?}: {err}",
                        entry.destination
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }

        match fingerprint_at(destination)? {
            Some(found) if found == entry.fingerprint => Ok(()),
            found => Err(ExecutionError::FingerprintMismatch {
                path: entry.destination.clone(),
                expected: entry.fingerprint.to_string(),
                found: found
                    .map(|fingerprint| fingerprint.to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            }),
        }
    }

    fn commit(&self, entry: &ConversionPlanEntry) -> Result<ManifestRecord, ExecutionError> {
        let record = ManifestRecord::new(
            entry.key.clone(),
            entry.source.clone(),
            entry.destination.clone(),
            entry.fingerprint.clone(),
            entry.size,
        );
        Ok(self.manifest.commit(record, entry.prior_version)?)
    }
}

fn superseded(entry: &ConversionPlanEntry) -> Option<(&Utf8Path, &Fingerprint)> {
    match &entry.note {
        Some(PlanNote::Drift {
            previous_destination: Some(previous),
            previous_fingerprint: Some(fingerprint),
            ..
        }) if previous != &entry.destination => Some((previous.as_path(), fingerprint)),
        _ => None,
    }
}

fn fingerprint_at(path: &Utf8Path) -> Result<Option<Fingerprint>, ExecutionError> {
    if !path.as_std_path().is_file() {
        return Ok(None);
    }
    fingerprint_file(path.as_std_path())
        .map(Some)
        .map_err(|err| ExecutionError::io(path, &err))
}

fn outcome(
    entry: &ConversionPlanEntry,
    action: Action,
    version: Option<u32>,
    error: Option<ExecutionError>,
) -> EntryOutcome {
    EntryOutcome {
        key: entry.key.clone(),
        source: entry.source.clone(),
        destination: entry.destination.clone(),
        status: entry.status,
        action,
        version,
        message: error.as_ref().map(ToString::to_string),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
