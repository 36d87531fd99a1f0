use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::ThreadPool;

use ukb_bids::config::{RetryPolicy, TransferMode};
use ukb_bids::domain::RawAsset;
use ukb_bids::error::ExecutionError;
use ukb_bids::executor::{Action, CancelToken, ExecuteOptions, ExecutionReport, Executor};
use ukb_bids::fields::FieldTable;
use ukb_bids::fs_util::fingerprint_bytes;
use ukb_bids::manifest::{ManifestRecord, ManifestStore};
use ukb_bids::naming::NamingParser;
use ukb_bids::output::JsonOutput;
use ukb_bids::participants::ParticipantTable;
use ukb_bids::planner::{PathPlanner, Plan, PlanNote, PlanStatus, ResolvedAsset};
use ukb_bids::resolver::EntityResolver;
use ukb_bids::transfer::{FsTransfer, TransferPrimitive};

struct Workspace {
    _temp: tempfile::TempDir,
    source: Utf8PathBuf,
    destination: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("bulk");
        let destination = root.join("bids");
        fs::create_dir_all(source.as_std_path()).unwrap();
        fs::create_dir_all(destination.as_std_path()).unwrap();
        Self {
            _temp: temp,
            source,
            destination,
        }
    }

    fn stage(&self, name: &str, content: &[u8]) -> ResolvedAsset {
        let path = self.source.join(name);
        fs::write(path.as_std_path(), content).unwrap();
        let fields = FieldTable::builtin();
        let participants = ParticipantTable::empty();
        let asset = RawAsset {
            path,
            relative: Utf8PathBuf::from(name),
            size: content.len() as u64,
            fingerprint: fingerprint_bytes(content),
        };
        let identifier = NamingParser::new().parse(name).unwrap();
        let entity = EntityResolver::new(&fields, &participants)
            .resolve(&identifier)
            .unwrap();
        ResolvedAsset {
            key: identifier.source_key(),
            asset,
            identifier,
            entity,
        }
    }

    fn plan(&self, manifest: &ManifestStore) -> Plan {
        let assets = vec![
            self.stage("1000001_20252_2_0.zip", b"t1-a"),
            self.stage("1000002_20252_2_0.zip", b"t1-b"),
            self.stage("1000003_20252_2_0.zip", b"t1-c"),
        ];
        PathPlanner::new().plan(assets, manifest)
    }
}

fn pool() -> ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .build()
        .unwrap()
}

/// Copies like the real primitive but refuses one subject for good.
struct RefuseSubject(&'static str);

impl TransferPrimitive for RefuseSubject {
    fn transfer(&self, source: &Utf8Path, destination: &Utf8Path) -> Result<(), ExecutionError> {
        if destination.as_str().contains(self.0) {
            return Err(ExecutionError::PermissionDenied(destination.to_path_buf()));
        }
        FsTransfer::new(TransferMode::Copy).transfer(source, destination)
    }
}

/// Fails with a transient error a fixed number of times, then copies.
struct Flaky {
    remaining: Mutex<u32>,
}

impl TransferPrimitive for Flaky {
    fn transfer(&self, source: &Utf8Path, destination: &Utf8Path) -> Result<(), ExecutionError> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(ExecutionError::Timeout { after_ms: 1 });
        }
        FsTransfer::new(TransferMode::Copy).transfer(source, destination)
    }
}

/// Reports success without writing anything.
struct Liar;

impl TransferPrimitive for Liar {
    fn transfer(&self, _: &Utf8Path, _: &Utf8Path) -> Result<(), ExecutionError> {
        Ok(())
    }
}

#[test]
fn one_failure_does_not_stop_the_batch() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    let transfer = RefuseSubject("sub-1000002");
    let pool = pool();

    let report = Executor::new(&ws.source, &ws.destination, &manifest, &transfer, &pool).execute(
        &plan,
        ExecuteOptions::default(),
        &JsonOutput,
    );

    assert_eq!(report.count(Action::Transferred), 2);
    assert_eq!(report.count(Action::Failed), 1);
    let failed = report.failures().next().unwrap();
    assert_matches!(failed.error, Some(ExecutionError::PermissionDenied(_)));
    assert!(failed.message.is_some());

    assert_eq!(manifest.len(), 2);
    assert!(manifest.lookup(&failed.key).is_none());
    assert!(!ws.destination.join(&failed.destination).as_std_path().exists());
}

#[test]
fn transient_failures_are_retried() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    let transfer = Flaky {
        remaining: Mutex::new(2),
    };
    let pool = pool();

    let report = Executor::new(&ws.source, &ws.destination, &manifest, &transfer, &pool)
        .with_retry(RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        })
        .execute(&plan, ExecuteOptions::default(), &JsonOutput);

    assert_eq!(report.count(Action::Transferred), 3);
    assert_eq!(manifest.len(), 3);
}

#[test]
fn unverified_transfer_is_not_recorded() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    let pool = pool();

    let report = Executor::new(&ws.source, &ws.destination, &manifest, &Liar, &pool).execute(
        &plan,
        ExecuteOptions::default(),
        &JsonOutput,
    );

    assert_eq!(report.count(Action::Failed), 3);
    for outcome in report.failures() {
        assert_matches!(
            &outcome.error,
            Some(ExecutionError::FingerprintMismatch { found, .. }) if found == "missing"
        );
    }
    assert!(manifest.is_empty());
}

#[test]
fn cancelled_run_starts_nothing() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    let transfer = FsTransfer::new(TransferMode::Copy);
    let pool = pool();
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = Executor::new(&ws.source, &ws.destination, &manifest, &transfer, &pool)
        .with_cancel(cancel)
        .execute(&plan, ExecuteOptions::default(), &JsonOutput);

    assert!(report.cancelled);
    assert_eq!(report.count(Action::Cancelled), 3);
    assert!(manifest.is_empty());
    assert!(fs::read_dir(ws.destination.as_std_path()).unwrap().next().is_none());
}

#[test]
fn verified_file_without_record_is_recommitted() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    let first = &plan.entries[0];
    let target = ws.destination.join(&first.destination);
    fs::create_dir_all(target.parent().unwrap().as_std_path()).unwrap();
    fs::copy(
        ws.source.join(&first.source).as_std_path(),
        target.as_std_path(),
    )
    .unwrap();

    let transfer = FsTransfer::new(TransferMode::Copy);
    let pool = pool();
    let report = Executor::new(&ws.source, &ws.destination, &manifest, &transfer, &pool).execute(
        &plan,
        ExecuteOptions::default(),
        &JsonOutput,
    );

    assert_eq!(report.count(Action::Recommitted), 1);
    assert_eq!(report.count(Action::Transferred), 2);
    assert_eq!(manifest.lookup(&first.key).unwrap().version, 1);
}

#[test]
fn foreign_content_at_destination_is_left_alone() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    let first = &plan.entries[0];
    let target = ws.destination.join(&first.destination);
    fs::create_dir_all(target.parent().unwrap().as_std_path()).unwrap();
    fs::write(target.as_std_path(), b"hand-edited").unwrap();

    let transfer = FsTransfer::new(TransferMode::Copy);
    let pool = pool();
    let report = Executor::new(&ws.source, &ws.destination, &manifest, &transfer, &pool).execute(
        &plan,
        ExecuteOptions::default(),
        &JsonOutput,
    );

    let failed = report.failures().next().unwrap();
    assert_eq!(failed.key, first.key);
    assert_matches!(failed.error, Some(ExecutionError::DestinationOccupied(_)));
    assert_eq!(fs::read(target.as_std_path()).unwrap(), b"hand-edited");
}

fn run(
    ws: &Workspace,
    manifest: &ManifestStore,
    plan: &Plan,
    apply_drift: bool,
) -> ExecutionReport {
    let transfer = FsTransfer::new(TransferMode::Copy);
    let pool = pool();
    Executor::new(&ws.source, &ws.destination, manifest, &transfer, &pool).execute(
        plan,
        ExecuteOptions { apply_drift },
        &JsonOutput,
    )
}

#[test]
fn deleted_destination_is_restored() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    run(&ws, &manifest, &plan, false);

    let first = &plan.entries[0];
    let target = ws.destination.join(&first.destination);
    fs::remove_file(target.as_std_path()).unwrap();

    let replan = ws.plan(&manifest);
    assert_eq!(replan.counts().unchanged, 3);
    let report = run(&ws, &manifest, &replan, false);
    assert_eq!(report.count(Action::Restored), 1);
    assert_eq!(report.count(Action::Unchanged), 2);
    assert_eq!(fs::read(target.as_std_path()).unwrap(), b"t1-a");
    assert_eq!(manifest.lookup(&first.key).unwrap().version, 1);
}

#[test]
fn edited_destination_is_reported_not_overwritten() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let plan = ws.plan(&manifest);
    run(&ws, &manifest, &plan, false);

    let first = &plan.entries[0];
    let target = ws.destination.join(&first.destination);
    fs::write(target.as_std_path(), b"edited by hand").unwrap();

    let report = run(&ws, &manifest, &ws.plan(&manifest), false);
    let failed = report.failures().next().unwrap();
    assert_eq!(failed.key, first.key);
    assert_matches!(failed.error, Some(ExecutionError::DestinationModified(_)));
    assert_eq!(fs::read(target.as_std_path()).unwrap(), b"edited by hand");
}

#[test]
fn superseded_path_claimed_in_the_same_plan_is_kept() {
    let ws = Workspace::new();
    let manifest = ManifestStore::in_memory();
    let moving = ws.stage("1000001_20252_2_0.zip", b"t1-a");
    let claimant = ws.stage("1000002_20252_2_0.zip", b"t1-old");

    // The first key was last converted to the second key's destination.
    let shared = claimant.entity.relative_path();
    let old_fingerprint = fingerprint_bytes(b"t1-old");
    manifest
        .commit(
            ManifestRecord::new(
                moving.key.clone(),
                moving.asset.relative.clone(),
                shared.clone(),
                old_fingerprint.clone(),
                6,
            ),
            None,
        )
        .unwrap();
    let target = ws.destination.join(&shared);
    fs::create_dir_all(target.parent().unwrap().as_std_path()).unwrap();
    fs::write(target.as_std_path(), b"t1-old").unwrap();

    let plan = PathPlanner::new().plan(vec![moving.clone(), claimant.clone()], &manifest);
    assert_eq!(plan.counts().drift, 2);
    let claim = plan
        .entries
        .iter()
        .find(|entry| entry.key == claimant.key)
        .unwrap();
    assert_matches!(
        &claim.note,
        Some(PlanNote::Drift { owner: Some(owner), .. }) if owner == &moving.key
    );

    let report = run(&ws, &manifest, &plan, true);
    assert_eq!(report.count(Action::Amended), 2);
    assert_eq!(fs::read(target.as_std_path()).unwrap(), b"t1-old");
    assert_eq!(manifest.owner_of(&shared), Some(claimant.key.clone()));
    assert_eq!(
        fs::read(ws.destination.join(moving.entity.relative_path()).as_std_path()).unwrap(),
        b"t1-a"
    );
    assert!(plan.entries.iter().all(|entry| entry.status == PlanStatus::Drift));
}
