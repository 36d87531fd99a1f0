use std::collections::BTreeSet;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::domain::{Label, RawAsset, SourceKey};
use crate::error::BidsError;
use crate::executor::{Action, CancelToken, ExecuteOptions, ExecutionReport, Executor};
use crate::fs_util::write_bytes_atomic;
use crate::inventory::Inventory;
use crate::manifest::{ManifestRecord, ManifestStore};
use crate::naming::NamingParser;
use crate::participants::{ParticipantSummary, ParticipantTable, render_participants_tsv};
use crate::planner::{PathPlanner, Plan, PlanCounts, PlanStatus, ResolvedAsset};
use crate::resolver::EntityResolver;
use crate::transfer::TransferPrimitive;
use crate::validation::{Severity, ValidationEngine, ValidationFinding};

const BIDS_VERSION: &str = "1.9.0";

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Convert,
    Plan,
    Validate,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub participants: Option<Utf8PathBuf>,
    pub max_subjects: Option<usize>,
    pub skip_existing: bool,
    pub write_participants: bool,
}

impl ConvertRequest {
    pub fn new(source: impl Into<Utf8PathBuf>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            participants: None,
            max_subjects: None,
            skip_existing: false,
            write_participants: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub apply_drift: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStage {
    Inventory,
    Parse,
    Resolve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetIssue {
    pub source: String,
    pub stage: IssueStage,
    pub message: String,
}

pub struct PreparedRun {
    pub request: ConvertRequest,
    pub plan: Plan,
    pub issues: Vec<AssetIssue>,
    pub skipped_subjects: Vec<String>,
    pub scanned: usize,
    manifest: ManifestStore,
}

impl PreparedRun {
    pub fn drift_count(&self) -> usize {
        self.plan.counts().drift
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReportCounts {
    pub scanned: usize,
    pub planned: PlanCounts,
    pub transferred: usize,
    pub recommitted: usize,
    pub restored: usize,
    pub amended: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub issues: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub source: String,
    pub destination: String,
    pub dry_run: bool,
    pub counts: ReportCounts,
    pub plan: Plan,
    pub execution: Option<ExecutionReport>,
    pub issues: Vec<AssetIssue>,
    pub skipped_subjects: Vec<String>,
    pub validation: Vec<ValidationFinding>,
    pub cancelled: bool,
}

impl ConversionReport {
    pub fn unresolved(&self) -> usize {
        let applied = self
            .execution
            .as_ref()
            .map(|execution| {
                execution
                    .outcomes
                    .iter()
                    .filter(|outcome| {
                        outcome.status == PlanStatus::Drift && outcome.action == Action::Amended
                    })
                    .count()
            })
            .unwrap_or(0);
        self.counts.planned.conflict + self.counts.planned.drift - applied
    }

    pub fn exit_code(&self) -> u8 {
        if self.cancelled {
            4
        } else if self.counts.failed > 0 {
            3
        } else if self.unresolved() > 0 {
            2
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub destination: String,
    pub findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn errors(&self) -> usize {
        self.findings
            .iter()
            .filter(|finding| finding.severity == Severity::Error)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub manifest: String,
    pub records: Vec<ManifestRecord>,
}

pub struct App<T: TransferPrimitive> {
    config: ResolvedConfig,
    transfer: T,
}

impl<T: TransferPrimitive> App<T> {
    pub fn new(config: ResolvedConfig, transfer: T) -> Self {
        Self { config, transfer }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn prepare(
        &self,
        request: &ConvertRequest,
        sink: &dyn ProgressSink,
    ) -> Result<PreparedRun, BidsError> {
        let pool = self.pool()?;
        let started = Instant::now();

        sink.event(ProgressEvent {
            message: format!("phase=Scan; scanning {}", request.source),
            elapsed: None,
        });
        let participants = match &request.participants {
            Some(path) => ParticipantTable::load(path)?,
            None => ParticipantTable::empty(),
        };
        tracing::debug!(
            subjects = participants.subject_count(),
            "participant table loaded"
        );
        let scan = Inventory::new(&self.config.ignore)?.scan(&request.source, &pool)?;
        let scanned = scan.assets.len();
        if scanned == 0 {
            return Err(BidsError::EmptyInventory(request.source.clone()));
        }
        let mut issues = scan
            .errors
            .into_iter()
            .map(|err| AssetIssue {
                source: err.path,
                stage: IssueStage::Inventory,
                message: err.message,
            })
            .collect::<Vec<_>>();

        sink.event(ProgressEvent {
            message: format!("phase=Resolve; resolving {scanned} assets"),
            elapsed: Some(started.elapsed()),
        });
        let parser = NamingParser::new();
        let resolver = EntityResolver::new(&self.config.fields, &participants);
        let results = pool.install(|| {
            scan.assets
                .into_par_iter()
                .map(|asset| resolve_asset(&parser, &resolver, asset))
                .collect::<Vec<_>>()
        });
        let mut resolved = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(asset) => resolved.push(asset),
                Err(issue) => {
                    tracing::warn!("{}: {}", issue.source, issue.message);
                    issues.push(issue);
                }
            }
        }
        if resolved.is_empty() {
            return Err(BidsError::AllAssetsFailed { count: scanned });
        }

        let skipped_subjects = self.filter_subjects(request, &mut resolved);

        let manifest = ManifestStore::open(&self.config.manifest_path_for(&request.destination))?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Plan; planning {} assets against {} manifest records",
                resolved.len(),
                manifest.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        let plan = PathPlanner::new().plan(resolved, &manifest);
        let counts = plan.counts();
        tracing::info!(
            new = counts.new,
            unchanged = counts.unchanged,
            conflict = counts.conflict,
            drift = counts.drift,
            issues = issues.len(),
            "plan ready"
        );

        Ok(PreparedRun {
            request: request.clone(),
            plan,
            issues,
            skipped_subjects,
            scanned,
            manifest,
        })
    }

    pub fn execute(
        &self,
        prepared: PreparedRun,
        options: RunOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<ConversionReport, BidsError> {
        let PreparedRun {
            request,
            plan,
            issues,
            skipped_subjects,
            scanned,
            manifest,
        } = prepared;
        let started = Instant::now();

        let mut counts = ReportCounts {
            scanned,
            planned: plan.counts(),
            issues: issues.len(),
            ..ReportCounts::default()
        };

        if options.dry_run {
            sink.event(ProgressEvent {
                message: "phase=Plan; dry run, nothing written".to_string(),
                elapsed: None,
            });
            return Ok(ConversionReport {
                source: request.source.to_string(),
                destination: request.destination.to_string(),
                dry_run: true,
                counts,
                plan,
                execution: None,
                issues,
                skipped_subjects,
                validation: Vec::new(),
                cancelled: false,
            });
        }

        fs::create_dir_all(request.destination.as_std_path())
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        let pool = self.pool()?;
        sink.event(ProgressEvent {
            message: format!("phase=Execute; applying {} entries", plan.entries.len()),
            elapsed: None,
        });
        let execution = Executor::new(
            &request.source,
            &request.destination,
            &manifest,
            &self.transfer,
            &pool,
        )
        .with_retry(self.config.retry)
        .with_cancel(cancel.clone())
        .execute(
            &plan,
            ExecuteOptions {
                apply_drift: options.apply_drift,
            },
            sink,
        );

        counts.transferred = execution.count(Action::Transferred);
        counts.recommitted = execution.count(Action::Recommitted);
        counts.restored = execution.count(Action::Restored);
        counts.amended = execution.count(Action::Amended);
        counts.failed = execution.count(Action::Failed);
        counts.cancelled = execution.count(Action::Cancelled);

        sink.event(ProgressEvent {
            message: "phase=Finalize; writing dataset files".to_string(),
            elapsed: Some(started.elapsed()),
        });
        self.write_dataset_description(&request.destination)?;
        if request.write_participants {
            write_participants_file(&request.destination, &manifest)?;
        }

        sink.event(ProgressEvent {
            message: "phase=Validate; checking destination tree".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let validation = ValidationEngine::new(&self.config.fields, self.config.check_archives)
            .validate(&request.destination, &manifest);

        let cancelled = execution.cancelled;
        Ok(ConversionReport {
            source: request.source.to_string(),
            destination: request.destination.to_string(),
            dry_run: false,
            counts,
            plan,
            execution: Some(execution),
            issues,
            skipped_subjects,
            validation,
            cancelled,
        })
    }

    pub fn convert(
        &self,
        request: &ConvertRequest,
        options: RunOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<ConversionReport, BidsError> {
        let prepared = self.prepare(request, sink)?;
        self.execute(prepared, options, cancel, sink)
    }

    pub fn validate(
        &self,
        destination: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ValidationReport, BidsError> {
        if !destination.as_std_path().is_dir() {
            return Err(BidsError::SourceNotDirectory(destination.to_path_buf()));
        }
        sink.event(ProgressEvent {
            message: format!("phase=Validate; checking {destination}"),
            elapsed: None,
        });
        let manifest = ManifestStore::open(&self.config.manifest_path_for(destination))?;
        let findings = ValidationEngine::new(&self.config.fields, self.config.check_archives)
            .validate(destination, &manifest);
        Ok(ValidationReport {
            destination: destination.to_string(),
            findings,
        })
    }

    pub fn history(
        &self,
        destination: &Utf8Path,
        key: Option<&SourceKey>,
        sink: &dyn ProgressSink,
    ) -> Result<HistoryReport, BidsError> {
        let path = self.config.manifest_path_for(destination);
        sink.event(ProgressEvent {
            message: format!("phase=Scan; reading {path}"),
            elapsed: None,
        });
        let manifest = ManifestStore::open(&path)?;
        let records = match key {
            Some(key) => manifest.history(key),
            None => manifest.records(),
        };
        Ok(HistoryReport {
            manifest: path.to_string(),
            records,
        })
    }

    fn pool(&self) -> Result<ThreadPool, BidsError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|index| format!("ukb2bids-worker-{index}"))
            .build()
            .map_err(|err| BidsError::WorkerPool(err.to_string()))
    }

    fn filter_subjects(
        &self,
        request: &ConvertRequest,
        resolved: &mut Vec<ResolvedAsset>,
    ) -> Vec<String> {
        let subjects = resolved
            .iter()
            .map(|asset| asset.entity.subject.clone())
            .collect::<BTreeSet<Label>>();

        let mut keep = BTreeSet::new();
        let mut skipped = Vec::new();
        for subject in subjects {
            let exists = request
                .destination
                .join(format!("sub-{subject}"))
                .as_std_path()
                .is_dir();
            let over_limit = request
                .max_subjects
                .is_some_and(|limit| keep.len() >= limit);
            if (request.skip_existing && exists) || over_limit {
                skipped.push(subject.to_string());
            } else {
                keep.insert(subject);
            }
        }

        if !skipped.is_empty() {
            tracing::info!(skipped = skipped.len(), "subjects left out of this run");
            resolved.retain(|asset| keep.contains(&asset.entity.subject));
        }
        skipped
    }

    fn write_dataset_description(&self, destination: &Utf8Path) -> Result<(), BidsError> {
        let path = destination.join("dataset_description.json");
        if path.as_std_path().exists() {
            return Ok(());
        }
        let description = serde_json::json!({
            "Name": self.config.dataset_name,
            "BIDSVersion": BIDS_VERSION,
            "DatasetType": "raw",
            "GeneratedBy": [{
                "Name": "ukb2bids",
                "Version": env!("CARGO_PKG_VERSION"),
            }],
        });
        let content = serde_json::to_vec_pretty(&description)
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&path, &content)
    }
}

fn resolve_asset(
    parser: &NamingParser,
    resolver: &EntityResolver<'_>,
    asset: RawAsset,
) -> Result<ResolvedAsset, AssetIssue> {
    let identifier = parser.parse(asset.file_name()).map_err(|err| AssetIssue {
        source: asset.relative.to_string(),
        stage: IssueStage::Parse,
        message: format!("{err} (tokens: {})", asset.tokens().join(" ")),
    })?;
    let entity = resolver.resolve(&identifier).map_err(|err| AssetIssue {
        source: asset.relative.to_string(),
        stage: IssueStage::Resolve,
        message: err.to_string(),
    })?;
    Ok(ResolvedAsset {
        key: identifier.source_key(),
        asset,
        identifier,
        entity,
    })
}

fn write_participants_file(
    destination: &Utf8Path,
    manifest: &ManifestStore,
) -> Result<(), BidsError> {
    let records = manifest.records();
    if records.is_empty() {
        return Ok(());
    }
    let rows = records.iter().map(|record| ParticipantSummary {
        subject: record.key.subject().to_string(),
        session: record
            .destination
            .components()
            .find_map(|component| component.as_str().strip_prefix("ses-").map(str::to_string)),
        field: record.key.field(),
    });
    let content = render_participants_tsv(rows);

    let path = destination.join("participants.tsv");
    if fs::read_to_string(path.as_std_path()).is_ok_and(|existing| existing == content) {
        return Ok(());
    }
    write_bytes_atomic(&path, content.as_bytes())
}
