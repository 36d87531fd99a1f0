use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::domain::Datatype;
use crate::error::BidsError;
use crate::fields::{FieldSpec, FieldTable};
use crate::fs_util::compile_globset;

pub const DEFAULT_CONFIG_FILE: &str = "ukb2bids.json";
pub const MAX_WORKERS: usize = 64;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub transfer: Option<TransferMode>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub manifest_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub ignore: Option<Vec<String>>,
    #[serde(default)]
    pub check_archives: Option<bool>,
    #[serde(default)]
    pub replace_default_fields: Option<bool>,
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldEntry {
    Shorthand(String),
    Detailed(FieldEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FieldEntryObject {
    pub code: u32,
    pub datatype: Datatype,
    pub suffix: String,
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub sidecars: Option<Vec<String>>,
    #[serde(default)]
    pub multi_run: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
    Hardlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub dataset_name: String,
    pub workers: usize,
    pub transfer: TransferMode,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub manifest_path: Option<Utf8PathBuf>,
    pub ignore: Vec<String>,
    pub check_archives: bool,
    pub fields: FieldTable,
}

impl ResolvedConfig {
    pub fn manifest_path_for(&self, destination: &Utf8Path) -> Utf8PathBuf {
        match &self.manifest_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => destination.join(path),
            None => destination.join(".ukb-bids").join("manifest.jsonl"),
        }
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Result<Self, BidsError> {
        if let Some(workers) = workers {
            self.workers = check_workers(workers)?;
        }
        Ok(self)
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            dataset_name: "UK Biobank imaging".to_string(),
            workers: default_workers(),
            transfer: TransferMode::Copy,
            retry: RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(250),
            },
            timeout: Duration::from_secs(600),
            manifest_path: None,
            ignore: default_ignore(),
            check_archives: false,
            fields: FieldTable::builtin(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BidsError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| BidsError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BidsError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BidsError> {
        let defaults = ResolvedConfig::default();
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(BidsError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let mut fields = if config.replace_default_fields.unwrap_or(false) {
            FieldTable::empty()
        } else {
            defaults.fields
        };
        for entry in config.fields {
            fields.insert(field_spec(entry)?)?;
        }
        if fields.is_empty() {
            return Err(BidsError::InvalidConfig(
                "field table is empty".to_string(),
            ));
        }
        fields.check_unique_targets()?;

        let ignore = config.ignore.unwrap_or(defaults.ignore);
        compile_globset(&ignore)?;

        let workers = match config.workers {
            Some(workers) => check_workers(workers)?,
            None => defaults.workers,
        };

        Ok(ResolvedConfig {
            schema_version,
            dataset_name: config.dataset_name.unwrap_or(defaults.dataset_name),
            workers,
            transfer: config.transfer.unwrap_or(defaults.transfer),
            retry: RetryPolicy {
                max_retries: config.max_retries.unwrap_or(defaults.retry.max_retries),
                backoff: config
                    .retry_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.backoff),
            },
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            manifest_path: config.manifest_path,
            ignore,
            check_archives: config.check_archives.unwrap_or(false),
            fields,
        })
    }
}

fn field_spec(entry: FieldEntry) -> Result<FieldSpec, BidsError> {
    match entry {
        FieldEntry::Shorthand(value) => {
            let invalid = || BidsError::InvalidConfig(format!("invalid field shorthand: {value}"));
            let (code, target) = value.split_once(':').ok_or_else(invalid)?;
            let (datatype, suffix) = target.split_once('/').ok_or_else(invalid)?;
            let code = code.trim().parse::<u32>().map_err(|_| invalid())?;
            Ok(FieldSpec::new(code, datatype.parse()?, suffix.trim(), "zip"))
        }
        FieldEntry::Detailed(obj) => Ok(FieldSpec {
            code: obj.code,
            datatype: obj.datatype,
            suffix: obj.suffix,
            extensions: obj
                .extensions
                .unwrap_or_else(|| vec!["zip".to_string()])
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            sidecars: obj
                .sidecars
                .unwrap_or_default()
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            multi_run: obj.multi_run.unwrap_or(false),
        }),
    }
}

fn check_workers(workers: usize) -> Result<usize, BidsError> {
    if workers == 0 || workers > MAX_WORKERS {
        return Err(BidsError::InvalidConfig(format!(
            "workers must be between 1 and {MAX_WORKERS}, got {workers}"
        )));
    }
    Ok(workers)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|value| value.get().min(8))
        .unwrap_or(1)
}

pub fn default_ignore() -> Vec<String> {
    vec![
        "fetched.lis".to_string(),
        "*.lis".to_string(),
        "*.stderr".to_string(),
        "*.stdout".to_string(),
        ".ukbbatch".to_string(),
    ]
}
