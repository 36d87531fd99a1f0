use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::domain::Datatype;
use crate::fields::FieldTable;
use crate::fs_util::{fingerprint_file, validate_zip};
use crate::manifest::ManifestStore;

const TOP_LEVEL_FILES: &[&str] = &[
    "dataset_description.json",
    "participants.tsv",
    "participants.json",
    "README",
    "README.md",
    "CHANGES",
    "LICENSE",
];

static BIDS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^sub-(?P<sub>[A-Za-z0-9]+)(?:_ses-(?P<ses>[A-Za-z0-9]+))?_(?P<suffix>[A-Za-z0-9_-]+?)(?:_run-(?P<run>[0-9]+))?\.(?P<ext>[A-Za-z0-9]+(?:\.[A-Za-z0-9]+)?)$",
    )
    .expect("BIDS file name pattern is a valid regular expression")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MissingDatasetDescription,
    MissingSidecar,
    OrphanFile,
    PathCollision,
    MissingFile,
    FingerprintMismatch,
    UntrackedFile,
    CorruptArchive,
}

impl FindingKind {
    pub fn severity(self) -> Severity {
        match self {
            FindingKind::UntrackedFile => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub kind: FindingKind,
    pub path: Utf8PathBuf,
    pub detail: String,
}

impl ValidationFinding {
    fn new(kind: FindingKind, path: impl Into<Utf8PathBuf>, detail: impl Into<String>) -> Self {
        Self {
            severity: kind.severity(),
            kind,
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub struct ValidationEngine<'a> {
    fields: &'a FieldTable,
    check_archives: bool,
}

impl<'a> ValidationEngine<'a> {
    pub fn new(fields: &'a FieldTable, check_archives: bool) -> Self {
        Self {
            fields,
            check_archives,
        }
    }

    pub fn validate(&self, root: &Utf8Path, manifest: &ManifestStore) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();

        if !root.join("dataset_description.json").as_std_path().is_file() {
            findings.push(ValidationFinding::new(
                FindingKind::MissingDatasetDescription,
                "dataset_description.json",
                "dataset_description.json is required at the dataset root",
            ));
        }

        let files = collect_files(root, &mut findings);
        let on_disk = files.iter().collect::<BTreeSet<_>>();
        let records = manifest.records();
        let tracked = records
            .iter()
            .map(|record| &record.destination)
            .collect::<BTreeSet<_>>();

        let mut by_lowercase = BTreeMap::<String, Vec<&Utf8PathBuf>>::new();
        for file in &files {
            by_lowercase
                .entry(file.as_str().to_lowercase())
                .or_default()
                .push(file);
        }
        for paths in by_lowercase.values().filter(|paths| paths.len() > 1) {
            let names = paths
                .iter()
                .map(|path| path.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            for path in paths {
                findings.push(ValidationFinding::new(
                    FindingKind::PathCollision,
                    path.as_path(),
                    format!("paths differ only by case: {names}"),
                ));
            }
        }

        for file in &files {
            if is_top_level_file(file) {
                continue;
            }
            match self.check_layout(file) {
                Err(detail) => {
                    findings.push(ValidationFinding::new(FindingKind::OrphanFile, file, detail));
                    continue;
                }
                Ok(sidecars) => {
                    for sidecar in sidecars {
                        if !on_disk.contains(&sidecar) {
                            findings.push(ValidationFinding::new(
                                FindingKind::MissingSidecar,
                                file,
                                format!("expected sidecar {sidecar}"),
                            ));
                        }
                    }
                }
            }
            if !tracked.contains(file) && !self.is_sidecar(file) {
                findings.push(ValidationFinding::new(
                    FindingKind::UntrackedFile,
                    file,
                    "no manifest record converts to this path",
                ));
            }
            if self.check_archives && file.extension() == Some("zip") {
                if let Err(err) = validate_zip(root.join(file).as_std_path()) {
                    findings.push(ValidationFinding::new(
                        FindingKind::CorruptArchive,
                        file,
                        err.to_string(),
                    ));
                }
            }
        }

        let mut owners = BTreeMap::<&Utf8PathBuf, Vec<String>>::new();
        for record in &records {
            owners
                .entry(&record.destination)
                .or_default()
                .push(record.key.to_string());
        }
        for (destination, keys) in owners.iter().filter(|(_, keys)| keys.len() > 1) {
            findings.push(ValidationFinding::new(
                FindingKind::PathCollision,
                destination.as_path(),
                format!("claimed by {}", keys.join(", ")),
            ));
        }

        for record in &records {
            let path = root.join(&record.destination);
            if !path.as_std_path().is_file() {
                findings.push(ValidationFinding::new(
                    FindingKind::MissingFile,
                    &record.destination,
                    format!("recorded for {} but absent", record.key),
                ));
                continue;
            }
            match fingerprint_file(path.as_std_path()) {
                Ok(found) if found == record.fingerprint => {}
                Ok(found) => findings.push(ValidationFinding::new(
                    FindingKind::FingerprintMismatch,
                    &record.destination,
                    format!(
                        "expected {}, found {}",
                        record.fingerprint.short(),
                        found.short()
                    ),
                )),
                Err(err) => findings.push(ValidationFinding::new(
                    FindingKind::FingerprintMismatch,
                    &record.destination,
                    format!("unreadable: {err}"),
                )),
            }
        }

        findings.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.kind.cmp(&b.kind)));
        findings.dedup();
        tracing::info!(findings = findings.len(), "validation complete");
        findings
    }

    fn check_layout(&self, file: &Utf8Path) -> Result<Vec<Utf8PathBuf>, String> {
        let name = file.file_name().unwrap_or_default();
        let caps = BIDS_NAME
            .captures(name)
            .ok_or_else(|| "not a BIDS file name".to_string())?;
        let subject = &caps["sub"];
        let session = caps.name("ses").map(|m| m.as_str());

        let components = file
            .parent()
            .map(|parent| parent.components().map(|c| c.as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        let expected_session = session.map(|session| format!("ses-{session}"));
        let (dirs_subject, dirs_session, dirs_datatype) = match components.as_slice() {
            [sub, datatype] => (*sub, None, *datatype),
            [sub, ses, datatype] => (*sub, Some(*ses), *datatype),
            _ => return Err("file is not inside sub-<label>/[ses-<label>/]<datatype>".to_string()),
        };
        if dirs_subject != format!("sub-{subject}")
            || dirs_session != expected_session.as_deref()
        {
            return Err("directories disagree with the file name entities".to_string());
        }
        let datatype = dirs_datatype
            .parse::<Datatype>()
            .map_err(|_| format!("unknown datatype directory {dirs_datatype:?}"))?;

        let suffix = &caps["suffix"];
        let extension = &caps["ext"];
        let sidecars = self
            .fields
            .sidecars_for(datatype, suffix, extension)
            .unwrap_or_default();
        let stem = name
            .strip_suffix(extension)
            .and_then(|stem| stem.strip_suffix('.'))
            .unwrap_or(name);
        Ok(sidecars
            .iter()
            .map(|ext| file.with_file_name(format!("{stem}.{ext}")))
            .collect())
    }

    fn is_sidecar(&self, file: &Utf8Path) -> bool {
        let Some(name) = file.file_name() else {
            return false;
        };
        self.fields.iter().any(|spec| {
            spec.sidecars
                .iter()
                .any(|ext| name.ends_with(&format!(".{ext}")))
                && !spec.extensions.iter().any(|ext| name.ends_with(&format!(".{ext}")))
        })
    }
}

fn is_top_level_file(file: &Utf8Path) -> bool {
    file.parent().is_some_and(|parent| parent.as_str().is_empty())
        && file
            .file_name()
            .is_some_and(|name| TOP_LEVEL_FILES.contains(&name))
}

fn collect_files(root: &Utf8Path, findings: &mut Vec<ValidationFinding>) -> Vec<Utf8PathBuf> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root.as_std_path())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("error reading destination entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = entry
            .path()
            .strip_prefix(root.as_std_path())
            .ok()
            .and_then(|path| Utf8Path::from_path(path).map(Utf8Path::to_path_buf))
        else {
            findings.push(ValidationFinding::new(
                FindingKind::OrphanFile,
                entry.path().display().to_string(),
                "path is not valid UTF-8",
            ));
            continue;
        };

        let top = relative
            .components()
            .next()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default();
        let is_top_level = relative.components().count() == 1;
        if is_top_level && TOP_LEVEL_FILES.contains(&top.as_str()) {
            files.push(relative);
        } else if !is_top_level && top.starts_with("sub-") {
            files.push(relative);
        } else {
            findings.push(ValidationFinding::new(
                FindingKind::OrphanFile,
                relative,
                "not a dataset-level file or inside a sub-<label> directory",
            ));
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::fields::FieldSpec;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn flags_misplaced_and_untracked_files() {
        let (_temp, root) = temp_root();
        fs::write(root.join("dataset_description.json"), b"{}").unwrap();
        fs::create_dir_all(root.join("sub-1/ses-02/anat")).unwrap();
        fs::write(root.join("sub-1/ses-02/anat/sub-1_ses-03_T1w.zip"), b"x").unwrap();
        fs::write(root.join("sub-1/ses-02/anat/sub-1_ses-02_T1w.zip"), b"x").unwrap();
        fs::write(root.join("notes.txt"), b"x").unwrap();

        let fields = FieldTable::builtin();
        let findings =
            ValidationEngine::new(&fields, false).validate(&root, &ManifestStore::in_memory());
        let kinds = findings
            .iter()
            .map(|finding| (finding.path.as_str(), finding.kind))
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                ("notes.txt", FindingKind::OrphanFile),
                (
                    "sub-1/ses-02/anat/sub-1_ses-02_T1w.zip",
                    FindingKind::UntrackedFile
                ),
                (
                    "sub-1/ses-02/anat/sub-1_ses-03_T1w.zip",
                    FindingKind::OrphanFile
                ),
            ]
        );
    }

    #[test]
    fn missing_description_is_reported() {
        let (_temp, root) = temp_root();
        let fields = FieldTable::builtin();
        let findings =
            ValidationEngine::new(&fields, false).validate(&root, &ManifestStore::in_memory());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::MissingDatasetDescription);
        assert_eq!(findings[0].severity, Severity::Error);
    }

    #[test]
    fn sidecar_requirement_comes_from_field_table() {
        let (_temp, root) = temp_root();
        fs::write(root.join("dataset_description.json"), b"{}").unwrap();
        fs::create_dir_all(root.join("sub-1/func")).unwrap();
        fs::write(root.join("sub-1/func/sub-1_bold.nii.gz"), b"x").unwrap();

        let mut fields = FieldTable::empty();
        let mut spec = FieldSpec::new(20227, Datatype::Func, "bold", "nii.gz");
        spec.sidecars = vec!["json".to_string()];
        fields.insert(spec).unwrap();

        let findings =
            ValidationEngine::new(&fields, false).validate(&root, &ManifestStore::in_memory());
        assert!(findings.iter().any(|finding| finding.kind == FindingKind::MissingSidecar
            && finding.detail.contains("sub-1/func/sub-1_bold.json")));
    }
}
