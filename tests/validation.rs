use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use ukb_bids::domain::SourceKey;
use ukb_bids::fields::FieldTable;
use ukb_bids::fs_util::fingerprint_bytes;
use ukb_bids::manifest::{ManifestRecord, ManifestStore};
use ukb_bids::validation::{FindingKind, Severity, ValidationEngine};

const T1: &str = "sub-1000001/ses-02/anat/sub-1000001_ses-02_T1w.zip";

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    fs::write(root.join("dataset_description.json"), b"{}").unwrap();
    (temp, root)
}

fn write(root: &Utf8Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    fs::write(path.as_std_path(), content).unwrap();
}

fn commit(manifest: &ManifestStore, key: &str, destination: &str, content: &[u8]) {
    let key: SourceKey = key.parse().unwrap();
    manifest
        .commit(
            ManifestRecord::new(
                key,
                Utf8PathBuf::from("1000001_20252_2_0.zip"),
                Utf8PathBuf::from(destination),
                fingerprint_bytes(content),
                content.len() as u64,
            ),
            None,
        )
        .unwrap();
}

#[test]
fn clean_tree_has_no_findings() {
    let (_temp, root) = temp_root();
    write(&root, T1, b"t1");
    write(&root, "participants.tsv", b"participant_id\n");
    let manifest = ManifestStore::in_memory();
    commit(&manifest, "1000001:2:20252:0:zip", T1, b"t1");

    let fields = FieldTable::builtin();
    let findings = ValidationEngine::new(&fields, false).validate(&root, &manifest);
    assert!(findings.is_empty(), "{findings:?}");
}

#[test]
fn manifest_disagreements_are_errors() {
    let (_temp, root) = temp_root();
    write(&root, T1, b"edited");
    let manifest = ManifestStore::in_memory();
    commit(&manifest, "1000001:2:20252:0:zip", T1, b"t1");
    commit(
        &manifest,
        "1000001:3:20252:0:zip",
        "sub-1000001/ses-03/anat/sub-1000001_ses-03_T1w.zip",
        b"t1-3",
    );

    let fields = FieldTable::builtin();
    let findings = ValidationEngine::new(&fields, false).validate(&root, &manifest);
    let kinds = findings.iter().map(|finding| finding.kind).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![FindingKind::FingerprintMismatch, FindingKind::MissingFile]
    );
    assert!(findings.iter().all(|finding| finding.severity == Severity::Error));
}

#[test]
fn case_only_collisions_are_reported() {
    let (_temp, root) = temp_root();
    write(&root, T1, b"a");
    write(&root, "sub-1000001/ses-02/anat/sub-1000001_ses-02_t1w.zip", b"b");

    let fields = FieldTable::builtin();
    let findings =
        ValidationEngine::new(&fields, false).validate(&root, &ManifestStore::in_memory());
    assert_eq!(
        findings
            .iter()
            .filter(|finding| finding.kind == FindingKind::PathCollision)
            .count(),
        2
    );
}

#[test]
fn archive_check_is_opt_in() {
    let (_temp, root) = temp_root();
    write(&root, T1, b"not a zip");
    let manifest = ManifestStore::in_memory();
    commit(&manifest, "1000001:2:20252:0:zip", T1, b"not a zip");

    let fields = FieldTable::builtin();
    assert!(ValidationEngine::new(&fields, false)
        .validate(&root, &manifest)
        .is_empty());
    let findings = ValidationEngine::new(&fields, true).validate(&root, &manifest);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::CorruptArchive);
}

#[test]
fn hidden_manifest_directory_is_ignored() {
    let (_temp, root) = temp_root();
    write(&root, ".ukb-bids/manifest.jsonl", b"");
    let fields = FieldTable::builtin();
    let findings =
        ValidationEngine::new(&fields, false).validate(&root, &ManifestStore::in_memory());
    assert!(findings.is_empty(), "{findings:?}");
}
