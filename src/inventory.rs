use camino::{Utf8Path, Utf8PathBuf};
use globset::GlobSet;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::domain::RawAsset;
use crate::error::{BidsError, ParseError};
use crate::fs_util::{compile_globset, fingerprint_file};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct InventoryScan {
    pub assets: Vec<RawAsset>,
    pub errors: Vec<InventoryError>,
}

pub struct Inventory {
    ignore: GlobSet,
}

impl Inventory {
    pub fn new(ignore: &[String]) -> Result<Self, BidsError> {
        Ok(Self {
            ignore: compile_globset(ignore)?,
        })
    }

    pub fn scan(&self, root: &Utf8Path, pool: &ThreadPool) -> Result<InventoryScan, BidsError> {
        if !root.as_std_path().exists() {
            return Err(BidsError::SourceNotFound(root.to_path_buf()));
        }
        if !root.as_std_path().is_dir() {
            return Err(BidsError::SourceNotDirectory(root.to_path_buf()));
        }

        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        let walker = WalkDir::new(root.as_std_path())
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_ignored(entry));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    match Utf8PathBuf::from_path_buf(entry.into_path()) {
                        Ok(path) => candidates.push(path),
                        Err(path) => errors.push(InventoryError {
                            path: path.display().to_string(),
                            message: ParseError::NonUtf8(path.display().to_string())
                                .to_string(),
                        }),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("error accessing source entry: {err}");
                    errors.push(InventoryError {
                        path: err
                            .path()
                            .map(|path| path.display().to_string())
                            .unwrap_or_default(),
                        message: err.to_string(),
                    });
                }
            }
        }

        tracing::debug!(candidates = candidates.len(), "source walk complete");

        let results = pool.install(|| {
            candidates
                .par_iter()
                .map(|path| describe(root, path))
                .collect::<Vec<_>>()
        });

        let mut assets = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(asset) => assets.push(asset),
                Err(err) => errors.push(err),
            }
        }
        assets.sort_by(|a, b| a.relative.cmp(&b.relative));

        tracing::info!(
            assets = assets.len(),
            errors = errors.len(),
            "inventory complete"
        );
        Ok(InventoryScan { assets, errors })
    }

    fn is_ignored(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name();
        name.to_string_lossy().starts_with('.') || self.ignore.is_match(name)
    }
}

fn describe(root: &Utf8Path, path: &Utf8Path) -> Result<RawAsset, InventoryError> {
    let fail = |message: String| InventoryError {
        path: path.to_string(),
        message,
    };
    let size = path
        .as_std_path()
        .metadata()
        .map_err(|err| fail(err.to_string()))?
        .len();
    let fingerprint = fingerprint_file(path.as_std_path()).map_err(|err| fail(err.to_string()))?;
    let relative = path
        .strip_prefix(root)
        .map(Utf8Path::to_path_buf)
        .map_err(|err| fail(err.to_string()))?;
    Ok(RawAsset {
        path: path.to_path_buf(),
        relative,
        size,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use rayon::ThreadPoolBuilder;

    use super::*;
    use crate::config::default_ignore;

    #[test]
    fn skips_fetch_side_files_and_hidden_entries() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("1000001_20227_2_0.zip"), b"a").unwrap();
        std::fs::write(root.join("fetched.lis"), b"x").unwrap();
        std::fs::write(root.join("2024-01-01.stderr"), b"x").unwrap();
        std::fs::write(root.join(".ukbbatch"), b"x").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/config"), b"x").unwrap();
        std::fs::create_dir_all(root.join("batch2")).unwrap();
        std::fs::write(root.join("batch2/1000002_20252_2_0.zip"), b"b").unwrap();

        let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let scan = Inventory::new(&default_ignore())
            .unwrap()
            .scan(&root, &pool)
            .unwrap();
        let names = scan
            .assets
            .iter()
            .map(|asset| asset.relative.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["1000001_20227_2_0.zip", "batch2/1000002_20252_2_0.zip"]);
        assert!(scan.errors.is_empty());
        assert_eq!(scan.assets[0].size, 1);
    }

    #[test]
    fn ignore_patterns_are_globs() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("scratch_7")).unwrap();
        std::fs::write(root.join("scratch_7/1000001_20252_2_0.zip"), b"a").unwrap();
        std::fs::write(root.join("1000001_20227_2_0.zip"), b"b").unwrap();
        std::fs::write(root.join("run1.log"), b"x").unwrap();

        let ignore = vec!["scratch_[0-9]".to_string(), "run?.log".to_string()];
        let pool = ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let scan = Inventory::new(&ignore).unwrap().scan(&root, &pool).unwrap();
        assert_eq!(scan.assets.len(), 1);
        assert_eq!(scan.assets[0].relative.as_str(), "1000001_20227_2_0.zip");
    }

    #[test]
    fn missing_root_is_fatal() {
        let pool = ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let err = Inventory::new(&[])
            .unwrap()
            .scan(Utf8Path::new("/definitely/not/here"), &pool)
            .unwrap_err();
        assert!(matches!(err, BidsError::SourceNotFound(_)));
    }
}
