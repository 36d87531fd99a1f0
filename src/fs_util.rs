use std::fs;
use std::io::{self, Read};
use std::path::Path;

use camino::Utf8Path;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::domain::Fingerprint;
use crate::error::BidsError;

const HASH_CHUNK: usize = 1024 * 1024;

pub fn fingerprint_file(path: &Path) -> io::Result<Fingerprint> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Fingerprint::from_hex(format!("{:x}", hasher.finalize())))
}

pub fn fingerprint_bytes(content: &[u8]) -> Fingerprint {
    Fingerprint::from_hex(format!("{:x}", Sha256::digest(content)))
}

pub fn validate_zip(zip_path: &Path) -> Result<(), BidsError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| BidsError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| BidsError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), BidsError> {
    let parent = path
        .parent()
        .ok_or_else(|| BidsError::Filesystem(format!("invalid path: {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".ukb-bids-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| BidsError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn compile_globset(patterns: &[String]) -> Result<GlobSet, BidsError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            BidsError::InvalidConfig(format!("invalid ignore pattern {pattern:?}: {err}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| BidsError::InvalidConfig(format!("invalid ignore patterns: {err}")))
}
