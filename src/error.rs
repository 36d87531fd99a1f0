use std::io;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BidsError {
    #[error("source root not found: {0}")]
    #[diagnostic(help("pass the directory that holds the bulk download"))]
    SourceNotFound(Utf8PathBuf),

    #[error("source root is not a directory: {0}")]
    SourceNotDirectory(Utf8PathBuf),

    #[error("no usable source assets found under {0}")]
    EmptyInventory(Utf8PathBuf),

    #[error("every one of the {count} source assets failed to parse or resolve")]
    #[diagnostic(help("check the field table and the participant table"))]
    AllAssetsFailed { count: usize },

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid datatype: {0}")]
    InvalidDatatype(String),

    #[error("invalid source key: {0}")]
    InvalidSourceKey(String),

    #[error(transparent)]
    Participants(#[from] ParticipantError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unrecognized source naming pattern: {0}")]
    UnrecognizedPattern(String),

    #[error("numeric token {token:?} out of range in {name}")]
    InvalidNumber { name: String, token: String },

    #[error("source file name is not valid UTF-8: {0}")]
    NonUtf8(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("unknown field code: {0}")]
    UnknownFieldCode(u32),

    #[error("extension {extension:?} is not declared for field {field}")]
    UnexpectedExtension { field: u32, extension: String },

    #[error("ambiguous session mapping for subject {subject}: {detail}")]
    AmbiguousSession { subject: String, detail: String },

    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    #[error("failed to read participant table {path}: {message}")]
    Read { path: Utf8PathBuf, message: String },

    #[error("participant table {path} has no {column:?} column")]
    MissingColumn { path: Utf8PathBuf, column: String },

    #[error("participant table {path}, line {line}: {message}")]
    InvalidRow {
        path: Utf8PathBuf,
        line: usize,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error(
        "concurrent modification of {key}: expected version {expected:?}, found {found:?}"
    )]
    ConcurrentModification {
        key: String,
        expected: Option<u32>,
        found: Option<u32>,
    },

    #[error("corrupt manifest {path} at line {line}: {message}")]
    Corrupt {
        path: Utf8PathBuf,
        line: usize,
        message: String,
    },

    #[error("manifest I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("I/O error on {path}: {message}")]
    Io {
        path: Utf8PathBuf,
        message: String,
        transient: bool,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(Utf8PathBuf),

    #[error("transfer timed out after {after_ms} ms")]
    Timeout { after_ms: u128 },

    #[error("destination already holds different content: {0}")]
    DestinationOccupied(Utf8PathBuf),

    #[error("converted file was modified after conversion: {0}")]
    DestinationModified(Utf8PathBuf),

    #[error("fingerprint mismatch at {path}: expected {expected}, found {found}")]
    FingerprintMismatch {
        path: Utf8PathBuf,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("transfer primitive failed: {0}")]
    Primitive(String),
}

impl ExecutionError {
    pub fn io(path: impl Into<Utf8PathBuf>, err: &io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => ExecutionError::PermissionDenied(path),
            kind => ExecutionError::Io {
                path,
                message: err.to_string(),
                transient: matches!(
                    kind,
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                ),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ExecutionError::Timeout { .. } => true,
            ExecutionError::Io { transient, .. } => *transient,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(ExecutionError::io("a", &interrupted).is_transient());

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(!ExecutionError::io("a", &missing).is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            ExecutionError::io("a", &denied),
            ExecutionError::PermissionDenied(Utf8PathBuf::from("a"))
        );
        assert!(ExecutionError::Timeout { after_ms: 5 }.is_transient());
    }
}
