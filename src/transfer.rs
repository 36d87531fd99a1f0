use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::TransferMode;
use crate::error::ExecutionError;

/// Places one source file at one destination path. Implementations must
/// either leave a complete file at `destination` or leave it untouched.
pub trait TransferPrimitive: Send + Sync {
    fn transfer(&self, source: &Utf8Path, destination: &Utf8Path) -> Result<(), ExecutionError>;
}

impl<T: TransferPrimitive + ?Sized> TransferPrimitive for Arc<T> {
    fn transfer(&self, source: &Utf8Path, destination: &Utf8Path) -> Result<(), ExecutionError> {
        (**self).transfer(source, destination)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FsTransfer {
    mode: TransferMode,
}

impl FsTransfer {
    pub fn new(mode: TransferMode) -> Self {
        Self { mode }
    }
}

impl TransferPrimitive for FsTransfer {
    fn transfer(&self, source: &Utf8Path, destination: &Utf8Path) -> Result<(), ExecutionError> {
        let parent = destination
            .parent()
            .ok_or_else(|| ExecutionError::Primitive(format!("invalid destination: {destination}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ExecutionError::io(parent, &err))?;

        match self.mode {
            TransferMode::Copy => copy_file_atomic(source, destination, parent),
            TransferMode::Move => match fs::rename(source.as_std_path(), destination.as_std_path()) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                    copy_file_atomic(source, destination, parent)?;
                    fs::remove_file(source.as_std_path())
                        .map_err(|err| ExecutionError::io(source, &err))
                }
                Err(err) => Err(ExecutionError::io(source, &err)),
            },
            TransferMode::Hardlink => {
                let staged = staging_path(parent, destination);
                let _ = fs::remove_file(staged.as_std_path());
                fs::hard_link(source.as_std_path(), staged.as_std_path())
                    .map_err(|err| ExecutionError::io(source, &err))?;
                fs::rename(staged.as_std_path(), destination.as_std_path()).map_err(|err| {
                    let _ = fs::remove_file(staged.as_std_path());
                    ExecutionError::io(destination, &err)
                })
            }
        }
    }
}

fn copy_file_atomic(
    source: &Utf8Path,
    destination: &Utf8Path,
    parent: &Utf8Path,
) -> Result<(), ExecutionError> {
    let temp = tempfile::Builder::new()
        .prefix(".ukb-bids-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ExecutionError::io(parent, &err))?;
    fs::copy(source.as_std_path(), temp.path()).map_err(|err| ExecutionError::io(source, &err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| ExecutionError::io(destination, &err))?;
    temp.persist(destination.as_std_path())
        .map_err(|err| ExecutionError::io(destination, &err.error))?;
    Ok(())
}

fn staging_path(parent: &Utf8Path, destination: &Utf8Path) -> Utf8PathBuf {
    let name = destination.file_name().unwrap_or("file");
    parent.join(format!(".ukb-bids-link-{}-{name}", std::process::id()))
}

/// Bounds every call of the wrapped primitive. The call runs on its own
/// thread; on timeout the caller gets [`ExecutionError::Timeout`] and the
/// thread is left to finish in the background.
pub struct TimedTransfer<T> {
    inner: Arc<T>,
    timeout: Duration,
}

impl<T: TransferPrimitive + 'static> TimedTransfer<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }
}

impl<T: TransferPrimitive + 'static> TransferPrimitive for TimedTransfer<T> {
    fn transfer(&self, source: &Utf8Path, destination: &Utf8Path) -> Result<(), ExecutionError> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        std::thread::spawn(move || {
            let _ = tx.send(inner.transfer(&source, &destination));
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ExecutionError::Timeout {
                after_ms: self.timeout.as_millis(),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ExecutionError::Primitive(
                "transfer thread exited without a result".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct Slow;

    impl TransferPrimitive for Slow {
        fn transfer(&self, _: &Utf8Path, _: &Utf8Path) -> Result<(), ExecutionError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn copy_creates_parents_and_keeps_source() {
        let (_temp, root) = temp_root();
        let source = root.join("a.zip");
        fs::write(source.as_std_path(), b"payload").unwrap();
        let destination = root.join("out/sub-1/anat/sub-1_T1w.zip");

        FsTransfer::new(TransferMode::Copy)
            .transfer(&source, &destination)
            .unwrap();
        assert_eq!(fs::read(destination.as_std_path()).unwrap(), b"payload");
        assert!(source.as_std_path().exists());
    }

    #[test]
    fn move_removes_source() {
        let (_temp, root) = temp_root();
        let source = root.join("a.zip");
        fs::write(source.as_std_path(), b"payload").unwrap();
        let destination = root.join("out/b.zip");

        FsTransfer::new(TransferMode::Move)
            .transfer(&source, &destination)
            .unwrap();
        assert!(!source.as_std_path().exists());
        assert_eq!(fs::read(destination.as_std_path()).unwrap(), b"payload");
    }

    #[test]
    fn missing_source_is_not_transient() {
        let (_temp, root) = temp_root();
        let err = FsTransfer::new(TransferMode::Copy)
            .transfer(&root.join("missing.zip"), &root.join("out/b.zip"))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn timed_transfer_gives_up() {
        let timed = TimedTransfer::new(Slow, Duration::from_millis(20));
        let err = timed
            .transfer(Utf8Path::new("a"), Utf8Path::new("b"))
            .unwrap_err();
        assert_matches!(err, ExecutionError::Timeout { after_ms: 20 });
    }
}
