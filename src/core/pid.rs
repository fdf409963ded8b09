//! PID file management: a plain-text decimal PID written at start and
//! removed on clean stop.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, info};

use crate::error::SupervisorError;

/// Writes the current PID, truncating any existing file. Mode `0666`.
pub fn store(path: &Path) -> Result<(), SupervisorError> {
    info!(target: "supervisor", ?path, "creating pid file");

    let pid_err = |reason: String| SupervisorError::PidFile {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
        .map_err(|e| pid_err(format!("could not open: {e}")))?;

    write!(file, "{}", std::process::id()).map_err(|e| pid_err(format!("could not write: {e}")))
}

/// Removes the PID file. A directory at the path is an error.
pub fn delete(path: &Path) -> Result<(), SupervisorError> {
    debug!(target: "supervisor", ?path, "removing pid file");

    let pid_err = |reason: String| SupervisorError::PidFile {
        path: path.to_path_buf(),
        reason,
    };

    let meta = std::fs::metadata(path).map_err(|e| pid_err(format!("could not stat: {e}")))?;
    if meta.is_dir() {
        return Err(pid_err("path is a directory".to_string()));
    }
    std::fs::remove_file(path).map_err(|e| pid_err(format!("could not remove: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_writes_decimal_pid_and_delete_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envisor.pid");

        store(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn store_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envisor.pid");
        std::fs::write(&path, "999999999999").unwrap();

        store(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn delete_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = delete(&dir.path().join("nope.pid")).unwrap_err();
        assert!(matches!(err, SupervisorError::PidFile { .. }));
    }

    #[test]
    fn delete_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = delete(dir.path()).unwrap_err();
        assert!(matches!(err, SupervisorError::PidFile { .. }));
    }
}
