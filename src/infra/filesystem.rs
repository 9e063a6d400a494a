//! Local filesystem operations
//!
//! Used for host-side state only; anything touching an image goes through
//! the command executor.

use std::path::Path;

use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Write content atomically: write a sibling temp file, then rename it
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", std::process::id()));
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, content).map_err(|e| FilesystemError::WriteFile {
        path: tmp.clone(),
        error: e.to_string(),
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        FilesystemError::WriteFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    })
}

/// Read content from a file
pub fn read_file(path: &Path) -> Result<String, FilesystemError> {
    std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Size of a local file in bytes
pub fn file_size(path: &Path) -> Result<u64, FilesystemError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| FilesystemError::ReadFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
}
