use std::path::{Component, Path, PathBuf};

use crate::error::TransferError;

/// Validates a file name received from a peer and resolves it under `root`.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Names that resolve to the root itself (`.`, `./`)
pub fn resolve_file_name(root: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    validate_file_name(file_name)?;
    Ok(root.join(file_name))
}

/// Checks that `file_name` is a relative path that stays inside its base
/// directory.
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidArgument("empty file name".into()));
    }

    let path = Path::new(file_name);

    if path.is_absolute() {
        return Err(TransferError::InvalidArgument(format!(
            "absolute path not allowed: {file_name}"
        )));
    }

    let mut named = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidArgument(format!(
                    "parent directory traversal not allowed: {file_name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidArgument(format!(
                    "path prefix not allowed: {file_name}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidArgument(format!(
                    "absolute path not allowed: {file_name}"
                )));
            }
            Component::Normal(_) => named = true,
            Component::CurDir => {}
        }
    }

    if !named {
        return Err(TransferError::InvalidArgument(format!(
            "file name has no file component: {file_name}"
        )));
    }
    Ok(())
}
