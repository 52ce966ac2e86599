use std::fs::create_dir_all;
use std::path::Path;

use tracing::error;

use crate::errors::StorageError;

pub(crate) fn create_parent_dir_if_not_exist(path: &Path) -> Result<(), StorageError> {
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
            if let Err(e) = create_dir_all(parent_dir) {
                error!("Failed to create directory {:?}: {:?}", parent_dir, e);
                return Err(StorageError::PathError {
                    path: parent_dir.to_path_buf(),
                    message: "could not create directory",
                    source: e,
                });
            }
        }
    }
    Ok(())
}
