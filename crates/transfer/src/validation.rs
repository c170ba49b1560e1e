use std::path::{Component, Path};

use crate::TransferError;

/// Validates a name relative to the chunk storage root.
///
/// Accepts upload ids and `<id>/<chunk>` style names. Rejects empty names,
/// absolute paths, prefixes and any `..` component, so a stored name can
/// never resolve outside the storage root.
pub fn validate_storage_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty name".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!("absolute: {name}")));
    }

    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!("traversal: {name}")));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!("absolute: {name}")));
            }
        }
    }

    if normal == 0 {
        return Err(TransferError::InvalidPath(format!("no file component: {name}")));
    }
    Ok(())
}

/// Validates an upload id used as a directory and file stem.
///
/// An id must be exactly one path component.
pub fn validate_upload_id(id: &str) -> Result<(), TransferError> {
    validate_storage_name(id)?;
    if id.contains(['/', '\\']) || id == "." {
        return Err(TransferError::InvalidPath(format!("not a single component: {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(validate_storage_name("").is_err());
        assert!(validate_upload_id("").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_storage_name("..").is_err());
        assert!(validate_storage_name("../outside").is_err());
        assert!(validate_storage_name("id/../../escape").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(validate_storage_name("/tmp/chunk").is_err());
    }

    #[test]
    fn rejects_current_dir_only() {
        assert!(validate_storage_name(".").is_err());
        assert!(validate_storage_name("./").is_err());
    }

    #[test]
    fn accepts_chunk_names() {
        assert!(validate_storage_name("2b1f0c").is_ok());
        assert!(validate_storage_name("2b1f0c/3").is_ok());
        assert!(validate_storage_name("2b1f0c.upload").is_ok());
    }

    #[test]
    fn upload_id_is_single_component() {
        assert!(validate_upload_id("5f3c2a9e-0000-4000-8000-000000000001").is_ok());
        assert!(validate_upload_id("a/b").is_err());
        assert!(validate_upload_id("a\\b").is_err());
        assert!(validate_upload_id("..").is_err());
    }
}
