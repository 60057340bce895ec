use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::admin::error::{AdminError, Result};
use crate::primitives::io::{FileIo, StdFileIo};

/// Opens existing image files in device order.
///
/// # Errors
///
/// Returns [`AdminError::MissingImage`] for the first path that does not
/// exist, or the I/O error of a failed open.
pub fn open_images<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Arc<dyn FileIo>>> {
    let mut devices: Vec<Arc<dyn FileIo>> = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AdminError::missing_image(path));
        }
        devices.push(Arc::new(StdFileIo::open(path)?));
    }
    Ok(devices)
}

/// Creates zero-filled image files of `len` bytes.
///
/// Existing files are only replaced when `overwrite` is set.
pub fn create_images<P: AsRef<Path>>(
    paths: &[P],
    len: u64,
    overwrite: bool,
) -> Result<Vec<Arc<dyn FileIo>>> {
    let mut devices: Vec<Arc<dyn FileIo>> = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(AdminError::ImageExists(path.to_path_buf()));
        }
        ensure_parent_dir(path)?;
        devices.push(Arc::new(StdFileIo::create(path, len)?));
    }
    Ok(devices)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Renders a UUID the way `inspect` prints it.
pub(crate) fn uuid_string(uuid: &[u8; 16]) -> String {
    let hex = hex::encode(uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_is_grouped() {
        let uuid = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x66, 0x77,
        ];
        assert_eq!(uuid_string(&uuid), "01234567-89ab-cdef-0011-223344556677");
    }

    #[test]
    fn missing_and_existing_images_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("disk.img");
        assert!(matches!(
            open_images(&[&path]),
            Err(AdminError::MissingImage(_))
        ));
        let created = create_images(&[&path], 1 << 20, false).unwrap();
        assert_eq!(created[0].len().unwrap(), 1 << 20);
        assert!(matches!(
            create_images(&[&path], 1 << 20, false),
            Err(AdminError::ImageExists(_))
        ));
        assert_eq!(open_images(&[&path]).unwrap().len(), 1);
    }
}
