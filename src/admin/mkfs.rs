use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::util::{create_images, uuid_string};
use crate::admin::Result;
use crate::fs::{format, FormatOptions};

/// Outcome of [`mkfs`].
#[derive(Clone, Debug, Serialize)]
pub struct MkfsReport {
    /// Filesystem UUID.
    pub fsid: String,
    /// Label written to the superblock.
    pub label: String,
    /// Image files, in device-id order.
    pub devices: Vec<String>,
    /// Size of every image in bytes.
    pub device_size: u64,
    /// Tree node size.
    pub node_size: u32,
    /// Generation of the first published superblock.
    pub generation: u64,
    /// Bytes allocated to chunks after formatting.
    pub bytes_used: u64,
}

/// Creates `paths` as `size`-byte images and formats them as one
/// filesystem.
///
/// # Errors
///
/// Fails if an image exists and `overwrite` is unset, or if formatting
/// fails.
pub fn mkfs<P: AsRef<Path>>(
    paths: &[P],
    size: u64,
    opts: &FormatOptions,
    overwrite: bool,
) -> Result<MkfsReport> {
    let devices = create_images(paths, size, overwrite)?;
    let sb = format(&devices, opts)?;
    let report = MkfsReport {
        fsid: uuid_string(&sb.fsid),
        label: sb.label.clone(),
        devices: paths
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect(),
        device_size: size,
        node_size: sb.node_size,
        generation: sb.generation,
        bytes_used: sb.bytes_used,
    };
    info!(fsid = %report.fsid, devices = report.devices.len(), "admin.mkfs");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::util::open_images;
    use crate::storage::superblock::load_superblock;

    #[test]
    fn mkfs_writes_labelled_images() {
        let dir = tempfile::tempdir().unwrap();
        let paths = [dir.path().join("a.img"), dir.path().join("b.img")];
        let opts = FormatOptions {
            label: "scratch".into(),
            ..FormatOptions::scratch()
        };
        let report = mkfs(&paths, 64 << 20, &opts, false).unwrap();
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.generation, 1);
        for io in open_images(&paths).unwrap() {
            let sb = load_superblock(io.as_ref()).unwrap();
            assert_eq!(sb.label, "scratch");
            assert_eq!(uuid_string(&sb.fsid), report.fsid);
        }
    }
}
