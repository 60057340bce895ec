#![allow(missing_docs)]

use std::path::PathBuf;

use arborfs::admin::{mkfs, verify, VerifyLevel};
use arborfs::fs::{FileKind, Filesystem, FormatOptions, MountOptions};
use arborfs::types::objectid::FIRST_FREE as ROOT_DIR;
use arborfs::{ArborError, TreeId};
use tempfile::TempDir;

fn image_set(dir: &TempDir, count: usize) -> Vec<PathBuf> {
    let paths: Vec<PathBuf> = (0..count)
        .map(|i| dir.path().join(format!("disk{i}.img")))
        .collect();
    mkfs(&paths, 128 << 20, &FormatOptions::scratch(), false).expect("mkfs");
    paths
}

fn free_totals(fs: &Filesystem) -> Vec<(u64, u64)> {
    fs.with_state(|s| {
        s.chunks
            .iter()
            .map(|c| {
                let c = c.lock();
                (c.offset, c.free.total())
            })
            .collect()
    })
}

fn writable() -> MountOptions {
    MountOptions {
        background_flush: false,
        ..MountOptions::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn files_of_various_sizes_survive_remount() -> Result<(), ArborError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = image_set(&dir, 1);
    let sizes = [1usize, 4096, 10_000, 65_536, 300_000];
    {
        let fs = Filesystem::open_paths(&paths, writable())?;
        for (i, size) in sizes.iter().enumerate() {
            let name = format!("file-{i}");
            let ino = fs.create(TreeId::FS, ROOT_DIR, name.as_bytes(), FileKind::File)?;
            fs.write(TreeId::FS, ino, 0, &pattern(*size, i as u8))?;
        }
        fs.shutdown()?;
    }

    let fs = Filesystem::open_paths(&paths, writable())?;
    for (i, size) in sizes.iter().enumerate() {
        let name = format!("file-{i}");
        let ino = fs
            .lookup(TreeId::FS, ROOT_DIR, name.as_bytes())?
            .expect("file present after remount");
        assert_eq!(fs.stat(TreeId::FS, ino)?.size, *size as u64);
        assert_eq!(fs.read(TreeId::FS, ino)?, pattern(*size, i as u8), "{name}");
    }
    drop(fs);

    let report = verify(&paths, VerifyLevel::Full).expect("verify");
    assert!(report.success, "{:?}", report.findings);
    Ok(())
}

#[test]
fn rewrites_replace_the_extent_at_an_offset() -> Result<(), ArborError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = image_set(&dir, 1);
    {
        let fs = Filesystem::open_paths(&paths, writable())?;
        let ino = fs.create(TreeId::FS, ROOT_DIR, b"log", FileKind::File)?;
        fs.write(TreeId::FS, ino, 0, &[1; 4096])?;
        fs.write(TreeId::FS, ino, 4096, &[2; 4096])?;
        fs.flush()?;
        fs.write(TreeId::FS, ino, 0, &[3; 4096])?;
        assert!(matches!(
            fs.write(TreeId::FS, ino, 100, &[0; 10]),
            Err(ArborError::Invalid(_))
        ));
        fs.shutdown()?;
    }

    let fs = Filesystem::open_paths(&paths, writable())?;
    let ino = fs.lookup(TreeId::FS, ROOT_DIR, b"log")?.expect("log");
    let data = fs.read(TreeId::FS, ino)?;
    assert_eq!(&data[..4096], &[3; 4096][..]);
    assert_eq!(&data[4096..], &[2; 4096][..]);
    Ok(())
}

#[test]
fn read_only_mount_sees_data_but_refuses_writes() -> Result<(), ArborError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = image_set(&dir, 1);
    {
        let fs = Filesystem::open_paths(&paths, writable())?;
        let ino = fs.create(TreeId::FS, ROOT_DIR, b"notes", FileKind::File)?;
        fs.write(TreeId::FS, ino, 0, b"hello")?;
        fs.shutdown()?;
    }

    let fs = Filesystem::open_paths(&paths, MountOptions::inspect())?;
    let ino = fs.lookup(TreeId::FS, ROOT_DIR, b"notes")?.expect("notes");
    assert_eq!(fs.read(TreeId::FS, ino)?, b"hello");
    assert!(matches!(
        fs.write(TreeId::FS, ino, 0, b"bye"),
        Err(ArborError::ReadOnly)
    ));
    assert!(matches!(
        fs.unlink(TreeId::FS, ROOT_DIR, b"notes"),
        Err(ArborError::ReadOnly)
    ));
    let generation = fs.superblock().generation;
    drop(fs);

    let fs = Filesystem::open_paths(&paths, MountOptions::inspect())?;
    assert_eq!(fs.superblock().generation, generation);
    Ok(())
}

#[test]
fn cached_and_rebuilt_free_space_agree() -> Result<(), ArborError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = image_set(&dir, 1);
    {
        let fs = Filesystem::open_paths(&paths, writable())?;
        for i in 0..12u8 {
            let name = [b'c', b'a' + i];
            let ino = fs.create(TreeId::FS, ROOT_DIR, &name, FileKind::File)?;
            fs.write(TreeId::FS, ino, 0, &vec![i; 4096 * (i as usize + 1)])?;
        }
        fs.unlink(TreeId::FS, ROOT_DIR, b"cc")?;
        fs.shutdown()?;
    }

    let trusted = Filesystem::open_paths(&paths, MountOptions::inspect())?;
    let cached = free_totals(&trusted);
    drop(trusted);

    let rebuilt = Filesystem::open_paths(
        &paths,
        MountOptions {
            trust_space_cache: false,
            ..MountOptions::inspect()
        },
    )?;
    assert_eq!(cached, free_totals(&rebuilt));
    Ok(())
}

#[test]
fn two_device_filesystem_mounts_from_either_order() -> Result<(), ArborError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = image_set(&dir, 2);
    {
        let fs = Filesystem::open_paths(&paths, writable())?;
        assert_eq!(fs.superblock().num_devices, 2);
        let ino = fs.create(TreeId::FS, ROOT_DIR, b"spread", FileKind::File)?;
        fs.write(TreeId::FS, ino, 0, &pattern(200_000, 7))?;
        fs.shutdown()?;
    }

    let reversed: Vec<PathBuf> = paths.iter().rev().cloned().collect();
    let fs = Filesystem::open_paths(&reversed, writable())?;
    let ino = fs.lookup(TreeId::FS, ROOT_DIR, b"spread")?.expect("spread");
    assert_eq!(fs.read(TreeId::FS, ino)?, pattern(200_000, 7));

    assert!(matches!(
        Filesystem::open_paths(&paths[..1], writable()),
        Err(ArborError::Unsupported(_))
    ));
    Ok(())
}
