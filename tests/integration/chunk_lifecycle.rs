#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use arborfs::admin::{mkfs, verify, VerifyLevel};
use arborfs::fs::{FileKind, Filesystem, FormatOptions, MountOptions};
use arborfs::types::objectid::FIRST_FREE as ROOT_DIR;
use arborfs::TreeId;

const FILE_LEN: usize = 2 << 20;
const FILES: usize = 40;

fn uncached_mount() -> MountOptions {
    MountOptions {
        background_flush: false,
        space_cache: false,
        ..MountOptions::default()
    }
}

fn data_chunks(fs: &Filesystem) -> usize {
    fs.with_state(|s| s.chunks.iter().filter(|c| c.lock().is_data()).count())
}

fn bytes_used(fs: &Filesystem) -> u64 {
    fs.superblock().bytes_used
}

fn fill(fs: &Arc<Filesystem>) {
    for i in 0..FILES {
        let name = format!("blob-{i:02}");
        let ino = fs
            .create(TreeId::FS, ROOT_DIR, name.as_bytes(), FileKind::File)
            .expect("create");
        fs.write(TreeId::FS, ino, 0, &vec![i as u8; FILE_LEN])
            .expect("write");
    }
}

fn images(dir: &tempfile::TempDir) -> Vec<PathBuf> {
    let paths = vec![dir.path().join("disk.img")];
    let opts = FormatOptions {
        space_cache: false,
        ..FormatOptions::scratch()
    };
    mkfs(&paths, 512 << 20, &opts, false).expect("mkfs");
    paths
}

#[test]
fn data_chunks_are_allocated_on_demand() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = images(&dir);
    let fs = Filesystem::open_paths(&paths, uncached_mount()).expect("mount");
    assert_eq!(data_chunks(&fs), 0);
    let before = bytes_used(&fs);

    fill(&fs);
    fs.flush().expect("flush");
    assert!(data_chunks(&fs) >= 2, "{} data chunks", data_chunks(&fs));
    assert!(bytes_used(&fs) >= before + (FILES * FILE_LEN) as u64);
    drop(fs);

    let report = verify(&paths, VerifyLevel::Full).expect("verify");
    assert!(report.success, "{:?}", report.findings);
    assert!(report.counts.chunks >= 4);
}

#[test]
fn emptied_data_chunks_are_dropped_on_the_following_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = images(&dir);
    {
        let fs = Filesystem::open_paths(&paths, uncached_mount()).expect("mount");
        fill(&fs);
        fs.flush().expect("fill commit");
        let populated = bytes_used(&fs);

        for i in 0..FILES {
            let name = format!("blob-{i:02}");
            fs.unlink(TreeId::FS, ROOT_DIR, name.as_bytes()).expect("unlink");
        }
        fs.flush().expect("unlink commit");
        assert!(bytes_used(&fs) < populated);
        assert!(data_chunks(&fs) >= 2, "chunks linger until the next commit");

        let stats = fs.flush().expect("drop commit");
        assert!(stats.is_some(), "emptied chunks schedule another commit");
        assert_eq!(data_chunks(&fs), 0);
        assert_eq!(fs.flush().expect("idle"), None);
    }

    let fs = Filesystem::open_paths(&paths, uncached_mount()).expect("remount");
    assert_eq!(data_chunks(&fs), 0);
    assert!(fs.list_dir(TreeId::FS, ROOT_DIR).expect("list").is_empty());
    drop(fs);

    let report = verify(&paths, VerifyLevel::Full).expect("verify");
    assert!(report.success, "{:?}", report.findings);
}

#[test]
fn freed_space_is_reused_after_remount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = images(&dir);
    {
        let fs = Filesystem::open_paths(&paths, uncached_mount()).expect("mount");
        fill(&fs);
        for i in (0..FILES).step_by(2) {
            let name = format!("blob-{i:02}");
            fs.unlink(TreeId::FS, ROOT_DIR, name.as_bytes()).expect("unlink");
        }
        fs.shutdown().expect("shutdown");
    }

    let fs = Filesystem::open_paths(&paths, uncached_mount()).expect("remount");
    let chunks = data_chunks(&fs);
    let ino = fs
        .create(TreeId::FS, ROOT_DIR, b"refill", FileKind::File)
        .expect("create");
    fs.write(TreeId::FS, ino, 0, &vec![0xee; FILE_LEN]).expect("write");
    fs.flush().expect("flush");
    assert_eq!(data_chunks(&fs), chunks);
    assert_eq!(fs.read(TreeId::FS, ino).expect("read"), vec![0xee; FILE_LEN]);
    let kept = fs
        .lookup(TreeId::FS, ROOT_DIR, b"blob-01")
        .expect("lookup")
        .expect("odd blobs remain");
    assert_eq!(fs.read(TreeId::FS, kept).expect("read"), vec![1; FILE_LEN]);
}
