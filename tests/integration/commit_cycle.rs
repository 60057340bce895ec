#![allow(missing_docs)]

use std::sync::Arc;

use arborfs::fs::{format, FileKind, Filesystem, FormatOptions, MountOptions};
use arborfs::primitives::io::{FileIo, MemFileIo};
use arborfs::types::objectid::FIRST_FREE as ROOT_DIR;
use arborfs::{ArborError, TreeId};

fn devices(n: usize) -> (Vec<Arc<MemFileIo>>, Vec<Arc<dyn FileIo>>) {
    let mem: Vec<Arc<MemFileIo>> = (0..n).map(|_| Arc::new(MemFileIo::new(256 << 20))).collect();
    let dyns = mem.iter().map(|d| Arc::clone(d) as Arc<dyn FileIo>).collect();
    (mem, dyns)
}

fn quiet() -> MountOptions {
    MountOptions {
        background_flush: false,
        ..MountOptions::default()
    }
}

fn formatted(n: usize) -> (Vec<Arc<MemFileIo>>, Vec<Arc<dyn FileIo>>) {
    let (mem, dyns) = devices(n);
    format(&dyns, &FormatOptions::scratch()).expect("format");
    (mem, dyns)
}

#[test]
fn flush_commits_only_when_something_changed() {
    let (_, devs) = formatted(1);
    let fs = Filesystem::open(devs, quiet()).expect("mount");
    assert_eq!(fs.flush().expect("idle flush"), None);

    let ino = fs.create(TreeId::FS, ROOT_DIR, b"a", FileKind::File).unwrap();
    fs.write(TreeId::FS, ino, 0, &[1; 4096]).unwrap();
    let stats = fs.flush().expect("flush").expect("a commit ran");
    assert_eq!(stats.generation, 2);
    assert!(stats.nodes_written > 0);
    assert_eq!(fs.superblock().generation, 2);
    assert_eq!(fs.flush().expect("second flush"), None);
}

#[test]
fn backup_ring_tracks_recent_generations() {
    let (_, devs) = formatted(1);
    let fs = Filesystem::open(devs, quiet()).unwrap();
    for n in 0..5u8 {
        let name = [b'f', b'0' + n];
        fs.create(TreeId::FS, ROOT_DIR, &name, FileKind::File).unwrap();
        fs.flush().unwrap();
    }
    let sb = fs.superblock();
    assert_eq!(sb.generation, 6);
    let gens: Vec<u64> = sb.backups.iter().map(|b| b.tree_root_gen).collect();
    assert_eq!(gens, vec![3, 4, 5, 6]);
    assert_eq!(sb.backups[3].tree_root, sb.root);
}

#[test]
fn failed_commit_leaves_previous_generation_on_disk() {
    let (mem, devs) = formatted(1);
    {
        let fs = Filesystem::open(devs.clone(), quiet()).unwrap();
        let a = fs.create(TreeId::FS, ROOT_DIR, b"kept", FileKind::File).unwrap();
        fs.write(TreeId::FS, a, 0, b"durable").unwrap();
        fs.flush().unwrap();

        fs.create(TreeId::FS, ROOT_DIR, b"lost", FileKind::File).unwrap();
        mem[0].set_fail_writes(true);
        assert!(fs.flush().is_err());
    }
    mem[0].set_fail_writes(false);

    let fs = Filesystem::open(devs, quiet()).unwrap();
    assert_eq!(fs.superblock().generation, 2);
    let kept = fs.lookup(TreeId::FS, ROOT_DIR, b"kept").unwrap().expect("kept survives");
    assert_eq!(fs.read(TreeId::FS, kept).unwrap(), b"durable");
    assert_eq!(fs.lookup(TreeId::FS, ROOT_DIR, b"lost").unwrap(), None);
}

#[test]
fn directory_operations_round_trip() {
    let (_, devs) = formatted(1);
    {
        let fs = Filesystem::open(devs.clone(), quiet()).unwrap();
        let dir = fs.create(TreeId::FS, ROOT_DIR, b"docs", FileKind::Directory).unwrap();
        for name in [&b"one"[..], b"two", b"three"] {
            fs.create(TreeId::FS, dir, name, FileKind::File).unwrap();
        }
        assert!(matches!(
            fs.create(TreeId::FS, dir, b"two", FileKind::File),
            Err(ArborError::Invalid(_))
        ));
        assert!(matches!(
            fs.unlink(TreeId::FS, ROOT_DIR, b"docs"),
            Err(ArborError::Invalid(_))
        ));
        fs.unlink(TreeId::FS, dir, b"two").unwrap();
        fs.shutdown().unwrap();
    }

    let fs = Filesystem::open(devs, quiet()).unwrap();
    let dir = fs.lookup(TreeId::FS, ROOT_DIR, b"docs").unwrap().unwrap();
    let names: Vec<Vec<u8>> = fs
        .list_dir(TreeId::FS, dir)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![b"one".to_vec(), b"three".to_vec()]);
    assert_eq!(fs.stat(TreeId::FS, dir).unwrap().nlink, 1);
}

#[test]
fn subvolumes_are_created_and_dropped() {
    let (_, devs) = formatted(1);
    let subvol = {
        let fs = Filesystem::open(devs.clone(), quiet()).unwrap();
        let subvol = fs.create_subvolume().unwrap();
        assert_eq!(subvol.0, TreeId::FIRST_SUBVOLUME);
        let ino = fs.create(subvol, ROOT_DIR, b"inner", FileKind::File).unwrap();
        fs.write(subvol, ino, 0, &[9; 8192]).unwrap();
        fs.shutdown().unwrap();
        subvol
    };

    {
        let fs = Filesystem::open(devs.clone(), quiet()).unwrap();
        let ino = fs.lookup(subvol, ROOT_DIR, b"inner").unwrap().unwrap();
        assert_eq!(fs.read(subvol, ino).unwrap(), vec![9; 8192]);
        fs.delete_subvolume(subvol).unwrap();
        assert!(matches!(fs.delete_subvolume(subvol), Err(ArborError::NotFound)));
        fs.shutdown().unwrap();
    }

    let fs = Filesystem::open(devs, quiet()).unwrap();
    assert!(!fs.with_state(|s| s.trees.trees.contains_key(&subvol)));
}

#[test]
fn read_only_mount_refuses_changes() {
    let (_, devs) = formatted(1);
    let fs = Filesystem::open(devs, MountOptions::inspect()).unwrap();
    assert!(matches!(
        fs.create(TreeId::FS, ROOT_DIR, b"x", FileKind::File),
        Err(ArborError::ReadOnly)
    ));
    assert_eq!(fs.flush().unwrap(), None);
}

#[test]
fn background_flusher_commits_on_its_own() {
    let (_, devs) = formatted(1);
    let fs = Filesystem::open(
        devs,
        MountOptions {
            flush_interval_ms: 20,
            ..MountOptions::default()
        },
    )
    .unwrap();
    fs.create(TreeId::FS, ROOT_DIR, b"auto", FileKind::File).unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while fs.superblock().generation < 2 {
        assert!(std::time::Instant::now() < deadline, "flusher never committed");
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    fs.shutdown().unwrap();
}
