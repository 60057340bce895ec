#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arborfs::fs::{format, FileKind, Filesystem, FormatOptions, MountOptions};
use arborfs::primitives::io::{FileIo, MemFileIo};
use arborfs::types::objectid::FIRST_FREE as ROOT_DIR;
use arborfs::{ArborError, TreeId};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum FileOp {
    Create { name: u16, sectors: u8, fill: u8 },
    Unlink { name: u16 },
    Flush,
}

fn op_strategy() -> impl Strategy<Value = FileOp> {
    let names = 0u16..96;
    prop_oneof![
        4 => (names.clone(), 0u8..4, any::<u8>())
            .prop_map(|(name, sectors, fill)| FileOp::Create { name, sectors, fill }),
        2 => names.prop_map(|name| FileOp::Unlink { name }),
        1 => Just(FileOp::Flush),
    ]
}

fn entry_name(name: u16) -> Vec<u8> {
    format!("entry-{name:03}").into_bytes()
}

fn fresh_device() -> Vec<Arc<dyn FileIo>> {
    let device: Arc<dyn FileIo> = Arc::new(MemFileIo::new(128 << 20));
    let devices = vec![device];
    format(&devices, &FormatOptions::scratch()).expect("format");
    devices
}

fn quiet() -> MountOptions {
    MountOptions {
        background_flush: false,
        ..MountOptions::default()
    }
}

fn snapshot(fs: &Filesystem) -> BTreeMap<Vec<u8>, Vec<u8>> {
    fs.list_dir(TreeId::FS, ROOT_DIR)
        .expect("list")
        .into_iter()
        .map(|entry| {
            let data = fs.read(TreeId::FS, entry.inode).expect("read");
            (entry.name, data)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn directory_matches_model_across_commits_and_remounts(
        ops in prop::collection::vec(op_strategy(), 1..120)
    ) {
        let devices = fresh_device();
        let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        {
            let fs = Filesystem::open(devices.clone(), quiet()).expect("mount");
            for op in ops {
                match op {
                    FileOp::Create { name, sectors, fill } => {
                        let name = entry_name(name);
                        let created = fs.create(TreeId::FS, ROOT_DIR, &name, FileKind::File);
                        if reference.contains_key(&name) {
                            prop_assert!(matches!(created, Err(ArborError::Invalid(_))));
                            continue;
                        }
                        let inode = created.expect("create");
                        let data = vec![fill; sectors as usize * 4096];
                        if !data.is_empty() {
                            fs.write(TreeId::FS, inode, 0, &data).expect("write");
                        }
                        reference.insert(name, data);
                    }
                    FileOp::Unlink { name } => {
                        let name = entry_name(name);
                        let removed = fs.unlink(TreeId::FS, ROOT_DIR, &name);
                        if reference.remove(&name).is_some() {
                            removed.expect("unlink");
                        } else {
                            prop_assert!(matches!(removed, Err(ArborError::NotFound)));
                        }
                    }
                    FileOp::Flush => {
                        fs.flush().expect("flush");
                    }
                }
            }
            prop_assert_eq!(&snapshot(&fs), &reference);
            fs.shutdown().expect("shutdown");
        }

        let fs = Filesystem::open(devices, quiet()).expect("remount");
        prop_assert_eq!(snapshot(&fs), reference);
        let sb = fs.superblock();
        let used: u64 = fs.with_state(|s| {
            s.chunks
                .iter()
                .map(|c| {
                    let c = c.lock();
                    c.used * c.usage_multiplier()
                })
                .sum()
        });
        prop_assert_eq!(sb.bytes_used, used);
    }
}
