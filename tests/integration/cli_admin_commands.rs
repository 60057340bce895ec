#![allow(missing_docs)]

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use arborfs::storage::superblock::SUPERBLOCK_OFFSETS;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn setup_image(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.img"));
    cargo_bin_cmd!("arborfs")
        .args(["mkfs", "--scratch", "--size", "128M", "--label", name])
        .arg(&path)
        .assert()
        .success();
    (dir, path)
}

fn json_output(args: &[&str], image: &Path) -> Value {
    let output = cargo_bin_cmd!("arborfs")
        .args(["--format", "json"])
        .args(args)
        .arg(image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn mkfs_reports_the_new_filesystem() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("fresh.img");
    let output = cargo_bin_cmd!("arborfs")
        .args(["--format", "json", "mkfs", "--scratch", "--size", "64M", "--label", "fresh"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["label"], "fresh");
    assert_eq!(json["node_size"], 4096);
    assert_eq!(json["device_size"], 64 << 20);
    assert_eq!(json["fsid"].as_str().map(str::len), Some(36));
    assert_eq!(fs::metadata(&path).expect("image").len(), 64 << 20);
}

#[test]
fn mkfs_refuses_to_overwrite_without_force() {
    let (_dir, path) = setup_image("twice");
    cargo_bin_cmd!("arborfs")
        .args(["mkfs", "--scratch", "--size", "128M"])
        .arg(&path)
        .assert()
        .failure()
        .code(1);
    cargo_bin_cmd!("arborfs")
        .args(["mkfs", "--scratch", "--size", "128M", "--force"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn inspect_emits_json() {
    let (_dir, path) = setup_image("inspect");
    let json = json_output(&["inspect"], &path);
    assert_eq!(json["superblock"]["label"], "inspect");
    assert_eq!(json["superblock"]["generation"], 1);
    assert_eq!(json["superblock"]["num_devices"], 1);
    assert!(json["superblock"]["bytes_used"].as_u64().unwrap_or(0) > 0);

    let chunks = json["chunks"].as_array().expect("chunks");
    assert!(chunks.iter().any(|c| c["kind"] == "system"));
    assert!(chunks.iter().any(|c| c["kind"] == "metadata"));

    let trees: Vec<&str> = json["trees"]
        .as_array()
        .expect("trees")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    for expected in ["root", "extent", "chunk", "dev", "fs", "csum"] {
        assert!(trees.contains(&expected), "{expected} missing from {trees:?}");
    }
}

#[test]
fn inspect_prints_text_sections() {
    let (_dir, path) = setup_image("text");
    let output = cargo_bin_cmd!("arborfs")
        .arg("inspect")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    for section in ["Superblock:", "Backup roots:", "Chunks:", "Devices:", "Trees:"] {
        assert!(text.contains(section), "missing {section}");
    }
}

#[test]
fn verify_full_succeeds() {
    let (_dir, path) = setup_image("verify");
    let json = json_output(&["verify", "--level", "full"], &path);
    assert!(json["success"].as_bool().unwrap_or(false));
    assert_eq!(json["level"], "full");
    assert!(json["counts"]["nodes"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn verify_fails_on_damaged_superblock_copy() {
    let (_dir, path) = setup_image("damaged");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open image");
    file.seek(SeekFrom::Start(SUPERBLOCK_OFFSETS[1] + 100))
        .expect("seek");
    file.write_all(&[0xff; 32]).expect("corrupt");
    file.sync_all().expect("sync");
    drop(file);

    let output = cargo_bin_cmd!("arborfs")
        .args(["--format", "json", "verify", "--level", "fast"])
        .arg(&path)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["success"], false);
    assert!(json["findings"]
        .as_array()
        .expect("findings")
        .iter()
        .any(|f| f["severity"] == "error"));
}

#[test]
fn missing_image_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("arborfs")
        .arg("inspect")
        .arg(dir.path().join("absent.img"))
        .assert()
        .failure()
        .code(1);
}

#[test]
fn config_file_feeds_mkfs_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("arborfs.toml");
    fs::write(
        &config,
        r#"
[format]
node_size = 8192
label = "configured"
metadata_profile = "single"
system_profile = "single"
metadata_chunk_size = 8388608
system_chunk_size = 1048576
"#,
    )
    .expect("write config");

    let output = cargo_bin_cmd!("arborfs")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "config"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["format"]["node_size"], 8192);
    assert_eq!(json["mount"]["read_only"], false);

    let image = dir.path().join("configured.img");
    let output = cargo_bin_cmd!("arborfs")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "mkfs", "--size", "128M"])
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["label"], "configured");
    assert_eq!(json["node_size"], 8192);
}
