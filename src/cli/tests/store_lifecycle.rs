//! End-to-end test of the store commands against a local tarball base image,
//! using the directory driver so no btrfs filesystem is needed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_a3s-rootfs");

struct Store {
    _tmp: TempDir,
    root: PathBuf,
    base_image: PathBuf,
}

impl Store {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let base_image = tmp.path().join("base.tar.gz");
        write_base_image(&base_image);
        Self {
            _tmp: tmp,
            root,
            base_image,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(BIN)
            .arg("--store")
            .arg(&self.root)
            .args(["--driver", "dir"])
            .args(args)
            .env_remove("A3S_ROOTFS_CONFIG")
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "{:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    }

    fn volumes(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root.join("volumes"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn write_base_image(path: &Path) {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in [("etc/hostname", &b"base\n"[..]), ("usr/bin/true", &b"#!"[..])] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    std::fs::write(path, encoder.finish().unwrap()).unwrap();
}

#[test]
fn test_create_list_stats_delete_clean() {
    let store = Store::new();
    let base = store.base_image.display().to_string();

    let rootfs = store.run_ok(&["create", "web", &base]);
    let rootfs = PathBuf::from(rootfs.trim());
    assert_eq!(std::fs::read(rootfs.join("etc/hostname")).unwrap(), b"base\n");
    assert!(rootfs.join("usr/bin/true").is_file());
    assert_eq!(store.volumes().len(), 1);

    assert_eq!(store.run_ok(&["list", "-q"]).trim(), "web");

    let stats: serde_json::Value =
        serde_json::from_str(&store.run_ok(&["stats", "web", "--json"])).unwrap();
    assert_eq!(stats["id"], "web");
    assert_eq!(stats["layers"], 1);
    assert_eq!(stats["base_image"], format!("file://{}", base));

    let usage: serde_json::Value =
        serde_json::from_str(&store.run_ok(&["stats", "--json"])).unwrap();
    assert_eq!(usage["images"], 1);
    assert_eq!(usage["volumes"], 1);
    assert_eq!(usage["incomplete_volumes"], 0);
    assert_eq!(usage["cached_blobs"], 1);

    // A second image on the same base shares the layer volume
    store.run_ok(&["create", "api", &base]);
    assert_eq!(store.volumes().len(), 1);

    let dup = store.run(&["create", "web", &base]);
    assert!(!dup.status.success());

    assert!(store.run_ok(&["delete", "web"]).contains("Deleted: web"));
    let report: serde_json::Value =
        serde_json::from_str(&store.run_ok(&["clean", "--json"])).unwrap();
    assert_eq!(report["destroyed"].as_array().unwrap().len(), 0);
    assert_eq!(store.volumes().len(), 1);

    store.run_ok(&["delete", "api"]);
    let report: serde_json::Value =
        serde_json::from_str(&store.run_ok(&["clean", "--json"])).unwrap();
    assert_eq!(report["destroyed"].as_array().unwrap().len(), 1);
    assert!(store.volumes().is_empty());
    assert!(store.run_ok(&["list", "-q"]).trim().is_empty());
}

#[test]
fn test_clean_keeps_listed_base_image() {
    let store = Store::new();
    let base = store.base_image.display().to_string();

    store.run_ok(&["pull", &base]);
    assert_eq!(store.volumes().len(), 1);

    let report: serde_json::Value =
        serde_json::from_str(&store.run_ok(&["clean", "--json", "--keep", &base])).unwrap();
    assert_eq!(report["destroyed"].as_array().unwrap().len(), 0);
    assert_eq!(store.volumes().len(), 1);

    store.run_ok(&["clean"]);
    assert!(store.volumes().is_empty());
}

#[test]
fn test_clean_below_threshold_is_a_no_op() {
    let store = Store::new();
    let base = store.base_image.display().to_string();
    store.run_ok(&["pull", &base]);

    let out = store.run_ok(&["clean", "--threshold", "1g"]);
    assert!(out.contains("nothing to do"));
    assert_eq!(store.volumes().len(), 1);
}

#[test]
fn test_delete_missing_image() {
    let store = Store::new();
    let output = store.run(&["delete", "ghost"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ghost"));

    store.run_ok(&["delete", "-f", "ghost"]);
}

#[test]
fn test_create_rejects_invalid_id() {
    let store = Store::new();
    let base = store.base_image.display().to_string();
    let output = store.run(&["create", "../escape", &base]);
    assert!(!output.status.success());
    assert!(!store.root.join("images/../escape").exists());
}
