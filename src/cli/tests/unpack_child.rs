//! Integration tests for the hidden `unpack` subcommand.
//!
//! The child is started through `sh` so the control descriptor can be
//! placed on fd 3, the way the store's re-exec does it.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_a3s-rootfs");

/// Run `a3s-rootfs unpack <target>` with `control` on fd 3 and `layer` on stdin.
fn run_unpack(target: &Path, control: &Path, layer: &[u8]) -> Output {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(r#"exec "$0" unpack "$1" 3<"$2""#)
        .arg(BIN)
        .arg(target)
        .arg(control)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    // An aborted child exits without reading stdin
    let _ = stdin.write_all(layer);
    drop(stdin);
    child.wait_with_output().unwrap()
}

fn layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn proceed_file(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("control");
    std::fs::write(&path, b"1").unwrap();
    path
}

#[test]
fn test_unpack_extracts_after_gate_opens() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("rootfs");
    std::fs::create_dir(&target).unwrap();
    let control = proceed_file(&tmp);

    let layer = layer_tar(&[("etc/hostname", b"web\n"), ("bin/sh", b"#!")]);
    let output = run_unpack(&target, &control, &layer);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(std::fs::read(target.join("etc/hostname")).unwrap(), b"web\n");
    assert!(target.join("bin/sh").is_file());
}

#[test]
fn test_unpack_aborts_on_closed_control_pipe() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("rootfs");
    std::fs::create_dir(&target).unwrap();

    let layer = layer_tar(&[("etc/hostname", b"web\n")]);
    let output = run_unpack(&target, Path::new("/dev/null"), &layer);

    assert!(output.status.success());
    assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
}

#[test]
fn test_unpack_applies_whiteouts() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("rootfs");
    std::fs::create_dir_all(target.join("etc")).unwrap();
    std::fs::write(target.join("etc/motd"), b"lower layer").unwrap();
    std::fs::write(target.join("etc/issue"), b"kept").unwrap();
    let control = proceed_file(&tmp);

    let layer = layer_tar(&[("etc/.wh.motd", b""), ("etc/os-release", b"ID=test\n")]);
    let output = run_unpack(&target, &control, &layer);

    assert!(output.status.success());
    assert!(!target.join("etc/motd").exists());
    assert!(!target.join("etc/.wh.motd").exists());
    assert!(target.join("etc/issue").exists());
    assert!(target.join("etc/os-release").exists());
}

#[test]
fn test_unpack_opaque_directory_hides_lower_layer() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("rootfs");
    std::fs::create_dir_all(target.join("etc/conf.d")).unwrap();
    std::fs::write(target.join("etc/from-lower-layer"), b"lower").unwrap();
    std::fs::write(target.join("etc/conf.d/old.conf"), b"lower").unwrap();
    std::fs::write(target.join("hostname"), b"lower").unwrap();
    let control = proceed_file(&tmp);

    let layer = layer_tar(&[("etc/.wh..wh..opq", b""), ("etc/os-release", b"ID=test\n")]);
    let output = run_unpack(&target, &control, &layer);

    assert!(output.status.success());
    assert!(!target.join("etc/from-lower-layer").exists());
    assert!(!target.join("etc/conf.d").exists());
    assert!(!target.join("etc/.wh..wh..opq").exists());
    assert!(target.join("etc/os-release").exists());
    assert!(target.join("hostname").exists());
}

#[test]
fn test_unpack_rejects_whiteout_of_parent_directory() {
    let tmp = TempDir::new().unwrap();
    let volumes = tmp.path().join("volumes");
    std::fs::create_dir_all(volumes.join("sibling")).unwrap();
    std::fs::write(volumes.join("sibling/keep"), b"keep").unwrap();
    let target = volumes.join("new");
    std::fs::create_dir(&target).unwrap();
    let control = proceed_file(&tmp);

    let output = run_unpack(&target, &control, &layer_tar(&[(".wh...", b"")]));

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid whiteout"));
    assert!(volumes.join("sibling/keep").exists());
}

#[test]
fn test_unpack_reports_corrupt_archive() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("rootfs");
    std::fs::create_dir(&target).unwrap();
    let control = proceed_file(&tmp);

    let output = run_unpack(&target, &control, b"definitely not a tar archive, just some bytes");

    assert_eq!(output.status.code(), Some(1));
    assert!(!output.stderr.is_empty());
}

#[test]
fn test_unpack_requires_control_descriptor() {
    let tmp = TempDir::new().unwrap();
    let output = Command::new("sh")
        .arg("-c")
        .arg(r#"exec 3<&-; exec "$0" unpack "$1""#)
        .arg(BIN)
        .arg(tmp.path())
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("control descriptor"));
}
