use std::path::PathBuf;
use std::process::Command;

fn exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_burnin"))
}

#[test]
fn cli_lists_filter_catalog() {
    let out = Command::new(exe()).arg("filters").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    for id in ["none", "mono", "noir", "fade", "instant", "process"] {
        assert!(text.lines().any(|l| l.starts_with(id)), "missing {id} in:\n{text}");
    }
    assert!(text.contains(&format!("catalog version {}", burnin::FILTER_CATALOG_VERSION)));
}

#[test]
fn cli_probe_missing_file_fails() {
    let out = Command::new(exe())
        .args(["probe", "/definitely/not/here.mp4"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("open error"), "{err}");
}

#[test]
fn cli_export_requires_source_and_out() {
    let out = Command::new(exe()).args(["export"]).output().unwrap();
    assert!(!out.status.success());
}

#[test]
fn cli_export_rejects_unknown_filter() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in.mp4");
    std::fs::write(&src, b"x").unwrap();
    let out = Command::new(exe())
        .arg("export")
        .arg("--source")
        .arg(&src)
        .arg("--out")
        .arg(dir.path().join("out.mp4"))
        .args(["--filter", "sepia"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("unknown filter id 'sepia'"), "{err}");
    assert!(!dir.path().join("out.mp4").exists());
}
