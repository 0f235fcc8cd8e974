use super::*;
use gearshift_core::CartridgeRepository;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEST_REPOSITORY_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[test]
fn cartridge_versions_sorted_newest_first() {
    let root = test_repository_root();
    publish(&root, "php", "0.0.9", &["5.3"], &[]);
    publish(&root, "php", "0.0.12", &["5.3", "5.4"], &["0.0.11"]);
    publish(&root, "php", "0.0.11", &["5.3", "5.4"], &["0.0.10"]);

    let index = CartridgeIndex::open(&root);
    let versions = index
        .cartridge_versions("php")
        .expect("must list versions")
        .into_iter()
        .map(|manifest| manifest.cartridge_version.to_string())
        .collect::<Vec<_>>();
    assert_eq!(versions, vec!["0.0.12", "0.0.11", "0.0.9"]);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn select_returns_latest_manifest_supporting_version() {
    let root = test_repository_root();
    publish(&root, "php", "0.0.9", &["5.3"], &[]);
    publish(&root, "php", "0.0.12", &["5.4"], &["0.0.11"]);

    let index = CartridgeIndex::open(&root);
    let selected = index
        .select("php", "5.3")
        .expect("must select")
        .expect("5.3 is published");
    assert_eq!(selected.cartridge_version.to_string(), "0.0.9");

    let selected = index
        .select("php", "5.4")
        .expect("must select")
        .expect("5.4 is published");
    assert_eq!(selected.cartridge_version.to_string(), "0.0.12");

    assert!(index.select("php", "7.0").expect("must select").is_none());
    assert!(index.select("ruby", "1.9").expect("must select").is_none());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn cartridge_versions_rejects_manifest_stored_under_wrong_name() {
    let root = test_repository_root();
    publish(&root, "php", "0.0.9", &["5.3"], &[]);
    let misplaced = root.join("perl");
    fs::create_dir_all(&misplaced).expect("must create dir");
    fs::rename(root.join("php").join("0.0.9"), misplaced.join("0.0.9")).expect("must move");

    let err = CartridgeIndex::open(&root)
        .cartridge_versions("perl")
        .expect_err("name mismatch must fail");
    assert!(
        err.to_string().contains("declares cartridge 'php'"),
        "unexpected error: {err}"
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn overlay_merges_payload_and_preserves_instance_files() {
    let root = test_repository_root();
    let payload = publish(&root, "php", "0.0.12", &["5.4"], &["0.0.11"]);
    fs::create_dir_all(payload.join("bin")).expect("must create bin");
    fs::write(payload.join("bin").join("control"), "#!/bin/sh\necho new\n").expect("write");
    fs::write(payload.join("README"), "new readme").expect("write");

    let instance = root.join("gear").join("php");
    fs::create_dir_all(instance.join("bin")).expect("must create instance bin");
    fs::write(instance.join("bin").join("control"), "#!/bin/sh\necho old\n").expect("write");
    fs::create_dir_all(instance.join("data")).expect("must create data");
    fs::write(instance.join("data").join("app.db"), "user data").expect("write");

    let index = CartridgeIndex::open(&root);
    let manifest = index
        .select("php", "5.4")
        .expect("must select")
        .expect("published");
    index.overlay(&manifest, &instance).expect("must overlay");

    assert_eq!(
        fs::read_to_string(instance.join("bin").join("control")).expect("read"),
        "#!/bin/sh\necho new\n"
    );
    assert_eq!(
        fs::read_to_string(instance.join("README")).expect("read"),
        "new readme"
    );
    assert_eq!(
        fs::read_to_string(instance.join("data").join("app.db")).expect("read"),
        "user data",
        "instance-owned data must survive the overlay"
    );
    assert!(
        !instance.join("metadata").exists(),
        "repository metadata must not be copied into the instance"
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn overlay_dir_rejects_missing_source() {
    let root = test_repository_root();
    let err = overlay_dir(&root.join("missing"), &root.join("dst"), &[])
        .expect_err("missing source must fail");
    assert!(err.to_string().contains("overlay source is not a directory"));
}

fn publish(
    root: &Path,
    name: &str,
    cartridge_version: &str,
    versions: &[&str],
    compatible_versions: &[&str],
) -> PathBuf {
    let payload = root.join(name).join(cartridge_version);
    let metadata = payload.join("metadata");
    fs::create_dir_all(&metadata).expect("must create metadata dir");

    let quote = |values: &[&str]| {
        values
            .iter()
            .map(|value| format!("\"{value}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let manifest = format!(
        "name = \"{name}\"\nvendor = \"redhat\"\nversion = \"{}\"\ncartridge_version = \"{cartridge_version}\"\nshort_name = \"{}\"\nversions = [{}]\ncompatible_versions = [{}]\n",
        versions[versions.len() - 1],
        name.to_ascii_uppercase(),
        quote(versions),
        quote(compatible_versions),
    );
    fs::write(metadata.join("manifest.toml"), manifest).expect("must write manifest");
    payload
}

fn test_repository_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_REPOSITORY_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "gearshift-repository-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}
