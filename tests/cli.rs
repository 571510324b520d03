//! Smoke tests for the `geosample` binary.

use std::path::Path;
use std::process::{Command, Output};

use ndarray::Array3;

use geosample::{Crs, GeoTiffWriter, GeoTransform};

const UTM: Crs = Crs(32633);

/// A 40x40 single-scene corpus tiled into 16 grid windows of 10 px.
fn write_corpus(dir: &Path) -> std::path::PathBuf {
    let images = dir.join("images");
    let labels = dir.join("labels");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&labels).unwrap();

    let transform = GeoTransform::new(500_000.0, 5_000_400.0, 10.0, 10.0);
    let image = Array3::from_shape_fn((2, 40, 40), |(b, r, c)| (b * 10_000 + r * 40 + c) as f32);
    GeoTiffWriter::new(image.view(), transform, UTM)
        .write(images.join("scene.tif"))
        .unwrap();
    let label = Array3::from_shape_fn((1, 40, 40), |(_, r, _)| (r / 20) as f32);
    GeoTiffWriter::new(label.view(), transform, UTM)
        .write(labels.join("scene_label.tif"))
        .unwrap();

    let path = dir.join("corpus.json");
    let corpus = serde_json::json!({
        "engine": {"tile_size": 10, "num_workers": 0, "resampling_method_image": "nearest"},
        "splits": {"train": {"images": [images], "labels": [labels]}}
    });
    std::fs::write(&path, corpus.to_string()).unwrap();
    path
}

fn geosample(args: &[&str], log: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_geosample"))
        .args(args)
        .env("RUST_LOG", log)
        .output()
        .unwrap()
}

fn tif_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "tif"))
        .count()
}

#[test]
fn export_writes_requested_samples_only() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path());
    let out = dir.path().join("out");

    let output = geosample(
        &["--config", corpus.to_str().unwrap(), "export", out.to_str().unwrap(), "--count", "3"],
        "geosample=trace",
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    // image and label per sample
    assert_eq!(tif_count(&out), 6);
    for seq in 0..3 {
        assert!(out.join(format!("sample_{seq:06}.tif")).exists());
        assert!(out.join(format!("sample_{seq:06}_label.tif")).exists());
    }

    // one image and one label read per exported window, none beyond
    let logs = String::from_utf8_lossy(&output.stdout);
    let reads = logs.lines().filter(|l| l.contains("Physical read")).count();
    assert_eq!(reads, 6, "{logs}");
}

#[test]
fn info_lists_sources() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path());
    let output = geosample(&["--config", corpus.to_str().unwrap(), "info"], "off");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("EPSG:32633"), "{stdout}");
    assert!(stdout.contains("scene_label"));
}

#[test]
fn missing_config_fails() {
    let output = geosample(&["--config", "/nonexistent/corpus.json", "info"], "off");
    assert!(!output.status.success());
}
