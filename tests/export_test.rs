//! Merging persisted labels into the JSONL training file

mod fixtures;
mod helpers;

use serde_json::Value;

use fixtures::*;
use helpers::*;
use promo_labeler::models::label::LabelRecord;
use promo_labeler::services::export::{self, RecordError};
use promo_labeler::services::pipeline::persist;

async fn labeled(data: &DataDir, relative: &str, label: Value) {
    let image = data.image(relative);
    let file_name = image.file_name().unwrap().to_string_lossy().into_owned();
    let record = LabelRecord::new(file_name, "openai", label.as_object().unwrap().clone());
    persist(&data.label_path(relative), &record).await.unwrap();
}

fn read_lines(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_convert_writes_one_line_per_label() {
    let data = DataDir::new();
    labeled(&data, "promo1.jpg", butter_label()).await;
    labeled(&data, "BXYG/promo2.png", beer_label()).await;
    data.image("promo3.jpg");

    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("training_data.jsonl");
    let report = export::convert(data.path(), &output, "images/", &skip_dirs()).unwrap();

    assert_eq!(report.written, 2);
    assert!(report.errors.is_empty());

    let lines = read_lines(&output);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["image_path"], "images/BXYG/promo2.png");
    assert_eq!(lines[1]["image_path"], "images/promo1.jpg");

    let label: Value = serde_json::from_str(lines[0]["label"].as_str().unwrap()).unwrap();
    assert_eq!(label, beer_label());
}

#[tokio::test]
async fn test_convert_counts_bad_records() {
    let data = DataDir::new();
    labeled(&data, "promo1.jpg", butter_label()).await;
    labeled(&data, "promo2.jpg", coffee_label()).await;
    std::fs::remove_file(data.path().join("promo2.jpg")).unwrap();
    data.image("promo3.jpg");
    data.write("promo3.json", b"{\"name\": \"truncated");

    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("out.jsonl");
    let report = export::convert(data.path(), &output, "", &skip_dirs()).unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.errors.len(), 2);
    assert!(report
        .errors
        .iter()
        .any(|(_, e)| matches!(e, RecordError::ImageMissing(_))));
    assert!(report
        .errors
        .iter()
        .any(|(_, e)| matches!(e, RecordError::Parse(_))));

    let lines = read_lines(&output);
    assert_eq!(lines[0]["image_path"], "promo1.jpg");
}

#[tokio::test]
async fn test_convert_ignores_unrelated_json_and_skipped_dirs() {
    let data = DataDir::new();
    labeled(&data, "promo1.jpg", butter_label()).await;
    labeled(&data, "UNKNOWN/blurry.jpg", coffee_label()).await;
    data.write("manifest.json", b"{\"not\": \"a record\"}");
    data.write("UNKNOWN/broken.json", b"not json at all");

    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("out.jsonl");
    let report = export::convert(data.path(), &output, "images/", &skip_dirs()).unwrap();

    assert_eq!(report.written, 1);
    assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
    let lines = read_lines(&output);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["image_path"], "images/promo1.jpg");

    // Without the skip list the UNKNOWN label is exported too.
    let report = export::convert(data.path(), &output, "images/", &[]).unwrap();
    assert_eq!(report.written, 2);
}
