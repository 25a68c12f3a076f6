//! Static snapshot collection against the test application.

mod helpers;

use fob_rsc::{RscConfig, SnapshotCollector};
use helpers::*;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

fn config_in(dir: &std::path::Path) -> RscConfig {
    RscConfig::from_value(json!({ "dist_dir": dir, "public_dir": "public" })).unwrap()
}

#[tokio::test]
async fn test_every_file_task_is_persisted_after_wait() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let collector = SnapshotCollector::from_config(&config);
    let handler = handler_with(config, Arc::new(TestApp));

    let report = collector.collect(&handler).await.unwrap();
    collector.wait_for_tasks().await.unwrap();

    assert_eq!(
        report.scheduled,
        vec![
            PathBuf::from("index.html"),
            PathBuf::from("RSC/_.txt"),
            PathBuf::from("about/index.html"),
            PathBuf::from("RSC/about.txt"),
        ]
    );
    assert_eq!(report.skipped, vec!["sitemap".to_string()]);

    let out = dir.path().join("public");
    for file in &report.scheduled {
        assert!(out.join(file).is_file(), "missing {}", file.display());
    }

    let index = fs::read_to_string(out.join("index.html")).unwrap();
    assert!(index.contains(r#"{"id":"root","value":{"page":"/"}}"#));
    assert!(index.contains("__FLIGHT_DATA"));

    let payload = fs::read_to_string(out.join("RSC/about.txt")).unwrap();
    assert_eq!(
        payload_lines(&payload),
        vec![json!({ "id": "root", "value": { "path": "about" } })]
    );
}

#[tokio::test]
async fn test_run_waits_for_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let collector = SnapshotCollector::from_config(&config);
    let handler = handler_with(config, Arc::new(TestApp));

    let report = collector.run(&handler).await.unwrap();
    assert_eq!(collector.pending(), 0);
    assert_eq!(report.scheduled.len(), 4);
    assert!(dir.path().join("public/about/index.html").is_file());
}

#[tokio::test]
async fn test_entry_without_build_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let collector = SnapshotCollector::from_config(&config);
    let handler = handler_with(config, Arc::new(EmptyApp));

    let report = collector.run(&handler).await.unwrap();
    assert!(report.scheduled.is_empty());
    assert!(report.skipped.is_empty());
}
