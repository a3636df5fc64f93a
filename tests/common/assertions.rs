//! Custom test assertions for integration tests

use serde_json::Value;
use std::path::Path;
use tokio::sync::broadcast;

use bulk_data_client::Event;

/// Drain every event already sent on `events`
pub fn drain_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => collected.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    collected
}

/// Event ids in the order they were emitted
pub fn event_ids(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::event_id).collect()
}

/// Parse every line of an NDJSON file
pub fn read_ndjson(path: &Path) -> Vec<Value> {
    let contents = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Expected {:?} to be readable: {}", path, e));
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("line should be valid JSON"))
        .collect()
}

/// Assert that files exist in a directory
pub fn assert_files_exist(dir: &Path, expected_files: &[&str]) {
    for filename in expected_files {
        let path = dir.join(filename);
        assert!(
            path.exists(),
            "Expected file '{}' to exist in {:?}",
            filename,
            dir
        );
    }
}

/// Ids of the records in an NDJSON file
pub fn record_ids(path: &Path) -> Vec<String> {
    read_ndjson(path)
        .iter()
        .map(|record| record["id"].as_str().unwrap_or_default().to_string())
        .collect()
}
