use std::fs;

use serde_json::json;
use weavemesh::config::{JournalConfig, RecoveryMode};
use weavemesh::journal::{EventKind, Journal, JournalError, ReadOptions, chain_hash};

fn config(dir: &tempfile::TempDir) -> JournalConfig {
    JournalConfig::at(dir.path().join("journal.jsonl"))
}

#[test]
fn seq_and_chain_hold_across_emits() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();

    for i in 0..5 {
        let event = journal
            .emit("s1", EventKind::TaskDispatched, json!({ "i": i }))
            .unwrap();
        assert_eq!(event.seq, i);
        assert_eq!(event.hash_prev.is_none(), i == 0);
    }

    let events: Vec<_> = journal
        .iter_all()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(events.len(), 5);
    for pair in events.windows(2) {
        let prev_line = pair[0].canonical_line().unwrap();
        assert_eq!(pair[1].hash_prev.as_deref(), Some(chain_hash(&prev_line).as_str()));
    }
}

#[test]
fn read_session_returns_emits_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();

    journal.emit("a", EventKind::PeerJoined, json!({"n": 1})).unwrap();
    journal.emit("b", EventKind::PeerJoined, json!({"n": 2})).unwrap();
    journal.emit("a", EventKind::PeerLeft, json!({"n": 3})).unwrap();

    let events = journal.read_session("a", ReadOptions::default()).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload["n"], 1);
    assert_eq!(events[1].payload["n"], 3);

    let limited = journal
        .read_session(
            "a",
            ReadOptions {
                offset: 1,
                limit: Some(5),
            },
        )
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].payload["n"], 3);
}

#[test]
fn read_session_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = Journal::open(config(&dir)).unwrap();
        journal.emit("s", EventKind::TaskResult, json!({"ok": true})).unwrap();
    }
    let journal = Journal::open(config(&dir)).unwrap();
    let events = journal.read_session("s", ReadOptions::default()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["ok"], true);
}

#[test]
fn tampered_hash_prev_truncates_to_valid_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    {
        let journal = Journal::open(config(&dir)).unwrap();
        for i in 0..3 {
            journal.emit("s", EventKind::TaskResult, json!({ "i": i })).unwrap();
        }
    }

    // Corrupt event 1's hash_prev.
    let content = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut event: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    event["hash_prev"] = json!("deadbeef");
    lines[1] = event.to_string();
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    // Truncate mode keeps event 0 and continues at seq 1.
    let journal = Journal::open(config(&dir)).unwrap();
    assert_eq!(journal.len(), 1);
    let next = journal.emit("s", EventKind::TaskResult, json!({"fresh": true})).unwrap();
    assert_eq!(next.seq, 1);

    // The recovered file chains cleanly.
    let events: Vec<_> = journal
        .iter_all()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(events.len(), 2);
}

#[test]
fn strict_mode_refuses_a_tampered_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    {
        let journal = Journal::open(config(&dir)).unwrap();
        for i in 0..3 {
            journal.emit("s", EventKind::TaskResult, json!({ "i": i })).unwrap();
        }
    }
    let content = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut event: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    event["hash_prev"] = json!("deadbeef");
    lines[1] = event.to_string();
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    let strict = JournalConfig {
        recovery: RecoveryMode::Strict,
        ..config(&dir)
    };
    assert!(matches!(
        Journal::open(strict),
        Err(JournalError::IntegrityViolation { seq: 1, .. })
    ));
}

#[test]
fn torn_final_write_is_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    {
        let journal = Journal::open(config(&dir)).unwrap();
        journal.emit("s", EventKind::TaskResult, json!({})).unwrap();
    }
    let mut content = fs::read_to_string(&path).unwrap();
    content.push_str("{\"event_id\":\"truncated-mid-wr");
    fs::write(&path, content).unwrap();

    let journal = Journal::open(config(&dir)).unwrap();
    assert_eq!(journal.len(), 1);
}

#[test]
fn compaction_preserves_retained_sessions_and_renumbers() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();

    journal.emit("keep", EventKind::TaskResult, json!({"k": 0})).unwrap();
    journal.emit("drop", EventKind::TaskResult, json!({"d": 0})).unwrap();
    journal.emit("keep", EventKind::TaskResult, json!({"k": 1})).unwrap();

    journal.compact(["keep".to_string()]).unwrap();

    let events: Vec<_> = journal
        .iter_all()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].seq, 0);
    assert_eq!(events[1].seq, 1);
    assert!(events[0].hash_prev.is_none());
    let line0 = events[0].canonical_line().unwrap();
    assert_eq!(events[1].hash_prev.as_deref(), Some(chain_hash(&line0).as_str()));

    // Appends continue on the new chain, and a reopen still validates.
    journal.emit("keep", EventKind::TaskResult, json!({"k": 2})).unwrap();
    drop(journal);
    let journal = Journal::open(config(&dir)).unwrap();
    assert_eq!(journal.len(), 3);
}

#[test]
fn payload_redaction_applies_before_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();
    let event = journal
        .emit(
            "s",
            EventKind::TaskDispatched,
            json!({ "api_key": "sk-123", "note": "fine" }),
        )
        .unwrap();
    assert_eq!(event.payload["api_key"], "[REDACTED]");
    assert_eq!(event.payload["note"], "fine");

    let on_disk = fs::read_to_string(dir.path().join("journal.jsonl")).unwrap();
    assert!(!on_disk.contains("sk-123"));
}

#[test]
fn subscribers_observe_emits_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();
    let rx = journal.subscribe();

    journal.emit("s", EventKind::BidReceived, json!({"n": 1})).unwrap();
    journal.emit("s", EventKind::BidReceived, json!({"n": 2})).unwrap();

    assert_eq!(rx.recv().unwrap().payload["n"], 1);
    assert_eq!(rx.recv().unwrap().payload["n"], 2);

    // A dropped subscriber never fails an emit.
    drop(rx);
    journal.emit("s", EventKind::BidReceived, json!({"n": 3})).unwrap();
}

#[test]
fn second_process_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();
    // Same-process double-open trips the PID lockfile.
    assert!(matches!(
        Journal::open(config(&dir)),
        Err(JournalError::Locked { .. })
    ));
    drop(journal);
    // Lock is released with the journal.
    assert!(Journal::open(config(&dir)).is_ok());
}

#[test]
fn health_reports_usage() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(config(&dir)).unwrap();
    journal.emit("s", EventKind::TaskResult, json!({"some": "payload"})).unwrap();
    let health = journal.health();
    assert!(health.writable);
    assert!(health.disk_usage_bytes > 0);
}
