//! Concurrency properties of the Manager's locked operations

mod common;

use common::test_manager;
use conveyor_task::{Error, TaskState};
use serde_json::json;
use std::sync::Arc;

const RACERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_share_one_winner() {
    let manager = test_manager();

    let mut handles = Vec::new();
    for _ in 0..RACERS {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.start("echo", json!({}), "shared").await
        }));
    }

    let mut created = Vec::new();
    let mut conflicts = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(task) => created.push(task.id()),
            Err(Error::AlreadyRunning { task }) => conflicts.push(task.id),
            Err(e) => panic!("Unexpected error: {}", e),
        }
    }

    // Exactly one start creates a task; every loser references that task
    assert_eq!(created.len(), 1);
    assert_eq!(conflicts.len(), RACERS - 1);
    assert!(conflicts.iter().all(|id| *id == created[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_single_winner() {
    let manager = test_manager();
    let task = manager.start("echo", json!({}), "").await.unwrap();
    let task_id = task.id();

    let mut handles = Vec::new();
    for _ in 0..RACERS {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.begin_processing(Some(task_id)).await
        }));
    }

    let mut claims = 0;
    let mut misses = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Some(claimed) => {
                assert_eq!(claimed.state(), TaskState::Processing);
                claims += 1;
            }
            None => misses += 1,
        }
    }

    assert_eq!(claims, 1);
    assert_eq!(misses, RACERS - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drain_claims_are_disjoint() {
    let manager = test_manager();

    let mut expected = Vec::new();
    for _ in 0..RACERS {
        expected.push(manager.start("echo", json!({}), "").await.unwrap().id());
    }

    // Twice as many claimants as rows: every row is claimed exactly once
    let mut handles = Vec::new();
    for _ in 0..(RACERS * 2) {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(
            async move { manager.begin_processing(None).await },
        ));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap().unwrap() {
            claimed.push(task.id());
        }
    }

    claimed.sort_unstable();
    expected.sort_unstable();
    assert_eq!(claimed, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_leaves_one_active_task() {
    let manager = test_manager();
    manager.start("echo", json!({}), "shared").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..RACERS {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.restart("shared", "echo", json!({})).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("restart failed");
    }

    // However the restarts interleaved, exactly one task is still active
    let all = manager.get_last("shared", None, 0).await.unwrap();
    let active: Vec<_> = all.iter().filter(|t| !t.state().is_final()).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(all.len(), RACERS + 1);
}
