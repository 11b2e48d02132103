//! Integration tests for many workers sharing one database file.
//!
//! Every worker thread opens its own `Store`, as separate processes would.

mod common;

use common::TestEnv;
use eyre::Result;
use initiative::{NewTask, Outcome, Store, Task, TaskId, TaskStatus, is_retryable};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const WORKERS: usize = 8;

/// Run `op`, retrying while it reports transient lock contention.
fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> T {
    for _ in 0..50 {
        match op() {
            Ok(value) => return value,
            Err(err) if is_retryable(&err) => thread::sleep(Duration::from_millis(10)),
            Err(err) => panic!("operation failed: {:#}", err),
        }
    }
    panic!("operation still busy after retries");
}

/// Start `WORKERS` threads at once, each with its own store handle.
fn spawn_workers<T: Send + 'static>(
    root: &Path,
    work: impl Fn(usize, &mut Store) -> T + Send + Sync + 'static,
) -> Vec<T> {
    let barrier = Arc::new(Barrier::new(WORKERS));
    let work = Arc::new(work);
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let root = root.to_path_buf();
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            thread::spawn(move || {
                let mut store = Store::open(&root).expect("Failed to open worker store");
                barrier.wait();
                work(worker, &mut store)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect()
}

#[test]
fn test_concurrent_claims_hand_out_each_task_once() {
    let mut env = TestEnv::new();
    let ids: HashSet<TaskId> = (0..3).map(|i| env.add(&format!("Task {}", i))).collect();

    let claims: Vec<Option<Task>> = spawn_workers(env.root(), |_, store| with_retry(|| store.claim_next()));

    let claimed: Vec<TaskId> = claims.iter().flatten().map(|t| t.id).collect();
    assert_eq!(claimed.len(), 3, "exactly one claim per ready task");
    assert_eq!(claimed.iter().copied().collect::<HashSet<_>>(), ids);
    assert_eq!(claims.iter().filter(|c| c.is_none()).count(), WORKERS - 3);
    assert_eq!(env.count_by_status(TaskStatus::InProgress), 3);
}

#[test]
fn test_workers_drain_queue_without_duplicates() {
    let mut env = TestEnv::new();
    for i in 0..40 {
        env.add_with_priority(&format!("Task {}", i), i % 4);
    }

    let processed: Vec<Vec<TaskId>> = spawn_workers(env.root(), |_, store| {
        let mut done = Vec::new();
        while let Some(task) = with_retry(|| store.claim_next()) {
            let outcome = with_retry(|| store.complete(task.id, "ok"));
            assert!(outcome.is_applied(), "worker lost its own claim: {:?}", outcome);
            done.push(task.id);
        }
        done
    });

    let all: Vec<TaskId> = processed.into_iter().flatten().collect();
    let unique: HashSet<TaskId> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(env.store.status().unwrap().completed, 40);
}

#[test]
fn test_concurrent_creates_get_distinct_ids() {
    let env = TestEnv::new();

    let created: Vec<Vec<TaskId>> = spawn_workers(env.root(), |worker, store| {
        (0..10)
            .map(|i| {
                with_retry(|| store.create_task(NewTask::new(format!("w{} t{}", worker, i), "d")))
            })
            .collect()
    });

    let mut all: Vec<TaskId> = created.iter().flatten().copied().collect();
    for ids in &created {
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), WORKERS * 10);
    assert_eq!(env.store.status().unwrap().total, WORKERS * 10);
}

#[test]
fn test_racing_completions_apply_once() {
    let mut env = TestEnv::new();
    let id = env.add("Contested");
    env.claim(id);

    let outcomes: Vec<Outcome<Task>> =
        spawn_workers(env.root(), move |worker, store| with_retry(|| store.complete(id, &format!("w{}", worker))));

    assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);
    for outcome in outcomes.iter().filter(|o| !o.is_applied()) {
        assert_eq!(
            outcome,
            &Outcome::NotApplicable {
                id,
                status: Some(TaskStatus::Completed)
            }
        );
    }
    let winner = outcomes.into_iter().find_map(Outcome::applied).unwrap();
    assert_eq!(env.get(id).result, winner.result);
}

#[test]
fn test_cancel_races_with_claims() {
    let mut env = TestEnv::new();
    let root = env.add_with_priority("Root", 1);
    let dependents: Vec<TaskId> = (0..5).map(|i| env.add_after(&format!("Dep {}", i), &[root])).collect();
    let free: Vec<TaskId> = (0..5).map(|i| env.add(&format!("Free {}", i))).collect();

    spawn_workers(env.root(), move |worker, store| {
        if worker == 0 {
            with_retry(|| store.cancel(root));
        } else {
            while let Some(task) = with_retry(|| store.claim_next()) {
                with_retry(|| store.complete(task.id, "ok"));
            }
        }
    });

    // A dependent can only run after its root completed, so the whole group
    // shares the root's fate.
    let fate = env.status_of(root);
    assert!(matches!(fate, TaskStatus::Completed | TaskStatus::Cancelled));
    for id in dependents {
        assert_eq!(env.status_of(id), fate, "dependent {} diverged from its root", id);
    }
    for id in free {
        assert_ne!(env.status_of(id), TaskStatus::InProgress);
    }
}
