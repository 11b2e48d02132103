//! Integration tests for error reporting.
//!
//! Routine outcomes, domain errors surfaced through the wire protocol, and
//! database-level failures.

mod common;

use common::TestEnv;
use initiative::{
    NewTask, Outcome, Request, Response, SCHEMA_VERSION, Store, StoreError, TaskId, TaskStatus, dispatch, is_retryable,
};
use rusqlite::{Connection, params};
use tempfile::TempDir;

// =============================================================================
// Outcome Tests
// =============================================================================

#[test]
fn test_missing_task_is_an_outcome_not_an_error() {
    let mut env = TestEnv::new();
    assert!(env.store.get_task(77).unwrap().is_none());
    assert_eq!(env.store.retry(77).unwrap(), Outcome::NotFound(77));
    assert_eq!(env.store.cancel(77).unwrap(), Outcome::NotFound(77));
    assert!(env.store.tags(77).unwrap().is_empty());
}

#[test]
fn test_outcome_into_result_feeds_question_mark() {
    fn complete_twice(store: &mut Store, id: TaskId) -> Result<(), StoreError> {
        store.complete(id, "once").expect("storage ok").into_result()?;
        store.complete(id, "twice").expect("storage ok").into_result()?;
        Ok(())
    }

    let mut env = TestEnv::new();
    let id = env.add("Work");
    env.claim(id);

    let err = complete_twice(&mut env.store, id).unwrap_err();
    assert_eq!(
        err,
        StoreError::InvalidState {
            id,
            status: TaskStatus::Completed
        }
    );
    assert!(!err.is_retryable());
    assert_eq!(err.to_string(), format!("operation not applicable to task {} in status completed", id));
}

// =============================================================================
// Domain Error Tests
// =============================================================================

#[test]
fn test_domain_errors_are_not_retryable() {
    let mut env = TestEnv::new();
    let err = env.store.create_task(NewTask::new("Orphan", "d").depends_on([5])).unwrap_err();

    assert!(!is_retryable(&err));
    assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::UnknownDependency(5)));
    assert!(err.to_string().contains("unknown dependency"));
}

#[test]
fn test_protocol_reports_cycle_as_error_response() {
    let mut env = TestEnv::new();
    let a = env.add("A");

    let response = dispatch(
        &mut env.store,
        Request::CreateTask {
            title: "Loop".to_string(),
            description: String::new(),
            priority: 0,
            max_retries: 2,
            depends_on: vec![a, a + 1],
            tags: vec![],
        },
    );
    match response {
        Response::Error { message, retryable } => {
            assert!(message.contains("circular dependency"), "unexpected message: {}", message);
            assert!(!retryable);
        }
        other => panic!("expected error response, got {:?}", other),
    }
    assert_eq!(env.store.status().unwrap().total, 1);
}

#[test]
fn test_protocol_rejects_invalid_input_before_storage() {
    let mut env = TestEnv::new();

    let response = dispatch(
        &mut env.store,
        Request::CreateTask {
            title: "   ".to_string(),
            description: String::new(),
            priority: 0,
            max_retries: 2,
            depends_on: vec![],
            tags: vec![],
        },
    );
    assert!(matches!(response, Response::Error { retryable: false, .. }));

    let id = env.add("Work");
    let response = dispatch(
        &mut env.store,
        Request::AddTag {
            id,
            tag: "has space".to_string(),
        },
    );
    assert!(matches!(response, Response::Error { retryable: false, .. }));
    assert!(env.get(id).tags.is_empty());
    assert_eq!(env.store.status().unwrap().total, 1);
}

#[test]
fn test_protocol_maps_outcomes() {
    let mut env = TestEnv::new();
    let id = env.add("Work");

    let response = dispatch(
        &mut env.store,
        Request::Complete {
            id,
            result: "x".to_string(),
        },
    );
    assert_eq!(
        response,
        Response::NotApplicable {
            id,
            status: Some(TaskStatus::Pending)
        }
    );
    assert_eq!(
        dispatch(&mut env.store, Request::GetTask { id: 999 }),
        Response::NotFound { id: 999 }
    );
}

// =============================================================================
// Database Tests
// =============================================================================

#[test]
fn test_open_without_init_fails() {
    let temp_dir = TempDir::new().unwrap();
    let err = Store::open(temp_dir.path()).err().expect("open should fail");
    assert!(err.to_string().contains("initiative init"));
    assert!(!temp_dir.path().join(".initiative").exists());
}

#[test]
fn test_init_is_idempotent_and_keeps_data() {
    let mut env = TestEnv::new();
    let id = env.add("Survivor");

    let reopened = Store::init(env.root()).unwrap();
    assert_eq!(reopened.get_task(id).unwrap().unwrap().title, "Survivor");
}

#[test]
fn test_newer_schema_refuses_to_open() {
    let env = TestEnv::new();
    let conn = Connection::open(env.store.db_path()).unwrap();
    conn.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
        params![(SCHEMA_VERSION + 1).to_string()],
    )
    .unwrap();

    let err = Store::open(env.root()).err().expect("newer schema should be rejected");
    assert!(err.to_string().contains("newer"), "unexpected error: {}", err);
    assert!(!is_retryable(&err));
}

#[test]
fn test_corrupt_database_file_fails_to_open() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join(".initiative");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("initiative.db"), b"definitely not sqlite, just bytes padding the header out").unwrap();

    assert!(Store::open(temp_dir.path()).is_err());
}
