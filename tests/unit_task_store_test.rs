use ace::core::AceError;
use ace::core::taskstore::{TaskRecord, TaskStatus, TaskStore, TaskType, generate_task_id};
use serde_json::json;

fn record(task_type: TaskType) -> TaskRecord {
    TaskRecord::new(task_type, json!({"cluster_name": "demo"}), "acectl")
}

#[tokio::test]
async fn test_create_then_get_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().to_str().unwrap()).await.unwrap();

    let task = record(TaskType::TableDiff);
    let id = task.task_id.clone();
    store.create(task).await.unwrap();

    let loaded = store.get(&id).unwrap();
    assert_eq!(loaded.task_id, id);
    assert_eq!(loaded.task_type, TaskType::TableDiff);
    assert_eq!(loaded.task_status, TaskStatus::Running);
    assert_eq!(loaded.client_role, "acectl");
    assert!(loaded.finished_at.is_none());
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().to_str().unwrap()).await.unwrap();
    assert!(matches!(
        store.get("nope"),
        Err(AceError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_terminal_transition_happens_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().to_str().unwrap()).await.unwrap();

    let task = record(TaskType::TableRepair);
    let id = task.task_id.clone();
    store.create(task).await.unwrap();

    let finished = store
        .finish(&id, TaskStatus::Completed, Some(json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(finished.task_status, TaskStatus::Completed);
    assert!(finished.finished_at.is_some());

    // A second terminal transition must be refused, whatever the status.
    let err = store
        .finish(&id, TaskStatus::Failed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AceError::AlreadyTerminal(_)));

    let loaded = store.get(&id).unwrap();
    assert_eq!(loaded.task_status, TaskStatus::Completed);
    assert_eq!(loaded.task_result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_finish_rejects_non_terminal_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().to_str().unwrap()).await.unwrap();

    let task = record(TaskType::SpockDiff);
    let id = task.task_id.clone();
    store.create(task).await.unwrap();

    assert!(store.finish(&id, TaskStatus::Running, None).await.is_err());
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let id = {
        let store = TaskStore::open(path).await.unwrap();
        let task = record(TaskType::SchemaDiff);
        let id = task.task_id.clone();
        store.create(task).await.unwrap();
        store
            .finish(&id, TaskStatus::Failed, Some(json!({"error": {"kind": "sql"}})))
            .await
            .unwrap();
        id
    };

    let reopened = TaskStore::open(path).await.unwrap();
    let loaded = reopened.get(&id).unwrap();
    assert_eq!(loaded.task_status, TaskStatus::Failed);
    assert_eq!(loaded.task_result, Some(json!({"error": {"kind": "sql"}})));
}

#[tokio::test]
async fn test_mark_started_stamps_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().to_str().unwrap()).await.unwrap();

    let task = record(TaskType::TableRerun);
    let id = task.task_id.clone();
    store.create(task).await.unwrap();
    store.mark_started(&id).await.unwrap();
    assert!(store.get(&id).unwrap().started_at.is_some());
}

#[test]
fn test_task_ids_are_unique_and_opaque() {
    let a = generate_task_id();
    let b = generate_task_id();
    assert_ne!(a, b);
    assert!(a.len() >= 32);
}

#[test]
fn test_status_and_type_render_like_the_wire_format() {
    assert_eq!(TaskStatus::Running.to_string(), "RUNNING");
    assert_eq!(TaskStatus::Completed.to_string(), "COMPLETED");
    assert_eq!(TaskStatus::Failed.to_string(), "FAILED");
    assert_eq!(TaskType::TableDiff.to_string(), "table-diff");
    assert_eq!(TaskType::RepsetDiff.to_string(), "repset-diff");
}
