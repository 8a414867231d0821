//! Task CRUD, dispatch registration and persistence through an instance stack.

use craft_agent::scheduler::{ScheduledTask, TaskAction};
use craft_agent::{AgentConfig, InstanceOrchestrator, InstanceRef};

async fn orchestrator(root: &std::path::Path) -> InstanceOrchestrator {
    InstanceOrchestrator::new(AgentConfig::with_data_root(root)).await.unwrap()
}

#[tokio::test]
async fn create_and_delete_track_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path()).await;
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    let scheduler = stack.scheduler();

    let task = scheduler
        .create(ScheduledTask::new("nightly", TaskAction::Backup, "0 */6 * * *"))
        .await
        .unwrap();
    assert!(!task.id.is_empty());
    assert!(scheduler.has_dispatch(&task.id));
    assert_eq!(scheduler.get(&task.id).await.unwrap().name, "nightly");

    scheduler.delete(&task.id).await.unwrap();
    assert!(!scheduler.has_dispatch(&task.id));
    assert!(scheduler.list().await.is_empty());
    assert_eq!(scheduler.delete(&task.id).await.unwrap_err().code(), "not_found");

    orch.shutdown().await;
}

#[tokio::test]
async fn update_replaces_the_registration() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path()).await;
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    let scheduler = stack.scheduler();

    let task = scheduler
        .create(ScheduledTask::new("restart", TaskAction::Restart, "0 4 * * *"))
        .await
        .unwrap();
    let mut changed = task.clone();
    changed.schedule = "30 5 * * 1-5".into();
    let updated = scheduler.update(&task.id, changed).await.unwrap();
    assert_eq!(updated.schedule, "30 5 * * 1-5");
    assert_eq!(scheduler.dispatch_ids(), vec![task.id.clone()]);

    let mut disabled = updated.clone();
    disabled.enabled = false;
    scheduler.update(&task.id, disabled).await.unwrap();
    assert!(scheduler.dispatch_ids().is_empty());
    assert_eq!(scheduler.list().await.len(), 1);

    orch.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_change_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path()).await;
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    let scheduler = stack.scheduler();

    let missing = scheduler
        .update("nope", ScheduledTask::new("x", TaskAction::Backup, "not a cron"))
        .await
        .unwrap_err();
    assert_eq!(missing.code(), "not_found");

    let bad = scheduler
        .create(ScheduledTask::new("x", TaskAction::Backup, "61 * * * *"))
        .await
        .unwrap_err();
    assert_eq!(bad.code(), "invalid_schedule");
    assert!(scheduler.list().await.is_empty());
    assert!(scheduler.dispatch_ids().is_empty());
    assert!(!stack.paths().tasks_file().exists());

    orch.shutdown().await;
}

#[tokio::test]
async fn run_now_records_last_run_even_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path()).await;
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    let scheduler = stack.scheduler();

    let task = scheduler
        .create(
            ScheduledTask::new("announce", TaskAction::Command, "*/5 * * * *")
                .with_param("command", "say hello"),
        )
        .await
        .unwrap();
    let err = scheduler.run_now(&task.id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_transition");

    let stored = scheduler.get(&task.id).await.unwrap();
    assert!(stored.last_run.is_some());
    let on_disk: Vec<ScheduledTask> =
        serde_json::from_slice(&std::fs::read(stack.paths().tasks_file()).unwrap()).unwrap();
    assert_eq!(on_disk[0].last_run, stored.last_run);

    orch.shutdown().await;
}

#[tokio::test]
async fn backup_task_creates_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path()).await;
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    std::fs::write(stack.paths().server_dir().join("ops.json"), b"[]").unwrap();

    let task = stack
        .scheduler()
        .create(ScheduledTask::new("snap", TaskAction::Backup, "0 0 * * *"))
        .await
        .unwrap();
    stack.scheduler().run_now(&task.id).await.unwrap();

    let backups = stack.backups().list().await.unwrap();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].path.join("ops.json").is_file());

    orch.shutdown().await;
}

#[tokio::test]
async fn reload_registers_enabled_tasks_only() {
    let dir = tempfile::tempdir().unwrap();
    let (on, off) = {
        let orch = orchestrator(dir.path()).await;
        let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
        let on = stack
            .scheduler()
            .create(ScheduledTask::new("on", TaskAction::Backup, "0 3 * * SUN"))
            .await
            .unwrap();
        let mut disabled = ScheduledTask::new("off", TaskAction::Backup, "0 3 * * *");
        disabled.enabled = false;
        let off = stack.scheduler().create(disabled).await.unwrap();
        orch.shutdown().await;
        (on, off)
    };

    let orch = orchestrator(dir.path()).await;
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    let ids: Vec<String> = stack.scheduler().list().await.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![on.id.clone(), off.id.clone()]);
    assert_eq!(stack.scheduler().dispatch_ids(), vec![on.id]);

    orch.shutdown().await;
}
