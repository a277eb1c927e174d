//! End-to-end tests for both worker pool strategies.
//!
//! Compiles are simulated with `sh` one-liners in place of a TeX engine.
//! Sandboxes run on the host through `LocalRuntime`.
#![cfg(unix)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use texflow_db::Records;
use texflow_jobs::{
    defaults, CompileContext, CompilerConfig, LocalRuntime, PassSummary, ProcessPool, Result,
    SandboxPool, SandboxRuntime, Scheduler, SchedulerEvent, Task, TaskStatus, TemplateConfig,
    TimeoutPolicy, WorkerPool,
};

/// Copies the rendered source to `<task_id>.pdf` next to it.
const COPY_CMD: &str = r#"sh -c 'cp "$1" "${1%.tex}.pdf"' sh {filepath}"#;

/// Runs commands on the host and records sandbox lifecycle calls.
#[derive(Default)]
struct RecordingRuntime {
    calls: Mutex<Vec<String>>,
}

impl RecordingRuntime {
    fn calls(&self, verb: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| call.strip_prefix(verb).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl SandboxRuntime for RecordingRuntime {
    async fn ensure(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("ensure {}", name));
        Ok(())
    }

    async fn exec_detached(&self, name: &str, workdir: &Path, argv: &[String]) -> Result<()> {
        LocalRuntime.exec_detached(name, workdir, argv).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("stop {}", name));
        Ok(())
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn test_config(root: &Path, compile_cmd: &str) -> CompilerConfig {
    let structures = root.join("structures");
    std::fs::create_dir_all(&structures).unwrap();
    std::fs::write(
        structures.join("article.structure"),
        "\\documentclass{article}\n\\title{$title}\n\\begin{document}\n$body\n\\end{document}\n",
    )
    .unwrap();

    CompilerConfig::new(compile_cmd)
        .with_structure_dir(structures)
        .with_compile_tmp_dir(root.join("scratch"))
        .with_compiler_number(2)
        .with_scan_interval(Duration::from_millis(20))
        .with_template(
            "article",
            TemplateConfig {
                structure: "article.structure".into(),
                cls_path: None,
            },
        )
}

async fn create_task(records: &Records, body: &str) -> Task {
    let user = records.users.create().await.unwrap();
    let args = serde_json::from_value(serde_json::json!({"title": "Report"})).unwrap();
    records
        .tasks
        .create(Task::new(&user.user_id, "doc", "article", body).with_args(args))
        .await
        .unwrap()
}

/// Run passes until `done` holds for the accumulated counts.
async fn drive<P: WorkerPool + 'static>(
    scheduler: &mut Scheduler<P>,
    done: impl Fn(&PassSummary) -> bool,
) -> PassSummary {
    let mut total = PassSummary::default();
    for _ in 0..200 {
        let pass = scheduler.run_pass().await.unwrap();
        total.leased += pass.leased;
        total.finished += pass.finished;
        total.failed += pass.failed;
        total.abandoned += pass.abandoned;
        total.reclaimed += pass.reclaimed;
        if done(&total) {
            return total;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("scheduler did not settle: {:?}", total);
}

async fn process_scheduler(
    config: CompilerConfig,
    records: &Records,
) -> (Scheduler<ProcessPool>, CompileContext) {
    let config = Arc::new(config);
    let ctx = CompileContext::new(config.clone(), records.clone())
        .await
        .unwrap();
    let pool = ProcessPool::start(ctx.clone());
    (Scheduler::new(records.clone(), pool, config), ctx)
}

async fn sandbox_scheduler(
    config: CompilerConfig,
    records: &Records,
) -> (Scheduler<SandboxPool>, CompileContext) {
    let config = Arc::new(config);
    let ctx = CompileContext::new(config.clone(), records.clone())
        .await
        .unwrap();
    let pool = SandboxPool::start(ctx.clone(), Arc::new(LocalRuntime))
        .await
        .unwrap();
    (Scheduler::new(records.clone(), pool, config), ctx)
}

// ============================================================================
// PROCESS POOL
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_success_appends_one_pdf() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let (mut scheduler, ctx) = process_scheduler(test_config(root.path(), COPY_CMD), &records).await;

    drive(&mut scheduler, |s| s.finished == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Finished);
    let pdf_id = stored.pdf_id.unwrap();

    let user = records.users.get(&task.user_id).await.unwrap();
    assert_eq!(user.compiled_pdfs, vec![pdf_id.clone()]);

    let pdf = records.pdfs.get(&pdf_id).await.unwrap().decode_data().unwrap();
    let source = String::from_utf8(pdf).unwrap();
    assert!(source.contains("\\title{Report}"));
    assert!(source.contains("Hello"));

    assert!(!ctx.scratch_root.join(&task.task_id).exists());
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_missing_artifact_fails() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let (mut scheduler, ctx) = process_scheduler(test_config(root.path(), "true"), &records).await;

    drive(&mut scheduler, |s| s.failed == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().starts_with("No pdf generated"));
    assert!(stored.pdf_id.is_none());
    assert!(!ctx.scratch_root.join(&task.task_id).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_timeout_abandons_and_cleans_scratch() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let config = test_config(root.path(), "sleep 5").with_compile_timeout(Duration::from_millis(200));
    let (mut scheduler, ctx) = process_scheduler(config, &records).await;

    let mut events = scheduler.events();
    drive(&mut scheduler, |s| s.abandoned == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Compiling);
    assert!(stored.error.is_none());
    assert!(!ctx.scratch_root.join(&task.task_id).exists());
    assert_eq!(scheduler.in_flight(), 0);

    let mut abandoned = false;
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::TaskAbandoned { task_id, .. } = event {
            assert_eq!(task_id, task.task_id);
            abandoned = true;
        }
    }
    assert!(abandoned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_timeout_fail_policy() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let config = test_config(root.path(), "sleep 5")
        .with_compile_timeout(Duration::from_millis(200))
        .with_on_timeout(TimeoutPolicy::Fail);
    let (mut scheduler, _ctx) = process_scheduler(config, &records).await;

    drive(&mut scheduler, |s| s.failed == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_keeps_failed_scratch_when_asked() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let config = test_config(root.path(), "true").with_keep_failed_scratch(true);
    let (mut scheduler, ctx) = process_scheduler(config, &records).await;

    drive(&mut scheduler, |s| s.failed == 1).await;

    let scratch = ctx.scratch_root.join(&task.task_id);
    assert!(scratch.join(format!("{}.tex", task.task_id)).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_unknown_template_fails() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let user = records.users.create().await.unwrap();
    let task = records
        .tasks
        .create(Task::new(&user.user_id, "doc", "missing", "Hello"))
        .await
        .unwrap();
    let (mut scheduler, _ctx) = process_scheduler(test_config(root.path(), COPY_CMD), &records).await;

    drive(&mut scheduler, |s| s.failed == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(user_pdfs_empty(&records, &user.user_id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_many_tasks_all_finish() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    for i in 0..5 {
        create_task(&records, &format!("Body {}", i)).await;
    }
    let (mut scheduler, _ctx) = process_scheduler(test_config(root.path(), COPY_CMD), &records).await;

    let total = drive(&mut scheduler, |s| s.finished == 5).await;
    assert_eq!(total.leased, 5);

    for task in records.tasks.list_all().await.unwrap() {
        assert_eq!(task.status, TaskStatus::Finished);
        let user = records.users.get(&task.user_id).await.unwrap();
        assert_eq!(user.compiled_pdfs, vec![task.pdf_id.unwrap()]);
    }
}

// ============================================================================
// SANDBOX POOL
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_success() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let (mut scheduler, ctx) = sandbox_scheduler(test_config(root.path(), COPY_CMD), &records).await;
    assert_eq!(
        scheduler.pool().sandboxes(),
        &["texlive-0".to_string(), "texlive-1".to_string()]
    );

    drive(&mut scheduler, |s| s.finished == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Finished);
    let user = records.users.get(&task.user_id).await.unwrap();
    assert_eq!(user.compiled_pdfs, vec![stored.pdf_id.unwrap()]);
    assert!(!ctx.scratch_root.join(&task.task_id).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_missing_artifact_fails_and_removes_marker() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let config = test_config(root.path(), "true").with_keep_failed_scratch(true);
    let (mut scheduler, ctx) = sandbox_scheduler(config, &records).await;

    drive(&mut scheduler, |s| s.failed == 1).await;

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().starts_with("No pdf generated"));
    assert!(stored.pdf_id.is_none());

    let scratch = ctx.scratch_root.join(&task.task_id);
    assert!(scratch.exists());
    assert!(!scratch.join(defaults::MARKER_FILE_NAME).exists());
    assert_eq!(scheduler.pool().idle_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_failed_scratch_removed_by_default() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let (mut scheduler, ctx) = sandbox_scheduler(test_config(root.path(), "true"), &records).await;

    drive(&mut scheduler, |s| s.failed == 1).await;

    assert!(!ctx.scratch_root.join(&task.task_id).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_leases_only_idle_sandboxes() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    for _ in 0..3 {
        create_task(&records, "Hello").await;
    }
    let (mut scheduler, _ctx) = sandbox_scheduler(test_config(root.path(), "sleep 1"), &records).await;

    let pass = scheduler.run_pass().await.unwrap();
    assert_eq!(pass.leased, 2);
    assert_eq!(scheduler.pool().idle_count(), 0);

    let compiling = records
        .tasks
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Compiling)
        .count();
    assert_eq!(compiling, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandboxes_reused_by_name() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let config = Arc::new(test_config(root.path(), COPY_CMD));
    let ctx = CompileContext::new(config, records.clone()).await.unwrap();
    let runtime = Arc::new(RecordingRuntime::default());

    let first = SandboxPool::start(ctx.clone(), runtime.clone()).await.unwrap();
    let second = SandboxPool::start(ctx, runtime.clone()).await.unwrap();

    assert_eq!(first.sandboxes(), second.sandboxes());
    assert_eq!(
        runtime.calls("ensure "),
        vec!["texlive-0", "texlive-1", "texlive-0", "texlive-1"]
    );
    assert!(runtime.calls("stop ").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sandbox_shutdown_stops_sandboxes_and_cleans_scratch() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let config = Arc::new(test_config(root.path(), "sleep 5"));
    let ctx = CompileContext::new(config.clone(), records.clone())
        .await
        .unwrap();
    let runtime = Arc::new(RecordingRuntime::default());
    let pool = SandboxPool::start(ctx.clone(), runtime.clone()).await.unwrap();
    let mut scheduler = Scheduler::new(records.clone(), pool, config);

    let pass = scheduler.run_pass().await.unwrap();
    assert_eq!(pass.leased, 1);
    let scratch = ctx.scratch_root.join(&task.task_id);
    assert!(scratch.exists());

    let handle = scheduler.start();
    handle.shutdown().await.unwrap();
    handle.join().await.unwrap();

    assert!(!scratch.exists());
    assert_eq!(runtime.calls("stop "), vec!["texlive-0", "texlive-1"]);
    assert_eq!(runtime.calls("ensure "), vec!["texlive-0", "texlive-1"]);

    let stored = records.tasks.get(&task.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Compiling);
    assert!(stored.pdf_id.is_none());
}

// ============================================================================
// RUNNING SCHEDULER
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_scheduler_finishes_and_stops() {
    let root = TempDir::new().unwrap();
    let records = Records::in_memory();
    let task = create_task(&records, "Hello").await;
    let (scheduler, _ctx) = process_scheduler(test_config(root.path(), COPY_CMD), &records).await;

    let handle = scheduler.start();
    let mut events = handle.events();

    let mut finished = false;
    for _ in 0..200 {
        if records.tasks.get(&task.task_id).await.unwrap().status == TaskStatus::Finished {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(finished);

    handle.shutdown().await.unwrap();
    handle.join().await.unwrap();

    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        if event == SchedulerEvent::Stopped {
            stopped = true;
        }
    }
    assert!(stopped);
}

async fn user_pdfs_empty(records: &Records, user_id: &str) -> bool {
    records
        .users
        .get(user_id)
        .await
        .unwrap()
        .compiled_pdfs
        .is_empty()
}
