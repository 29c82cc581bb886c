// End-to-end: a stage with one failing task on a two-worker scheduler

use stage_engine::{EngineConfig, EngineError, Scheduler, ShellTask};

use std::path::Path;

fn config(dir: &Path, workers: usize) -> EngineConfig {
    EngineConfig {
        log_dir: dir.join("log"),
        temp_dir: dir.join("tmp"),
        workers,
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failing_task_fails_the_stage_but_all_logs_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = Scheduler::new("scenario", config(dir.path(), 2)).unwrap();

    scheduler
        .add_task(ShellTask::new("echo first-ok"), false)
        .unwrap();
    scheduler
        .add_task(ShellTask::new("echo second-fails; exit 1"), false)
        .unwrap();
    scheduler
        .add_task(ShellTask::new("sleep 0.2; echo third-ok"), false)
        .unwrap();
    assert_eq!(scheduler.pending_stages(), 1);

    let err = scheduler.run().await.unwrap_err();

    match &err {
        EngineError::StageFailed { job, log, summary } => {
            assert_eq!(job, "scenario");
            assert_eq!(log, &dir.path().join("log/scenario.log"));
            assert_eq!(summary.as_deref(), Some("second-fails\n"));
        }
        other => panic!("expected a stage failure, got {}", other),
    }
    assert!(err.to_string().contains("scenario.log"));

    let job_log = std::fs::read_to_string(dir.path().join("log/scenario.log")).unwrap();
    assert_eq!(job_log, "first-ok\nsecond-fails\nthird-ok\n");
    for idx in 0..3 {
        assert!(!dir.path().join(format!("log/scenario-{}.log", idx)).exists());
    }

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_log_accumulates_across_stages() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = Scheduler::new("multi", config(dir.path(), 3)).unwrap();

    scheduler.add_task(ShellTask::new("echo s1-a"), true).unwrap();
    scheduler.add_task(ShellTask::new("echo s1-b"), false).unwrap();
    scheduler.add_task(ShellTask::new("echo s2-a"), true).unwrap();

    scheduler.run().await.unwrap();

    let job_log = std::fs::read_to_string(scheduler.job_log()).unwrap();
    assert_eq!(job_log, "s1-a\ns1-b\ns2-a\n");
}
