use ppr::error::RepairError;
use ppr::handlers::{
    ClearCache, CommandStage, EnvironmentCheck, ForcedUpdate, LastResortRecovery, NetworkCheck,
    PkgTool, StageHandler,
};
use ppr::{
    CommandExecutor, Config, EventReporter, Event, PkgSettings, RepoProber, RepairResult,
    RunState, STAGE_ORDER, ScriptedExecutor, Sequencer, Stage, Status, event_queue,
};
use std::path::Path;
use std::sync::Arc;

fn privileged() -> RepairResult<()> {
    Ok(())
}

fn unprivileged() -> RepairResult<()> {
    Err(RepairError::PrivilegeError("effective uid is 1001, root is required".into()))
}

/// Same layout as the default registry, with the privilege check swapped out.
fn registry(
    exec: &Arc<ScriptedExecutor>,
    db_dir: &Path,
    privilege: fn() -> RepairResult<()>,
) -> Vec<Arc<dyn StageHandler>> {
    let settings = Arc::new(PkgSettings {
        database_dir: db_dir.to_path_buf(),
        ..PkgSettings::default()
    });
    let executor: Arc<dyn CommandExecutor> = exec.clone();
    let tool = PkgTool::new(executor.clone(), settings.clone());
    let prober = RepoProber::new(executor, settings.clone()).unwrap();
    let verify: Arc<dyn StageHandler> = Arc::new(CommandStage::verify_database(tool.clone()));

    vec![
        Arc::new(NetworkCheck::new(prober)),
        Arc::new(EnvironmentCheck::with_privilege_check(settings.clone(), privilege)),
        Arc::new(ClearCache::new(settings)),
        Arc::new(ForcedUpdate::new(tool.clone())),
        verify.clone(),
        Arc::new(CommandStage::recompute_metadata(tool.clone())),
        verify,
        Arc::new(LastResortRecovery::new(tool)),
    ]
}

fn seed_database(dir: &Path) {
    std::fs::write(dir.join("repo-FreeBSD.sqlite"), b"stale").unwrap();
    std::fs::write(dir.join("local.sqlite"), b"db").unwrap();
}

#[tokio::test]
async fn test_full_run_repairs_and_reports() {
    let db = tempfile::tempdir().unwrap();
    seed_database(db.path());
    let out = tempfile::tempdir().unwrap();
    let report_path = out.path().join("report.json");

    let exec = Arc::new(ScriptedExecutor::new());
    exec.succeed("pkg config ABI", "FreeBSD:14:amd64\n")
        .succeed("pkg -vv", "Repositories:\n  FreeBSD: {\n    enabled: yes,\n  }\n");

    let config = Config {
        report_path: Some(report_path.clone()),
        ..Config::default()
    };
    let tx = event_queue();
    let reporter = tokio::spawn(EventReporter::new(config.report_path.clone()).consume(tx.subscribe()));
    let handlers = registry(&exec, db.path(), privileged);
    let outcome = Sequencer::new(config, handlers, tx).run().await;
    let reporter = reporter.await.unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.exit_code(), 0);
    let stages: Vec<Stage> = outcome.events.iter().map(|e| e.stage).collect();
    assert_eq!(stages, STAGE_ORDER.to_vec());
    assert_eq!(outcome.events[0].status, Status::Warn);
    assert_eq!(outcome.events[0].message, "could not detect repository URLs");
    assert_eq!(outcome.events[7].message, "moved local.sqlite aside");

    assert!(!db.path().join("repo-FreeBSD.sqlite").exists());
    assert!(!db.path().join("local.sqlite").exists());
    assert!(db.path().join("local.sqlite.bak").exists());

    assert_eq!(
        exec.calls(),
        vec![
            "pkg config ABI",
            "pkg -vv",
            "pkg update -f",
            "pkg check -da",
            "pkg check -r -a",
            "pkg check -da",
            "pkg update -f",
            "pkg check -da",
        ]
    );

    assert_eq!(reporter.events(), outcome.events.as_slice());
    let saved: Vec<Event> =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(saved, outcome.events);
}

#[tokio::test]
async fn test_unprivileged_run_stops_after_environment_check() {
    let db = tempfile::tempdir().unwrap();
    seed_database(db.path());
    let exec = Arc::new(ScriptedExecutor::new());

    let outcome = Sequencer::new(
        Config::default(),
        registry(&exec, db.path(), unprivileged),
        event_queue(),
    )
    .run()
    .await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.events.len(), 2);
    assert_eq!(outcome.events[1].stage, Stage::DetectEnv);
    assert_eq!(outcome.events[1].status, Status::Error);
    assert_eq!(outcome.exit_code(), 126);
    assert_eq!(exec.calls(), vec!["pkg config ABI", "pkg -vv"]);
    assert!(db.path().join("repo-FreeBSD.sqlite").exists());
    assert!(db.path().join("local.sqlite").exists());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let db = tempfile::tempdir().unwrap();
    seed_database(db.path());
    let exec = Arc::new(ScriptedExecutor::new());
    let config = Config {
        dry_run: true,
        ..Config::default()
    };

    let outcome = Sequencer::new(config, registry(&exec, db.path(), privileged), event_queue())
        .run()
        .await;

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.events.len(), STAGE_ORDER.len());
    for event in &outcome.events[2..] {
        assert_eq!(event.status, Status::Skip, "{} should be skipped", event.stage);
    }
    assert_eq!(exec.calls(), vec!["pkg config ABI", "pkg -vv"]);
    assert!(db.path().join("repo-FreeBSD.sqlite").exists());
    assert!(db.path().join("local.sqlite").exists());
}

#[tokio::test]
async fn test_stage_failures_are_warnings() {
    let db = tempfile::tempdir().unwrap();
    let exec = Arc::new(ScriptedExecutor::new());
    exec.fail("pkg update -f", "no meta file")
        .fail("pkg bootstrap -f", "bootstrap failed")
        .fail("pkg update -f", "still no meta file")
        .fail("pkg check -da", "missing dependency")
        .fail("pkg check -r -a", "sqlite error");

    let outcome = Sequencer::new(
        Config::default(),
        registry(&exec, db.path(), privileged),
        event_queue(),
    )
    .run()
    .await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.exit_code(), 0);
    let statuses: Vec<Status> = outcome.events.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            Status::Warn,
            Status::Ok,
            Status::Ok,
            Status::Warn,
            Status::Warn,
            Status::Warn,
            Status::Ok,
            Status::Ok,
        ]
    );
    assert_eq!(outcome.events[7].message, "no local database found");
}
