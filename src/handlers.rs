use crate::config::{Config, PkgSettings};
use crate::error::{RepairError, RepairResult};
use crate::executor::{CommandExecutor, command_line};
use crate::probe::RepoProber;
use crate::stage::{Event, STAGE_ORDER, Stage};
use crate::utils::{require_root, tail};
use async_trait::async_trait;
use globset::Glob;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;

pub const UPDATE_ARGS: &[&str] = &["update", "-f"];
pub const BOOTSTRAP_ARGS: &[&str] = &["bootstrap", "-f"];
pub const CHECK_ARGS: &[&str] = &["check", "-da"];
pub const RECOMPUTE_ARGS: &[&str] = &["check", "-r", "-a"];

/// One step of the repair pipeline. Every failure inside `execute` ends up
/// in the returned event; nothing is propagated.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, config: &Config, deadline: Instant) -> Event;
}

#[derive(Clone)]
pub struct PkgTool {
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<PkgSettings>,
}

impl PkgTool {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: Arc<PkgSettings>) -> Self {
        Self { executor, settings }
    }

    pub fn settings(&self) -> &PkgSettings {
        &self.settings
    }

    pub async fn run(&self, args: &[&str], deadline: Instant) -> RepairResult<String> {
        self.executor
            .execute(&self.settings.pkg_binary, args, deadline)
            .await
    }

    pub fn describe(&self, args: &[&str]) -> String {
        command_line(&self.settings.pkg_binary, args)
    }
}

fn attempt_text(result: &RepairResult<String>) -> String {
    match result {
        Ok(out) => out.clone(),
        Err(e) => {
            let out = e.captured_output().trim_end();
            if out.is_empty() {
                e.to_string()
            } else {
                format!("{}\n{}", out, e)
            }
        }
    }
}

/// Builds the fixed, ordered handler list. The verify handler is shared by
/// both of its positions.
pub fn default_registry(
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<PkgSettings>,
) -> RepairResult<Vec<Arc<dyn StageHandler>>> {
    let tool = PkgTool::new(executor.clone(), settings.clone());
    let prober = RepoProber::new(executor, settings.clone())?;
    let verify: Arc<dyn StageHandler> = Arc::new(CommandStage::verify_database(tool.clone()));

    let registry: Vec<Arc<dyn StageHandler>> = vec![
        Arc::new(NetworkCheck::new(prober)),
        Arc::new(EnvironmentCheck::new(settings.clone())),
        Arc::new(ClearCache::new(settings)),
        Arc::new(ForcedUpdate::new(tool.clone())),
        verify.clone(),
        Arc::new(CommandStage::recompute_metadata(tool.clone())),
        verify,
        Arc::new(LastResortRecovery::new(tool)),
    ];
    debug_assert!(registry.iter().map(|h| h.stage()).eq(STAGE_ORDER));
    Ok(registry)
}

pub struct NetworkCheck {
    prober: RepoProber,
}

impl NetworkCheck {
    pub fn new(prober: RepoProber) -> Self {
        Self { prober }
    }
}

#[async_trait]
impl StageHandler for NetworkCheck {
    fn stage(&self) -> Stage {
        Stage::RepoNetwork
    }

    async fn execute(&self, _config: &Config, deadline: Instant) -> Event {
        let summary = self.prober.probe_all(deadline).await;
        let event = if summary.all_reachable {
            Event::ok(self.stage(), summary.message)
        } else {
            Event::warn(self.stage(), summary.message)
        };
        event.with_detail(summary.detail)
    }
}

pub struct EnvironmentCheck {
    settings: Arc<PkgSettings>,
    privilege: fn() -> RepairResult<()>,
}

impl EnvironmentCheck {
    pub fn new(settings: Arc<PkgSettings>) -> Self {
        Self::with_privilege_check(settings, require_root)
    }

    pub fn with_privilege_check(
        settings: Arc<PkgSettings>,
        privilege: fn() -> RepairResult<()>,
    ) -> Self {
        Self { settings, privilege }
    }

    fn locate_pkg(&self) -> String {
        let binary = &self.settings.pkg_binary;
        match which::which(binary) {
            Ok(path) => format!("{} found at {}", binary, path.display()),
            Err(_) => format!("{} not found on PATH", binary),
        }
    }
}

#[async_trait]
impl StageHandler for EnvironmentCheck {
    fn stage(&self) -> Stage {
        Stage::DetectEnv
    }

    async fn execute(&self, _config: &Config, _deadline: Instant) -> Event {
        match (self.privilege)() {
            Ok(()) => Event::ok(self.stage(), "running as root").with_detail(self.locate_pkg()),
            Err(e) if e.is_fatal() => {
                warn!("{}", e);
                Event::error(self.stage(), "must run as root").with_detail(e.to_string())
            }
            Err(e) => {
                warn!("Could not determine privileges: {}", e);
                Event::warn(self.stage(), "could not determine privileges")
                    .with_detail(e.to_string())
            }
        }
    }
}

pub struct ClearCache {
    settings: Arc<PkgSettings>,
}

impl ClearCache {
    pub fn new(settings: Arc<PkgSettings>) -> Self {
        Self { settings }
    }

    pub async fn matching_files(&self) -> RepairResult<Vec<PathBuf>> {
        let matcher = Glob::new(&self.settings.cache_pattern)?.compile_matcher();
        let mut entries = tokio::fs::read_dir(&self.settings.database_dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            if matcher.is_match(Path::new(&entry.file_name())) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl StageHandler for ClearCache {
    fn stage(&self) -> Stage {
        Stage::ClearRepoCache
    }

    async fn execute(&self, config: &Config, _deadline: Instant) -> Event {
        let dir = self.settings.database_dir.display();
        let paths = match self.matching_files().await {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Could not scan {}: {}", dir, e);
                let err = RepairError::FilesystemError(e.to_string());
                return Event::warn(self.stage(), format!("could not scan {}", dir))
                    .with_detail(err.to_string());
            }
        };

        if paths.is_empty() {
            return Event::ok(self.stage(), "repo cache already clean").with_detail(format!(
                "checked {} for {}",
                dir, self.settings.cache_pattern
            ));
        }

        if config.dry_run {
            return Event::skip(
                self.stage(),
                format!("dry run: would remove {} cached repo catalog(s)", paths.len()),
            )
            .with_detail(join_paths(&paths));
        }

        let mut failures = Vec::new();
        for path in &paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Removed {}", path.display()),
                Err(e) => {
                    warn!("Could not remove {}: {}", path.display(), e);
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if failures.is_empty() {
            Event::ok(self.stage(), "removed cached repo catalogs").with_detail(join_paths(&paths))
        } else {
            Event::warn(self.stage(), "some cached repo catalogs could not be removed")
                .with_detail(failures.join("\n"))
        }
    }
}

pub struct ForcedUpdate {
    tool: PkgTool,
}

impl ForcedUpdate {
    pub fn new(tool: PkgTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl StageHandler for ForcedUpdate {
    fn stage(&self) -> Stage {
        Stage::PkgUpdateForce
    }

    async fn execute(&self, config: &Config, deadline: Instant) -> Event {
        if config.dry_run {
            return Event::skip(
                self.stage(),
                format!("dry run: would run {}", self.tool.describe(UPDATE_ARGS)),
            );
        }

        let settings = self.tool.settings();
        let first = self.tool.run(UPDATE_ARGS, deadline).await;
        if let Ok(out) = &first {
            return Event::ok(self.stage(), "pkg update completed")
                .with_detail(tail(out, settings.success_tail));
        }

        warn!("pkg update failed, bootstrapping and retrying once");
        if let Err(e) = self.tool.run(BOOTSTRAP_ARGS, deadline).await {
            warn!("pkg bootstrap failed: {}", e);
        }
        let retry = self.tool.run(UPDATE_ARGS, deadline).await;
        match &retry {
            Ok(_) => info!("pkg update succeeded after bootstrap"),
            Err(e) => warn!("pkg update retry failed: {}", e),
        }

        let half = settings.failure_tail / 2;
        let detail = format!(
            "{}\n{}",
            tail(&attempt_text(&first), half),
            tail(&attempt_text(&retry), half)
        );
        Event::warn(self.stage(), "pkg update had problems; tried bootstrap and retry")
            .with_detail(detail)
    }
}

pub struct CommandStage {
    stage: Stage,
    tool: PkgTool,
    args: &'static [&'static str],
    ok_message: &'static str,
    warn_message: &'static str,
}

impl CommandStage {
    pub fn verify_database(tool: PkgTool) -> Self {
        Self {
            stage: Stage::PkgCheckDa,
            tool,
            args: CHECK_ARGS,
            ok_message: "local package database looks consistent",
            warn_message: "integrity issues detected",
        }
    }

    pub fn recompute_metadata(tool: PkgTool) -> Self {
        Self {
            stage: Stage::PkgCheckRecompute,
            tool,
            args: RECOMPUTE_ARGS,
            ok_message: "recomputed package metadata",
            warn_message: "recompute reported problems",
        }
    }
}

#[async_trait]
impl StageHandler for CommandStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, config: &Config, deadline: Instant) -> Event {
        if config.dry_run {
            return Event::skip(
                self.stage,
                format!("dry run: would run {}", self.tool.describe(self.args)),
            );
        }

        let settings = self.tool.settings();
        let result = self.tool.run(self.args, deadline).await;
        match &result {
            Ok(out) => {
                Event::ok(self.stage, self.ok_message).with_detail(tail(out, settings.success_tail))
            }
            Err(e) => {
                warn!("{}", e);
                Event::warn(self.stage, self.warn_message)
                    .with_detail(tail(&attempt_text(&result), settings.failure_tail))
            }
        }
    }
}

pub struct LastResortRecovery {
    tool: PkgTool,
}

impl LastResortRecovery {
    pub fn new(tool: PkgTool) -> Self {
        Self { tool }
    }

    async fn follow_up(&self, deadline: Instant) {
        for args in [UPDATE_ARGS, CHECK_ARGS] {
            match self.tool.run(args, deadline).await {
                Ok(_) => debug!("{} finished", self.tool.describe(args)),
                Err(e) => warn!("Follow-up {} failed: {}", self.tool.describe(args), e),
            }
        }
    }
}

#[async_trait]
impl StageHandler for LastResortRecovery {
    fn stage(&self) -> Stage {
        Stage::MoveLocalSqlite
    }

    async fn execute(&self, config: &Config, deadline: Instant) -> Event {
        let settings = self.tool.settings();
        let name = &settings.local_database;
        let local = settings.local_database_path();
        let backup = settings.backup_path();
        let moved = format!("{} -> {}", local.display(), backup.display());

        match tokio::fs::metadata(&local).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Event::ok(self.stage(), "no local database found")
                    .with_detail("database already in a clean state");
            }
            Err(e) => {
                warn!("Could not inspect {}: {}", local.display(), e);
                return Event::warn(self.stage(), format!("could not inspect {}", name))
                    .with_detail(e.to_string());
            }
        }

        if config.dry_run {
            return Event::skip(self.stage(), format!("dry run: would move {} aside", name))
                .with_detail(moved);
        }

        if let Err(e) = tokio::fs::rename(&local, &backup).await {
            warn!("Could not move {}: {}", local.display(), e);
            let err = RepairError::FilesystemError(e.to_string());
            return Event::warn(self.stage(), format!("could not move {}", name))
                .with_detail(err.to_string());
        }
        info!("Moved {}", moved);

        self.follow_up(deadline).await;
        Event::ok(self.stage(), format!("moved {} aside", name)).with_detail(moved)
    }
}
