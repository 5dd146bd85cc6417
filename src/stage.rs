use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[serde(rename = "repo_network_check")]
    RepoNetwork,
    DetectEnv,
    ClearRepoCache,
    PkgUpdateForce,
    PkgCheckDa,
    PkgCheckRecompute,
    MoveLocalSqlite,
}

/// Fixed run order. Verification runs on both sides of the recompute so a
/// regression introduced by it shows up in the second pass.
pub const STAGE_ORDER: [Stage; 8] = [
    Stage::RepoNetwork,
    Stage::DetectEnv,
    Stage::ClearRepoCache,
    Stage::PkgUpdateForce,
    Stage::PkgCheckDa,
    Stage::PkgCheckRecompute,
    Stage::PkgCheckDa,
    Stage::MoveLocalSqlite,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RepoNetwork => "repo_network_check",
            Stage::DetectEnv => "detect_env",
            Stage::ClearRepoCache => "clear_repo_cache",
            Stage::PkgUpdateForce => "pkg_update_force",
            Stage::PkgCheckDa => "pkg_check_da",
            Stage::PkgCheckRecompute => "pkg_check_recompute",
            Stage::MoveLocalSqlite => "move_local_sqlite",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Warn,
    Skip,
    Error,
}

impl Status {
    /// Only `error` stops the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Status::Error)
    }
}

/// One stage outcome. Built once by a handler and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: String,
    pub stage: Stage,
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Event {
    pub fn new(stage: Stage, status: Status, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            stage,
            status,
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn ok(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Ok, message)
    }

    pub fn warn(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Warn, message)
    }

    pub fn skip(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Skip, message)
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Error, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(STAGE_ORDER.len(), 8);
        let verify_runs = STAGE_ORDER.iter().filter(|s| **s == Stage::PkgCheckDa).count();
        assert_eq!(verify_runs, 2);
        assert_eq!(STAGE_ORDER[5], Stage::PkgCheckRecompute);
        assert_eq!(STAGE_ORDER[4], Stage::PkgCheckDa);
        assert_eq!(STAGE_ORDER[6], Stage::PkgCheckDa);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::warn(Stage::RepoNetwork, "some repositories are unreachable");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "repo_network_check");
        assert_eq!(json["status"], "warn");
        assert!(json.get("detail").is_none());

        let event = event.with_detail("[x] http://example.org (tcp connect failed)");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["detail"], "[x] http://example.org (tcp connect failed)");
    }

    #[test]
    fn test_event_time_is_rfc3339_utc() {
        let event = Event::ok(Stage::DetectEnv, "running as root");
        assert!(event.time.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(&event.time).is_ok());
    }

    #[test]
    fn test_stage_names_match_serde() {
        for stage in STAGE_ORDER {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.as_str());
        }
    }

    #[test]
    fn test_only_error_is_fatal() {
        assert!(Status::Error.is_fatal());
        assert!(!Status::Warn.is_fatal());
        assert!(!Status::Ok.is_fatal());
        assert!(!Status::Skip.is_fatal());
    }
}
