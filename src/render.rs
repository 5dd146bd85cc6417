use crate::sequencer::{PipelineMessage, RunState};
use crate::stage::{Event, Stage, Status};
use crate::utils::indent;
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone)]
pub struct Theme {
    pub title: String,
    pub labels: Vec<String>,
    pub success_summary: String,
    pub failure_summary: String,
    pub interrupted_summary: String,
    pub spinner_template: String,
    pub detail_indent: String,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            title: "ppr · PGSD pkg repair".to_string(),
            labels: vec![
                "Copyright © 2025 Pacific Grove Software Distribution Foundation".to_string(),
                "Licensed under the BSD 2-Clause License".to_string(),
            ],
            success_summary: "Completed successfully. Run `pkg -vv` to confirm repos.".to_string(),
            failure_summary: "Finished with errors.".to_string(),
            interrupted_summary: "Interrupted.".to_string(),
            spinner_template: "{spinner:.blue} {msg}".to_string(),
            detail_indent: "    ".to_string(),
        }
    }
}

impl Theme {
    pub fn icon(&self, status: Status) -> &'static str {
        match status {
            Status::Ok => "[✓]",
            Status::Warn => "[!]",
            Status::Skip => "[...]",
            Status::Error => "[x]",
        }
    }

    pub fn stage_label(&self, stage: Stage) -> &'static str {
        match stage {
            Stage::RepoNetwork => "Check repository network",
            Stage::DetectEnv => "Detect environment",
            Stage::ClearRepoCache => "Clear repo cache",
            Stage::PkgUpdateForce => "Force pkg update",
            Stage::PkgCheckDa => "Verify package DB",
            Stage::PkgCheckRecompute => "Recompute package metadata",
            Stage::MoveLocalSqlite => "Last resort: move local.sqlite",
        }
    }

    pub fn paint(&self, status: Status, text: &str) -> ColoredString {
        match status {
            Status::Ok => text.green(),
            Status::Warn => text.yellow(),
            Status::Skip => text.dimmed(),
            Status::Error => text.red().bold(),
        }
    }

    pub fn banner(&self) -> String {
        let mut out = format!("{}\n", self.title.blue().bold());
        for label in &self.labels {
            out.push_str(&format!("{}\n", label.dimmed()));
        }
        out
    }

    /// One finished stage: `icon label: message`, then the indented detail
    /// unless `compact` is set.
    pub fn render_event(&self, event: &Event, compact: bool) -> String {
        let head = format!("  {} {}", self.icon(event.status), self.stage_label(event.stage));
        let mut out = format!("{}", self.paint(event.status, &head));
        if !event.message.is_empty() {
            out.push_str(": ");
            out.push_str(&event.message);
        }
        out.push('\n');
        if !compact && !event.detail.is_empty() {
            out.push_str(&format!("{}", indent(&event.detail, &self.detail_indent).dimmed()));
        }
        out
    }

    pub fn summary(&self, state: Option<RunState>) -> ColoredString {
        match state {
            Some(RunState::Completed) => self.success_summary.green(),
            Some(RunState::Failed) => self.failure_summary.red().bold(),
            _ => self.interrupted_summary.yellow(),
        }
    }
}

pub struct Renderer {
    theme: Theme,
    compact: bool,
}

impl Renderer {
    pub fn new(theme: Theme, compact: bool) -> Self {
        Self { theme, compact }
    }

    fn spinner(&self, stage: Stage) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template(&self.theme.spinner_template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(self.theme.stage_label(stage));
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    }

    pub async fn consume(self, mut rx: broadcast::Receiver<PipelineMessage>) -> Option<RunState> {
        println!("{}", self.theme.banner());
        let mut current: Option<ProgressBar> = None;
        let finished = loop {
            match rx.recv().await {
                Ok(PipelineMessage::StageStarted { stage, .. }) => {
                    if let Some(spinner) = current.take() {
                        spinner.finish_and_clear();
                    }
                    current = Some(self.spinner(stage));
                }
                Ok(PipelineMessage::StageFinished { event, .. }) => {
                    let line = self.theme.render_event(&event, self.compact);
                    if let Some(spinner) = current.take() {
                        spinner.finish_and_clear();
                    }
                    print!("{}", line);
                }
                Ok(PipelineMessage::Finished(state)) => break Some(state),
                Err(RecvError::Lagged(missed)) => warn!("Renderer missed {} message(s)", missed),
                Err(RecvError::Closed) => break None,
            }
        };
        if let Some(spinner) = current.take() {
            spinner.finish_and_clear();
        }
        println!("\n{}", self.theme.summary(finished));
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_event_with_detail() {
        colored::control::set_override(false);
        let theme = Theme::default();
        let event = Event::warn(Stage::PkgCheckDa, "integrity issues detected")
            .with_detail("vim has a missing dependency: python3\n");

        let full = theme.render_event(&event, false);
        assert_eq!(
            full,
            "  [!] Verify package DB: integrity issues detected\n    vim has a missing dependency: python3\n"
        );

        let compact = theme.render_event(&event, true);
        assert_eq!(compact, "  [!] Verify package DB: integrity issues detected\n");
    }

    #[test]
    fn test_every_status_has_an_icon() {
        let theme = Theme::default();
        assert_eq!(theme.icon(Status::Ok), "[✓]");
        assert_eq!(theme.icon(Status::Warn), "[!]");
        assert_eq!(theme.icon(Status::Skip), "[...]");
        assert_eq!(theme.icon(Status::Error), "[x]");
    }

    #[test]
    fn test_summary_text() {
        colored::control::set_override(false);
        let theme = Theme::default();
        assert_eq!(
            theme.summary(Some(RunState::Completed)).to_string(),
            "Completed successfully. Run `pkg -vv` to confirm repos."
        );
        assert_eq!(theme.summary(Some(RunState::Failed)).to_string(), "Finished with errors.");
        assert_eq!(theme.summary(None).to_string(), "Interrupted.");
    }
}
