use crate::error::RepairResult;
use crate::sequencer::PipelineMessage;
use crate::stage::Event;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{self, error::RecvError};

/// Collects stage events and writes them out as a JSON array at the end of
/// the run.
#[derive(Debug, Default)]
pub struct EventReporter {
    path: Option<PathBuf>,
    events: Vec<Event>,
    flushed: bool,
}

impl EventReporter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            events: Vec::new(),
            flushed: false,
        }
    }

    pub fn record(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn render(&self) -> RepairResult<String> {
        let mut json = serde_json::to_string_pretty(&self.events)?;
        json.push('\n');
        Ok(json)
    }

    pub fn write(&self) -> RepairResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        std::fs::write(path, self.render()?)?;
        info!("Wrote {} event(s) to {}", self.events.len(), path.display());
        Ok(())
    }

    /// Best-effort write. Runs at most once; failures are only logged.
    pub fn flush(&mut self) {
        if self.flushed {
            debug!("Report already flushed");
            return;
        }
        self.flushed = true;
        if let Err(e) = self.write() {
            warn!("Could not write JSON report: {}", e);
        }
    }

    pub async fn consume(mut self, mut rx: broadcast::Receiver<PipelineMessage>) -> Self {
        loop {
            match rx.recv().await {
                Ok(PipelineMessage::StageFinished { event, .. }) => self.record(event),
                Ok(PipelineMessage::StageStarted { .. }) => {}
                Ok(PipelineMessage::Finished(_)) => break,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Reporter missed {} message(s)", missed);
                }
                Err(RecvError::Closed) => {
                    debug!("Event queue closed before the run finished");
                    break;
                }
            }
        }
        self.flush();
        self
    }
}
