use crate::config::Config;
use crate::handlers::StageHandler;
use crate::stage::{Event, Stage, Status};
use crate::utils::MAX_DURATION;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Messages published on the run's event queue. The sequencer is the only
/// producer; the reporter and the renderer subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMessage {
    StageStarted { position: usize, stage: Stage },
    StageFinished { position: usize, event: Event },
    Finished(RunState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running(usize),
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    pub events: Vec<Event>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
            && !self.events.iter().any(|e| e.status == Status::Error)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            return 0;
        }
        match self.events.last() {
            Some(event) if event.status == Status::Error && event.stage == Stage::DetectEnv => 126,
            _ => 1,
        }
    }
}

pub fn event_queue() -> broadcast::Sender<PipelineMessage> {
    let (tx, _) = broadcast::channel(64);
    tx
}

pub struct Sequencer {
    config: Config,
    handlers: Vec<Arc<dyn StageHandler>>,
    state: RunState,
    events: Vec<Event>,
    tx: broadcast::Sender<PipelineMessage>,
}

impl Sequencer {
    pub fn new(
        config: Config,
        handlers: Vec<Arc<dyn StageHandler>>,
        tx: broadcast::Sender<PipelineMessage>,
    ) -> Self {
        let state = if handlers.is_empty() {
            RunState::Completed
        } else {
            RunState::Running(0)
        };
        Self {
            config,
            handlers,
            state,
            events: Vec::new(),
            tx,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    fn publish(&self, message: PipelineMessage) {
        // no subscribers is fine
        let _ = self.tx.send(message);
    }

    /// Records the event of the current stage and moves to the next state.
    /// Terminal states ignore further events.
    pub fn advance(&mut self, event: Event) -> RunState {
        let RunState::Running(position) = self.state else {
            warn!("Ignoring {} event after the run ended", event.stage);
            return self.state;
        };

        let fatal = event.status.is_fatal();
        self.events.push(event.clone());
        self.publish(PipelineMessage::StageFinished { position, event });

        self.state = if fatal {
            RunState::Failed
        } else if position + 1 >= self.handlers.len() {
            RunState::Completed
        } else {
            RunState::Running(position + 1)
        };

        if self.state.is_terminal() {
            self.publish(PipelineMessage::Finished(self.state));
        }
        self.state
    }

    pub async fn run(mut self) -> RunOutcome {
        let started = StdInstant::now();
        if self.state == RunState::Completed {
            self.publish(PipelineMessage::Finished(self.state));
        }

        while let RunState::Running(position) = self.state {
            let handler = Arc::clone(&self.handlers[position]);
            let stage = handler.stage();
            info!("Stage {}/{}: {}", position + 1, self.handlers.len(), stage);
            self.publish(PipelineMessage::StageStarted { position, stage });

            let deadline = Instant::now() + self.config.timeout.min(MAX_DURATION);
            let event = handler.execute(&self.config, deadline).await;
            if event.stage != stage {
                warn!("{} handler reported its event as {}", stage, event.stage);
            }
            debug!("{} finished with {:?}: {}", stage, event.status, event.message);
            self.advance(event);
        }

        info!(
            "Run ended {:?} after {} stage(s) in {}",
            self.state,
            self.events.len(),
            crate::utils::format_duration(started.elapsed().as_secs())
        );
        RunOutcome {
            state: self.state,
            events: self.events,
        }
    }
}
