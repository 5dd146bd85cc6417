pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod probe;
pub mod render;
pub mod report;
pub mod sequencer;
pub mod stage;
pub mod utils;

pub use config::{Config, PkgSettings};
pub use error::{RepairError, RepairResult};
pub use executor::{CommandExecutor, ScriptedExecutor, SystemExecutor};
pub use handlers::{StageHandler, default_registry};
pub use probe::{RepoProbe, RepoProber};
pub use render::{Renderer, Theme};
pub use report::EventReporter;
pub use sequencer::{PipelineMessage, RunOutcome, RunState, Sequencer, event_queue};
pub use stage::{Event, STAGE_ORDER, Stage, Status};

pub const PPR_VERSION: &str = env!("CARGO_PKG_VERSION");

use lazy_static::lazy_static;
use std::path::PathBuf;

lazy_static! {
    pub static ref PPR_CONFIG: PathBuf = {
        if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_home).join("ppr")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".config").join("ppr")
        } else {
            PathBuf::from("/tmp/.ppr")
        }
    };
}
