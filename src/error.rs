use thiserror::Error;

pub type RepairResult<T> = Result<T, RepairError>;

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    /// Not running with the privileges needed to touch the pkg database
    #[error("Permission denied: {0}")]
    PrivilegeError(String),

    #[error("Repository unreachable: {0}")]
    NetworkUnreachable(String),

    /// The verbose configuration dump yielded no repository URLs
    #[error("Incomplete pkg configuration: {0}")]
    ConfigParseIncomplete(String),

    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    /// Nonzero exit or spawn failure. `output` holds whatever the process
    /// printed before it failed.
    #[error("{command} failed: {reason}")]
    ExternalCommandFailure {
        command: String,
        reason: String,
        output: String,
    },

    #[error("{command} timed out")]
    Timeout { command: String, output: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl RepairError {
    pub fn command_failed(command: &str, reason: impl Into<String>, output: String) -> Self {
        RepairError::ExternalCommandFailure {
            command: command.to_string(),
            reason: reason.into(),
            output,
        }
    }

    /// Output captured from an external command up to the point it failed.
    pub fn captured_output(&self) -> &str {
        match self {
            RepairError::ExternalCommandFailure { output, .. }
            | RepairError::Timeout { output, .. } => output,
            _ => "",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RepairError::PrivilegeError(_))
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RepairError::PrivilegeError(_) => 126,
            RepairError::InvalidArguments(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_output() {
        let err = RepairError::command_failed("pkg update -f", "exit status: 1", "partial\n".into());
        assert_eq!(err.captured_output(), "partial\n");
        assert_eq!(err.to_string(), "pkg update -f failed: exit status: 1");

        let err = RepairError::FilesystemError("nope".into());
        assert_eq!(err.captured_output(), "");
    }

    #[test]
    fn test_classification() {
        let privilege = RepairError::PrivilegeError("uid 1000".into());
        assert!(privilege.is_fatal());
        assert_eq!(privilege.exit_code(), 126);

        let unreachable = RepairError::NetworkUnreachable("pkg.example.org".into());
        assert_eq!(unreachable.exit_code(), 1);

        assert_eq!(RepairError::InvalidArguments("--timeout".into()).exit_code(), 2);
    }
}
