use gits_core::{ErrorClass, GitsError};
use gits_scheduler::TimeError;
use thiserror::Error;

/// Everything the `gits` binary can report. Display strings are what the
/// user sees after `Error: `.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("{0}")]
    Usage(String),

    #[error("Must be run inside a Git repository.")]
    NotARepository,

    #[error("Could not retrieve repository URL. Ensure 'origin' remote is set.")]
    NoOrigin,

    #[error("{0}")]
    RepoUrl(String),

    #[error("No changes found.")]
    NoChanges,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("{key} is not set; add it under [client] in {path}")]
    MissingConfig { key: &'static str, path: String },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx answer from the gateway, carrying its `error` text.
    #[error("{message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error(transparent)]
    Core(#[from] GitsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CliError::Usage(_) => ErrorClass::Usage,
            CliError::Core(e) => e.class(),
            _ => ErrorClass::Runtime,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_messages() {
        assert_eq!(
            CliError::NotARepository.to_string(),
            "Must be run inside a Git repository."
        );
        assert_eq!(
            CliError::NoOrigin.to_string(),
            "Could not retrieve repository URL. Ensure 'origin' remote is set."
        );
        assert_eq!(CliError::NoChanges.to_string(), "No changes found.");
        assert_eq!(
            CliError::FileNotFound("app.py".into()).to_string(),
            "file not found: app.py"
        );
        assert_eq!(
            CliError::Time(TimeError::NotInFuture { at: "x".into() }).to_string(),
            "Schedule time must be in the future."
        );
    }

    #[test]
    fn exit_classes() {
        assert_eq!(CliError::Usage("bad".into()).class().exit_code(), 2);
        assert_eq!(CliError::NoChanges.class().exit_code(), 1);
        assert_eq!(
            CliError::Core(GitsError::Bundle("x".into())).class(),
            ErrorClass::Usage
        );
    }
}
