use thiserror::Error;

/// Whether a failure was caused by how the request was phrased or by the
/// system trying to carry it out. Maps onto CLI exit codes 2 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Usage,
    Runtime,
}

impl ErrorClass {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Usage => 2,
            ErrorClass::Runtime => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum GitsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid change bundle: {0}")]
    Bundle(String),
}

impl GitsError {
    /// Short error code string sent to clients in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GitsError::Config(_) => "CONFIG_ERROR",
            GitsError::Serialization(_) => "SERIALIZATION_ERROR",
            GitsError::Bundle(_) => "INVALID_BUNDLE",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            GitsError::Config(_) | GitsError::Bundle(_) => ErrorClass::Usage,
            GitsError::Serialization(_) => ErrorClass::Runtime,
        }
    }
}

pub type Result<T> = std::result::Result<T, GitsError>;
