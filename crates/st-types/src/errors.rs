use thiserror::Error;

/// Main error type for the ServeTune system
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while turning raw trial text into typed metrics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("Trial log is missing the '{delimiter}' section delimiter")]
    MissingDelimiter { delimiter: String },

    #[error("Trial log contains the '{delimiter}' delimiter {count} times, expected once")]
    RepeatedDelimiter { delimiter: String, count: usize },

    #[error("Client section contains none of the known benchmark metrics")]
    EmptyClientSection,

    #[error("Invalid number '{raw}' for {field}")]
    InvalidNumber { field: String, raw: String },

    #[error("Malformed server log: expected {expected} '{table}' rows, found {found}")]
    RowCountMismatch {
        table: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid extraction pattern: {message}")]
    Pattern { message: String },
}

/// Errors raised by the directional search when it is driven incorrectly
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Search already finished: {reason}")]
    Finished { reason: String },

    #[error("Point {point} was already tried in this run")]
    RepeatedPoint { point: String },

    #[error("Point {point} is missing the token budget required in chunked mode")]
    MissingTokenBudget { point: String },

    #[error("Invalid search configuration: {message}")]
    InvalidConfig { message: String },
}

/// Errors surfaced by trial drivers
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {waited_secs}s waiting for '{marker}'")]
    Timeout { marker: String, waited_secs: u64 },

    #[error("Session output closed before '{marker}' appeared")]
    OutputClosed { marker: String },

    #[error("Session is busy draining output in the background")]
    Draining,

    #[error("Unknown {kind} '{name}'")]
    UnknownTarget { kind: String, name: String },

    #[error("No stored log for trial {trial}")]
    NoStoredLog { trial: String },
}

/// Result type alias for ServeTune operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Result alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

impl From<serde_yaml::Error> for TuneError {
    fn from(err: serde_yaml::Error) -> Self {
        TuneError::Yaml(err.to_string())
    }
}

impl From<csv::Error> for TuneError {
    fn from(err: csv::Error) -> Self {
        TuneError::Csv(err.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
