use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors surfaced by the backup tool.
///
/// Only [`BackupError::Config`] is allowed to abort a whole run. Everything
/// raised while a single VM is being processed is folded into that VM's
/// result by the orchestrator.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    pub fn config(message: impl Into<String>) -> Self {
        BackupError::Config(message.into())
    }

    /// Wrap an I/O failure with the path and operation that produced it.
    pub fn filesystem(
        error: std::io::Error,
        path: impl AsRef<str>,
        operation: impl AsRef<str>,
    ) -> Self {
        BackupError::Filesystem(format!(
            "{} '{}': {}",
            operation.as_ref(),
            path.as_ref(),
            error
        ))
    }

    pub fn is_config(&self) -> bool {
        matches!(self, BackupError::Config(_))
    }
}

impl From<serde_yaml_ng::Error> for BackupError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Classification of a failed virtualization tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayErrorKind {
    NotFound,
    PermissionDenied,
    Timeout,
    Unknown,
}

impl Display for GatewayErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let label = match self {
            GatewayErrorKind::NotFound => "not found",
            GatewayErrorKind::PermissionDenied => "permission denied",
            GatewayErrorKind::Timeout => "timeout",
            GatewayErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

static NOT_FOUND_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)not found|no such|does not exist|doesn't exist").ok());
static PERMISSION_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)permission denied|not authorized|unauthorized|forbidden|access denied").ok()
});
static TIMEOUT_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)timed out|timeout|deadline exceeded").ok());

fn matches(pattern: &Lazy<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(text))
}

/// A failed gateway operation: what went wrong, plus the tool's own words.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Gateway error ({kind}): {raw_message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub raw_message: String,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, raw_message: impl Into<String>) -> Self {
        Self {
            kind,
            raw_message: raw_message.into(),
        }
    }

    pub fn timeout(raw_message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Timeout, raw_message)
    }

    pub fn unknown(raw_message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Unknown, raw_message)
    }

    /// Classify tool stderr by the substrings the tool is known to emit.
    ///
    /// Permission problems are checked first: "permission denied" messages
    /// frequently also mention a path that "does not exist" further down.
    pub fn classify(stderr: &str) -> Self {
        let message = stderr.trim();
        let kind = if matches(&PERMISSION_PATTERN, message) {
            GatewayErrorKind::PermissionDenied
        } else if matches(&TIMEOUT_PATTERN, message) {
            GatewayErrorKind::Timeout
        } else if matches(&NOT_FOUND_PATTERN, message) {
            GatewayErrorKind::NotFound
        } else {
            GatewayErrorKind::Unknown
        };
        Self::new(kind, message)
    }

    /// Map a failure to spawn or wait on the tool process.
    pub fn from_io(error: &std::io::Error, context: &str) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::NotFound => GatewayErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => GatewayErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut => GatewayErrorKind::Timeout,
            _ => GatewayErrorKind::Unknown,
        };
        Self::new(kind, format!("{context}: {error}"))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
