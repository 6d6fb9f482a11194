//! Core domain model and capability seams for daywall.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "daywall-core";

pub const SUCCESS_TITLE: &str = "Wallpaper updated";
pub const SUCCESS_MESSAGE: &str = "Wallpaper changed successfully";
pub const FAILURE_TITLE: &str = "Error";

/// What started a pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// Catch-up run at process start when today's slot was missed.
    Startup,
    Scheduled,
    Forced,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Scheduled => "scheduled",
            Self::Forced => "forced",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Extraction,
    Download,
    Decode,
    Io,
    Apply,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extraction => "extraction",
            Self::Download => "download",
            Self::Decode => "decode",
            Self::Io => "io",
            Self::Apply => "apply",
        }
    }
}

/// Stage failure of a single pipeline invocation. Each variant carries a
/// one-line description suitable for a notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("listing page unavailable: {0}")]
    Fetch(String),
    #[error("no download link found: {0}")]
    Extraction(String),
    #[error("image download failed: {0}")]
    Download(String),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("local file operation failed: {0}")]
    Io(String),
    #[error("wallpaper could not be applied: {0}")]
    Apply(String),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Fetch(_) => FailureKind::Fetch,
            Self::Extraction(_) => FailureKind::Extraction,
            Self::Download(_) => FailureKind::Download,
            Self::Decode(_) => FailureKind::Decode,
            Self::Io(_) => FailureKind::Io,
            Self::Apply(_) => FailureKind::Apply,
        }
    }
}

/// Outcome of one pipeline invocation. Never persisted.
pub type PipelineResult = Result<(), PipelineError>;

/// Title/message pair shown to the user for a finished run.
pub fn outcome_notification(result: &PipelineResult) -> (&'static str, String) {
    match result {
        Ok(()) => (SUCCESS_TITLE, SUCCESS_MESSAGE.to_string()),
        Err(err) => (FAILURE_TITLE, one_line(&err.to_string())),
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

/// Platform seam for setting the desktop background from an image file.
#[async_trait]
pub trait WallpaperApplier: Send + Sync {
    async fn apply(&self, path: &Path) -> Result<(), ApplyError>;
}

/// Fire-and-forget outcome sink. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn now(title: &str, message: &str) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        }
    }
}

/// Signals emitted by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiEvent {
    ForceRequested,
    ExitRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_notification_is_single_line() {
        let result: PipelineResult = Err(PipelineError::Decode("bad\nheader  bytes".into()));
        let (title, message) = outcome_notification(&result);
        assert_eq!(title, FAILURE_TITLE);
        assert_eq!(message, "image could not be decoded: bad header bytes");
    }

    #[test]
    fn success_notification_uses_fixed_text() {
        let (title, message) = outcome_notification(&Ok(()));
        assert_eq!(title, SUCCESS_TITLE);
        assert_eq!(message, SUCCESS_MESSAGE);
    }

    #[test]
    fn error_kinds_serialize_as_snake_case() {
        let kind = PipelineError::Io("disk full".into()).kind();
        assert_eq!(kind.as_str(), "io");
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"io\"");
        assert_eq!(
            serde_json::to_string(&UiEvent::ForceRequested).unwrap(),
            "\"force_requested\""
        );
    }
}
