//! Processing log records (one per stage attempt)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failure,
    Warning,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failure => "failure",
            LogStatus::Warning => "warning",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(LogStatus::Success),
            "failure" => Ok(LogStatus::Failure),
            "warning" => Ok(LogStatus::Warning),
            other => Err(format!("unknown log status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub id: i64,
    pub book_id: String,
    pub step: String,
    pub status: LogStatus,
    pub message: String,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub book_id: String,
    pub step: String,
    pub status: LogStatus,
    pub message: String,
    pub duration_seconds: f64,
}

impl NewLogEntry {
    pub fn new(
        book_id: impl Into<String>,
        step: impl Into<String>,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            book_id: book_id.into(),
            step: step.into(),
            status,
            message: message.into(),
            duration_seconds: 0.0,
        }
    }

    pub fn duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = seconds;
        self
    }
}
