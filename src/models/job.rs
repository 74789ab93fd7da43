use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Queued and active jobs still have work ahead of them.
    pub fn is_pending(self) -> bool {
        matches!(self, JobState::Queued | JobState::Active)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Succeed,
    Fail,
    Retry,
    Cancel,
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobEvent::Start => "start",
            JobEvent::Succeed => "succeed",
            JobEvent::Fail => "fail",
            JobEvent::Retry => "retry",
            JobEvent::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {event} a job that is {from}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub event: JobEvent,
}

/// The single source of truth for legal job state changes.
///
/// `attempts_made` counts started attempts, so `Start` is only legal while
/// attempts remain and `Retry` only when the failed attempt was not the last.
pub fn next_state(
    from: JobState,
    event: JobEvent,
    attempts_made: u32,
    max_attempts: u32,
) -> Result<JobState, InvalidTransition> {
    use JobEvent::*;
    use JobState::*;

    let to = match (from, event) {
        (Queued, Start) if attempts_made < max_attempts => Some(Active),
        (Active, Succeed) => Some(Completed),
        (Active, Fail) => Some(Failed),
        (Failed, Retry) if attempts_made < max_attempts => Some(Queued),
        (Queued | Active, Cancel) => Some(Cancelled),
        _ => None,
    };

    to.ok_or(InvalidTransition { from, event })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobSummary {
    pub sheet_count: usize,
    pub processed_sheets: usize,
    pub total_rows: usize,
    pub total_columns: usize,
    pub warning_count: usize,
    pub truncated: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub owner_id: String,
    pub state: JobState,
    /// 0..=100, never decreases within an attempt.
    /// Highest percentage reported so far; a retry carries it over.
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub result_summary: Option<JobSummary>,
}

impl ProcessingJob {
    pub fn new(file_id: Uuid, owner_id: &str, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_id,
            owner_id: owner_id.to_string(),
            state: JobState::Queued,
            progress: 0,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            failure_reason: None,
            result_summary: None,
        }
    }

    /// Applies an event through [`next_state`] and updates the bookkeeping
    /// fields that go with it.
    pub fn apply(&mut self, event: JobEvent, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let to = next_state(self.state, event, self.attempts_made, self.max_attempts)?;

        match event {
            JobEvent::Start => {
                self.attempts_made += 1;
                self.started_at = Some(now);
                self.next_attempt_at = None;
            }
            JobEvent::Succeed => {
                self.progress = 100;
                self.completed_at = Some(now);
                self.failure_reason = None;
            }
            JobEvent::Fail | JobEvent::Cancel => {
                self.completed_at = Some(now);
            }
            JobEvent::Retry => {
                self.completed_at = None;
            }
        }

        self.state = to;
        Ok(())
    }

    /// Records a progress report. Values are clamped to 0..=100 and a report
    /// lower than the current value is ignored. Returns true when the stored
    /// value changed.
    pub fn record_progress(&mut self, percent: f32) -> bool {
        if self.state != JobState::Active || !percent.is_finite() {
            return false;
        }
        let value = percent.clamp(0.0, 100.0).floor() as u8;
        if value > self.progress {
            self.progress = value;
            true
        } else {
            false
        }
    }

    /// Terminal jobs never change state again. A persisted failed job is
    /// terminal: retries move a job straight back to queued.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}
