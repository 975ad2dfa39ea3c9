// Run Scheduler - wakes suspended runs back up after a delay step. The
// tokio implementation sleeps out the delay on a spawned task and hands
// the run id to the resume worker over a channel, so a process restart
// only loses in-flight timers, never run state.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::AutomationError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunScheduler: Send + Sync {
    /// Arrange for the run to be resumed at (or shortly after) `at`.
    async fn schedule_resume(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<(), AutomationError>;
}

pub struct TokioRunScheduler {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl TokioRunScheduler {
    /// Returns the scheduler and the receiver end for the resume worker.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RunScheduler for TokioRunScheduler {
    async fn schedule_resume(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<(), AutomationError> {
        let tx = self.tx.clone();
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        info!(%run_id, resume_at = %at, "scheduling run resumption");
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if tx.send(run_id).is_err() {
                warn!(%run_id, "resume worker is gone, dropping resumption");
            }
        });
        Ok(())
    }
}

/// Drains the resume channel, resuming each run on its own task.
pub fn spawn_resume_worker(
    engine: std::sync::Arc<super::engine::AutomationEngine>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(run_id) = rx.recv().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.resume(run_id).await {
                    error!(%run_id, error = %e, "run resumption failed");
                }
            });
        }
    })
}

/// Compute when a delay step should wake its run. `until` takes an
/// RFC 3339 timestamp; `duration` takes a human interval like
/// "10 minutes". Exactly one must be present.
pub fn resume_time(
    duration: Option<&str>,
    until: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AutomationError> {
    match (duration, until) {
        (Some(_), Some(_)) | (None, None) => Err(AutomationError::InvalidStepDefinition(
            "delay step requires exactly one of 'duration' or 'until'".to_string(),
        )),
        (None, Some(until)) => DateTime::parse_from_rfc3339(until)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                AutomationError::InvalidStepDefinition(format!(
                    "invalid delay 'until' timestamp '{}': {}",
                    until, e
                ))
            }),
        (Some(duration), None) => Ok(now + parse_interval(duration)?),
    }
}

fn parse_interval(raw: &str) -> Result<Duration, AutomationError> {
    let mut parts = raw.split_whitespace();
    let amount: i64 = parts
        .next()
        .and_then(|n| n.parse().ok())
        .filter(|n| *n >= 0)
        .ok_or_else(|| invalid_interval(raw))?;
    let unit = parts.next().ok_or_else(|| invalid_interval(raw))?;
    if parts.next().is_some() {
        return Err(invalid_interval(raw));
    }

    let duration = match unit {
        "ms" | "millisecond" | "milliseconds" => Duration::milliseconds(amount),
        "second" | "seconds" | "sec" | "secs" => Duration::seconds(amount),
        "minute" | "minutes" | "min" | "mins" => Duration::minutes(amount),
        "hour" | "hours" | "hr" | "hrs" => Duration::hours(amount),
        "day" | "days" => Duration::days(amount),
        "week" | "weeks" => Duration::weeks(amount),
        _ => return Err(invalid_interval(raw)),
    };
    Ok(duration)
}

fn invalid_interval(raw: &str) -> AutomationError {
    AutomationError::InvalidStepDefinition(format!("invalid delay duration '{}'", raw))
}
