//! Rollout evaluation - verdicts from review, QA, and incident signals
//!
//! The candidate window (rollout start to now) is compared against a
//! prior window of equal standing (the 30 days before the rollout).
//! Rollback triggers are checked before the sample-size gate: a bad
//! enough signal ends the rollout even on thin data.

use crate::error::Result;
use crate::rollout::SoulRollout;
use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

/// Counts over a signal window.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleStats {
    /// Items that failed (rejected reviews, failed QA cases)
    pub failed: u32,
    /// Total items observed
    pub total: u32,
}

impl SampleStats {
    /// Failure rate, 0.0 when the window is empty.
    #[must_use]
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.failed) / f64::from(self.total)
        }
    }
}

/// Read-only aggregate over human review outcomes.
#[async_trait::async_trait]
pub trait ReviewSignal: Send + Sync {
    /// Rejected/total review items for the agent in a window.
    async fn reject_stats(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SampleStats>;
}

/// Read-only aggregate over automated QA runs.
#[async_trait::async_trait]
pub trait QaSignal: Send + Sync {
    /// Failed/total QA cases for the agent in a window.
    async fn failure_stats(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SampleStats>;
}

/// Read-only count of high-severity incidents.
#[async_trait::async_trait]
pub trait IncidentSignal: Send + Sync {
    /// High-severity incidents attributed to the agent since `since`.
    async fn high_severity_count(&self, agent_id: &str, since: DateTime<Utc>) -> Result<u32>;
}

/// Signals that always report clean windows. Used when no collaborators
/// are wired up; rollouts then promote purely on sample size.
pub struct NoopSignals;

#[async_trait::async_trait]
impl ReviewSignal for NoopSignals {
    async fn reject_stats(
        &self,
        _agent_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<SampleStats> {
        Ok(SampleStats::default())
    }
}

#[async_trait::async_trait]
impl QaSignal for NoopSignals {
    async fn failure_stats(
        &self,
        _agent_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<SampleStats> {
        Ok(SampleStats::default())
    }
}

#[async_trait::async_trait]
impl IncidentSignal for NoopSignals {
    async fn high_severity_count(&self, _agent_id: &str, _since: DateTime<Utc>) -> Result<u32> {
        Ok(0)
    }
}

/// Thresholds controlling rollout verdicts.
#[derive(Debug, Clone)]
pub struct RolloutPolicy {
    /// Reject-rate increase over prior window that forces rollback
    pub reject_delta_rollback: f64,
    /// QA-failure-rate increase over prior window that forces rollback
    pub qa_delta_rollback: f64,
    /// Max reject-rate increase tolerated for promotion
    pub reject_delta_promote: f64,
    /// Max QA-failure-rate increase tolerated for promotion
    pub qa_delta_promote: f64,
    /// Incident count at or above which the rollout rolls back
    pub incident_rollback_threshold: u32,
    /// Length of the prior comparison window
    pub baseline_window: Duration,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            reject_delta_rollback: 0.10,
            qa_delta_rollback: 0.15,
            reject_delta_promote: 0.02,
            qa_delta_promote: 0.05,
            incident_rollback_threshold: 1,
            baseline_window: Duration::days(30),
        }
    }
}

/// Outcome of evaluating a rollout.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Candidate won; activate it
    Promote,
    /// Candidate lost; restore the baseline
    Rollback(String),
    /// Not enough evidence yet
    Pending(String),
}

/// Evaluate a running rollout against its signals.
#[instrument(skip_all, fields(rollout_id = %rollout.id, agent_id = %rollout.agent_id))]
pub async fn evaluate(
    rollout: &SoulRollout,
    review: &dyn ReviewSignal,
    qa: &dyn QaSignal,
    incidents: &dyn IncidentSignal,
    policy: &RolloutPolicy,
) -> Result<Verdict> {
    let now = Utc::now();
    let window_start = rollout.started_at;
    let prior_start = window_start - policy.baseline_window;

    let reject_now = review
        .reject_stats(&rollout.agent_id, window_start, now)
        .await?;
    let reject_prior = review
        .reject_stats(&rollout.agent_id, prior_start, window_start)
        .await?;
    let qa_now = qa
        .failure_stats(&rollout.agent_id, window_start, now)
        .await?;
    let qa_prior = qa
        .failure_stats(&rollout.agent_id, prior_start, window_start)
        .await?;
    let incident_count = incidents
        .high_severity_count(&rollout.agent_id, window_start)
        .await?;

    let reject_delta = reject_now.rate() - reject_prior.rate();
    let qa_delta = qa_now.rate() - qa_prior.rate();

    // Rollback triggers outrank the sample-size gate
    if incident_count > 0 && incident_count >= policy.incident_rollback_threshold {
        return Ok(Verdict::Rollback(format!(
            "{incident_count} high-severity incident(s) since rollout start"
        )));
    }
    if reject_delta > policy.reject_delta_rollback {
        return Ok(Verdict::Rollback(format!(
            "reject rate up {:.1}% vs prior window",
            reject_delta * 100.0
        )));
    }
    if qa_delta > policy.qa_delta_rollback {
        return Ok(Verdict::Rollback(format!(
            "qa failure rate up {:.1}% vs prior window",
            qa_delta * 100.0
        )));
    }

    let samples = rollout.metrics.total_samples();
    if samples < rollout.minimum_sample_size {
        return Ok(Verdict::Pending(format!(
            "{samples}/{} samples collected",
            rollout.minimum_sample_size
        )));
    }

    if reject_delta <= policy.reject_delta_promote
        && qa_delta <= policy.qa_delta_promote
        && incident_count == 0
    {
        return Ok(Verdict::Promote);
    }

    Ok(Verdict::Pending(
        "signal deltas between promote and rollback thresholds".to_string(),
    ))
}
