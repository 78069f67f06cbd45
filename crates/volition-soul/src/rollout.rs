//! Canary rollouts - routing a slice of conversations to a candidate soul
//!
//! A rollout pits a candidate version against a baseline for one agent.
//! Conversations are assigned to tracks by a deterministic hash bucket so
//! the same conversation always sees the same prompt for the life of the
//! rollout. Rollouts end in exactly one terminal state.

use crate::error::{Error, Result};
use crate::evaluate::{
    evaluate, IncidentSignal, NoopSignals, QaSignal, ReviewSignal, RolloutPolicy, Verdict,
};
use crate::store::SoulStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle state of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Running; `choose` splits traffic between candidate and baseline
    CanaryActive,
    /// Candidate won and is now the active version
    Promoted,
    /// Candidate lost; baseline was restored
    RolledBack,
    /// Superseded or manually stopped
    Cancelled,
}

impl RolloutStatus {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::CanaryActive)
    }
}

/// Sample counters accumulated while a rollout runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RolloutMetrics {
    /// Conversations routed to the candidate track
    pub candidate_samples: u32,
    /// Conversations routed to the baseline track
    pub baseline_samples: u32,
}

impl RolloutMetrics {
    /// Total sampled conversations across both tracks.
    #[must_use]
    pub fn total_samples(&self) -> u32 {
        self.candidate_samples + self.baseline_samples
    }
}

/// One canary rollout for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoulRollout {
    /// Rollout id
    pub id: Uuid,
    /// Owning agent
    pub agent_id: String,
    /// Version under trial
    pub candidate_version_id: Uuid,
    /// Version the candidate is measured against
    pub baseline_version_id: Option<Uuid>,
    /// Lifecycle state
    pub status: RolloutStatus,
    /// Percent of conversations routed to the candidate (0-100)
    pub traffic_percent: u8,
    /// Samples required before a promote decision
    pub minimum_sample_size: u32,
    /// Accumulated counters
    pub metrics: RolloutMetrics,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, once terminal
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the rollout ended
    pub end_reason: Option<String>,
}

/// Which prompt track a conversation was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// No rollout running; the live prompt applies
    Default,
    /// Candidate version under trial
    Candidate,
    /// Baseline version
    Baseline,
}

/// Result of routing one conversation through a rollout.
#[derive(Debug, Clone)]
pub struct ChosenSoul {
    /// Track the conversation landed on
    pub track: Track,
    /// Prompt content to use
    pub content: String,
    /// Version the content came from, when it came from the store
    pub version_id: Option<Uuid>,
}

/// Deterministic traffic bucket for a conversation, 0-99.
///
/// The same `(agent, conversation)` pair always lands in the same bucket,
/// so a conversation never flips tracks mid-rollout.
#[must_use]
pub fn bucket_for(agent_id: &str, conversation_id: Uuid) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update(b":");
    hasher.update(conversation_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Drives canary rollouts: starting them, routing conversations, and
/// applying evaluation verdicts.
pub struct RolloutEngine {
    store: Arc<dyn SoulStore>,
    review: Arc<dyn ReviewSignal>,
    qa: Arc<dyn QaSignal>,
    incidents: Arc<dyn IncidentSignal>,
    policy: RolloutPolicy,
}

impl RolloutEngine {
    /// Create an engine with no external signals; evaluation will only
    /// ever reach promote/pending once signals are attached.
    pub fn new(store: Arc<dyn SoulStore>) -> Self {
        let noop = Arc::new(NoopSignals);
        Self {
            store,
            review: noop.clone(),
            qa: noop.clone(),
            incidents: noop,
            policy: RolloutPolicy::default(),
        }
    }

    /// Attach a review-signal collaborator.
    #[must_use]
    pub fn with_review(mut self, review: Arc<dyn ReviewSignal>) -> Self {
        self.review = review;
        self
    }

    /// Attach a QA-signal collaborator.
    #[must_use]
    pub fn with_qa(mut self, qa: Arc<dyn QaSignal>) -> Self {
        self.qa = qa;
        self
    }

    /// Attach an incident-signal collaborator.
    #[must_use]
    pub fn with_incidents(mut self, incidents: Arc<dyn IncidentSignal>) -> Self {
        self.incidents = incidents;
        self
    }

    /// Replace the evaluation policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RolloutPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start a rollout, cancelling any rollout already running for the
    /// agent. At most one `canary_active` rollout exists per agent.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        agent_id: &str,
        candidate_version_id: Uuid,
        baseline_version_id: Option<Uuid>,
        traffic_percent: u8,
        minimum_sample_size: u32,
    ) -> Result<SoulRollout> {
        if traffic_percent > 100 {
            return Err(Error::InvalidRollout(format!(
                "traffic_percent {traffic_percent} exceeds 100"
            )));
        }
        if baseline_version_id == Some(candidate_version_id) {
            return Err(Error::InvalidRollout(
                "candidate and baseline must differ".to_string(),
            ));
        }

        let _guard = self.store.agent_lock(agent_id).await;

        let cancelled = self
            .store
            .cancel_active_rollouts(agent_id, "superseded by a new rollout")
            .await?;
        if cancelled > 0 {
            info!(agent_id, cancelled, "Cancelled prior rollouts before start");
        }

        let rollout = SoulRollout {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            candidate_version_id,
            baseline_version_id,
            status: RolloutStatus::CanaryActive,
            traffic_percent,
            minimum_sample_size,
            metrics: RolloutMetrics::default(),
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        };
        self.store.insert_rollout(rollout.clone()).await?;
        info!(agent_id, rollout_id = %rollout.id, traffic_percent, "Started canary rollout");
        Ok(rollout)
    }

    /// Route a conversation to a prompt track. Never fails: any store
    /// trouble degrades to the caller's fallback content.
    pub async fn choose(
        &self,
        agent_id: &str,
        conversation_id: Uuid,
        fallback_content: &str,
    ) -> ChosenSoul {
        let default = ChosenSoul {
            track: Track::Default,
            content: fallback_content.to_string(),
            version_id: None,
        };

        let rollout = match self.store.active_rollout(agent_id).await {
            Ok(Some(r)) => r,
            Ok(None) => return default,
            Err(e) => {
                warn!(agent_id, error = %e, "Rollout lookup failed, using fallback prompt");
                return default;
            }
        };

        let bucket = bucket_for(agent_id, conversation_id);
        let mut updated = rollout.clone();
        let chosen = if bucket < rollout.traffic_percent {
            updated.metrics.candidate_samples += 1;
            match self.store.version(rollout.candidate_version_id).await {
                Ok(Some(version)) => ChosenSoul {
                    track: Track::Candidate,
                    content: version.content,
                    version_id: Some(version.id),
                },
                Ok(None) | Err(_) => {
                    warn!(
                        agent_id,
                        version_id = %rollout.candidate_version_id,
                        "Candidate version unavailable, using fallback prompt"
                    );
                    return default;
                }
            }
        } else {
            updated.metrics.baseline_samples += 1;
            match rollout.baseline_version_id {
                Some(id) => match self.store.version(id).await {
                    Ok(Some(version)) => ChosenSoul {
                        track: Track::Baseline,
                        content: version.content,
                        version_id: Some(version.id),
                    },
                    Ok(None) | Err(_) => ChosenSoul {
                        track: Track::Baseline,
                        content: fallback_content.to_string(),
                        version_id: None,
                    },
                },
                None => ChosenSoul {
                    track: Track::Baseline,
                    content: fallback_content.to_string(),
                    version_id: None,
                },
            }
        };

        // Sample counters are best-effort bookkeeping
        if let Err(e) = self.store.update_rollout(updated).await {
            debug!(agent_id, error = %e, "Failed to record rollout sample");
        }

        chosen
    }

    /// Cancel the agent's active rollout, if any.
    pub async fn cancel(&self, agent_id: &str, reason: &str) -> Result<u32> {
        let _guard = self.store.agent_lock(agent_id).await;
        self.store.cancel_active_rollouts(agent_id, reason).await
    }

    /// Evaluate the agent's active rollout and apply the verdict.
    /// Returns the verdict, or `None` when no rollout is running.
    #[instrument(skip(self))]
    pub async fn evaluate_and_apply(&self, agent_id: &str) -> Result<Option<Verdict>> {
        let Some(rollout) = self.store.active_rollout(agent_id).await? else {
            return Ok(None);
        };

        let verdict = evaluate(
            &rollout,
            self.review.as_ref(),
            self.qa.as_ref(),
            self.incidents.as_ref(),
            &self.policy,
        )
        .await?;

        match &verdict {
            Verdict::Promote => self.promote(&rollout).await?,
            Verdict::Rollback(reason) => self.rollback(&rollout, reason.clone()).await?,
            Verdict::Pending(reason) => {
                debug!(agent_id, rollout_id = %rollout.id, reason, "Rollout still pending");
            }
        }
        Ok(Some(verdict))
    }

    /// Promote the candidate: activate it, end the rollout, and sync the
    /// live prompt so in-flight fallbacks reflect the winner immediately.
    pub async fn promote(&self, rollout: &SoulRollout) -> Result<()> {
        self.finish(
            rollout,
            rollout.candidate_version_id,
            RolloutStatus::Promoted,
            "evaluation thresholds met".to_string(),
        )
        .await
    }

    /// Roll back to the baseline version.
    pub async fn rollback(&self, rollout: &SoulRollout, reason: String) -> Result<()> {
        let winner = match rollout.baseline_version_id {
            Some(id) => id,
            None => {
                // No recorded baseline; keep whatever is active now
                let active = self
                    .store
                    .active_version(&rollout.agent_id)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("no active version for agent {}", rollout.agent_id))
                    })?;
                active.id
            }
        };
        self.finish(rollout, winner, RolloutStatus::RolledBack, reason)
            .await
    }

    async fn finish(
        &self,
        rollout: &SoulRollout,
        winner_version_id: Uuid,
        status: RolloutStatus,
        reason: String,
    ) -> Result<()> {
        let _guard = self.store.agent_lock(&rollout.agent_id).await;

        let winner = self
            .store
            .version(winner_version_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("version {winner_version_id}")))?;

        self.store
            .activate_version(&rollout.agent_id, winner_version_id)
            .await?;

        let mut ended = rollout.clone();
        ended.status = status;
        ended.ended_at = Some(Utc::now());
        ended.end_reason = Some(reason.clone());
        self.store.update_rollout(ended).await?;

        self.store
            .sync_live_prompt(&rollout.agent_id, &winner.content)
            .await?;

        info!(
            agent_id = %rollout.agent_id,
            rollout_id = %rollout.id,
            status = ?status,
            reason,
            "Rollout finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySoulStore;
    use crate::version::ensure_version;

    async fn engine_with_versions() -> (RolloutEngine, Arc<MemorySoulStore>, Uuid, Uuid) {
        let store = Arc::new(MemorySoulStore::new());
        let baseline = ensure_version(store.as_ref(), "joi", "baseline soul")
            .await
            .unwrap();
        let candidate = ensure_version(store.as_ref(), "joi", "candidate soul")
            .await
            .unwrap();
        // ensure_version leaves the candidate active; restore the baseline
        // as the live one the way a draft workflow would
        store.activate_version("joi", baseline.id).await.unwrap();
        let engine = RolloutEngine::new(store.clone());
        (engine, store, candidate.id, baseline.id)
    }

    #[test]
    fn buckets_are_deterministic_and_spread() {
        let conversation = Uuid::new_v4();
        let a = bucket_for("joi", conversation);
        let b = bucket_for("joi", conversation);
        assert_eq!(a, b);
        assert!(a < 100);
        // A different agent or conversation should usually land elsewhere;
        // verify it at least depends on both inputs over a sample
        let mut distinct = std::collections::HashSet::new();
        for _ in 0..64 {
            distinct.insert(bucket_for("joi", Uuid::new_v4()));
        }
        assert!(distinct.len() > 10);
    }

    #[tokio::test]
    async fn no_rollout_returns_default_track() {
        let store = Arc::new(MemorySoulStore::new());
        let engine = RolloutEngine::new(store);
        let chosen = engine.choose("joi", Uuid::new_v4(), "fallback").await;
        assert_eq!(chosen.track, Track::Default);
        assert_eq!(chosen.content, "fallback");
        assert!(chosen.version_id.is_none());
    }

    #[tokio::test]
    async fn full_traffic_always_selects_candidate() {
        let (engine, _store, candidate, baseline) = engine_with_versions().await;
        engine
            .start("joi", candidate, Some(baseline), 100, 10)
            .await
            .unwrap();
        for _ in 0..32 {
            let chosen = engine.choose("joi", Uuid::new_v4(), "fallback").await;
            assert_eq!(chosen.track, Track::Candidate);
            assert_eq!(chosen.content, "candidate soul");
        }
    }

    #[tokio::test]
    async fn zero_traffic_always_selects_baseline() {
        let (engine, _store, candidate, baseline) = engine_with_versions().await;
        engine
            .start("joi", candidate, Some(baseline), 0, 10)
            .await
            .unwrap();
        let chosen = engine.choose("joi", Uuid::new_v4(), "fallback").await;
        assert_eq!(chosen.track, Track::Baseline);
        assert_eq!(chosen.content, "baseline soul");
    }

    #[tokio::test]
    async fn missing_baseline_keeps_track_but_uses_fallback() {
        let (engine, _store, candidate, _baseline) = engine_with_versions().await;
        engine.start("joi", candidate, None, 0, 10).await.unwrap();
        let chosen = engine.choose("joi", Uuid::new_v4(), "fallback").await;
        assert_eq!(chosen.track, Track::Baseline);
        assert_eq!(chosen.content, "fallback");
    }

    #[tokio::test]
    async fn starting_again_cancels_prior_rollout() {
        let (engine, store, candidate, baseline) = engine_with_versions().await;
        let first = engine
            .start("joi", candidate, Some(baseline), 50, 10)
            .await
            .unwrap();
        let second = engine
            .start("joi", candidate, Some(baseline), 25, 10)
            .await
            .unwrap();

        let active = store.active_rollout("joi").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn candidate_must_differ_from_baseline() {
        let (engine, _store, candidate, _baseline) = engine_with_versions().await;
        let err = engine
            .start("joi", candidate, Some(candidate), 50, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRollout(_)));
    }

    #[tokio::test]
    async fn promote_activates_candidate_and_syncs_live_prompt() {
        let (engine, store, candidate, baseline) = engine_with_versions().await;
        let rollout = engine
            .start("joi", candidate, Some(baseline), 50, 10)
            .await
            .unwrap();

        engine.promote(&rollout).await.unwrap();

        let active = store.active_version("joi").await.unwrap().unwrap();
        assert_eq!(active.id, candidate);
        assert_eq!(
            store.live_prompt("joi").await.unwrap().as_deref(),
            Some("candidate soul")
        );
        assert!(store.active_rollout("joi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_restores_baseline() {
        let (engine, store, candidate, baseline) = engine_with_versions().await;
        store.activate_version("joi", candidate).await.unwrap();
        let rollout = engine
            .start("joi", candidate, Some(baseline), 50, 10)
            .await
            .unwrap();

        engine
            .rollback(&rollout, "reject rate spiked".to_string())
            .await
            .unwrap();

        let active = store.active_version("joi").await.unwrap().unwrap();
        assert_eq!(active.id, baseline);
        assert_eq!(
            store.live_prompt("joi").await.unwrap().as_deref(),
            Some("baseline soul")
        );
    }

    #[tokio::test]
    async fn same_conversation_keeps_its_track() {
        let (engine, _store, candidate, baseline) = engine_with_versions().await;
        engine
            .start("joi", candidate, Some(baseline), 50, 10)
            .await
            .unwrap();
        let conversation = Uuid::new_v4();
        let first = engine.choose("joi", conversation, "fallback").await;
        for _ in 0..8 {
            let again = engine.choose("joi", conversation, "fallback").await;
            assert_eq!(again.track, first.track);
        }
    }
}
