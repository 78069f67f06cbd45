//! Persistence contract for soul versions and rollouts
//!
//! The store enforces the invariants the rest of the crate leans on:
//! one active version per agent (uniqueness), agent-scoped exclusive
//! locks for activation and rollout writes. The in-memory implementation
//! mirrors those semantics for tests and single-process deployments.

use crate::error::{Error, Result};
use crate::rollout::{RolloutStatus, SoulRollout};
use crate::version::SoulVersion;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Storage for soul versions, rollouts, and the live prompt document.
#[async_trait::async_trait]
pub trait SoulStore: Send + Sync {
    /// The agent's active version, if any.
    async fn active_version(&self, agent_id: &str) -> Result<Option<SoulVersion>>;

    /// Look up a version by id.
    async fn version(&self, id: Uuid) -> Result<Option<SoulVersion>>;

    /// Insert `version` as the agent's active version, deactivating the
    /// previous one, but only if the currently active version id equals
    /// `expected_active`. A mismatch means a concurrent writer won and
    /// yields [`Error::Conflict`].
    async fn insert_active_version(
        &self,
        version: SoulVersion,
        expected_active: Option<Uuid>,
    ) -> Result<()>;

    /// Make an existing version the active one, deactivating the rest.
    async fn activate_version(&self, agent_id: &str, version_id: Uuid) -> Result<()>;

    /// The agent's `canary_active` rollout, if any.
    async fn active_rollout(&self, agent_id: &str) -> Result<Option<SoulRollout>>;

    /// Insert a new rollout.
    async fn insert_rollout(&self, rollout: SoulRollout) -> Result<()>;

    /// Overwrite an existing rollout record.
    async fn update_rollout(&self, rollout: SoulRollout) -> Result<()>;

    /// Mark every `canary_active` rollout for the agent cancelled.
    /// Returns how many were cancelled.
    async fn cancel_active_rollouts(&self, agent_id: &str, reason: &str) -> Result<u32>;

    /// The agent's live prompt document (what `choose` falls back to).
    async fn live_prompt(&self, agent_id: &str) -> Result<Option<String>>;

    /// Overwrite the agent's live prompt document.
    async fn sync_live_prompt(&self, agent_id: &str, content: &str) -> Result<()>;

    /// Acquire the agent-scoped exclusive lock serializing version and
    /// rollout mutation for one agent.
    async fn agent_lock(&self, agent_id: &str) -> OwnedMutexGuard<()>;
}

/// In-memory store enforcing the same invariants a database would.
#[derive(Default)]
pub struct MemorySoulStore {
    versions: DashMap<Uuid, SoulVersion>,
    rollouts: DashMap<Uuid, SoulRollout>,
    live_prompts: DashMap<String, String>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemorySoulStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current_active_id(&self, agent_id: &str) -> Option<Uuid> {
        self.versions
            .iter()
            .find(|entry| entry.agent_id == agent_id && entry.is_active)
            .map(|entry| entry.id)
    }
}

#[async_trait::async_trait]
impl SoulStore for MemorySoulStore {
    async fn active_version(&self, agent_id: &str) -> Result<Option<SoulVersion>> {
        Ok(self
            .versions
            .iter()
            .find(|entry| entry.agent_id == agent_id && entry.is_active)
            .map(|entry| entry.clone()))
    }

    async fn version(&self, id: Uuid) -> Result<Option<SoulVersion>> {
        Ok(self.versions.get(&id).map(|entry| entry.clone()))
    }

    async fn insert_active_version(
        &self,
        version: SoulVersion,
        expected_active: Option<Uuid>,
    ) -> Result<()> {
        let agent_id = version.agent_id.clone();
        let current = self.current_active_id(&agent_id);
        if current != expected_active {
            return Err(Error::Conflict(format!(
                "active version for agent {agent_id} changed concurrently"
            )));
        }
        if let Some(previous) = current {
            if let Some(mut entry) = self.versions.get_mut(&previous) {
                entry.is_active = false;
            }
        }
        self.versions.insert(version.id, version);
        Ok(())
    }

    async fn activate_version(&self, agent_id: &str, version_id: Uuid) -> Result<()> {
        if !self
            .versions
            .get(&version_id)
            .is_some_and(|v| v.agent_id == agent_id)
        {
            return Err(Error::NotFound(format!(
                "version {version_id} for agent {agent_id}"
            )));
        }
        for mut entry in self.versions.iter_mut() {
            if entry.agent_id == agent_id {
                entry.is_active = entry.id == version_id;
            }
        }
        Ok(())
    }

    async fn active_rollout(&self, agent_id: &str) -> Result<Option<SoulRollout>> {
        Ok(self
            .rollouts
            .iter()
            .find(|entry| entry.agent_id == agent_id && entry.status == RolloutStatus::CanaryActive)
            .map(|entry| entry.clone()))
    }

    async fn insert_rollout(&self, rollout: SoulRollout) -> Result<()> {
        self.rollouts.insert(rollout.id, rollout);
        Ok(())
    }

    async fn update_rollout(&self, rollout: SoulRollout) -> Result<()> {
        if !self.rollouts.contains_key(&rollout.id) {
            return Err(Error::NotFound(format!("rollout {}", rollout.id)));
        }
        self.rollouts.insert(rollout.id, rollout);
        Ok(())
    }

    async fn cancel_active_rollouts(&self, agent_id: &str, reason: &str) -> Result<u32> {
        let mut cancelled = 0;
        for mut entry in self.rollouts.iter_mut() {
            if entry.agent_id == agent_id && entry.status == RolloutStatus::CanaryActive {
                entry.status = RolloutStatus::Cancelled;
                entry.ended_at = Some(Utc::now());
                entry.end_reason = Some(reason.to_string());
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn live_prompt(&self, agent_id: &str) -> Result<Option<String>> {
        Ok(self.live_prompts.get(agent_id).map(|entry| entry.clone()))
    }

    async fn sync_live_prompt(&self, agent_id: &str, content: &str) -> Result<()> {
        self.live_prompts
            .insert(agent_id.to_string(), content.to_string());
        Ok(())
    }

    async fn agent_lock(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::SoulVersion;

    #[tokio::test]
    async fn insert_enforces_expected_active() {
        let store = MemorySoulStore::new();
        let first = SoulVersion::new("joi", "v1", None);
        let first_id = first.id;
        store.insert_active_version(first, None).await.unwrap();

        // A second writer with a stale expectation loses
        let stale = SoulVersion::new("joi", "v2", None);
        assert!(matches!(
            store.insert_active_version(stale, None).await,
            Err(Error::Conflict(_))
        ));

        // The right expectation wins and deactivates the predecessor
        let next = SoulVersion::new("joi", "v2", Some(first_id));
        let next_id = next.id;
        store
            .insert_active_version(next, Some(first_id))
            .await
            .unwrap();
        let active = store.active_version("joi").await.unwrap().unwrap();
        assert_eq!(active.id, next_id);
        assert!(!store.version(first_id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn activate_flips_exactly_one_version() {
        let store = MemorySoulStore::new();
        let a = SoulVersion::new("joi", "a", None);
        let a_id = a.id;
        store.insert_active_version(a, None).await.unwrap();
        let b = SoulVersion::new("joi", "b", Some(a_id));
        let b_id = b.id;
        store.insert_active_version(b, Some(a_id)).await.unwrap();

        store.activate_version("joi", a_id).await.unwrap();
        assert!(store.version(a_id).await.unwrap().unwrap().is_active);
        assert!(!store.version(b_id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn agent_locks_are_per_agent() {
        let store = MemorySoulStore::new();
        let guard = store.agent_lock("joi").await;
        // A different agent's lock is acquirable while joi's is held
        let other = store.agent_lock("kay").await;
        drop(other);
        drop(guard);
        // And joi's is acquirable again after release
        let _again = store.agent_lock("joi").await;
    }
}
