//! Soul versions and the ensure-active write path

use crate::error::{Error, Result};
use crate::store::SoulStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Review state of a soul version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    /// Not yet reviewed
    Unreviewed,
    /// Passed review
    Approved,
    /// Flagged during review or rollout
    Flagged,
}

/// An immutable soul version. Exactly one version per agent is active at
/// any time; the store enforces this with a uniqueness invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoulVersion {
    /// Version id
    pub id: Uuid,
    /// Owning agent
    pub agent_id: String,
    /// Prompt content
    pub content: String,
    /// SHA-256 hex digest of the content
    pub content_hash: String,
    /// Whether this version is the agent's active one
    pub is_active: bool,
    /// Review state
    pub quality_status: QualityStatus,
    /// Version this one was derived from
    pub parent_version_id: Option<Uuid>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl SoulVersion {
    /// Build a new active version derived from `parent`.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, content: impl Into<String>, parent: Option<Uuid>) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            content,
            content_hash,
            is_active: true,
            quality_status: QualityStatus::Unreviewed,
            parent_version_id: parent,
            created_at: Utc::now(),
        }
    }
}

/// SHA-256 hex digest of soul content.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Ensure the agent's active version carries exactly `content`.
///
/// Returns the existing active version unchanged when its hash already
/// matches. Otherwise inserts a new active version under the agent lock.
/// A [`Error::Conflict`] from the insert means a concurrent writer
/// activated a version first; the winner is re-read and returned, the
/// insert is never retried.
#[instrument(skip(store, content))]
pub async fn ensure_version(
    store: &dyn SoulStore,
    agent_id: &str,
    content: &str,
) -> Result<SoulVersion> {
    let hash = content_hash(content);
    if let Some(active) = store.active_version(agent_id).await? {
        if active.content_hash == hash {
            return Ok(active);
        }
    }

    let _guard = store.agent_lock(agent_id).await;

    // Re-check under the lock; another task may have written our content
    let current = store.active_version(agent_id).await?;
    if let Some(active) = &current {
        if active.content_hash == hash {
            return Ok(active.clone());
        }
    }

    let parent = current.as_ref().map(|v| v.id);
    let version = SoulVersion::new(agent_id, content, parent);
    match store
        .insert_active_version(version.clone(), parent)
        .await
    {
        Ok(()) => {
            debug!(agent_id, version_id = %version.id, "Activated new soul version");
            Ok(version)
        }
        Err(Error::Conflict(_)) => {
            // A concurrent writer won the activation race; their version
            // is the truth now.
            store
                .active_version(agent_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("no active version for agent {agent_id}")))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySoulStore;

    #[test]
    fn hash_is_stable_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello "));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let store = MemorySoulStore::new();
        let a = ensure_version(&store, "joi", "Be kind.").await.unwrap();
        let b = ensure_version(&store, "joi", "Be kind.").await.unwrap();
        assert_eq!(a.id, b.id);

        let active = store.active_version("joi").await.unwrap().unwrap();
        assert_eq!(active.id, a.id);
    }

    #[tokio::test]
    async fn changed_content_activates_new_version_with_lineage() {
        let store = MemorySoulStore::new();
        let first = ensure_version(&store, "joi", "v1").await.unwrap();
        let second = ensure_version(&store, "joi", "v2").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.parent_version_id, Some(first.id));

        let active = store.active_version("joi").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        // The first version is kept but no longer active
        let old = store.version(first.id).await.unwrap().unwrap();
        assert!(!old.is_active);
    }

    #[tokio::test]
    async fn conflict_resolves_by_reread() {
        let store = MemorySoulStore::new();
        let winner = ensure_version(&store, "joi", "winner").await.unwrap();

        // Simulate a stale writer racing with an outdated expectation
        let stale = SoulVersion::new("joi", "loser", None);
        let err = store.insert_active_version(stale, None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let active = store.active_version("joi").await.unwrap().unwrap();
        assert_eq!(active.id, winner.id);
    }
}
