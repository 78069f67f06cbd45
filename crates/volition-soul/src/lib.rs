//! Volition Soul - versioned agent prompts with canary rollouts
//!
//! An agent's "soul" is its system-prompt content. Souls are stored as
//! immutable versions with exactly one active version per agent, and new
//! candidate versions can be rolled out to a deterministic slice of
//! conversations before being promoted or rolled back on review/QA signals.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod evaluate;
pub mod rollout;
pub mod store;
pub mod version;

pub use error::{Error, Result};
pub use evaluate::{
    evaluate, IncidentSignal, NoopSignals, QaSignal, ReviewSignal, RolloutPolicy, SampleStats,
    Verdict,
};
pub use rollout::{
    bucket_for, ChosenSoul, RolloutEngine, RolloutMetrics, RolloutStatus, SoulRollout, Track,
};
pub use store::{MemorySoulStore, SoulStore};
pub use version::{content_hash, ensure_version, QualityStatus, SoulVersion};
