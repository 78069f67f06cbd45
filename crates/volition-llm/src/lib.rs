//! Volition LLM - backend adapters and model routing
//!
//! This crate normalizes three structurally different model-serving protocols
//! into one canonical streaming result:
//! - Native: structured content blocks with prompt caching support
//! - Compat: OpenAI-compatible chat completions (proxy gateways)
//! - Local: line-delimited streaming against a local open-weight server
//!
//! It also hosts the route resolver (task -> backend/model with fallbacks)
//! and per-model usage/cost accounting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod compat;
pub mod cost;
pub mod error;
pub mod local;
pub mod message;
pub mod mock;
pub mod native;
pub mod result;
pub mod routes;
pub mod tools;
pub mod util;

pub use backend::{Backend, BackendKind, NullSink, StreamRequest, SystemPrompt, TextSink};
pub use compat::{CompatBackend, CompatConfig};
pub use cost::{ModelPricing, UsageTotals};
pub use error::{Error, Result};
pub use local::{normalize_model_alias, LocalBackend, LocalConfig};
pub use message::{ImageContent, Message, Role, ToolResultBlock};
pub use mock::MockBackend;
pub use native::{NativeBackend, NativeConfig};
pub use result::{CanonicalResult, StopSignal, Usage};
pub use routes::{
    Credentials, PrefixSubstitutionPolicy, Route, RouteCache, RouteResolver, RouteSource,
    StaticRouteSource, TaskKind, ToolRoutePolicy,
};
pub use tools::{ToolCall, ToolDefinition};
