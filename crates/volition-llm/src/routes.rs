//! Route resolution - mapping logical tasks to `(backend, model)` pairs
//!
//! Routes come from a configuration source, cached with a short TTL.
//! A configured route is authoritative; caller overrides and hardcoded
//! defaults fill in behind it. Credential gaps trigger a translated
//! fallback to the other remote backend.

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::local::normalize_model_alias;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// How long a loaded route table stays fresh.
pub const ROUTE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default chat-quality model on the native backend.
const DEFAULT_CHAT_MODEL: &str = "claude-sonnet-4-20250514";
/// Default fast model for tool calling and utility tasks.
const DEFAULT_FAST_MODEL: &str = "claude-3-5-haiku-20241022";
/// Default model when only a local runtime is available.
const DEFAULT_LOCAL_MODEL: &str = "qwen3:8b";

/// Native model id ↔ proxy slug pairs used when credentials force a hop
/// to the other backend.
const MODEL_TRANSLATIONS: &[(&str, &str)] = &[
    ("claude-opus-4-20250514", "anthropic/claude-opus-4"),
    ("claude-sonnet-4-20250514", "anthropic/claude-sonnet-4"),
    ("claude-3-7-sonnet-20250219", "anthropic/claude-3.7-sonnet"),
    ("claude-3-5-haiku-20241022", "anthropic/claude-3.5-haiku"),
];

fn native_to_proxy(model: &str) -> String {
    MODEL_TRANSLATIONS
        .iter()
        .find(|(native, _)| *native == model)
        .map_or_else(|| format!("anthropic/{model}"), |(_, proxy)| (*proxy).to_string())
}

fn proxy_to_native(model: &str) -> String {
    MODEL_TRANSLATIONS
        .iter()
        .find(|(_, proxy)| *proxy == model)
        .map_or_else(
            || model.rsplit('/').next().unwrap_or(model).to_string(),
            |(native, _)| (*native).to_string(),
        )
}

// ============================================================================
// Types
// ============================================================================

/// Logical purpose of a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Conversational answers
    Chat,
    /// Structured tool calling
    Tool,
    /// Cheap internal helpers (titles, rewrites)
    Utility,
    /// Classification decisions
    Classifier,
    /// Compaction of long content
    Summarizer,
}

impl TaskKind {
    /// Stable string form used in configuration tables.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Tool => "tool",
            Self::Utility => "utility",
            Self::Classifier => "classifier",
            Self::Summarizer => "summarizer",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved `(backend, model)` pair for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Task this route serves
    pub task: TaskKind,
    /// Backend to call
    pub backend: BackendKind,
    /// Model identifier in that backend's namespace
    pub model: String,
}

impl Route {
    /// Build a route.
    #[must_use]
    pub fn new(task: TaskKind, backend: BackendKind, model: impl Into<String>) -> Self {
        Self {
            task,
            backend,
            model: model.into(),
        }
    }
}

/// Which remote credentials are present.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    /// Native backend key available
    pub native: bool,
    /// Proxy backend key available
    pub proxy: bool,
}

impl Credentials {
    /// Read credential presence from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            native: std::env::var("ANTHROPIC_API_KEY").is_ok_and(|v| !v.is_empty()),
            proxy: std::env::var("OPENROUTER_API_KEY").is_ok_and(|v| !v.is_empty()),
        }
    }
}

/// Source of configured routes.
#[async_trait::async_trait]
pub trait RouteSource: Send + Sync {
    /// Load the current route table.
    async fn load(&self) -> Result<Vec<Route>>;
}

/// Fixed in-memory route table.
pub struct StaticRouteSource {
    routes: Vec<Route>,
}

impl StaticRouteSource {
    /// Build a source from a fixed list.
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// A source with no configured routes.
    #[must_use]
    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }
}

#[async_trait::async_trait]
impl RouteSource for StaticRouteSource {
    async fn load(&self) -> Result<Vec<Route>> {
        Ok(self.routes.clone())
    }
}

/// TTL-bounded cache over a route source. Replaced wholesale on refresh,
/// never mutated in place.
pub struct RouteCache {
    inner: RwLock<Option<(Instant, Vec<Route>)>>,
    ttl: Duration,
}

impl RouteCache {
    /// Create a cache with the standard TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(ROUTE_CACHE_TTL)
    }

    /// Create a cache with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(None),
            ttl,
        }
    }

    /// Get the cached table, refreshing from the source if stale.
    pub async fn get(&self, source: &dyn RouteSource) -> Result<Vec<Route>> {
        {
            let guard = self.inner.read().await;
            if let Some((loaded_at, routes)) = guard.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(routes.clone());
                }
            }
        }
        let routes = source.load().await?;
        *self.inner.write().await = Some((Instant::now(), routes.clone()));
        debug!(count = routes.len(), "Refreshed route table");
        Ok(routes)
    }

    /// Drop the cached table so the next lookup re-reads the source.
    pub async fn invalidate(&self) {
        *self.inner.write().await = None;
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tool-route substitution policy
// ============================================================================

/// Policy for swapping out models unsuited to structured tool calling.
pub trait ToolRoutePolicy: Send + Sync {
    /// Return a replacement model, or `None` to keep the selection.
    fn substitute(&self, model: &str) -> Option<String>;
}

/// Prefix-matched substitution against a known-good replacement.
pub struct PrefixSubstitutionPolicy {
    prefixes: Vec<String>,
    replacement: String,
}

impl PrefixSubstitutionPolicy {
    /// Build a policy from prefixes and a replacement model.
    #[must_use]
    pub fn new(prefixes: Vec<String>, replacement: impl Into<String>) -> Self {
        Self {
            prefixes,
            replacement: replacement.into(),
        }
    }
}

impl Default for PrefixSubstitutionPolicy {
    fn default() -> Self {
        // Families observed mangling tool-call arguments into prose
        Self::new(
            vec![
                "deepseek".to_string(),
                "gemma".to_string(),
                "mistralai/mistral-7b".to_string(),
            ],
            DEFAULT_FAST_MODEL,
        )
    }
}

impl ToolRoutePolicy for PrefixSubstitutionPolicy {
    fn substitute(&self, model: &str) -> Option<String> {
        self.prefixes
            .iter()
            .any(|p| model.starts_with(p.as_str()))
            .then(|| self.replacement.clone())
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves a task to a concrete route.
pub struct RouteResolver {
    source: Arc<dyn RouteSource>,
    cache: RouteCache,
    credentials: Credentials,
    tool_policy: Arc<dyn ToolRoutePolicy>,
}

impl RouteResolver {
    /// Create a resolver over a route source.
    pub fn new(source: Arc<dyn RouteSource>, credentials: Credentials) -> Self {
        Self {
            source,
            cache: RouteCache::new(),
            credentials,
            tool_policy: Arc::new(PrefixSubstitutionPolicy::default()),
        }
    }

    /// Replace the tool-route substitution policy.
    #[must_use]
    pub fn with_tool_policy(mut self, policy: Arc<dyn ToolRoutePolicy>) -> Self {
        self.tool_policy = policy;
        self
    }

    /// Use a custom cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = RouteCache::with_ttl(ttl);
        self
    }

    /// Invalidate the cached route table after credential or config changes.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }

    /// Resolve a task to a route.
    ///
    /// A configured route wins over `override_model`; the override only
    /// applies when no route is configured for the task.
    #[instrument(skip(self))]
    pub async fn resolve(&self, task: TaskKind, override_model: Option<&str>) -> Result<Route> {
        let routes = self.cache.get(self.source.as_ref()).await?;

        let mut route = if let Some(configured) = routes.iter().find(|r| r.task == task) {
            self.apply_credential_fallback(configured.clone())?
        } else if let Some(model) = override_model {
            self.route_from_shape(task, model)?
        } else {
            self.default_route(task)?
        };

        if route.backend == BackendKind::Local {
            route.model = normalize_model_alias(&route.model).to_string();
        }

        if task == TaskKind::Tool {
            if let Some(replacement) = self.tool_policy.substitute(&route.model) {
                // Policies answer in the native namespace; fit the
                // replacement to the backend the route stays on
                let replacement = match route.backend {
                    BackendKind::Native => replacement,
                    BackendKind::Compat if replacement.contains('/') => replacement,
                    BackendKind::Compat => native_to_proxy(&replacement),
                    BackendKind::Local => DEFAULT_LOCAL_MODEL.to_string(),
                };
                warn!(
                    from = %route.model,
                    to = %replacement,
                    "Substituting model unreliable at structured tool calls"
                );
                route.model = replacement;
            }
        }

        Ok(route)
    }

    /// Keep a configured route unless its backend has no credentials and the
    /// other remote backend does, in which case hop with model translation.
    fn apply_credential_fallback(&self, route: Route) -> Result<Route> {
        match route.backend {
            BackendKind::Native if !self.credentials.native && self.credentials.proxy => {
                let translated = native_to_proxy(&route.model);
                warn!(
                    task = %route.task,
                    from = %route.model,
                    to = %translated,
                    "Native credentials missing, falling back to proxy backend"
                );
                Ok(Route::new(route.task, BackendKind::Compat, translated))
            }
            BackendKind::Compat if !self.credentials.proxy && self.credentials.native => {
                let translated = proxy_to_native(&route.model);
                warn!(
                    task = %route.task,
                    from = %route.model,
                    to = %translated,
                    "Proxy credentials missing, falling back to native backend"
                );
                Ok(Route::new(route.task, BackendKind::Native, translated))
            }
            BackendKind::Native if !self.credentials.native => Err(Error::NoRoute(format!(
                "route for task '{}' needs native credentials and no fallback exists",
                route.task
            ))),
            BackendKind::Compat if !self.credentials.proxy => Err(Error::NoRoute(format!(
                "route for task '{}' needs proxy credentials and no fallback exists",
                route.task
            ))),
            _ => Ok(route),
        }
    }

    /// A caller-supplied model determines the backend by its shape:
    /// slash-prefixed names belong to the proxy namespace, bare names prefer
    /// the native backend, falling through proxy to the local runtime.
    fn route_from_shape(&self, task: TaskKind, model: &str) -> Result<Route> {
        if model.contains('/') {
            if !self.credentials.proxy {
                return Err(Error::NoRoute(format!(
                    "model '{model}' requires proxy credentials"
                )));
            }
            return Ok(Route::new(task, BackendKind::Compat, model));
        }
        if self.credentials.native {
            Ok(Route::new(task, BackendKind::Native, model))
        } else if self.credentials.proxy {
            Ok(Route::new(task, BackendKind::Compat, native_to_proxy(model)))
        } else {
            Ok(Route::new(task, BackendKind::Local, model))
        }
    }

    /// Last-resort defaults per task, bent to whatever credentials exist.
    fn default_route(&self, task: TaskKind) -> Result<Route> {
        let model = match task {
            TaskKind::Chat => DEFAULT_CHAT_MODEL,
            TaskKind::Tool | TaskKind::Utility | TaskKind::Classifier | TaskKind::Summarizer => {
                DEFAULT_FAST_MODEL
            }
        };
        if self.credentials.native {
            Ok(Route::new(task, BackendKind::Native, model))
        } else if self.credentials.proxy {
            Ok(Route::new(task, BackendKind::Compat, native_to_proxy(model)))
        } else {
            Ok(Route::new(task, BackendKind::Local, DEFAULT_LOCAL_MODEL))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(routes: Vec<Route>, credentials: Credentials) -> RouteResolver {
        RouteResolver::new(Arc::new(StaticRouteSource::new(routes)), credentials)
    }

    #[tokio::test]
    async fn configured_route_beats_override() {
        let resolver = resolver_with(
            vec![Route::new(TaskKind::Chat, BackendKind::Native, "claude-sonnet-4-20250514")],
            Credentials {
                native: true,
                proxy: true,
            },
        );
        let route = resolver
            .resolve(TaskKind::Chat, Some("anthropic/claude-opus-4"))
            .await
            .unwrap();
        assert_eq!(route.backend, BackendKind::Native);
        assert_eq!(route.model, "claude-sonnet-4-20250514");
    }

    #[tokio::test]
    async fn credential_gap_hops_with_translation() {
        let resolver = resolver_with(
            vec![Route::new(TaskKind::Chat, BackendKind::Native, "claude-sonnet-4-20250514")],
            Credentials {
                native: false,
                proxy: true,
            },
        );
        let route = resolver.resolve(TaskKind::Chat, None).await.unwrap();
        assert_eq!(route.backend, BackendKind::Compat);
        assert_eq!(route.model, "anthropic/claude-sonnet-4");
    }

    #[tokio::test]
    async fn proxy_route_translates_back_to_native() {
        let resolver = resolver_with(
            vec![Route::new(
                TaskKind::Chat,
                BackendKind::Compat,
                "anthropic/claude-3.5-haiku",
            )],
            Credentials {
                native: true,
                proxy: false,
            },
        );
        let route = resolver.resolve(TaskKind::Chat, None).await.unwrap();
        assert_eq!(route.backend, BackendKind::Native);
        assert_eq!(route.model, "claude-3-5-haiku-20241022");
    }

    #[tokio::test]
    async fn override_shape_selects_backend() {
        let resolver = resolver_with(
            Vec::new(),
            Credentials {
                native: true,
                proxy: true,
            },
        );
        let proxy = resolver
            .resolve(TaskKind::Chat, Some("meta-llama/llama-3.1-70b"))
            .await
            .unwrap();
        assert_eq!(proxy.backend, BackendKind::Compat);

        let native = resolver
            .resolve(TaskKind::Chat, Some("claude-sonnet-4-20250514"))
            .await
            .unwrap();
        assert_eq!(native.backend, BackendKind::Native);
    }

    #[tokio::test]
    async fn bare_override_without_remote_credentials_goes_local() {
        let resolver = resolver_with(Vec::new(), Credentials::default());
        let route = resolver
            .resolve(TaskKind::Chat, Some("qwen3:cloud"))
            .await
            .unwrap();
        assert_eq!(route.backend, BackendKind::Local);
        assert_eq!(route.model, "qwen3");
    }

    #[tokio::test]
    async fn defaults_fill_in_last() {
        let resolver = resolver_with(
            Vec::new(),
            Credentials {
                native: true,
                proxy: false,
            },
        );
        let route = resolver.resolve(TaskKind::Utility, None).await.unwrap();
        assert_eq!(route.backend, BackendKind::Native);
        assert_eq!(route.model, "claude-3-5-haiku-20241022");
    }

    #[tokio::test]
    async fn tool_task_substitutes_unreliable_models() {
        let resolver = resolver_with(
            vec![Route::new(
                TaskKind::Tool,
                BackendKind::Compat,
                "deepseek/deepseek-chat",
            )],
            Credentials {
                native: false,
                proxy: true,
            },
        );
        let route = resolver.resolve(TaskKind::Tool, None).await.unwrap();
        // The replacement lands in the proxy namespace the route serves
        assert_eq!(route.backend, BackendKind::Compat);
        assert_eq!(route.model, "anthropic/claude-3.5-haiku");
    }

    #[tokio::test]
    async fn tool_task_substitution_on_local_stays_local() {
        let resolver = resolver_with(
            vec![Route::new(
                TaskKind::Tool,
                BackendKind::Local,
                "deepseek-r1:7b",
            )],
            Credentials {
                native: false,
                proxy: false,
            },
        );
        let route = resolver.resolve(TaskKind::Tool, None).await.unwrap();
        assert_eq!(route.backend, BackendKind::Local);
        assert_eq!(route.model, "qwen3:8b");
    }

    #[tokio::test]
    async fn chat_task_keeps_unreliable_models() {
        let resolver = resolver_with(
            vec![Route::new(
                TaskKind::Chat,
                BackendKind::Compat,
                "deepseek/deepseek-chat",
            )],
            Credentials {
                native: false,
                proxy: true,
            },
        );
        let route = resolver.resolve(TaskKind::Chat, None).await.unwrap();
        assert_eq!(route.model, "deepseek/deepseek-chat");
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        struct Counting {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait::async_trait]
        impl RouteSource for Counting {
            async fn load(&self) -> crate::error::Result<Vec<Route>> {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Vec::new())
            }
        }
        let source = Arc::new(Counting {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let resolver = RouteResolver::new(
            source.clone(),
            Credentials {
                native: true,
                proxy: false,
            },
        );
        resolver.resolve(TaskKind::Chat, None).await.unwrap();
        resolver.resolve(TaskKind::Chat, None).await.unwrap();
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        resolver.invalidate().await;
        resolver.resolve(TaskKind::Chat, None).await.unwrap();
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
