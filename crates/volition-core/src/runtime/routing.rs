//! Two-route resolution for a turn

use crate::error::Result;
use volition_llm::{Route, RouteResolver, TaskKind};

/// The routes one turn operates on.
#[derive(Debug, Clone)]
pub struct TurnRoutes {
    /// Higher-quality route for the final answer
    pub chat: Route,
    /// Cheap route driving the tool-calling loop, when tools are enabled
    pub tool: Option<Route>,
}

impl TurnRoutes {
    /// Two-phase mode: the tool route exists and differs from the chat
    /// route, so the final answer is re-run on the chat route.
    #[must_use]
    pub fn two_phase(&self) -> bool {
        self.tool.as_ref().is_some_and(|t| {
            t.backend != self.chat.backend || t.model != self.chat.model
        })
    }

    /// Route driving the iterative loop.
    #[must_use]
    pub fn loop_route(&self) -> &Route {
        self.tool.as_ref().unwrap_or(&self.chat)
    }
}

/// Resolve the chat route, and the tool route when tools are enabled.
/// The agent's model override applies to both lookups.
pub async fn resolve_turn_routes(
    resolver: &RouteResolver,
    model_override: Option<&str>,
    tools_enabled: bool,
) -> Result<TurnRoutes> {
    let chat = resolver.resolve(TaskKind::Chat, model_override).await?;
    let tool = if tools_enabled {
        Some(resolver.resolve(TaskKind::Tool, model_override).await?)
    } else {
        None
    };
    Ok(TurnRoutes { chat, tool })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use volition_llm::{BackendKind, Credentials, StaticRouteSource};

    fn resolver(routes: Vec<Route>) -> RouteResolver {
        RouteResolver::new(
            Arc::new(StaticRouteSource::new(routes)),
            Credentials {
                native: true,
                proxy: true,
            },
        )
    }

    #[tokio::test]
    async fn differing_routes_enable_two_phase() {
        let resolver = resolver(vec![
            Route::new(TaskKind::Chat, BackendKind::Native, "claude-sonnet-4-20250514"),
            Route::new(TaskKind::Tool, BackendKind::Native, "claude-3-5-haiku-20241022"),
        ]);
        let routes = resolve_turn_routes(&resolver, None, true).await.unwrap();
        assert!(routes.two_phase());
        assert_eq!(routes.loop_route().model, "claude-3-5-haiku-20241022");
    }

    #[tokio::test]
    async fn identical_routes_stay_single_phase() {
        let resolver = resolver(vec![
            Route::new(TaskKind::Chat, BackendKind::Native, "claude-sonnet-4-20250514"),
            Route::new(TaskKind::Tool, BackendKind::Native, "claude-sonnet-4-20250514"),
        ]);
        let routes = resolve_turn_routes(&resolver, None, true).await.unwrap();
        assert!(!routes.two_phase());
    }

    #[tokio::test]
    async fn no_tools_means_no_tool_route() {
        let resolver = resolver(vec![Route::new(
            TaskKind::Chat,
            BackendKind::Native,
            "claude-sonnet-4-20250514",
        )]);
        let routes = resolve_turn_routes(&resolver, None, false).await.unwrap();
        assert!(routes.tool.is_none());
        assert!(!routes.two_phase());
        assert_eq!(routes.loop_route().model, "claude-sonnet-4-20250514");
    }
}
