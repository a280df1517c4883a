//! Outward-facing MCP surface: exactly two meta-tools bound to the hierarchy
//! store and the server registry.
//!
//! Agents navigate the category tree with `get_tools_in_category` and invoke
//! real tools by dot path with `execute_tool`; the backing MCP server is
//! spawned or connected only when one of its tools is first executed.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::transport::stdio;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, ServiceError, ServiceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::RouterError;
use crate::hierarchy::HierarchyStore;
use crate::registry::ServerRegistry;

pub const NAVIGATE_TOOL: &str = "get_tools_in_category";
pub const EXECUTE_TOOL: &str = "execute_tool";

/// Downstream calls are cut off after this long, unless the caller's own
/// cancellation fires first.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(15);

/// The MCP server agents talk to. Cheap to clone; the hierarchy and registry
/// are shared process-wide.
#[derive(Clone)]
pub struct RouterServer {
    hierarchy: Arc<HierarchyStore>,
    registry: Arc<ServerRegistry>,
    name: String,
    version: String,
}

impl RouterServer {
    pub fn new(
        hierarchy: Arc<HierarchyStore>,
        registry: Arc<ServerRegistry>,
        name: String,
        version: String,
    ) -> Self {
        Self {
            hierarchy,
            registry,
            name,
            version,
        }
    }

    fn meta_tools(&self) -> Vec<Tool> {
        let mut navigate_description = String::from(
            "Navigate the tool hierarchy and discover available tools in a category. \
             Returns children and tools at the specified path.",
        );
        if let Some(overview) = self.hierarchy.root().overview.as_deref() {
            navigate_description.push_str("\n\n");
            navigate_description.push_str(overview);
        }

        vec![
            meta_tool(
                NAVIGATE_TOOL,
                navigate_description,
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Category path using dot notation (e.g. 'coding_tools' or 'coding_tools.serena.search'). Use empty string or '/' for the root.",
                        }
                    },
                    "required": ["path"],
                }),
            ),
            meta_tool(
                EXECUTE_TOOL,
                "Execute a tool by its full path. Automatically proxies the request to the \
                 appropriate MCP server."
                    .to_string(),
                json!({
                    "type": "object",
                    "properties": {
                        "tool_path": {
                            "type": "string",
                            "description": "Full tool path using dot notation (e.g. 'coding_tools.serena.search.find_symbol'), or just the tool name if unique.",
                        },
                        "arguments": {
                            "type": "object",
                            "description": "Arguments to pass to the tool.",
                            "additionalProperties": true,
                        }
                    },
                    "required": ["tool_path", "arguments"],
                }),
            ),
        ]
    }

    /// Handler for `get_tools_in_category`. The `path` argument is required;
    /// the empty string and `"/"` both name the root.
    pub async fn handle_get_tools_in_category(
        &self,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, McpError> {
        let path = arguments
            .and_then(|map| map.get("path"))
            .and_then(|value| value.as_str())
            .ok_or_else(|| RouterError::InvalidArguments("path is required".to_string()))?;

        let view = self.hierarchy.get_tools_in_category(path)?;
        let text = serde_json::to_string_pretty(&view)
            .map_err(|err| McpError::internal_error(format!("failed to encode view: {err}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Handler for `execute_tool`. Resolves the path, lazily obtains the
    /// downstream client, and relays the call bounded by a 15-second timeout
    /// derived from the caller's cancellation token.
    pub async fn handle_execute_tool(
        &self,
        ct: &CancellationToken,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, McpError> {
        let tool_path = arguments
            .and_then(|map| map.get("tool_path"))
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        if tool_path.is_empty() {
            return Err(RouterError::InvalidArguments("tool_path is required".to_string()).into());
        }

        // A missing or mistyped arguments object degrades to empty.
        let tool_args = arguments
            .and_then(|map| map.get("arguments"))
            .and_then(|value| value.as_object())
            .cloned()
            .unwrap_or_default();

        let (tool, server_name) = self.hierarchy.resolve_tool_path(tool_path)?;
        if server_name.is_empty() {
            // Meta-tools and serverless leaves land here; agents invoke the
            // meta-tools directly, never through execute_tool.
            return Err(RouterError::NoServerForTool(tool_path.to_string()).into());
        }

        let client = self.registry.get_or_load(ct, server_name).await?;

        let downstream_tool = if tool.maps_to.is_empty() {
            tool_path.rsplit('.').next().unwrap_or(tool_path)
        } else {
            tool.maps_to.as_str()
        };

        log::debug!(
            "executing tool: path={tool_path} server={server_name} tool={downstream_tool}"
        );

        let call = client.call_tool(downstream_tool, Some(tool_args));
        let result = tokio::select! {
            outcome = tokio::time::timeout(EXECUTE_TIMEOUT, call) => match outcome {
                Ok(inner) => inner,
                Err(_) => {
                    return Err(RouterError::CallTimeout {
                        server: server_name.to_string(),
                        timeout: EXECUTE_TIMEOUT,
                    }
                    .into())
                }
            },
            _ = ct.cancelled() => return Err(RouterError::Cancelled.into()),
        };

        // Relay the downstream result untouched; downstream MCP errors pass
        // through as-is.
        result.map_err(|err| match err {
            ServiceError::McpError(mcp_err) => mcp_err,
            other => McpError::internal_error(
                format!("<{server_name}> tool call failed: {other}"),
                None,
            ),
        })
    }

    /// Serve the router over stdio until the peer disconnects.
    pub async fn serve_stdio(self) -> Result<()> {
        log::info!("starting stdio MCP router");
        let service = self.serve(stdio()).await.inspect_err(|err| {
            log::error!("serving error: {err:?}");
        })?;
        service.waiting().await?;
        log::info!("stdio MCP router stopped");
        Ok(())
    }

    /// Serve the router over streamable HTTP at `/mcp`, optionally guarded by
    /// bearer tokens.
    pub async fn serve_http(
        self,
        addr: SocketAddr,
        auth_tokens: Vec<String>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
        use rmcp::transport::streamable_http_server::StreamableHttpService;

        let router = self.clone();
        let service = StreamableHttpService::new(
            move || Ok(router.clone()),
            LocalSessionManager::default().into(),
            Default::default(),
        );

        let mut app = axum::Router::new().nest_service("/mcp", service);
        if !auth_tokens.is_empty() {
            let tokens: Arc<HashSet<String>> = Arc::new(auth_tokens.into_iter().collect());
            app = app.layer(axum::middleware::from_fn_with_state(
                tokens,
                require_bearer_token,
            ));
        }

        log::info!("streamable-http MCP router listening on {addr}");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

impl ServerHandler for RouterServer {
    fn get_info(&self) -> ServerInfo {
        let mut instructions = String::from(
            "Hierarchical MCP router. Explore categories with get_tools_in_category and run \
             tools by dot path with execute_tool.",
        );
        if let Some(overview) = self.hierarchy.root().overview.as_deref() {
            instructions.push_str("\n\n");
            instructions.push_str(overview);
        }

        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
                ..Default::default()
            },
            instructions: Some(instructions),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.meta_tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            NAVIGATE_TOOL => {
                self.handle_get_tools_in_category(request.arguments.as_ref())
                    .await
            }
            EXECUTE_TOOL => {
                self.handle_execute_tool(&context.ct, request.arguments.as_ref())
                    .await
            }
            other => Err(McpError::invalid_params(format!("unknown tool: {other}"), None)),
        }
    }
}

fn meta_tool(name: &str, description: String, schema: serde_json::Value) -> Tool {
    let schema_obj = match schema {
        serde_json::Value::Object(obj) => Arc::new(obj),
        _ => Arc::new(serde_json::Map::new()),
    };
    Tool {
        name: name.to_string().into(),
        title: None,
        description: Some(description.into()),
        input_schema: schema_obj,
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

async fn require_bearer_token(
    State(tokens): State<Arc<HashSet<String>>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .is_some_and(|token| tokens.contains(token));

    if authorized {
        next.run(request).await
    } else {
        (axum::http::StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{HierarchyNode, ToolDefinition};
    use std::collections::HashMap;

    fn test_router() -> RouterServer {
        let mut nodes = HashMap::new();
        let mut root = HierarchyNode {
            overview: Some("Root overview".to_string()),
            ..Default::default()
        };
        root.tools.insert(
            NAVIGATE_TOOL.to_string(),
            ToolDefinition {
                description: "Navigate".to_string(),
                maps_to: NAVIGATE_TOOL.to_string(),
                ..Default::default()
            },
        );
        nodes.insert(String::new(), root);

        let mut leaf = HierarchyNode::default();
        leaf.tools.insert(
            "echo".to_string(),
            ToolDefinition {
                description: "Echo".to_string(),
                maps_to: "echo".to_string(),
                server: "missing-server".to_string(),
                ..Default::default()
            },
        );
        nodes.insert("tools".to_string(), HierarchyNode::default());
        nodes.insert("tools.echo".to_string(), leaf);

        let mut orphan = HierarchyNode::default();
        orphan.tools.insert(
            "lonely".to_string(),
            ToolDefinition {
                description: "No server anywhere".to_string(),
                maps_to: "lonely".to_string(),
                ..Default::default()
            },
        );
        nodes.insert("orphan".to_string(), orphan);

        let hierarchy = Arc::new(crate::hierarchy::HierarchyStore::new(nodes).unwrap());
        let registry = Arc::new(ServerRegistry::new(HashMap::new()));
        RouterServer::new(hierarchy, registry, "canopy-test".to_string(), "0.0.0".to_string())
    }

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn declares_exactly_two_meta_tools() {
        let router = test_router();
        let tools = router.meta_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, NAVIGATE_TOOL);
        assert_eq!(tools[1].name, EXECUTE_TOOL);
        // The navigation description folds in the root overview.
        assert!(tools[0]
            .description
            .as_deref()
            .unwrap_or_default()
            .contains("Root overview"));
    }

    #[tokio::test]
    async fn navigation_returns_view_as_text_content() {
        let router = test_router();
        let result = router
            .handle_get_tools_in_category(Some(&args(json!({"path": ""}))))
            .await
            .unwrap();
        let text = result.content[0].as_text().map(|t| t.text.clone()).unwrap_or_default();
        let view: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(view["path"], "");
        assert_eq!(view["overview"], "Root overview");
    }

    #[tokio::test]
    async fn navigation_requires_path_argument() {
        let router = test_router();
        let err = router
            .handle_get_tools_in_category(Some(&args(json!({}))))
            .await
            .unwrap_err();
        assert!(err.message.contains("path is required"));
    }

    #[tokio::test]
    async fn navigation_error_carries_offending_path() {
        let router = test_router();
        let err = router
            .handle_get_tools_in_category(Some(&args(json!({"path": "nonexistent"}))))
            .await
            .unwrap_err();
        assert!(err.message.contains("nonexistent"));
        assert!(err.message.contains("not found"));
    }

    #[tokio::test]
    async fn execute_rejects_empty_tool_path() {
        let router = test_router();
        let ct = CancellationToken::new();
        let err = router
            .handle_execute_tool(&ct, Some(&args(json!({"tool_path": "", "arguments": {}}))))
            .await
            .unwrap_err();
        assert!(err.message.contains("tool_path is required"));

        let err = router.handle_execute_tool(&ct, None).await.unwrap_err();
        assert!(err.message.contains("tool_path is required"));
    }

    #[tokio::test]
    async fn execute_refuses_meta_tools() {
        let router = test_router();
        let ct = CancellationToken::new();
        let err = router
            .handle_execute_tool(
                &ct,
                Some(&args(json!({"tool_path": NAVIGATE_TOOL, "arguments": {}}))),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("no MCP server configured"));
    }

    #[tokio::test]
    async fn serverless_leaf_fails_at_execution_not_load() {
        let router = test_router();
        let ct = CancellationToken::new();
        // The hierarchy loaded fine; only executing the tool surfaces the gap.
        let err = router
            .handle_execute_tool(
                &ct,
                Some(&args(json!({"tool_path": "orphan.lonely", "arguments": {}}))),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("no MCP server configured"));
    }

    #[tokio::test]
    async fn unknown_server_surfaces_config_missing() {
        let router = test_router();
        let ct = CancellationToken::new();
        let err = router
            .handle_execute_tool(
                &ct,
                Some(&args(json!({"tool_path": "tools.echo", "arguments": {}}))),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("missing-server"));
    }

    #[tokio::test]
    async fn unresolvable_tool_path_is_not_found() {
        let router = test_router();
        let ct = CancellationToken::new();
        let err = router
            .handle_execute_tool(
                &ct,
                Some(&args(json!({"tool_path": "no.such.tool", "arguments": {}}))),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("tool not found"));
        assert!(err.message.contains("no.such.tool"));
    }
}
