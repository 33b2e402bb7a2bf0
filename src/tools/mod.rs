//! Built-in tools and the adapters that publish the registry through the server.
//!
//! - `EchoTool` / `TimeTool` - small internal utilities registered at startup
//! - `RegistryTool` - exposes one registry entry as a server tool
//! - `RegistryToolProvider` - serves the live registry through the handler
//! - `RegistryCatalogResource` - the registry catalogue as a readable resource

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::handler::{
    get_bool_arg, get_string_arg, McpHandler, ResourceHandler, ToolContext, ToolHandler, ToolOutcome, ToolProvider,
};
use crate::mcp::protocol::{Resource, ResourceContents, Tool};
use crate::mcp::server::McpServer;
use crate::registry::{FailureKind, ToolRegistry};
use crate::tool_schema;

/// URI of the registry catalogue resource.
pub const REGISTRY_CATALOG_URI: &str = "mcp-hub://registry/tools";

/// Echo tool.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "echo".to_string(),
            description: Some("Return the given message unchanged.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Text to echo back"
                    }
                },
                "required": ["message"]
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<ToolOutcome> {
        let message = get_string_arg(&args, "message")?;
        Ok(ToolOutcome::ok(message))
    }
}

/// Current time tool.
pub struct TimeTool;

#[async_trait]
impl ToolHandler for TimeTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "time".to_string(),
            description: Some("Current UTC time in RFC 3339 format.".to_string()),
            input_schema: tool_schema! {
                "millis": {
                    "type": "boolean",
                    "description": "Include milliseconds"
                }
            },
        }
    }

    async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<ToolOutcome> {
        let format = if get_bool_arg(&args, "millis", false) {
            SecondsFormat::Millis
        } else {
            SecondsFormat::Secs
        };
        Ok(ToolOutcome::ok(Utc::now().to_rfc3339_opts(format, true)))
    }
}

/// Register the built-in tools under the registry prefix.
pub async fn register_builtin_tools(registry: &ToolRegistry) -> Result<Vec<String>> {
    Ok(vec![
        registry.register_internal(EchoTool).await?,
        registry.register_internal(TimeTool).await?,
    ])
}

/// A registry entry served as an MCP tool.
pub struct RegistryTool {
    registry: Arc<ToolRegistry>,
    descriptor: Tool,
}

impl RegistryTool {
    pub fn new(registry: Arc<ToolRegistry>, descriptor: Tool) -> Self {
        Self { registry, descriptor }
    }
}

#[async_trait]
impl ToolHandler for RegistryTool {
    fn definition(&self) -> Tool {
        self.descriptor.clone()
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutcome> {
        let execution = self.registry.execute(&self.descriptor.name, args, ctx).await;
        if execution.success {
            let data = execution
                .data
                .or_else(|| execution.content.map(Value::String))
                .unwrap_or(Value::Null);
            return Ok(ToolOutcome::ok(data));
        }

        let message = execution
            .error
            .or(execution.content)
            .unwrap_or_else(|| "Tool failed".to_string());
        match execution.failure {
            Some(FailureKind::NotFound) => Err(Error::ToolNotFound(self.descriptor.name.clone())),
            Some(FailureKind::Execution) => Err(Error::ToolExecutionFailed(message)),
            Some(FailureKind::Reported) | None => Ok(ToolOutcome::fail(message)),
        }
    }
}

/// Resolves server tools against the registry on every list and call.
pub struct RegistryToolProvider {
    registry: Arc<ToolRegistry>,
}

impl RegistryToolProvider {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolProvider for RegistryToolProvider {
    async fn tools(&self) -> Vec<Tool> {
        self.registry.list_tools().await
    }

    async fn tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        let descriptor = self.registry.descriptor(name).await?;
        Some(Arc::new(RegistryTool::new(self.registry.clone(), descriptor)))
    }
}

/// The registry catalogue as a JSON resource.
pub struct RegistryCatalogResource {
    registry: Arc<ToolRegistry>,
}

impl RegistryCatalogResource {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ResourceHandler for RegistryCatalogResource {
    fn definition(&self) -> Resource {
        Resource {
            uri: REGISTRY_CATALOG_URI.to_string(),
            name: "Tool registry".to_string(),
            description: Some("Every tool the hub routes, with its origin".to_string()),
            mime_type: Some("application/json".to_string()),
        }
    }

    async fn read(&self, _ctx: &ToolContext) -> Result<ResourceContents> {
        let entries = self.registry.entries().await;
        let text = serde_json::to_string_pretty(&json!({
            "prefix": self.registry.prefix(),
            "servers": self.registry.server_names().await,
            "tools": entries,
        }))?;
        Ok(ResourceContents {
            uri: REGISTRY_CATALOG_URI.to_string(),
            mime_type: Some("application/json".to_string()),
            text: Some(text),
            blob: None,
        })
    }
}

/// Serve the registry's tools and catalogue through `handler`.
///
/// Returns how many tools the registry holds now; later changes show up live.
pub async fn expose_registry(handler: &mut McpHandler, registry: Arc<ToolRegistry>) -> Result<usize> {
    let count = registry.tool_count().await;
    handler.add_provider(Arc::new(RegistryToolProvider::new(registry.clone())));
    handler.register_resource(RegistryCatalogResource::new(registry))?;
    Ok(count)
}

/// Send `notifications/tools/list_changed` from `server` whenever the registry changes.
pub fn announce_tool_changes(registry: &ToolRegistry, server: &Arc<McpServer>) {
    let server = Arc::downgrade(server);
    registry.on_tools_changed(Arc::new(move || {
        if let Some(server) = server.upgrade() {
            let notified = server.notify_tools_changed();
            debug!(notified, "Announced tool list change");
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let outcome = EchoTool
            .execute(args(json!({"message": "hi there"})), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.text(), "hi there");

        let err = EchoTool.execute(Map::new(), &ToolContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidToolArguments(_)));
    }

    #[tokio::test]
    async fn test_time_tool_is_rfc3339() {
        let outcome = TimeTool.execute(Map::new(), &ToolContext::new()).await.unwrap();
        let text = outcome.text();
        assert!(chrono::DateTime::parse_from_rfc3339(&text).is_ok());
        assert!(text.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_expose_registry() {
        let registry = Arc::new(ToolRegistry::new("hub"));
        let names = register_builtin_tools(&registry).await.unwrap();
        assert_eq!(names, vec!["hub_echo", "hub_time"]);

        let mut handler = McpHandler::new();
        assert_eq!(expose_registry(&mut handler, registry.clone()).await.unwrap(), 2);
        assert!(handler.get_resource(REGISTRY_CATALOG_URI).is_some());

        let tool = handler.resolve_tool("hub_echo").await.unwrap();
        let outcome = tool
            .execute(args(json!({"message": "routed"})), &ToolContext::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.text(), "routed");

        // A handler error is a failed call, not a reported failure.
        let err = tool.execute(Map::new(), &ToolContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::ToolExecutionFailed(ref msg) if msg.contains("Missing required argument: message")));
    }

    struct Picky;

    #[async_trait]
    impl ToolHandler for Picky {
        fn definition(&self) -> Tool {
            Tool {
                name: "picky".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _args: Map<String, Value>, _ctx: &ToolContext) -> Result<ToolOutcome> {
            Ok(ToolOutcome::fail("not today"))
        }
    }

    #[tokio::test]
    async fn test_reported_failure_stays_an_outcome() {
        let registry = Arc::new(ToolRegistry::new("hub"));
        registry.register_internal(Picky).await.unwrap();
        let mut handler = McpHandler::new();
        expose_registry(&mut handler, registry).await.unwrap();

        let tool = handler.resolve_tool("hub_picky").await.unwrap();
        let outcome = tool.execute(Map::new(), &ToolContext::new()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.text(), "not today");
    }

    #[tokio::test]
    async fn test_registry_changes_are_live() {
        let registry = Arc::new(ToolRegistry::new("hub"));
        register_builtin_tools(&registry).await.unwrap();
        let mut handler = McpHandler::new();
        expose_registry(&mut handler, registry.clone()).await.unwrap();

        let stale = RegistryTool::new(registry.clone(), handler.resolve_tool("hub_echo").await.unwrap().definition());
        registry.register_internal(Picky).await.unwrap();
        let names: Vec<_> = handler.all_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["hub_echo", "hub_picky", "hub_time"]);

        let gone = RegistryTool::new(
            registry,
            Tool {
                name: "hub_gone".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
        );
        assert!(matches!(
            gone.execute(Map::new(), &ToolContext::new()).await,
            Err(Error::ToolNotFound(name)) if name == "hub_gone"
        ));
        assert!(stale
            .execute(args(json!({"message": "still here"})), &ToolContext::new())
            .await
            .unwrap()
            .success);
    }

    #[tokio::test]
    async fn test_catalog_resource() {
        let registry = Arc::new(ToolRegistry::new("hub"));
        register_builtin_tools(&registry).await.unwrap();

        let contents = RegistryCatalogResource::new(registry)
            .read(&ToolContext::new())
            .await
            .unwrap();
        let catalog: Value = serde_json::from_str(contents.text.as_deref().unwrap()).unwrap();
        assert_eq!(catalog["prefix"], "hub");
        assert_eq!(catalog["tools"][0]["name"], "hub_echo");
        assert_eq!(catalog["tools"][0]["source"], "internal");
    }
}
