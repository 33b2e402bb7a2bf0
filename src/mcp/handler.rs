//! Tool and resource handlers exposed by the MCP server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mcp::protocol::{ContentBlock, Resource, ResourceContents, Tool, ToolResult};

/// Caller identity attached to a tool call.
///
/// Filled from the `_meta` object of `tools/call` params when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Build a context from request `_meta` and the serving connection.
    pub fn from_meta(meta: Option<&Map<String, Value>>, connection_id: &str) -> Self {
        let field = |key: &str| {
            meta.and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(String::from)
        };
        Self {
            org_id: field("orgId"),
            user_id: field("userId"),
            connection_id: Some(connection_id.to_string()),
        }
    }
}

/// What a tool handler produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Text form sent back as the result's content block.
    ///
    /// Strings go out verbatim, other data as pretty JSON.
    pub fn text(&self) -> String {
        if !self.success {
            return self.error.clone().unwrap_or_else(|| "Tool failed".to_string());
        }
        match &self.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            None => String::new(),
        }
    }

    /// Convert into the wire result of `tools/call`.
    pub fn into_tool_result(self) -> ToolResult {
        if self.success {
            success_result(self.text())
        } else {
            error_result(self.text())
        }
    }
}

/// Handler for MCP tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> Tool;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Map<String, Value>, context: &ToolContext) -> Result<ToolOutcome>;
}

/// Handler for a readable resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn definition(&self) -> Resource;

    async fn read(&self, context: &ToolContext) -> Result<ResourceContents>;
}

/// A tool set that can change while the server runs.
///
/// Consulted after the statically registered tools on every list and call.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn tools(&self) -> Vec<Tool>;

    async fn tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>>;
}

/// Registry of tool and resource handlers.
pub struct McpHandler {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    providers: Vec<Arc<dyn ToolProvider>>,
    resources: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl McpHandler {
    /// Create a new handler registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            providers: Vec::new(),
            resources: HashMap::new(),
        }
    }

    /// Serve a live tool set next to the registered tools.
    pub fn add_provider(&mut self, provider: Arc<dyn ToolProvider>) {
        self.providers.push(provider);
    }

    /// Register a tool handler. Names are unique.
    pub fn register<T: ToolHandler + 'static>(&mut self, handler: T) -> Result<()> {
        self.register_arc(Arc::new(handler))
    }

    /// Register a tool handler (Arc version).
    pub fn register_arc(&mut self, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let name = handler.definition().name;
        if self.tools.contains_key(&name) {
            return Err(Error::ToolAlreadyRegistered(name));
        }
        self.tools.insert(name, handler);
        Ok(())
    }

    pub fn register_resource<R: ResourceHandler + 'static>(&mut self, handler: R) -> Result<()> {
        let uri = handler.definition().uri;
        if self.resources.contains_key(&uri) {
            return Err(Error::Config(format!("resource already registered: {}", uri)));
        }
        self.resources.insert(uri, Arc::new(handler));
        Ok(())
    }

    /// Get all registered tools, sorted by name.
    pub fn list_tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(|h| h.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Get a tool by name.
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    /// Registered and provided tools, sorted by name. Registered tools shadow
    /// provided ones with the same name.
    pub async fn all_tools(&self) -> Vec<Tool> {
        let mut tools = self.list_tools();
        let mut seen: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
        for provider in &self.providers {
            for tool in provider.tools().await {
                if seen.insert(tool.name.clone()) {
                    tools.push(tool);
                }
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Look a tool up among registered tools, then providers.
    pub async fn resolve_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        if let Some(tool) = self.get_tool(name) {
            return Some(tool);
        }
        for provider in &self.providers {
            if let Some(tool) = provider.tool(name).await {
                return Some(tool);
            }
        }
        None
    }

    /// Check if a tool exists.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = self.resources.values().map(|h| h.definition()).collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn get_resource(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.resources.get(uri).cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Default for McpHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper macro for creating tool input schemas.
#[macro_export]
macro_rules! tool_schema {
    ($($json:tt)+) => {
        serde_json::json!({
            "type": "object",
            "properties": {
                $($json)+
            }
        })
    };
}

/// Helper to create a text content block.
pub fn text_content(text: impl Into<String>) -> ContentBlock {
    ContentBlock::Text { text: text.into() }
}

/// Helper to create a successful tool result.
pub fn success_result(text: impl Into<String>) -> ToolResult {
    ToolResult {
        content: vec![text_content(text)],
        is_error: false,
    }
}

/// Helper to create an error tool result.
pub fn error_result(text: impl Into<String>) -> ToolResult {
    ToolResult {
        content: vec![text_content(text)],
        is_error: true,
    }
}

/// Helper to extract a required string argument.
pub fn get_string_arg(args: &Map<String, Value>, name: &str) -> Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::InvalidToolArguments(format!("Missing required argument: {}", name)))
}

/// Helper to extract an optional string argument.
pub fn get_optional_string_arg(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(String::from)
}

/// Helper to extract a boolean argument with a default.
pub fn get_bool_arg(args: &Map<String, Value>, name: &str, default: bool) -> bool {
    args.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
}
