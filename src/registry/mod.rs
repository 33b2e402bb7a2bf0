//! Unified tool registry.
//!
//! Internal tools live under `<prefix>_<name>`; tools imported from an external
//! MCP server live under `<server>_<name>` and are forwarded to that server's
//! [`Client`]. Both kinds execute through one entry point and report results in
//! one normalized shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::client::Client;
use crate::mcp::handler::{ToolContext, ToolHandler};
use crate::mcp::protocol::Tool;
use crate::metrics::{Metrics, Timer};

/// Where a tool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Internal,
    External,
}

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool ran and reported failure.
    Reported,
    /// The call itself failed: handler error, transport fault or timeout.
    Execution,
    /// No tool is registered under that name.
    NotFound,
}

/// Normalized result of [`ToolRegistry::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ToolSource>,
    /// Owning server, for external tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ToolExecution {
    fn failure(
        kind: FailureKind,
        error: impl Into<String>,
        source: Option<ToolSource>,
        server: Option<String>,
    ) -> Self {
        Self {
            success: false,
            content: None,
            data: None,
            error: Some(error.into()),
            source,
            server,
            failure: Some(kind),
        }
    }

    fn not_found(name: &str) -> Self {
        Self::failure(FailureKind::NotFound, format!("Tool not found: {}", name), None, None)
    }
}

/// Catalogue entry describing one registered tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTool {
    #[serde(flatten)]
    pub descriptor: Tool,
    pub source: ToolSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

struct InternalTool {
    descriptor: Tool,
    handler: Arc<dyn ToolHandler>,
}

struct ExternalTool {
    descriptor: Tool,
    original_name: String,
    server: String,
    client: Arc<Client>,
}

/// Called after the set of registered tools changed.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Registry of internal and external tools.
///
/// Lock order is internal, then external, then servers.
///
/// ```
/// use mcp_hub::mcp::handler::ToolContext;
/// use mcp_hub::registry::ToolRegistry;
/// use mcp_hub::tools::EchoTool;
///
/// # tokio_test::block_on(async {
/// let registry = ToolRegistry::new("hub");
/// let name = registry.register_internal(EchoTool).await.unwrap();
/// assert_eq!(name, "hub_echo");
///
/// let mut args = serde_json::Map::new();
/// args.insert("message".into(), "hi".into());
/// let result = registry.execute(&name, args, &ToolContext::new()).await;
/// assert!(result.success);
/// assert_eq!(result.content.as_deref(), Some("hi"));
/// # });
/// ```
pub struct ToolRegistry {
    prefix: String,
    internal: RwLock<HashMap<String, InternalTool>>,
    external: RwLock<HashMap<String, ExternalTool>>,
    servers: RwLock<HashMap<String, Arc<Client>>>,
    listeners: Mutex<Vec<ChangeListener>>,
    metrics: Arc<Metrics>,
}

impl ToolRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            internal: RwLock::new(HashMap::new()),
            external: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Run `listener` whenever tools are added or removed.
    pub fn on_tools_changed(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn tools_changed(&self) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener();
        }
    }

    /// Register an internal tool as `<prefix>_<name>`, returning the full name.
    pub async fn register_internal<T: ToolHandler + 'static>(&self, handler: T) -> Result<String> {
        self.register_internal_arc(Arc::new(handler)).await
    }

    pub async fn register_internal_arc(&self, handler: Arc<dyn ToolHandler>) -> Result<String> {
        let mut descriptor = handler.definition();
        let name = format!("{}_{}", self.prefix, descriptor.name);
        descriptor.name = name.clone();

        {
            let mut internal = self.internal.write().await;
            let external = self.external.read().await;
            if internal.contains_key(&name) || external.contains_key(&name) {
                return Err(Error::ToolAlreadyRegistered(name));
            }
            internal.insert(name.clone(), InternalTool { descriptor, handler });
        }
        debug!(tool = %name, "Registered internal tool");
        self.tools_changed();
        Ok(name)
    }

    /// Import every tool `client` offers as `<server_name>_<tool>`.
    ///
    /// All-or-nothing: any name collision leaves the registry untouched.
    pub async fn import_external(&self, server_name: &str, client: Arc<Client>) -> Result<usize> {
        if self.servers.read().await.contains_key(server_name) {
            return Err(Error::Config(format!("external server already registered: {}", server_name)));
        }

        let tools = client.list_tools(false).await?;
        let imported: Vec<(String, ExternalTool)> = tools
            .into_iter()
            .map(|tool| {
                let name = format!("{}_{}", server_name, tool.name);
                let original_name = tool.name.clone();
                let descriptor = Tool {
                    name: name.clone(),
                    ..tool
                };
                (
                    name,
                    ExternalTool {
                        descriptor,
                        original_name,
                        server: server_name.to_string(),
                        client: client.clone(),
                    },
                )
            })
            .collect();

        let count = imported.len();
        {
            let internal = self.internal.read().await;
            let mut external = self.external.write().await;
            let mut servers = self.servers.write().await;

            if servers.contains_key(server_name) {
                return Err(Error::Config(format!("external server already registered: {}", server_name)));
            }
            let mut seen = HashSet::new();
            for (name, _) in &imported {
                if internal.contains_key(name) || external.contains_key(name) || !seen.insert(name.as_str()) {
                    return Err(Error::ToolAlreadyRegistered(name.clone()));
                }
            }

            external.extend(imported);
            servers.insert(server_name.to_string(), client);
        }
        info!(server = server_name, count, "Imported external tools");
        self.tools_changed();
        Ok(count)
    }

    /// Remove every tool `server_name` contributed and disconnect its client.
    pub async fn remove_external_server(&self, server_name: &str) -> Result<usize> {
        let (client, removed) = {
            let mut external = self.external.write().await;
            let mut servers = self.servers.write().await;
            let client = servers
                .remove(server_name)
                .ok_or_else(|| Error::ServerNotFound(server_name.to_string()))?;
            let before = external.len();
            external.retain(|_, tool| tool.server != server_name);
            (client, before - external.len())
        };

        if let Err(e) = client.disconnect().await {
            warn!(server = server_name, "Disconnect failed: {}", e);
        }
        info!(server = server_name, removed, "Removed external server");
        self.tools_changed();
        Ok(removed)
    }

    /// Execute a tool by its registry name. Never fails; misses are failed results.
    pub async fn execute(&self, name: &str, arguments: Map<String, Value>, context: &ToolContext) -> ToolExecution {
        let timer = Timer::start();

        let internal = self.internal.read().await.get(name).map(|t| t.handler.clone());
        let execution = if let Some(handler) = internal {
            Self::run_internal(handler, arguments, context).await
        } else {
            let external = self
                .external
                .read()
                .await
                .get(name)
                .map(|t| (t.server.clone(), t.original_name.clone(), t.client.clone()));
            match external {
                Some((server, original_name, client)) => {
                    Self::run_external(name, server, &original_name, client, arguments).await
                }
                None => {
                    warn!(tool = name, "Tool not found in registry");
                    ToolExecution::not_found(name)
                }
            }
        };

        self.metrics.record_tool_call(execution.success);
        debug!(
            tool = name,
            success = execution.success,
            source = ?execution.source,
            elapsed_ms = timer.elapsed_ms(),
            "Tool executed"
        );
        execution
    }

    async fn run_internal(
        handler: Arc<dyn ToolHandler>,
        arguments: Map<String, Value>,
        context: &ToolContext,
    ) -> ToolExecution {
        match handler.execute(arguments, context).await {
            Ok(outcome) => ToolExecution {
                success: outcome.success,
                content: Some(outcome.text()),
                failure: (!outcome.success).then_some(FailureKind::Reported),
                data: outcome.data,
                error: outcome.error,
                source: Some(ToolSource::Internal),
                server: None,
            },
            Err(e) => ToolExecution::failure(FailureKind::Execution, e.to_string(), Some(ToolSource::Internal), None),
        }
    }

    async fn run_external(
        name: &str,
        server: String,
        original_name: &str,
        client: Arc<Client>,
        arguments: Map<String, Value>,
    ) -> ToolExecution {
        let prefix = format!("{}_", server);
        let remote_name = name.strip_prefix(&prefix).unwrap_or(original_name);

        match client.call_tool(remote_name, Value::Object(arguments)).await {
            Ok(result) => {
                let text = result.first_text().map(String::from);
                let data = text.as_deref().and_then(|t| serde_json::from_str::<Value>(t).ok());
                ToolExecution {
                    success: !result.is_error,
                    error: if result.is_error { text.clone() } else { None },
                    content: text,
                    data,
                    source: Some(ToolSource::External),
                    server: Some(server),
                    failure: result.is_error.then_some(FailureKind::Reported),
                }
            }
            Err(e) => {
                warn!(tool = name, server = %server, "External tool call failed: {}", e);
                ToolExecution::failure(
                    FailureKind::Execution,
                    e.to_string(),
                    Some(ToolSource::External),
                    Some(server),
                )
            }
        }
    }

    /// Descriptors of every tool, sorted by name.
    pub async fn list_tools(&self) -> Vec<Tool> {
        self.entries().await.into_iter().map(|e| e.descriptor).collect()
    }

    /// Catalogue of every tool with its origin, sorted by name.
    pub async fn entries(&self) -> Vec<RegisteredTool> {
        let internal = self.internal.read().await;
        let external = self.external.read().await;

        let mut entries: Vec<RegisteredTool> = internal
            .values()
            .map(|t| RegisteredTool {
                descriptor: t.descriptor.clone(),
                source: ToolSource::Internal,
                server: None,
            })
            .chain(external.values().map(|t| RegisteredTool {
                descriptor: t.descriptor.clone(),
                source: ToolSource::External,
                server: Some(t.server.clone()),
            }))
            .collect();
        entries.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        entries
    }

    /// Descriptor of one tool by its registry name.
    pub async fn descriptor(&self, name: &str) -> Option<Tool> {
        if let Some(tool) = self.internal.read().await.get(name) {
            return Some(tool.descriptor.clone());
        }
        self.external.read().await.get(name).map(|t| t.descriptor.clone())
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.internal.read().await.contains_key(name) || self.external.read().await.contains_key(name)
    }

    pub async fn tool_count(&self) -> usize {
        self.internal.read().await.len() + self.external.read().await.len()
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disconnect every external server's client.
    pub async fn disconnect_all(&self) {
        let clients: Vec<Arc<Client>> = self.servers.read().await.values().cloned().collect();
        for client in clients {
            if let Err(e) = client.disconnect().await {
                warn!(server = client.name(), "Disconnect failed: {}", e);
            }
        }
    }
}
