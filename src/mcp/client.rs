//! High-level MCP client over a [`Session`].
//!
//! Adds capability checks, cursor pagination and list caching that is
//! invalidated by the server's `list_changed` notifications.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::*;
use crate::mcp::session::{ListKind, Session, SessionOptions};
use crate::mcp::transport::{create_transport, Platform, TransportConfig};

/// Guard against servers that never stop paginating.
const MAX_PAGES: usize = 100;

fn default_true() -> bool {
    true
}

/// One external MCP server the hub connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    pub transport: TransportConfig,
    /// Per-request timeout; the session default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_initialize: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout_ms: None,
            auto_initialize: true,
            enabled: true,
        }
    }
}

/// Optional server feature groups a call may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Tools,
    Resources,
    ResourceSubscribe,
    Prompts,
    Logging,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::ResourceSubscribe => "resources.subscribe",
            Self::Prompts => "prompts",
            Self::Logging => "logging",
        }
    }

    fn supported_by(&self, caps: &ServerCapabilities) -> bool {
        match self {
            Self::Tools => caps.tools.is_some(),
            Self::Resources => caps.resources.is_some(),
            Self::ResourceSubscribe => caps.resources.as_ref().is_some_and(|r| r.subscribe),
            Self::Prompts => caps.prompts.is_some(),
            Self::Logging => caps.logging.is_some(),
        }
    }
}

#[derive(Debug, Default)]
struct ListCaches {
    tools: Option<Vec<Tool>>,
    resources: Option<Vec<Resource>>,
    prompts: Option<Vec<Prompt>>,
}

impl ListCaches {
    fn invalidate(&mut self, kind: ListKind) {
        match kind {
            ListKind::Tools => self.tools = None,
            ListKind::Resources => self.resources = None,
            ListKind::Prompts => self.prompts = None,
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// MCP client bound to one server.
pub struct Client {
    name: String,
    session: Session,
    caches: Arc<Mutex<ListCaches>>,
    disconnected: AtomicBool,
}

impl Client {
    /// Wrap an existing session.
    pub fn new(name: impl Into<String>, session: Session) -> Self {
        let caches = Arc::new(Mutex::new(ListCaches::default()));
        let hook = Arc::downgrade(&caches);
        session.on_list_changed(Arc::new(move |kind: ListKind| {
            if let Some(caches) = hook.upgrade() {
                caches.lock().unwrap_or_else(PoisonError::into_inner).invalidate(kind);
            }
        }));

        Self {
            name: name.into(),
            session,
            caches,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Build the transport for `config`, open a session and optionally initialize it.
    pub async fn connect(config: &ClientConfig, platform: &Platform) -> Result<Self> {
        let transport = create_transport(&config.transport, platform)?;
        let mut options = SessionOptions::default();
        if let Some(millis) = config.timeout_ms {
            options = options.with_timeout(Duration::from_millis(millis));
        }
        let client = Self::new(config.name.clone(), Session::new(transport, options));

        if config.auto_initialize {
            if let Err(e) = client.initialize().await {
                warn!(server = %config.name, "Initialize failed: {}", e);
                let _ = client.disconnect().await;
                return Err(e);
            }
        } else {
            client.session.start().await?;
        }

        info!(server = %config.name, transport = client.session.transport().kind(), "Connected to MCP server");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_initialized()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.session.server_info()
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.session.server_capabilities()
    }

    pub async fn initialize(&self) -> Result<InitializeResult> {
        self.session.initialize().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.session.request(methods::PING, None).await?;
        Ok(())
    }

    /// Fail fast, before any I/O, when the server lacks `capability`.
    fn require(&self, capability: Capability) -> Result<()> {
        let caps = self.session.server_capabilities().ok_or(Error::NotInitialized)?;
        if capability.supported_by(caps) {
            Ok(())
        } else {
            Err(Error::CapabilityNotSupported(capability.as_str().to_string()))
        }
    }

    fn caches(&self) -> MutexGuard<'_, ListCaches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tools offered by the server, served from cache unless `force_refresh`.
    pub async fn list_tools(&self, force_refresh: bool) -> Result<Vec<Tool>> {
        self.require(Capability::Tools)?;
        if !force_refresh {
            if let Some(tools) = self.caches().tools.clone() {
                return Ok(tools);
            }
        }
        let tools = self
            .paginate(methods::TOOLS_LIST, |page: ListToolsResult| (page.tools, page.next_cursor))
            .await?;
        debug!(server = %self.name, count = tools.len(), "Fetched tools");
        self.caches().tools = Some(tools.clone());
        Ok(tools)
    }

    /// Cached tool list, if one is held.
    pub fn cached_tools(&self) -> Option<Vec<Tool>> {
        self.caches().tools.clone()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        self.require(Capability::Tools)?;
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let value = self
            .session
            .request(methods::TOOLS_CALL, Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_resources(&self, force_refresh: bool) -> Result<Vec<Resource>> {
        self.require(Capability::Resources)?;
        if !force_refresh {
            if let Some(resources) = self.caches().resources.clone() {
                return Ok(resources);
            }
        }
        let resources = self
            .paginate(methods::RESOURCES_LIST, |page: ListResourcesResult| {
                (page.resources, page.next_cursor)
            })
            .await?;
        self.caches().resources = Some(resources.clone());
        Ok(resources)
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        self.require(Capability::Resources)?;
        self.paginate(methods::RESOURCES_TEMPLATES_LIST, |page: ListResourceTemplatesResult| {
            (page.resource_templates, page.next_cursor)
        })
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.require(Capability::Resources)?;
        let value = self
            .session
            .request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        self.require(Capability::ResourceSubscribe)?;
        self.session
            .request(methods::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.require(Capability::ResourceSubscribe)?;
        self.session
            .request(methods::RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self, force_refresh: bool) -> Result<Vec<Prompt>> {
        self.require(Capability::Prompts)?;
        if !force_refresh {
            if let Some(prompts) = self.caches().prompts.clone() {
                return Ok(prompts);
            }
        }
        let prompts = self
            .paginate(methods::PROMPTS_LIST, |page: ListPromptsResult| (page.prompts, page.next_cursor))
            .await?;
        self.caches().prompts = Some(prompts.clone());
        Ok(prompts)
    }

    pub async fn get_prompt(&self, name: &str, arguments: HashMap<String, String>) -> Result<GetPromptResult> {
        self.require(Capability::Prompts)?;
        let value = self
            .session
            .request(methods::PROMPTS_GET, Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        self.require(Capability::Logging)?;
        self.session
            .request(methods::LOGGING_SET_LEVEL, Some(json!({ "level": level })))
            .await?;
        Ok(())
    }

    /// Close the session and transport and clear caches. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let first = !self.disconnected.swap(true, Ordering::SeqCst);
        self.caches().clear();
        if !first {
            return Ok(());
        }
        self.session.close().await?;
        info!(server = %self.name, "Disconnected from MCP server");
        Ok(())
    }

    async fn paginate<P, T>(&self, method: &str, split: impl Fn(P) -> (Vec<T>, Option<String>)) -> Result<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let params = serde_json::to_value(PaginatedParams { cursor: cursor.take() })?;
            let value = self.session.request(method, Some(params)).await?;
            let (mut batch, next) = split(serde_json::from_value(value)?);
            items.append(&mut batch);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        warn!(server = %self.name, method, "Stopped paginating after {} pages", MAX_PAGES);
        Ok(items)
    }
}
