//! MCP server implementation.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::connection::{Outbound, ServerConnection};
use crate::mcp::handler::{McpHandler, ToolContext};
use crate::mcp::protocol::*;
use crate::mcp::transport::stdio::{encode_line, MAX_LINE_BYTES};
use crate::metrics::Metrics;
use crate::VERSION;

/// MCP server.
///
/// Holds no per-connection state beyond the initialized connections.
pub struct McpServer {
    handler: Arc<McpHandler>,
    info: Implementation,
    instructions: Option<String>,
    /// Initialized connections, for list-changed broadcasts.
    initialized: DashMap<String, Arc<ServerConnection>>,
    /// In-flight requests, for cancellation logging.
    active_requests: RwLock<HashSet<(String, RequestId)>>,
    metrics: Arc<Metrics>,
}

impl McpServer {
    /// Create a new MCP server.
    pub fn new(handler: McpHandler, name: impl Into<String>) -> Self {
        Self {
            handler: Arc::new(handler),
            info: Implementation::new(name, VERSION),
            instructions: None,
            initialized: DashMap::new(),
            active_requests: RwLock::new(HashSet::new()),
            metrics: Metrics::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn info(&self) -> &Implementation {
        &self.info
    }

    pub fn handler(&self) -> &McpHandler {
        &self.handler
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Capabilities advertised in the `initialize` result.
    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            resources: (self.handler.resource_count() > 0).then(ResourcesCapability::default),
            prompts: None,
            logging: Some(LoggingCapability {}),
            experimental: None,
        }
    }

    pub fn is_initialized(&self, connection_id: &str) -> bool {
        self.initialized.contains_key(connection_id)
    }

    /// Send `notifications/tools/list_changed` to every initialized connection.
    ///
    /// Returns how many connections accepted it.
    pub fn notify_tools_changed(&self) -> usize {
        let notification = Message::Notification(JsonRpcNotification::new(notifications::TOOLS_LIST_CHANGED, None));
        let mut notified = 0;
        for entry in self.initialized.iter() {
            match entry.value().send(notification.clone()) {
                Ok(()) => notified += 1,
                Err(e) => debug!(connection_id = entry.key().as_str(), "Skipping list_changed: {}", e),
            }
        }
        notified
    }

    /// Start the ordered intake for `conn`.
    ///
    /// Messages are taken in arrival order. Notifications and `initialize` finish
    /// before the next message is looked at; other requests run on their own
    /// tasks so a slow tool does not hold the connection up. The intake stops
    /// when the returned sender is dropped or the connection closes.
    pub fn spawn_inbox(self: &Arc<Self>, conn: Arc<ServerConnection>) -> mpsc::UnboundedSender<Value> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                if conn.is_closed() {
                    break;
                }
                let method = raw.get("method").and_then(Value::as_str);
                let concurrent = raw.get("id").is_some() && method.is_some_and(|m| m != methods::INITIALIZE);
                if concurrent {
                    let server = server.clone();
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        server.handle_message(&conn, raw).await;
                    });
                } else {
                    server.handle_message(&conn, raw).await;
                }
            }
            trace!(connection_id = conn.id(), "Inbox closed");
        });
        tx
    }

    /// Forget a connection that went away.
    pub fn connection_closed(&self, connection_id: &str) {
        if self.initialized.remove(connection_id).is_some() {
            debug!(connection_id, "Dropped initialized connection");
        }
    }

    /// Handle one raw JSON text received on `conn`.
    pub async fn handle_text(&self, conn: &Arc<ServerConnection>, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.handle_message(conn, value).await,
            Err(e) => {
                warn!(connection_id = conn.id(), "Unparseable message: {}", e);
                self.reply(conn, JsonRpcResponse::failure(RequestId::Null, JsonRpcError::parse_error(e)));
            }
        }
    }

    /// Handle one decoded JSON value received on `conn`.
    pub async fn handle_message(&self, conn: &Arc<ServerConnection>, raw: Value) {
        let id_hint = raw.get("id").cloned();

        match Message::from_value(raw) {
            Ok(Message::Request(req)) => {
                let response = self.handle_request(conn, req).await;
                self.reply(conn, response);
            }
            Ok(Message::Notification(notif)) => self.handle_notification(conn.id(), notif).await,
            Ok(Message::Response(res)) => {
                debug!(connection_id = conn.id(), id = %res.id, "Ignoring response sent to server");
            }
            Err(MalformedMessage::RequestShaped(id)) => {
                warn!(connection_id = conn.id(), id = %id, "Request without method");
                self.reply(conn, JsonRpcResponse::failure(id, JsonRpcError::invalid_request("missing method")));
            }
            Err(MalformedMessage::InvalidFields(detail)) if id_hint.is_some() => {
                let id = id_hint
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or(RequestId::Null);
                warn!(connection_id = conn.id(), id = %id, "Invalid request: {}", detail);
                self.reply(conn, JsonRpcResponse::failure(id, JsonRpcError::invalid_request(detail)));
            }
            Err(e) => warn!(connection_id = conn.id(), "Ignoring malformed message: {}", e),
        }
    }

    fn reply(&self, conn: &ServerConnection, response: JsonRpcResponse) {
        if let Err(e) = conn.send(Message::Response(response)) {
            warn!(connection_id = conn.id(), "Failed to queue response: {}", e);
        }
    }

    /// Handle a JSON-RPC request, producing exactly one response.
    pub async fn handle_request(&self, conn: &Arc<ServerConnection>, req: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Handling request: {} (id: {}, connection: {})", req.method, req.id, conn.id());
        self.metrics.inc_requests();

        let key = (conn.id().to_string(), req.id.clone());
        self.active_requests.write().await.insert(key.clone());

        let result = self.dispatch(conn, &req).await;

        self.active_requests.write().await.remove(&key);

        match result {
            Ok(value) => JsonRpcResponse::success(req.id, value),
            Err(e) => {
                self.metrics.inc_failed();
                debug!(method = %req.method, "Request failed: {}", e);
                JsonRpcResponse::failure(req.id, e.to_rpc_error())
            }
        }
    }

    async fn dispatch(&self, conn: &Arc<ServerConnection>, req: &JsonRpcRequest) -> Result<Value> {
        let connection_id = conn.id();
        let method = req.method.as_str();
        if method != methods::INITIALIZE && method != methods::PING && !self.is_initialized(connection_id) {
            return Err(Error::NotInitialized);
        }

        let params = req.params.clone();
        match method {
            methods::INITIALIZE => self.handle_initialize(conn, params),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.handle_list_tools().await,
            methods::TOOLS_CALL => self.handle_call_tool(connection_id, params).await,
            methods::RESOURCES_LIST => self.handle_list_resources(),
            methods::RESOURCES_READ => self.handle_read_resource(connection_id, params).await,
            methods::LOGGING_SET_LEVEL => self.handle_set_level(params),
            other => Err(Error::Rpc(JsonRpcError::method_not_found(other))),
        }
    }

    /// Handle a notification.
    async fn handle_notification(&self, connection_id: &str, notif: JsonRpcNotification) {
        debug!("Handling notification: {}", notif.method);
        self.metrics.inc_notifications();

        match notif.method.as_str() {
            notifications::INITIALIZED => {
                info!(connection_id, "Client initialized");
            }
            notifications::CANCELLED => {
                match notif.params.map(serde_json::from_value::<CancelledParams>) {
                    Some(Ok(cancel)) => {
                        let in_flight = self
                            .active_requests
                            .read()
                            .await
                            .contains(&(connection_id.to_string(), cancel.request_id.clone()));
                        info!(
                            connection_id,
                            request_id = %cancel.request_id,
                            reason = cancel.reason.as_deref().unwrap_or(""),
                            in_flight,
                            "Client cancelled request"
                        );
                    }
                    _ => warn!(connection_id, "Malformed cancellation notification"),
                }
            }
            notifications::ROOTS_LIST_CHANGED => {
                info!(connection_id, "Client roots changed");
            }
            _ => {
                debug!("Unknown notification: {}", notif.method);
            }
        }
    }

    /// Handle initialize request.
    fn handle_initialize(&self, conn: &Arc<ServerConnection>, params: Option<Value>) -> Result<Value> {
        let connection_id = conn.id();
        let params: InitializeParams = parse_params(params)?;

        let protocol_version = if is_supported_version(&params.protocol_version) {
            params.protocol_version.clone()
        } else {
            warn!(
                connection_id,
                requested = %params.protocol_version,
                "Unsupported protocol version requested, answering with {}",
                LATEST_PROTOCOL_VERSION
            );
            LATEST_PROTOCOL_VERSION.to_string()
        };

        if self
            .initialized
            .insert(connection_id.to_string(), conn.clone())
            .is_some()
        {
            debug!(connection_id, "Connection re-initialized");
        }
        info!(
            connection_id,
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol = %protocol_version,
            "Initialize"
        );

        let result = InitializeResult {
            protocol_version,
            capabilities: self.capabilities(),
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Handle list tools request.
    async fn handle_list_tools(&self) -> Result<Value> {
        let result = ListToolsResult {
            tools: self.handler.all_tools().await,
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Handle call tool request.
    async fn handle_call_tool(&self, connection_id: &str, params: Option<Value>) -> Result<Value> {
        let has_name = params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .is_some_and(|name| !name.is_empty());
        if !has_name {
            return Err(Error::ToolExecutionFailed("Missing tool name".to_string()));
        }
        let params: CallToolParams = parse_params(params)?;

        let handler = self
            .handler
            .resolve_tool(&params.name)
            .await
            .ok_or_else(|| Error::ToolNotFound(params.name.clone()))?;

        let context = ToolContext::from_meta(params.meta.as_ref(), connection_id);
        let outcome = handler
            .execute(params.arguments, &context)
            .await
            .map_err(|e| {
                warn!(tool = %params.name, "Tool handler failed: {}", e);
                match e {
                    Error::ToolExecutionFailed(_) | Error::ToolNotFound(_) => e,
                    other => Error::ToolExecutionFailed(other.to_string()),
                }
            })?;

        Ok(serde_json::to_value(outcome.into_tool_result())?)
    }

    fn handle_list_resources(&self) -> Result<Value> {
        let result = ListResourcesResult {
            resources: self.handler.list_resources(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_read_resource(&self, connection_id: &str, params: Option<Value>) -> Result<Value> {
        let params: ResourceUriParams = parse_params(params)?;
        let handler = self
            .handler
            .get_resource(&params.uri)
            .ok_or_else(|| Error::ResourceNotFound(params.uri.clone()))?;

        let context = ToolContext::new().with_connection(connection_id);
        let contents = handler.read(&context).await?;
        Ok(serde_json::to_value(ReadResourceResult {
            contents: vec![contents],
        })?)
    }

    fn handle_set_level(&self, params: Option<Value>) -> Result<Value> {
        #[derive(serde::Deserialize)]
        struct SetLevelParams {
            level: LoggingLevel,
        }

        let params: SetLevelParams = parse_params(params)?;
        info!("Client requested log level {:?}", params.level);
        Ok(json!({}))
    }

    /// Serve a single connection over newline-delimited JSON streams.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("Starting MCP server: {} v{}", self.info.name, self.info.version);

        let (conn, mut outbound) = ServerConnection::new(format!("stdio-{}", Uuid::new_v4()));

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = outbound.recv().await {
                let message = match frame {
                    Outbound::Message(message) => message,
                    // No side channel on a byte stream.
                    Outbound::Event { .. } => continue,
                    Outbound::Close => break,
                };
                let bytes = match encode_line(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    error!("Failed to write to stdout: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!("Failed to flush stdout: {}", e);
                    break;
                }
            }
        });

        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            match read_frame(&mut reader, &mut line).await {
                Ok(Frame::Line) => {
                    let text = match std::str::from_utf8(&line) {
                        Ok(text) => text.trim(),
                        Err(e) => {
                            warn!(connection_id = conn.id(), "Frame is not valid UTF-8: {}", e);
                            self.reply(&conn, JsonRpcResponse::failure(RequestId::Null, JsonRpcError::parse_error(e)));
                            continue;
                        }
                    };
                    if text.is_empty() {
                        continue;
                    }
                    trace!("Received: {}", text);
                    self.handle_text(&conn, text).await;
                }
                Ok(Frame::Oversized) => {
                    warn!(connection_id = conn.id(), "Dropped frame over {} bytes", MAX_LINE_BYTES);
                    let detail = format!("frame exceeds {} bytes", MAX_LINE_BYTES);
                    self.reply(&conn, JsonRpcResponse::failure(RequestId::Null, JsonRpcError::parse_error(detail)));
                }
                Ok(Frame::Eof) => {
                    debug!("EOF on stdin, stopping server");
                    break;
                }
                Err(e) => {
                    error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }

        conn.close();
        self.connection_closed(conn.id());
        if let Err(e) = writer_task.await {
            error!("Writer task failed: {}", e);
        }

        info!("MCP server stopped");
        Ok(())
    }

    /// Serve over the process's own stdin/stdout.
    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

enum Frame {
    Line,
    /// Longer than `MAX_LINE_BYTES`; the rest of the line was discarded.
    Oversized,
    Eof,
}

/// Read one newline-terminated frame into `buf` as raw bytes.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_LINE_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= MAX_LINE_BYTES {
        return Ok(Frame::Line);
    }

    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        let newline = chunk.iter().position(|b| *b == b'\n');
        let len = chunk.len();
        match newline {
            Some(pos) => {
                reader.consume(pos + 1);
                break;
            }
            None => reader.consume(len),
        }
    }
    Ok(Frame::Oversized)
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| Error::InvalidToolArguments("Missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| Error::InvalidToolArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::{ResourceHandler, ToolHandler, ToolOutcome};
    use async_trait::async_trait;
    use serde_json::Map;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct LeadTool;

    #[async_trait]
    impl ToolHandler for LeadTool {
        fn definition(&self) -> Tool {
            Tool {
                name: "create_lead".to_string(),
                description: Some("Create a CRM lead".to_string()),
                input_schema: crate::tool_schema! { "name": { "type": "string" } },
            }
        }

        async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutcome> {
            match args.get("name").and_then(Value::as_str) {
                Some("explode") => Err(Error::Internal("database offline".to_string())),
                Some("") => Ok(ToolOutcome::fail("name must not be empty")),
                Some(name) => Ok(ToolOutcome::ok(json!({
                    "lead": name,
                    "org": ctx.org_id,
                    "connection": ctx.connection_id,
                }))),
                None => Ok(ToolOutcome::fail("name is required")),
            }
        }
    }

    struct StatusResource;

    #[async_trait]
    impl ResourceHandler for StatusResource {
        fn definition(&self) -> Resource {
            Resource {
                uri: "mcp-hub://status".to_string(),
                name: "status".to_string(),
                description: None,
                mime_type: Some("text/plain".to_string()),
            }
        }

        async fn read(&self, _ctx: &ToolContext) -> Result<ResourceContents> {
            Ok(ResourceContents {
                uri: "mcp-hub://status".to_string(),
                mime_type: Some("text/plain".to_string()),
                text: Some("ok".to_string()),
                blob: None,
            })
        }
    }

    fn server() -> McpServer {
        let mut handler = McpHandler::new();
        handler.register(LeadTool).unwrap();
        handler.register_resource(StatusResource).unwrap();
        McpServer::new(handler, "test-hub").with_instructions("Use create_lead for leads")
    }

    fn request(id: i64, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    fn initialize_params(version: &str) -> Value {
        json!({
            "protocolVersion": version,
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        })
    }

    fn next_response(rx: &mut UnboundedReceiver<Outbound>) -> JsonRpcResponse {
        match rx.try_recv() {
            Ok(Outbound::Message(Message::Response(res))) => res,
            other => panic!("Expected response, got {:?}", other),
        }
    }

    async fn initialized(server: &McpServer) -> (Arc<ServerConnection>, UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = ServerConnection::new("conn-1");
        server
            .handle_message(&conn, request(1, "initialize", initialize_params(LATEST_PROTOCOL_VERSION)))
            .await;
        let res = next_response(&mut rx);
        assert!(res.error.is_none());
        (conn, rx)
    }

    #[tokio::test]
    async fn test_initialize_advertises_capabilities() {
        let server = server();
        let (conn, mut rx) = ServerConnection::new("conn-1");

        server
            .handle_message(&conn, request(1, "initialize", initialize_params("2024-11-05")))
            .await;
        let res = next_response(&mut rx);
        let result: InitializeResult = serde_json::from_value(res.result.unwrap()).unwrap();

        assert_eq!(result.protocol_version, "2024-11-05");
        assert_eq!(result.capabilities.tools, Some(ToolsCapability { list_changed: true }));
        assert!(result.capabilities.resources.is_some());
        assert_eq!(result.server_info.name, "test-hub");
        assert_eq!(result.instructions.as_deref(), Some("Use create_lead for leads"));
        assert!(server.is_initialized("conn-1"));
    }

    #[tokio::test]
    async fn test_initialize_unknown_version_is_lenient() {
        let server = server();
        let (conn, mut rx) = ServerConnection::new("conn-1");

        server
            .handle_message(&conn, request(1, "initialize", initialize_params("1999-01-01")))
            .await;
        let res = next_response(&mut rx);
        assert_eq!(res.result.unwrap()["protocolVersion"], LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_methods_gated_before_initialize() {
        let server = server();
        let (conn, mut rx) = ServerConnection::new("fresh");

        server.handle_message(&conn, request(1, "tools/list", json!({}))).await;
        let res = next_response(&mut rx);
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_REQUEST);

        server.handle_message(&conn, request(2, "ping", json!({}))).await;
        let res = next_response(&mut rx);
        assert_eq!(res.result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_call_tool_success_and_business_failure() {
        let server = server();
        let (conn, mut rx) = initialized(&server).await;

        let params = json!({
            "name": "create_lead",
            "arguments": {"name": "Ada"},
            "_meta": {"orgId": "org-9", "userId": "u-2"}
        });
        server.handle_message(&conn, request(2, "tools/call", params)).await;
        let result: ToolResult = serde_json::from_value(next_response(&mut rx).result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 1);
        let data: Value = serde_json::from_str(result.first_text().unwrap()).unwrap();
        assert_eq!(data["lead"], "Ada");
        assert_eq!(data["org"], "org-9");
        assert_eq!(data["connection"], "conn-1");

        let params = json!({"name": "create_lead", "arguments": {"name": ""}});
        server.handle_message(&conn, request(3, "tools/call", params)).await;
        let result: ToolResult = serde_json::from_value(next_response(&mut rx).result.unwrap()).unwrap();
        assert!(result.is_error);
        assert_eq!(result.first_text(), Some("name must not be empty"));
    }

    #[tokio::test]
    async fn test_call_tool_errors() {
        let server = server();
        let (conn, mut rx) = initialized(&server).await;

        server
            .handle_message(&conn, request(2, "tools/call", json!({"arguments": {}})))
            .await;
        assert_eq!(
            next_response(&mut rx).error.unwrap().code,
            error_codes::TOOL_EXECUTION_FAILED
        );

        server
            .handle_message(&conn, request(3, "tools/call", json!({"name": "missing_tool"})))
            .await;
        assert_eq!(next_response(&mut rx).error.unwrap().code, error_codes::NOT_FOUND);

        server
            .handle_message(
                &conn,
                request(4, "tools/call", json!({"name": "create_lead", "arguments": {"name": "explode"}})),
            )
            .await;
        let err = next_response(&mut rx).error.unwrap();
        assert_eq!(err.code, error_codes::TOOL_EXECUTION_FAILED);
        assert!(err.message.contains("database offline"));
    }

    #[tokio::test]
    async fn test_resources() {
        let server = server();
        let (conn, mut rx) = initialized(&server).await;

        server.handle_message(&conn, request(2, "resources/list", json!({}))).await;
        let list: ListResourcesResult =
            serde_json::from_value(next_response(&mut rx).result.unwrap()).unwrap();
        assert_eq!(list.resources.len(), 1);

        server
            .handle_message(&conn, request(3, "resources/read", json!({"uri": "mcp-hub://status"})))
            .await;
        let read: ReadResourceResult =
            serde_json::from_value(next_response(&mut rx).result.unwrap()).unwrap();
        assert_eq!(read.contents[0].text.as_deref(), Some("ok"));

        server
            .handle_message(&conn, request(4, "resources/read", json!({"uri": "mcp-hub://nope"})))
            .await;
        assert_eq!(
            next_response(&mut rx).error.unwrap().code,
            error_codes::RESOURCE_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_unknown_method_and_malformed_input() {
        let server = server();
        let (conn, mut rx) = initialized(&server).await;

        server.handle_message(&conn, request(2, "prompts/list", json!({}))).await;
        assert_eq!(next_response(&mut rx).error.unwrap().code, error_codes::METHOD_NOT_FOUND);

        server.handle_message(&conn, json!({"jsonrpc": "2.0", "id": 9})).await;
        let res = next_response(&mut rx);
        assert_eq!(res.id, RequestId::Number(9));
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_REQUEST);

        server.handle_text(&conn, "{not json").await;
        let res = next_response(&mut rx);
        assert_eq!(res.id, RequestId::Null);
        assert_eq!(res.error.unwrap().code, error_codes::PARSE_ERROR);

        // Notifications and stray responses produce nothing.
        server
            .handle_message(&conn, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        server
            .handle_message(&conn, json!({"jsonrpc": "2.0", "id": 5, "result": {}}))
            .await;
        server.handle_message(&conn, json!({"jsonrpc": "2.0"})).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_closed_forgets_initialization() {
        let server = server();
        let (conn, _rx) = initialized(&server).await;
        assert!(server.is_initialized(conn.id()));

        server.connection_closed(conn.id());
        assert!(!server.is_initialized(conn.id()));
    }

    #[tokio::test]
    async fn test_serve_over_streams() {
        let server = Arc::new(server());
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let serving = tokio::spawn(server.serve(server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client);
        let init = request(1, "initialize", initialize_params(LATEST_PROTOCOL_VERSION));
        client_write
            .write_all(format!("{}\n\n{}\n", init, request(2, "tools/list", json!({}))).as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let first: JsonRpcResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id, RequestId::Number(1));
        let second: JsonRpcResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let tools: ListToolsResult = serde_json::from_value(second.result.unwrap()).unwrap();
        assert_eq!(tools.tools[0].name, "create_lead");

        client_write.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_keeps_going_after_bad_frames() {
        let server = Arc::new(server());
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let serving = tokio::spawn(server.serve(server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"\xff\xfe\n").await.unwrap();
        client_write.write_all(b"{not json\n").await.unwrap();
        client_write
            .write_all(format!("{}\n", request(7, "ping", json!({}))).as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        for _ in 0..2 {
            let res: JsonRpcResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(res.id, RequestId::Null);
            assert_eq!(res.error.unwrap().code, error_codes::PARSE_ERROR);
        }
        let pong: JsonRpcResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(pong.id, RequestId::Number(7));
        assert_eq!(pong.result, Some(json!({})));

        client_write.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_discards_oversized_line() {
        let mut wire = vec![b'x'; MAX_LINE_BYTES + 10];
        wire.extend_from_slice(b"\n{\"id\":1}\ntail");
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = Vec::new();

        assert!(matches!(read_frame(&mut reader, &mut buf).await.unwrap(), Frame::Oversized));
        assert!(matches!(read_frame(&mut reader, &mut buf).await.unwrap(), Frame::Line));
        assert_eq!(buf, b"{\"id\":1}\n");
        assert!(matches!(read_frame(&mut reader, &mut buf).await.unwrap(), Frame::Line));
        assert_eq!(buf, b"tail");
        assert!(matches!(read_frame(&mut reader, &mut buf).await.unwrap(), Frame::Eof));
    }

    async fn hub() -> (Arc<McpServer>, Arc<crate::registry::ToolRegistry>) {
        let registry = Arc::new(crate::registry::ToolRegistry::new("hub"));
        crate::tools::register_builtin_tools(&registry).await.unwrap();
        let mut handler = McpHandler::new();
        crate::tools::expose_registry(&mut handler, registry.clone()).await.unwrap();
        let server = Arc::new(McpServer::new(handler, "hub"));
        crate::tools::announce_tool_changes(&registry, &server);
        (server, registry)
    }

    #[tokio::test]
    async fn test_registry_tool_failure_is_execution_error() {
        let (server, registry) = hub().await;
        registry.register_internal(LeadTool).await.unwrap();
        let (conn, mut rx) = initialized(&server).await;
        while rx.try_recv().is_ok() {}

        server
            .handle_message(&conn, request(2, "tools/call", json!({"name": "hub_echo", "arguments": {}})))
            .await;
        let err = next_response(&mut rx).error.unwrap();
        assert_eq!(err.code, error_codes::TOOL_EXECUTION_FAILED);
        assert!(err.message.contains("Missing required argument: message"));

        let params = json!({"name": "hub_create_lead", "arguments": {"name": "explode"}});
        server.handle_message(&conn, request(3, "tools/call", params)).await;
        let err = next_response(&mut rx).error.unwrap();
        assert_eq!(err.code, error_codes::TOOL_EXECUTION_FAILED);
        assert!(err.message.contains("database offline"));

        // A reported failure is still a result.
        let params = json!({"name": "hub_create_lead", "arguments": {"name": ""}});
        server.handle_message(&conn, request(4, "tools/call", params)).await;
        let result: ToolResult = serde_json::from_value(next_response(&mut rx).result.unwrap()).unwrap();
        assert!(result.is_error);
        assert_eq!(result.first_text(), Some("name must not be empty"));
    }

    #[tokio::test]
    async fn test_registry_changes_announced_to_initialized_connections() {
        let (server, registry) = hub().await;
        let (conn, mut rx) = initialized(&server).await;
        let (_idle, mut idle_rx) = ServerConnection::new("idle");

        registry.register_internal(LeadTool).await.unwrap();
        match rx.try_recv() {
            Ok(Outbound::Message(Message::Notification(n))) => {
                assert_eq!(n.method, notifications::TOOLS_LIST_CHANGED)
            }
            other => panic!("Expected list_changed, got {:?}", other),
        }
        assert!(idle_rx.try_recv().is_err());

        server.handle_message(&conn, request(2, "tools/list", json!({}))).await;
        let tools: ListToolsResult = serde_json::from_value(next_response(&mut rx).result.unwrap()).unwrap();
        let names: Vec<_> = tools.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["hub_create_lead", "hub_echo", "hub_time"]);

        server.connection_closed(conn.id());
        assert_eq!(server.notify_tools_changed(), 0);
    }

    #[tokio::test]
    async fn test_inbox_handles_messages_in_order() {
        let server = Arc::new(server());
        let (conn, mut rx) = ServerConnection::new("inbox");
        let inbox = server.spawn_inbox(conn.clone());

        inbox
            .send(request(1, "initialize", initialize_params(LATEST_PROTOCOL_VERSION)))
            .unwrap();
        inbox
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .unwrap();
        inbox.send(request(2, "tools/list", json!({}))).unwrap();

        let mut ids = Vec::new();
        while ids.len() < 2 {
            match rx.recv().await {
                Some(Outbound::Message(Message::Response(res))) => {
                    assert!(res.error.is_none(), "{:?}", res.error);
                    ids.push(res.id);
                }
                other => panic!("Unexpected frame {:?}", other),
            }
        }
        assert_eq!(ids, vec![RequestId::Number(1), RequestId::Number(2)]);
        assert_eq!(server.metrics().snapshot().notifications_total, 1);
    }
}
