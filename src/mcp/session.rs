//! Client-side MCP session.
//!
//! A `Session` owns one transport and turns it into request/response calls:
//! it assigns ids, tracks in-flight requests, enforces timeouts, performs the
//! `initialize` handshake once and answers the few requests a server may send
//! to its client (`ping`, `roots/list`).

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::*;
use crate::mcp::transport::{EventSink, Transport, TransportEvent, TransportState};
use crate::VERSION;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    pub request_timeout: Duration,
    /// Roots returned for `roots/list` when the roots capability is declared.
    pub roots: Vec<Root>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("mcp-hub", VERSION),
            capabilities: ClientCapabilities::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            roots: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_roots(mut self, roots: Vec<Root>) -> Self {
        self.capabilities.roots = Some(RootsCapability { list_changed: false });
        self.roots = roots;
        self
    }
}

/// Which server list a `list_changed` notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl ListKind {
    pub fn from_notification(method: &str) -> Option<Self> {
        match method {
            notifications::TOOLS_LIST_CHANGED => Some(Self::Tools),
            notifications::RESOURCES_LIST_CHANGED => Some(Self::Resources),
            notifications::PROMPTS_LIST_CHANGED => Some(Self::Prompts),
            _ => None,
        }
    }
}

pub type NotificationCallback = Arc<dyn Fn(&JsonRpcNotification) + Send + Sync>;
pub type ListChangedCallback = Arc<dyn Fn(ListKind) + Send + Sync>;

struct PendingRequest {
    method: String,
    completion: oneshot::Sender<Result<Value>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingRequest>>,
    handshake: OnceLock<InitializeResult>,
    initializing: AtomicBool,
    closed: AtomicBool,
    started: tokio::sync::Mutex<bool>,
    on_notification: RwLock<Option<NotificationCallback>>,
    on_list_changed: RwLock<Option<ListChangedCallback>>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, id: i64) -> Option<PendingRequest> {
        self.pending().remove(&id)
    }

    /// Reject every outstanding request.
    fn fail_all(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<(i64, PendingRequest)> = self.pending().drain().collect();
        if drained.is_empty() {
            return;
        }
        debug!("Rejecting {} pending request(s)", drained.len());
        for (id, pending) in drained {
            trace!(id, method = %pending.method, "Rejecting pending request");
            let _ = pending.completion.send(Err(make_error()));
        }
    }

    async fn handle_event(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Message(message) => self.handle_message(message).await,
            TransportEvent::Error(error) => {
                warn!(transport = self.transport.kind(), "Transport error: {}", error);
                self.fail_all(|| Error::Transport(error.clone()));
            }
            TransportEvent::Closed => {
                info!(transport = self.transport.kind(), "Transport closed");
                self.closed.store(true, Ordering::SeqCst);
                self.fail_all(|| Error::ConnectionClosed);
                return false;
            }
            TransportEvent::StateChanged(state) => {
                debug!(transport = self.transport.kind(), ?state, "Transport state changed");
            }
        }
        true
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => self.handle_response(response),
            Message::Notification(notification) => self.handle_notification(notification),
            Message::Request(request) => self.handle_request(request).await,
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let id = match response.id {
            RequestId::Number(id) => id,
            ref other => {
                warn!(id = %other, "Dropping response with foreign id");
                return;
            }
        };
        let Some(pending) = self.take_pending(id) else {
            debug!(id, "Dropping response for unknown or expired request");
            return;
        };
        trace!(id, method = %pending.method, "Response received");
        let outcome = response.into_result().map_err(Error::Rpc);
        let _ = pending.completion.send(outcome);
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        if let Some(kind) = ListKind::from_notification(&notification.method) {
            debug!(?kind, "Server list changed");
            let callback = self
                .on_list_changed
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback(kind);
            }
        }

        match notification.method.as_str() {
            notifications::CANCELLED => {
                match notification
                    .params
                    .clone()
                    .map(serde_json::from_value::<CancelledParams>)
                {
                    Some(Ok(cancel)) => info!(
                        request_id = %cancel.request_id,
                        reason = cancel.reason.as_deref().unwrap_or(""),
                        "Server cancelled request"
                    ),
                    _ => warn!("Malformed cancellation notification"),
                }
            }
            notifications::PROGRESS => {
                match notification
                    .params
                    .clone()
                    .map(serde_json::from_value::<ProgressParams>)
                {
                    Some(Ok(progress)) => debug!(
                        token = %progress.progress_token,
                        progress = progress.progress,
                        total = ?progress.total,
                        "Progress"
                    ),
                    _ => warn!("Malformed progress notification"),
                }
            }
            notifications::MESSAGE => {
                info!(params = ?notification.params, "Server log message");
            }
            method => trace!(method, "Notification received"),
        }

        let callback = self
            .on_notification
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&notification);
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        let response = match request.method.as_str() {
            methods::PING => JsonRpcResponse::success(request.id, json!({})),
            methods::ROOTS_LIST if self.options.capabilities.roots.is_some() => {
                JsonRpcResponse::success(request.id, json!({ "roots": self.options.roots }))
            }
            other => {
                debug!(method = other, "Server sent an unsupported request");
                JsonRpcResponse::failure(request.id, JsonRpcError::method_not_found(other))
            }
        };
        if let Err(e) = self.transport.send(&Message::Response(response)).await {
            warn!("Failed to answer server request: {}", e);
        }
    }
}

/// Removes a pending entry however the request future ends.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.take_pending(self.id);
    }
}

/// Per-connection client protocol state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                options,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                handshake: OnceLock::new(),
                initializing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                started: tokio::sync::Mutex::new(false),
                on_notification: RwLock::new(None),
                on_list_changed: RwLock::new(None),
            }),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    pub fn transport_state(&self) -> TransportState {
        self.shared.transport.state()
    }

    /// Observe every notification the server sends.
    pub fn on_notification(&self, callback: NotificationCallback) {
        *self
            .shared
            .on_notification
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Observe `*/list_changed` notifications.
    pub fn on_list_changed(&self, callback: ListChangedCallback) {
        *self
            .shared
            .on_list_changed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Start the transport and the dispatch task. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut started = self.shared.started.lock().await;
        if *started {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (sink, rx) = EventSink::channel();
        tokio::spawn(dispatch_loop(Arc::downgrade(&self.shared), rx));
        self.shared.transport.start(sink).await?;
        *started = true;
        debug!(transport = self.shared.transport.kind(), "Session started");
        Ok(())
    }

    /// Perform the `initialize` handshake. At most once per session.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        if self.shared.handshake.get().is_some()
            || self.shared.initializing.swap(true, Ordering::SeqCst)
        {
            return Err(Error::AlreadyInitialized);
        }

        let outcome = self.handshake().await;
        if outcome.is_err() {
            self.shared.initializing.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn handshake(&self) -> Result<InitializeResult> {
        self.start().await?;

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.shared.options.capabilities.clone(),
            client_info: self.shared.options.client_info.clone(),
        };
        let value = self
            .send_request(methods::INITIALIZE, Some(serde_json::to_value(params)?), self.shared.options.request_timeout)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if !is_supported_version(&result.protocol_version) {
            warn!(version = %result.protocol_version, "Server answered with an unsupported protocol version");
            return Err(Error::UnsupportedProtocolVersion(result.protocol_version));
        }

        let result = self.shared.handshake.get_or_init(|| result).clone();
        self.notify(notifications::INITIALIZED, None).await?;
        info!(
            server = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP session initialized"
        );
        Ok(result)
    }

    /// Send a request using the session's default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.shared.options.request_timeout)
            .await
    }

    /// Send a request and wait for its response.
    ///
    /// Only `initialize` and `ping` may precede the handshake.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if method == methods::INITIALIZE {
            return Err(Error::McpProtocol("use Session::initialize for the handshake".to_string()));
        }
        if method != methods::PING && !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        self.start().await?;
        self.send_request(method, params, timeout).await
    }

    async fn send_request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.shared.pending().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                completion: tx,
            },
        );
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        debug!(id, method, "Sending request");
        let message = Message::Request(JsonRpcRequest::new(RequestId::Number(id), method, params));
        self.shared.transport.send(&message).await?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                if self.shared.take_pending(id).is_some() {
                    warn!(id, method, "Request timed out after {:?}", timeout);
                    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    return Err(Error::timeout(method, millis));
                }
                // Settled while the timer fired.
                rx.try_recv().unwrap_or(Err(Error::ConnectionClosed))
            }
        }
    }

    /// Send a notification. Resolves once the transport accepted it.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let message = Message::Notification(JsonRpcNotification::new(method, params));
        self.shared.transport.send(&message).await
    }

    /// Close the session and its transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.shared.transport.close().await;
        self.shared.fail_all(|| Error::ConnectionClosed);
        debug!("Session closed");
        result
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.handshake.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.shared.handshake.get()
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.initialize_result().map(|r| &r.capabilities)
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.initialize_result().map(|r| &r.server_info)
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.initialize_result().map(|r| r.protocol_version.as_str())
    }

    /// Requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }
}

async fn dispatch_loop(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.handle_event(event).await {
            break;
        }
    }
    trace!("Session dispatch loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::testing::SpyTransport;
    use std::sync::atomic::AtomicUsize;

    fn init_result(version: &str) -> Value {
        json!({
            "protocolVersion": version,
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "spy-server", "version": "0.1.0"}
        })
    }

    fn handshaking_spy(version: &'static str) -> Arc<SpyTransport> {
        Arc::new(SpyTransport::with_responder(move |req| match req.method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(req.id.clone(), init_result(version))),
            _ => None,
        }))
    }

    fn response(id: i64, result: Value) -> Message {
        Message::Response(JsonRpcResponse::success(RequestId::Number(id), result))
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let spy = handshaking_spy(LATEST_PROTOCOL_VERSION);
        let session = Session::new(spy.clone(), SessionOptions::default());

        let result = session.initialize().await.unwrap();
        assert_eq!(result.server_info.name, "spy-server");
        assert!(session.is_initialized());
        assert_eq!(session.protocol_version(), Some(LATEST_PROTOCOL_VERSION));
        assert_eq!(spy.sent_methods(), vec!["initialize", "notifications/initialized"]);

        match &spy.sent()[0] {
            Message::Request(req) => {
                let params = req.params.as_ref().unwrap();
                assert_eq!(params["protocolVersion"], "2024-11-05");
                assert_eq!(params["clientInfo"]["name"], "mcp-hub");
            }
            other => panic!("Expected request, got {:?}", other),
        }

        assert!(matches!(session.initialize().await, Err(Error::AlreadyInitialized)));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_server_version_rejected() {
        let spy = handshaking_spy("1999-01-01");
        let session = Session::new(spy.clone(), SessionOptions::default());

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocolVersion(v) if v == "1999-01-01"));
        assert!(!session.is_initialized());
        assert_eq!(spy.sent_methods(), vec!["initialize"]);
    }

    #[tokio::test]
    async fn test_requests_gated_until_initialized() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());

        let err = session.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        assert_eq!(spy.send_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        session.start().await.unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.request("ping", None).await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.request("ping", None).await }
        });
        while session.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        spy.inject(response(2, json!({"order": "second"})));
        spy.inject(response(1, json!({"order": "first"})));

        assert_eq!(first.await.unwrap().unwrap()["order"], "first");
        assert_eq!(second.await.unwrap().unwrap()["order"], "second");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rpc_error_response() {
        let spy = Arc::new(SpyTransport::with_responder(|req| {
            Some(JsonRpcResponse::failure(req.id.clone(), JsonRpcError::rate_limited(Some(5))))
        }));
        let session = Session::new(spy, SessionOptions::default());

        let err = session.request("ping", None).await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(error_codes::RATE_LIMITED));
        assert!(err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy, SessionOptions::default());
        session.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = session
            .request_with_timeout("ping", None, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { millis: 100, .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_just_before_deadline_resolves() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        session.start().await.unwrap();

        let injector = spy.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(99)).await;
            injector.inject(response(1, json!({"ok": true})));
        });

        let value = session
            .request_with_timeout("ping", None, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_dropped() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        session.start().await.unwrap();

        let err = session
            .request_with_timeout("ping", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        spy.inject(response(1, json!({})));
        tokio::task::yield_now().await;
        assert_eq!(session.pending_count(), 0);

        let injector = spy.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            injector.inject(response(2, json!({"fresh": true})));
        });
        let value = session.request("ping", None).await.unwrap();
        assert_eq!(value["fresh"], true);
    }

    #[tokio::test]
    async fn test_transport_close_rejects_pending() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        session.start().await.unwrap();

        let waiting = tokio::spawn({
            let session = session.clone();
            async move { session.request("ping", None).await }
        });
        while session.pending_count() < 1 {
            tokio::task::yield_now().await;
        }

        spy.drop_connection();
        assert!(waiting.await.unwrap().unwrap_err().is_connection_closed());
        assert_eq!(session.pending_count(), 0);

        while !session.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(session.request("ping", None).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_transport_error_rejects_pending() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        session.start().await.unwrap();

        let waiting = tokio::spawn({
            let session = session.clone();
            async move { session.request("ping", None).await }
        });
        while session.pending_count() < 1 {
            tokio::task::yield_now().await;
        }

        spy.inject_error("pipe burst");
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport(msg) if msg == "pipe burst"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        session.start().await.unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(spy.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_answers_server_ping_and_roots() {
        let spy = Arc::new(SpyTransport::new());
        let options = SessionOptions::default().with_roots(vec![Root {
            uri: "file:///workspace".to_string(),
            name: Some("workspace".to_string()),
        }]);
        let session = Session::new(spy.clone(), options);
        session.start().await.unwrap();

        spy.inject(Message::Request(JsonRpcRequest::new(RequestId::from(40), "ping", None)));
        spy.inject(Message::Request(JsonRpcRequest::new(RequestId::from(41), "roots/list", None)));
        spy.inject(Message::Request(JsonRpcRequest::new(
            RequestId::from(42),
            "sampling/createMessage",
            None,
        )));
        while spy.send_count() < 3 {
            tokio::task::yield_now().await;
        }

        let responses: Vec<JsonRpcResponse> = spy
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Response(res) => Some(res),
                _ => None,
            })
            .collect();
        assert_eq!(responses[0].result, Some(json!({})));
        assert_eq!(responses[1].result.as_ref().unwrap()["roots"][0]["uri"], "file:///workspace");
        assert_eq!(responses[2].error.as_ref().unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_changed_callback() {
        let spy = Arc::new(SpyTransport::new());
        let session = Session::new(spy.clone(), SessionOptions::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        session.on_list_changed(Arc::new(move |kind: ListKind| {
            assert_eq!(kind, ListKind::Tools);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        session.start().await.unwrap();

        spy.inject(Message::Notification(JsonRpcNotification::new(
            notifications::TOOLS_LIST_CHANGED,
            None,
        )));
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
