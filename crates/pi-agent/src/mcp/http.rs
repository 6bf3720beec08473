use std::sync::atomic::{
    AtomicI64,
    Ordering,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

use super::McpError;
use super::McpTransport;
use super::protocol::{
    JsonRpcMessage,
    JsonRpcNotification,
    JsonRpcRequest,
    JsonRpcResponse,
};

/// Session-continuation header used by streamable-HTTP servers.
const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Hard cap on a single SSE line.
const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpServerConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// JSON-RPC over MCP "Streamable HTTP": requests are POSTs whose responses
/// arrive either as plain JSON or as a short-lived SSE stream; a background
/// GET stream carries server-initiated notifications.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpServerConfig,
    session_id: std::sync::Mutex<Option<String>>,
    next_id: AtomicI64,
    notifications_tx: std::sync::Mutex<Option<mpsc::Sender<JsonRpcNotification>>>,
    notifications_rx: std::sync::Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
    close_token: CancellationToken,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(config: HttpServerConfig) -> Self {
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            client: reqwest::Client::new(),
            config,
            session_id: std::sync::Mutex::new(None),
            next_id: AtomicI64::new(0),
            notifications_tx: std::sync::Mutex::new(Some(notifications_tx)),
            notifications_rx: std::sync::Mutex::new(Some(notifications_rx)),
            close_token: CancellationToken::new(),
            listener: std::sync::Mutex::new(None),
        }
    }

    /// Opens the background GET stream for server-initiated notifications.
    pub fn start_listener(&self) {
        let mut guard = self.listener.lock().expect("listener lock poisoned");
        if guard.is_some() || self.close_token.is_cancelled() {
            return;
        }
        let client = self.client.clone();
        let config = self.config.clone();
        let session_id = self.current_session_id();
        let close_token = self.close_token.clone();
        let notifications_tx = self
            .notifications_tx
            .lock()
            .expect("notifications lock poisoned")
            .clone();
        *guard = Some(tokio::spawn(async move {
            run_sse_listener(client, config, session_id, notifications_tx, close_token).await;
        }));
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session lock poisoned").clone()
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(SESSION_ID_HEADER) {
            if let Ok(value) = value.to_str() {
                let mut guard = self.session_id.lock().expect("session lock poisoned");
                if guard.as_deref() != Some(value) {
                    debug!(session_id = value, "captured MCP session id");
                    *guard = Some(value.to_string());
                }
            }
        }
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(session_id) = self.current_session_id() {
            builder = builder.header(SESSION_ID_HEADER, session_id);
        }
        builder
    }

    fn forward_notification(&self, notification: JsonRpcNotification) {
        // Gated on the close signal so a late SSE frame never lands on a
        // receiver being torn down.
        if self.close_token.is_cancelled() {
            return;
        }
        let guard = self.notifications_tx.lock().expect("notifications lock poisoned");
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(notification).is_err() {
                warn!("notification channel full, dropping server notification");
            }
        }
    }

    /// Drains an SSE response body until a JSON-RPC response with the given id
    /// arrives; other frames are forwarded as notifications.
    async fn read_sse_response(
        &self,
        response: reqwest::Response,
        id: i64,
        cancel_token: &CancellationToken,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new(MAX_SSE_LINE_BYTES);
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel_token.cancelled() => return Err(McpError::Cancelled),
                _ = self.close_token.cancelled() => return Err(McpError::Closed),
            };
            let Some(chunk) = chunk else {
                return Err(McpError::Frame("event stream ended without a response".to_string()));
            };
            let chunk = chunk.map_err(|err| McpError::Http(err.to_string()))?;
            for event in parser.feed(&chunk) {
                let Ok(value) = serde_json::from_str::<Value>(&event) else {
                    warn!("dropping non-JSON SSE event");
                    continue;
                };
                match JsonRpcMessage::classify(value) {
                    Ok(JsonRpcMessage::Response(response)) if response.id == id => return Ok(response),
                    Ok(JsonRpcMessage::Notification(notification)) => self.forward_notification(notification),
                    Ok(_) => warn!("dropping unexpected SSE frame"),
                    Err(err) => warn!(?err, "dropping malformed SSE frame"),
                }
            }
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        cancel_token: &CancellationToken,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.close_token.is_cancelled() {
            return Err(McpError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::new(id, method, params);

        let builder = self
            .apply_headers(self.client.post(&self.config.url))
            .header(reqwest::header::ACCEPT, ACCEPT_BOTH)
            .json(&request);

        let response = tokio::select! {
            res = builder.send() => res.map_err(|err| McpError::Http(err.to_string()))?,
            _ = cancel_token.cancelled() => return Err(McpError::Cancelled),
            _ = self.close_token.cancelled() => return Err(McpError::Closed),
        };
        self.capture_session_id(&response);

        if !response.status().is_success() {
            return Err(McpError::Http(format!("server returned status {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            self.read_sse_response(response, id, cancel_token).await
        } else {
            let body = response.bytes().await.map_err(|err| McpError::Http(err.to_string()))?;
            Ok(serde_json::from_slice(&body)?)
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.close_token.is_cancelled() {
            return Err(McpError::Closed);
        }
        let notification = JsonRpcNotification::new(method, params);
        let response = self
            .apply_headers(self.client.post(&self.config.url))
            .json(&notification)
            .send()
            .await
            .map_err(|err| McpError::Http(err.to_string()))?;
        self.capture_session_id(&response);
        // Body is drained and discarded.
        let _ = response.bytes().await;
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.notifications_rx
            .lock()
            .expect("notifications lock poisoned")
            .take()
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.close_token.is_cancelled() {
            return Ok(());
        }
        self.close_token.cancel();

        let listener = self.listener.lock().expect("listener lock poisoned").take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }

        if let Some(session_id) = self.current_session_id() {
            let mut builder = self.client.delete(&self.config.url).header(SESSION_ID_HEADER, session_id);
            if let Some(token) = &self.config.bearer_token {
                builder = builder.bearer_auth(token);
            }
            if let Err(err) = builder.send().await {
                debug!(?err, "failed to delete MCP session");
            }
        }

        // Dropping the sender closes the notification channel for consumers.
        self.notifications_tx
            .lock()
            .expect("notifications lock poisoned")
            .take();
        Ok(())
    }
}

async fn run_sse_listener(
    client: reqwest::Client,
    config: HttpServerConfig,
    session_id: Option<String>,
    notifications_tx: Option<mpsc::Sender<JsonRpcNotification>>,
    close_token: CancellationToken,
) {
    let Some(notifications_tx) = notifications_tx else {
        return;
    };

    let mut builder = client
        .get(&config.url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(token) = &config.bearer_token {
        builder = builder.bearer_auth(token);
    }
    if let Some(session_id) = session_id {
        builder = builder.header(SESSION_ID_HEADER, session_id);
    }

    let response = tokio::select! {
        res = builder.send() => res,
        _ = close_token.cancelled() => return,
    };
    let response = match response {
        Ok(res) if res.status().is_success() => res,
        Ok(res) => {
            debug!(status = %res.status(), "server does not offer an SSE notification stream");
            return;
        },
        Err(err) => {
            debug!(?err, "failed to open SSE notification stream");
            return;
        },
    };

    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new(MAX_SSE_LINE_BYTES);
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = close_token.cancelled() => break,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let Ok(chunk) = chunk else {
            break;
        };
        for event in parser.feed(&chunk) {
            if close_token.is_cancelled() {
                return;
            }
            let Ok(value) = serde_json::from_str::<Value>(&event) else {
                continue;
            };
            if let Ok(JsonRpcMessage::Notification(notification)) = JsonRpcMessage::classify(value) {
                if notifications_tx.try_send(notification).is_err() {
                    warn!("notification channel full, dropping server notification");
                }
            }
        }
    }
    debug!("SSE notification listener exited");
}

/// Incremental server-sent-events parser.
///
/// `data:` lines accumulate until a blank-line boundary completes the event.
/// Lines longer than the cap are discarded whole.
#[derive(Debug)]
pub struct SseParser {
    max_line_bytes: usize,
    line_buf: Vec<u8>,
    data_buf: Vec<String>,
    skipping_oversize_line: bool,
}

impl SseParser {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            line_buf: Vec::new(),
            data_buf: Vec::new(),
            skipping_oversize_line: false,
        }
    }

    /// Feeds a chunk of the stream, returning any events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut events = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                if self.skipping_oversize_line {
                    self.skipping_oversize_line = false;
                    self.line_buf.clear();
                    continue;
                }
                let line = String::from_utf8_lossy(&self.line_buf).into_owned();
                self.line_buf.clear();
                if let Some(event) = self.take_line(line.trim_end_matches('\r')) {
                    events.push(event);
                }
            } else {
                if self.line_buf.len() >= self.max_line_bytes {
                    if !self.skipping_oversize_line {
                        warn!("SSE line exceeds the size cap, discarding");
                        self.skipping_oversize_line = true;
                    }
                    continue;
                }
                self.line_buf.push(*byte);
            }
        }
        events
    }

    fn take_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data_buf.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data_buf).join("\n"));
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_buf.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // Other fields (event:, id:, retry:) and comments are ignored.
        None
    }
}
