use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicI64,
    Ordering,
};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use tokio::io::{
    AsyncRead,
    AsyncWriteExt,
};
use tokio::process::{
    Child,
    ChildStdin,
    Command,
};
use tokio::sync::{
    Mutex,
    mpsc,
    oneshot,
};
use tokio::task::JoinHandle;
use tokio_util::codec::{
    FramedRead,
    LinesCodec,
};
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

/// Hard cap on a single newline-delimited frame from the child's stdout.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

/// How long `close` waits for the child to exit before killing it.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<std::sync::Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Command line used to launch an MCP server subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A predicate consulted before spawning the subprocess. Returning false
/// refuses the spawn.
pub type SpawnApproval = dyn Fn(&ServerCommand) -> bool + Send + Sync;

/// JSON-RPC over a subprocess's stdin/stdout with newline-delimited framing.
#[derive(Debug)]
pub struct StdioTransport {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicI64,
    notifications_rx: std::sync::Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
    close_token: CancellationToken,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawns the server subprocess and starts the background receive loop.
    pub fn spawn(config: &ServerCommand, approval: Option<&SpawnApproval>) -> Result<Self, McpError> {
        if let Some(approval) = approval {
            if !approval(config) {
                return Err(McpError::SpawnRefused);
            }
        }

        debug!(command = %config.command, args = ?config.args, "spawning MCP server");
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| McpError::Spawn(err.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("no stdout".to_string()))?;

        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let close_token = CancellationToken::new();
        let recv_task = spawn_receive_loop(stdout, Arc::clone(&pending), notifications_tx, close_token.clone());

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicI64::new(0),
            notifications_rx: std::sync::Mutex::new(Some(notifications_rx)),
            close_token,
            recv_task: std::sync::Mutex::new(Some(recv_task)),
        })
    }

    async fn write_frame(&self, frame: String) -> Result<(), McpError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::Closed)?;
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| McpError::Custom(format!("failed to write to server stdin: {}", err)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| McpError::Custom(format!("failed to write to server stdin: {}", err)))?;
        stdin
            .flush()
            .await
            .map_err(|err| McpError::Custom(format!("failed to flush server stdin: {}", err)))?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
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
        let frame = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock poisoned").insert(id, tx);

        if let Err(err) = self.write_frame(frame).await {
            self.pending.lock().expect("pending lock poisoned").remove(&id);
            return Err(err);
        }

        tokio::select! {
            res = rx => res.map_err(|_| McpError::Closed),
            _ = cancel_token.cancelled() => {
                self.pending.lock().expect("pending lock poisoned").remove(&id);
                Err(McpError::Cancelled)
            },
            _ = self.close_token.cancelled() => {
                self.pending.lock().expect("pending lock poisoned").remove(&id);
                Err(McpError::Closed)
            },
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.close_token.is_cancelled() {
            return Err(McpError::Closed);
        }
        let notification = JsonRpcNotification::new(method, params);
        self.write_frame(serde_json::to_string(&notification)?).await
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

        // Closing stdin signals the server to exit.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "MCP server exited"),
                Ok(Err(err)) => warn!(?err, "failed waiting for MCP server"),
                Err(_) => {
                    warn!("MCP server did not exit in time, killing");
                    let _ = child.kill().await;
                },
            }
        }

        let task = self.recv_task.lock().expect("recv task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Reads newline-delimited JSON objects, dispatching responses to the pending
/// map and forwarding everything else to the notifications channel with a
/// non-blocking send.
fn spawn_receive_loop<R>(
    reader: R,
    pending: PendingMap,
    notifications_tx: mpsc::Sender<JsonRpcNotification>,
    close_token: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        loop {
            let line = tokio::select! {
                _ = close_token.cancelled() => break,
                line = lines.next() => line,
            };
            let Some(line) = line else {
                debug!("MCP server stdout closed");
                break;
            };
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(?err, "dropping unreadable frame from MCP server");
                    continue;
                },
            };
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(err) => {
                    warn!(?err, "dropping non-JSON frame from MCP server");
                    continue;
                },
            };
            match JsonRpcMessage::classify(value) {
                Ok(JsonRpcMessage::Response(response)) if response.id != 0 => {
                    let sender = pending.lock().expect("pending lock poisoned").remove(&response.id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(response);
                        },
                        None => warn!(id = response.id, "received a response with no pending request"),
                    }
                },
                Ok(JsonRpcMessage::Notification(notification)) => {
                    // Dropped on overflow: notifications are best-effort.
                    if notifications_tx.try_send(notification).is_err() {
                        warn!("notification channel full, dropping server notification");
                    }
                },
                Ok(JsonRpcMessage::Response(_) | JsonRpcMessage::Request(_)) => {
                    warn!("dropping unexpected frame from MCP server");
                },
                Err(err) => warn!(?err, "dropping malformed frame from MCP server"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_loop_dispatches_responses_by_id() {
        let (mut client_side, server_side) = tokio::io::duplex(1024);
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (notifications_tx, mut notifications_rx) = mpsc::channel(4);
        let close_token = CancellationToken::new();
        let _task = spawn_receive_loop(server_side, Arc::clone(&pending), notifications_tx, close_token.clone());

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, tx);

        client_side
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n")
            .await
            .unwrap();
        client_side
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n")
            .await
            .unwrap();

        let response = rx.await.unwrap();
        assert_eq!(response.id, 3);
        assert!(pending.lock().unwrap().is_empty());

        let notification = notifications_rx.recv().await.unwrap();
        assert_eq!(notification.method, "notifications/tools/list_changed");

        close_token.cancel();
    }

    #[tokio::test]
    async fn test_receive_loop_skips_garbage() {
        let (mut client_side, server_side) = tokio::io::duplex(1024);
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (notifications_tx, mut notifications_rx) = mpsc::channel(4);
        let close_token = CancellationToken::new();
        let _task = spawn_receive_loop(server_side, pending, notifications_tx, close_token.clone());

        client_side.write_all(b"this is not json\n\n").await.unwrap();
        client_side
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let notification = notifications_rx.recv().await.unwrap();
        assert_eq!(notification.method, "ping");
        close_token.cancel();
    }

    #[tokio::test]
    async fn test_send_after_close_errors() {
        let config = ServerCommand {
            command: "cat".to_string(),
            ..Default::default()
        };
        let transport = StdioTransport::spawn(&config, None).unwrap();
        transport.close().await.unwrap();
        // Idempotent close.
        transport.close().await.unwrap();

        let err = transport
            .send("tools/list", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed));
    }

    #[tokio::test]
    async fn test_spawn_refused_by_approval() {
        let config = ServerCommand {
            command: "cat".to_string(),
            ..Default::default()
        };
        let approval: Box<SpawnApproval> = Box::new(|_| false);
        let err = StdioTransport::spawn(&config, Some(approval.as_ref())).unwrap_err();
        assert!(matches!(err, McpError::SpawnRefused));
    }

    #[tokio::test]
    async fn test_send_cancelled_by_caller() {
        let config = ServerCommand {
            command: "cat".to_string(),
            ..Default::default()
        };
        // cat echoes our request back; it is classified as a request frame and
        // dropped, so the reply never arrives and cancellation must fire.
        let transport = StdioTransport::spawn(&config, None).unwrap();
        let cancel_token = CancellationToken::new();
        let cancel_clone = cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let err = transport.send("tools/list", None, &cancel_token).await.unwrap_err();
        assert!(matches!(err, McpError::Cancelled));
        transport.close().await.unwrap();
    }
}
