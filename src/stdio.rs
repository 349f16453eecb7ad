//! Stdio transport for local MCP servers.
//!
//! Spawns the server as a child process and exchanges newline-delimited
//! JSON-RPC 2.0 frames over its stdin/stdout:
//!
//! - the host writes one request per line to the child's stdin
//! - a background reader task consumes the child's stdout line by line and
//!   completes the pending request whose id matches each response
//! - the child's stderr is drained to the host log and never interpreted
//!   as protocol
//!
//! Requests may be issued concurrently from any number of callers; writes
//! are serialized behind the stdin lock and each caller awaits its own
//! oneshot completion in the pending map. Responses are matched by id
//! regardless of arrival order. A single malformed stdout line is logged
//! and tolerated; EOF fails every pending request with `Closed`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ServerConfig;
use crate::error::{McpError, Result};
use crate::transport::Transport;
use crate::types::{McpRequest, McpResponse, RequestId};

/// How long `stop` waits for the child to exit after its stdin is closed
/// before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<McpResponse>>>>;

/// Subprocess transport speaking line-delimited JSON-RPC over stdio.
pub struct StdioTransport {
    config: ServerConfig,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Create a transport for the given server configuration.
    ///
    /// The process is not spawned until [`Transport::start`].
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader_task: Mutex::new(None),
            stderr_task: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn write_frame(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| McpError::Closed("stdin not available".to_string()))?;

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            // Broken pipe: the child is gone.
            self.connected.store(false, Ordering::SeqCst);
            return Err(McpError::Closed(format!("write to server failed: {e}")));
        }
        Ok(())
    }

    /// Read the child's stdout until EOF, completing pending requests.
    async fn read_loop(stdout: ChildStdout, pending: PendingMap, connected: Arc<AtomicBool>) {
        let mut lines = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let response: McpResponse = match serde_json::from_str(line) {
                Ok(response) => response,
                Err(e) => {
                    // Malformed single line; keep the connection alive.
                    warn!(error = %e, "invalid JSON line from server");
                    continue;
                }
            };

            match &response.id {
                Some(id) => {
                    let sender = pending.lock().await.remove(id);
                    match sender {
                        // Receiver may have timed out; a late reply is dropped.
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(id = %id, "response matches no pending request, dropping"),
                    }
                }
                None => debug!("server notification, dropping"),
            }
        }

        if connected.swap(false, Ordering::SeqCst) {
            warn!("server closed its stdout");
        }
        // Dropping the senders fails every waiting caller with Closed.
        pending.lock().await.clear();
    }

    /// Drain the child's stderr to the host log.
    async fn stderr_loop(stderr: ChildStderr, server: String) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %server, "server stderr: {line}");
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<()> {
        if self.is_connected() {
            warn!(server = %self.config.name, "transport already started");
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::TransportStart(format!(
                "failed to spawn MCP server '{}' (command: {}): {e}",
                self.config.name, self.config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::TransportStart("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::TransportStart("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::TransportStart("failed to capture stderr".to_string()))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.connected.store(true, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        *self.reader_task.lock().await = Some(tokio::spawn(Self::read_loop(
            stdout, pending, connected,
        )));
        *self.stderr_task.lock().await = Some(tokio::spawn(Self::stderr_loop(
            stderr,
            self.config.name.clone(),
        )));

        info!(
            server = %self.config.name,
            command = %self.config.command,
            "started MCP server"
        );
        Ok(())
    }

    async fn send(&self, request: McpRequest, timeout: Option<Duration>) -> Result<McpResponse> {
        if !self.is_connected() {
            return Err(McpError::Closed("transport not connected".to_string()));
        }

        let line = serde_json::to_string(&request)?;

        // Notifications are written best-effort; no reply is awaited.
        let Some(id) = request.id.clone() else {
            if let Err(e) = self.write_frame(&line).await {
                warn!(method = %request.method, error = %e, "notification write failed");
            }
            return Ok(McpResponse::success(None, serde_json::json!({})));
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.write_frame(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        debug!(method = %request.method, id = %id, "sent MCP request");

        let deadline = timeout.unwrap_or(self.config.timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Closed(
                "connection closed while awaiting response".to_string(),
            )),
            Err(_) => {
                // Deadline elapsed; drop the correlation entry so a late
                // reply is discarded by the reader.
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout(format!(
                    "request timed out: {}",
                    request.method
                )))
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }

        // Fail all pending requests with Closed.
        self.pending.lock().await.clear();

        // Closing stdin is the stdio terminate signal; give the child
        // SHUTDOWN_GRACE to exit on its own before killing it.
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.config.name, status = %status, "server exited")
                }
                Ok(Err(e)) => warn!(server = %self.config.name, error = %e, "wait failed"),
                Err(_) => {
                    warn!(server = %self.config.name, "server did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }

        info!(server = %self.config.name, "MCP server stopped");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
