//! Server registry: the fleet layer.
//!
//! [`ServerRegistry`] owns the table of registered MCP servers and their
//! lifecycle state machines, orchestrates connect/disconnect fan-out and
//! reconnection with exponential backoff, aggregates the tool catalog
//! across connected servers, and emits a status event on every transition.
//! It is the single entry point higher layers use.
//!
//! Lifecycle per server:
//!
//! ```text
//! REGISTERED -> CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED
//!                    \                                           /
//!                     `-> ERROR <------ RECONNECTING <----------'
//! ```
//!
//! Permission checks run strictly before any tool dispatch and every
//! registry-initiated tool invocation emits one audit event; both hooks are
//! optional constructor dependencies.
//!
//! The server table lives behind a synchronous `RwLock`: state inspection
//! (`get_all_tools`, `find_tool`, `get_server`) never suspends, and no
//! guard is ever held across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEventType, AuditLogger};
use crate::client::{McpClient, ServerConfig};
use crate::permissions::{PermissionLevel, PermissionManager};
use crate::transport::Transport;
use crate::types::{ToolResult, ToolSchema};

/// Connection status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Registered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    Reconnecting,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }

    const ALL: [ServerStatus; 7] = [
        Self::Registered,
        Self::Connecting,
        Self::Connected,
        Self::Disconnecting,
        Self::Disconnected,
        Self::Error,
        Self::Reconnecting,
    ];
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered MCP server: static configuration plus runtime state.
///
/// Owned exclusively by the registry; `tools` is empty unless the status is
/// `Connected`, and `retry_count` resets to 0 on every successful connect.
#[derive(Debug, Clone)]
pub struct RegisteredServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub transport: String,
    pub timeout: Duration,
    pub enabled: bool,
    pub cwd: Option<std::path::PathBuf>,

    // Runtime state
    pub status: ServerStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub tools: Vec<ToolSchema>,
}

impl RegisteredServer {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            transport: "stdio".to_string(),
            timeout: Duration::from_secs(30),
            enabled: true,
            cwd: None,
            status: ServerStatus::Registered,
            last_connected_at: None,
            last_error: None,
            retry_count: 0,
            tools: Vec::new(),
        }
    }

    /// Client-facing connection config for this server.
    pub fn to_config(&self) -> ServerConfig {
        ServerConfig {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            transport: self.transport.clone(),
            timeout: self.timeout,
            cwd: self.cwd.clone(),
        }
    }
}

/// Caller identity attached to a tool invocation, consulted by the
/// permission manager and recorded in audit events.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
}

/// Async handler invoked on every status transition with
/// `(server_name, new_status)`.
pub type EventHandler = Arc<dyn Fn(String, ServerStatus) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(String, ServerStatus) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |name, status| f(name, status).boxed())
}

/// Factory producing a transport for a server, used to inject in-memory
/// transports in tests (mirrors `McpClient::connect`'s override).
pub type TransportFactory = Arc<dyn Fn(&RegisteredServer) -> Arc<dyn Transport> + Send + Sync>;

/// The server table: records plus registration order, guarded together so
/// first-match tool routing follows registration order.
#[derive(Default)]
struct ServerTable {
    servers: HashMap<String, RegisteredServer>,
    order: Vec<String>,
}

/// Central registry for a fleet of MCP servers.
#[derive(Clone)]
pub struct ServerRegistry {
    table: Arc<RwLock<ServerTable>>,
    client: McpClient,
    max_retries: u32,
    retry_delay: Duration,
    event_handlers: Arc<RwLock<Vec<EventHandler>>>,
    reconnect_tasks: Arc<Mutex<HashMap<String, JoinHandle<bool>>>>,
    shutdown: CancellationToken,
    shutdown_started: Arc<AtomicBool>,
    permissions: Option<Arc<PermissionManager>>,
    audit: Option<AuditLogger>,
    transport_factory: Option<TransportFactory>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl ServerRegistry {
    /// Create a registry.
    ///
    /// `max_retries` bounds `reconnect` attempts; `retry_delay` is the
    /// backoff base (doubled after each failed attempt).
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            table: Arc::new(RwLock::new(ServerTable::default())),
            client: McpClient::new(),
            max_retries,
            retry_delay,
            event_handlers: Arc::new(RwLock::new(Vec::new())),
            reconnect_tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            shutdown_started: Arc::new(AtomicBool::new(false)),
            permissions: None,
            audit: None,
            transport_factory: None,
        }
    }

    /// Attach a permission manager consulted before every tool dispatch.
    pub fn with_permissions(mut self, permissions: Arc<PermissionManager>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Attach an audit logger recording every tool invocation and server
    /// lifecycle event.
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Override transport construction (tests wire in-memory transports
    /// through this).
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// The embedded client (per-server sessions).
    pub fn client(&self) -> &McpClient {
        &self.client
    }

    /// Register a new server.
    ///
    /// Fails if the name is already registered or empty/oversized. When
    /// `connect` is set and the server is enabled, a connection attempt is
    /// made before returning.
    pub async fn register(&self, server: RegisteredServer, connect: bool) -> bool {
        if server.name.is_empty() || server.name.len() > 64 {
            warn!(server = %server.name, "invalid server name (must be 1..=64 chars)");
            return false;
        }

        let name = server.name.clone();
        let enabled = server.enabled;
        {
            let mut table = self.table.write().expect("server table poisoned");
            if table.servers.contains_key(&name) {
                warn!(server = %name, "server already registered");
                return false;
            }
            table.servers.insert(name.clone(), server);
            table.order.push(name.clone());
        }
        info!(server = %name, "registered MCP server");

        if connect && enabled {
            self.connect(&name).await;
        }
        true
    }

    /// Unregister a server: disconnect if connected, cancel any pending
    /// reconnection task, and remove the record.
    pub async fn unregister(&self, server_name: &str) -> bool {
        let status = match self.get_server(server_name) {
            Some(server) => server.status,
            None => {
                warn!(server = %server_name, "server not registered");
                return false;
            }
        };

        if status == ServerStatus::Connected {
            self.disconnect(server_name).await;
        }

        if let Some(task) = self
            .reconnect_tasks
            .lock()
            .expect("reconnect tasks poisoned")
            .remove(server_name)
        {
            task.abort();
        }

        {
            let mut table = self.table.write().expect("server table poisoned");
            table.servers.remove(server_name);
            table.order.retain(|n| n != server_name);
        }
        info!(server = %server_name, "unregistered MCP server");
        true
    }

    /// Connect to a registered server.
    ///
    /// Transitions `-> CONNECTING`, delegates to the embedded client, and
    /// on success records `last_connected_at`, resets `retry_count`, caches
    /// the tool catalog, and transitions `-> CONNECTED`. On failure records
    /// `last_error` and transitions `-> ERROR`. Emits a status event at
    /// every transition. Concurrent calls for one name start at most one
    /// transport; the later caller observes the in-flight attempt and
    /// returns success.
    pub async fn connect(&self, server_name: &str) -> bool {
        let (config, snapshot) = {
            let mut table = self.table.write().expect("server table poisoned");
            let Some(server) = table.servers.get_mut(server_name) else {
                error!(server = %server_name, "server not registered");
                return false;
            };
            match server.status {
                ServerStatus::Connected => {
                    debug!(server = %server_name, "server already connected");
                    return true;
                }
                ServerStatus::Connecting => {
                    debug!(server = %server_name, "connect already in progress");
                    return true;
                }
                _ => server.status = ServerStatus::Connecting,
            }
            (server.to_config(), server.clone())
        };
        self.emit_event(server_name, ServerStatus::Connecting).await;

        let transport = self.transport_factory.as_ref().map(|f| f(&snapshot));
        let result = self.client.connect(config, transport).await;

        match result {
            Ok(()) => {
                let tools = self
                    .client
                    .list_tools(Some(server_name), false)
                    .await
                    .remove(server_name)
                    .unwrap_or_default();
                let tool_count = tools.len();
                {
                    let mut table = self.table.write().expect("server table poisoned");
                    if let Some(server) = table.servers.get_mut(server_name) {
                        server.status = ServerStatus::Connected;
                        server.last_connected_at = Some(Utc::now());
                        server.last_error = None;
                        server.retry_count = 0;
                        server.tools = tools;
                    }
                }
                self.emit_event(server_name, ServerStatus::Connected).await;
                self.audit_server_event(AuditEventType::ServerConnect, server_name, None)
                    .await;
                info!(server = %server_name, tools = tool_count, "connected to MCP server");
                true
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut table = self.table.write().expect("server table poisoned");
                    if let Some(server) = table.servers.get_mut(server_name) {
                        server.status = ServerStatus::Error;
                        server.last_error = Some(message.clone());
                    }
                }
                self.emit_event(server_name, ServerStatus::Error).await;
                self.audit_server_event(AuditEventType::ServerError, server_name, Some(&message))
                    .await;
                error!(server = %server_name, error = %message, "failed to connect");
                false
            }
        }
    }

    /// Disconnect from a server, clearing its cached tools.
    pub async fn disconnect(&self, server_name: &str) -> bool {
        {
            let mut table = self.table.write().expect("server table poisoned");
            let Some(server) = table.servers.get_mut(server_name) else {
                warn!(server = %server_name, "server not registered");
                return false;
            };
            if server.status != ServerStatus::Connected {
                debug!(server = %server_name, "server not connected");
                return true;
            }
            server.status = ServerStatus::Disconnecting;
        }
        self.emit_event(server_name, ServerStatus::Disconnecting)
            .await;

        match self.client.disconnect(server_name).await {
            Ok(()) => {
                {
                    let mut table = self.table.write().expect("server table poisoned");
                    if let Some(server) = table.servers.get_mut(server_name) {
                        server.status = ServerStatus::Disconnected;
                        server.tools.clear();
                    }
                }
                self.emit_event(server_name, ServerStatus::Disconnected)
                    .await;
                self.audit_server_event(AuditEventType::ServerDisconnect, server_name, None)
                    .await;
                info!(server = %server_name, "disconnected from MCP server");
                true
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut table = self.table.write().expect("server table poisoned");
                    if let Some(server) = table.servers.get_mut(server_name) {
                        server.status = ServerStatus::Error;
                        server.last_error = Some(message.clone());
                    }
                }
                self.emit_event(server_name, ServerStatus::Error).await;
                error!(server = %server_name, error = %message, "error disconnecting");
                false
            }
        }
    }

    /// Concurrently connect every enabled server.
    ///
    /// Returns a per-name success map; non-enabled servers are reported as
    /// `false` but not attempted.
    pub async fn connect_all(&self) -> HashMap<String, bool> {
        let (enabled, disabled): (Vec<String>, Vec<String>) = {
            let table = self.table.read().expect("server table poisoned");
            let mut enabled = Vec::new();
            let mut disabled = Vec::new();
            for name in &table.order {
                if table.servers[name].enabled {
                    enabled.push(name.clone());
                } else {
                    disabled.push(name.clone());
                }
            }
            (enabled, disabled)
        };

        let attempts = join_all(enabled.iter().map(|name| self.connect(name))).await;

        let mut results: HashMap<String, bool> =
            enabled.into_iter().zip(attempts).collect();
        for name in disabled {
            results.insert(name, false);
        }
        results
    }

    /// Disconnect every connected server.
    pub async fn disconnect_all(&self) -> HashMap<String, bool> {
        let names: Vec<(String, ServerStatus)> = {
            let table = self.table.read().expect("server table poisoned");
            table
                .order
                .iter()
                .map(|n| (n.clone(), table.servers[n].status))
                .collect()
        };

        let mut results = HashMap::new();
        for (name, status) in names {
            if status == ServerStatus::Connected {
                results.insert(name.clone(), self.disconnect(&name).await);
            } else {
                results.insert(name, true);
            }
        }
        results
    }

    /// Reconnect to a server with exponential backoff.
    ///
    /// Makes up to `max_retries` attempts, sleeping
    /// `retry_delay * 2^(attempt-1)` after each failure. Returns on the
    /// first success; otherwise the server is left in `ERROR`. A registry
    /// shutdown short-circuits the loop, including mid-sleep.
    pub async fn reconnect(&self, server_name: &str, force: bool) -> bool {
        let status = match self.get_server(server_name) {
            Some(server) => server.status,
            None => return false,
        };

        if force && status == ServerStatus::Connected {
            self.disconnect(server_name).await;
        }

        {
            let mut table = self.table.write().expect("server table poisoned");
            if let Some(server) = table.servers.get_mut(server_name) {
                server.status = ServerStatus::Reconnecting;
            }
        }
        self.emit_event(server_name, ServerStatus::Reconnecting)
            .await;

        let mut delay = self.retry_delay;
        for attempt in 1..=self.max_retries {
            if self.shutdown.is_cancelled() {
                return false;
            }

            {
                let mut table = self.table.write().expect("server table poisoned");
                if let Some(server) = table.servers.get_mut(server_name) {
                    server.retry_count = attempt;
                }
            }

            if self.connect(server_name).await {
                return true;
            }

            info!(
                server = %server_name,
                attempt,
                max = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "reconnect attempt failed, backing off"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }

        error!(
            server = %server_name,
            attempts = self.max_retries,
            "failed to reconnect, giving up"
        );
        false
    }

    /// Run [`ServerRegistry::reconnect`] as a tracked background task.
    ///
    /// The task is cancelled by `unregister` and `shutdown`.
    pub fn spawn_reconnect(&self, server_name: &str) {
        let registry = self.clone();
        let name = server_name.to_string();
        let handle = tokio::spawn(async move { registry.reconnect(&name, false).await });

        let mut tasks = self
            .reconnect_tasks
            .lock()
            .expect("reconnect tasks poisoned");
        if let Some(previous) = tasks.insert(server_name.to_string(), handle) {
            previous.abort();
        }
    }

    /// A registered server's record.
    pub fn get_server(&self, server_name: &str) -> Option<RegisteredServer> {
        self.table
            .read()
            .expect("server table poisoned")
            .servers
            .get(server_name)
            .cloned()
    }

    /// All registered servers, in registration order.
    pub fn servers(&self) -> Vec<RegisteredServer> {
        let table = self.table.read().expect("server table poisoned");
        table
            .order
            .iter()
            .map(|n| table.servers[n].clone())
            .collect()
    }

    /// Names of servers currently in `CONNECTED` state.
    pub fn connected_servers(&self) -> Vec<String> {
        let table = self.table.read().expect("server table poisoned");
        table
            .order
            .iter()
            .filter(|n| table.servers[*n].status == ServerStatus::Connected)
            .cloned()
            .collect()
    }

    /// The tool catalog: server name to cached schemas, restricted to
    /// `CONNECTED` servers.
    pub fn get_all_tools(&self) -> HashMap<String, Vec<ToolSchema>> {
        let table = self.table.read().expect("server table poisoned");
        table
            .servers
            .iter()
            .filter(|(_, s)| s.status == ServerStatus::Connected)
            .map(|(name, s)| (name.clone(), s.tools.clone()))
            .collect()
    }

    /// First-match tool lookup, optionally restricted to one server.
    pub fn find_tool(&self, tool_name: &str, server_name: Option<&str>) -> Option<ToolSchema> {
        let table = self.table.read().expect("server table poisoned");
        let mut candidates = table.order.iter().filter_map(|n| table.servers.get(n));
        match server_name {
            Some(wanted) => candidates
                .find(|s| s.name == wanted)
                .and_then(|s| s.tools.iter().find(|t| t.name == tool_name).cloned()),
            None => candidates
                .find_map(|s| s.tools.iter().find(|t| t.name == tool_name).cloned()),
        }
    }

    /// Call a tool with an anonymous caller context.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
        server_name: Option<&str>,
    ) -> ToolResult {
        self.call_tool_with_context(tool_name, arguments, server_name, &CallContext::default())
            .await
    }

    /// Call a tool, bracketed by the permission check and audit trail.
    ///
    /// When `server_name` is given the call routes to that server;
    /// otherwise connected servers are scanned in registration order and
    /// the first one whose cached catalog contains the tool is used. A
    /// permission denial produces a failed `ToolResult` and an
    /// `ACCESS_DENIED` audit event without contacting the server.
    pub async fn call_tool_with_context(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
        server_name: Option<&str>,
        context: &CallContext,
    ) -> ToolResult {
        let target = match server_name {
            Some(name) => Some(name.to_string()),
            None => {
                let table = self.table.read().expect("server table poisoned");
                table
                    .order
                    .iter()
                    .filter_map(|n| table.servers.get(n))
                    .find(|s| {
                        s.status == ServerStatus::Connected
                            && s.tools.iter().any(|t| t.name == tool_name)
                    })
                    .map(|s| s.name.clone())
            }
        };

        let Some(target) = target else {
            return ToolResult::failure(format!("Tool not found: {tool_name}"));
        };

        if let Some(permissions) = &self.permissions {
            let allowed = permissions.check_permission(
                context.user_id.as_deref(),
                &context.roles,
                &target,
                tool_name,
                PermissionLevel::Execute,
                &context_map(context),
            );
            if !allowed {
                if let Some(audit) = &self.audit {
                    audit
                        .log_access(
                            context.user_id.as_deref().unwrap_or("anonymous"),
                            &target,
                            tool_name,
                            false,
                            Some("permission denied"),
                        )
                        .await;
                }
                return ToolResult::failure(format!(
                    "permission denied: {target}/{tool_name}"
                ))
                .with_metadata(&target, tool_name);
            }
        }

        let started = std::time::Instant::now();
        let result = self
            .client
            .call_tool(&target, tool_name, arguments.clone(), None)
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Some(audit) = &self.audit {
            audit
                .log_tool_execution(
                    context.user_id.as_deref().unwrap_or("anonymous"),
                    &target,
                    tool_name,
                    arguments,
                    if result.success { "success" } else { "failure" },
                    result.error.clone(),
                    Some(duration_ms),
                )
                .await;
        }

        result
    }

    /// Register a status-transition event handler.
    ///
    /// Handlers run sequentially per transition; a panicking handler is
    /// logged and does not abort the transition.
    pub fn add_event_handler(&self, handler: EventHandler) {
        self.event_handlers
            .write()
            .expect("event handlers poisoned")
            .push(handler);
    }

    /// Remove a previously registered handler (matched by identity).
    pub fn remove_event_handler(&self, handler: &EventHandler) {
        self.event_handlers
            .write()
            .expect("event handlers poisoned")
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    async fn emit_event(&self, server_name: &str, status: ServerStatus) {
        let handlers: Vec<EventHandler> = self
            .event_handlers
            .read()
            .expect("event handlers poisoned")
            .clone();

        for handler in handlers {
            let future = handler(server_name.to_string(), status);
            // Spawned so a panicking handler surfaces as a JoinError
            // instead of unwinding through the transition.
            if let Err(e) = tokio::spawn(future).await {
                error!(server = %server_name, status = %status, error = %e, "event handler failed");
            }
        }
    }

    async fn audit_server_event(
        &self,
        event_type: AuditEventType,
        server_name: &str,
        error_message: Option<&str>,
    ) {
        if let Some(audit) = &self.audit {
            let status = if error_message.is_some() {
                "failure"
            } else {
                "success"
            };
            audit
                .log_server_event(event_type, server_name, status, error_message)
                .await;
        }
    }

    /// Shut the registry down: cancel outstanding reconnection tasks,
    /// disconnect every server, and close the embedded client.
    ///
    /// Idempotent and safe to await concurrently.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut tasks = self
                .reconnect_tasks
                .lock()
                .expect("reconnect tasks poisoned");
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }

        self.disconnect_all().await;
        self.client.close().await;

        if let Some(audit) = &self.audit {
            audit
                .log_server_event(AuditEventType::SystemShutdown, "registry", "success", None)
                .await;
        }
        info!("server registry shutdown complete");
    }

    /// Summary of all server statuses: per-status counts, per-server
    /// detail, and the total tool count.
    pub fn status_summary(&self) -> Value {
        let table = self.table.read().expect("server table poisoned");

        let mut status_counts: HashMap<&'static str, usize> = ServerStatus::ALL
            .iter()
            .map(|s| (s.as_str(), 0))
            .collect();
        let mut total_tools = 0;
        let mut details = Vec::new();

        for name in &table.order {
            let server = &table.servers[name];
            *status_counts.entry(server.status.as_str()).or_insert(0) += 1;
            total_tools += server.tools.len();
            details.push(json!({
                "name": server.name,
                "status": server.status.as_str(),
                "enabled": server.enabled,
                "tools_count": server.tools.len(),
                "last_connected_at": server.last_connected_at.map(|t| t.to_rfc3339()),
                "last_error": server.last_error,
                "retry_count": server.retry_count,
            }));
        }

        json!({
            "total_servers": table.order.len(),
            "status_counts": status_counts,
            "total_tools": total_tools,
            "servers": details,
        })
    }
}

fn context_map(context: &CallContext) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    if let Some(ip) = &context.ip_address {
        map.insert("ip_address".to_string(), json!(ip));
    }
    if let Some(session) = &context.session_id {
        map.insert("session_id".to_string(), json!(session));
    }
    map
}
