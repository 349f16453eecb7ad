//! Audit logging for MCP operations.
//!
//! Every registry-initiated tool invocation, access decision, and server
//! lifecycle event becomes an [`AuditEvent`] persisted through a pluggable
//! [`AuditStorage`] sink. Two reference sinks are provided: a bounded
//! in-memory queue and an append-only JSON-Lines file.
//!
//! Arguments are sanitized at write time: any key whose lower-case form
//! contains a sensitive fragment (`password`, `secret`, `token`, ...) has
//! its value replaced with `"[REDACTED]"`, recursively through nested
//! objects, before the sink ever sees the event.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Types of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Connection events
    ServerConnect,
    ServerDisconnect,
    ServerError,

    // Tool events
    ToolList,
    ToolExecution,
    ToolError,

    // Access events
    AccessGranted,
    AccessDenied,

    // Admin events
    ConfigChange,
    PolicyChange,

    // System events
    SystemStart,
    SystemShutdown,
}

/// A single audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub event_id: String,

    pub event_type: AuditEventType,

    /// Event timestamp (ISO-8601 in serialized form).
    pub timestamp: DateTime<Utc>,

    /// User who triggered the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// MCP server name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Tool name, for tool events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Tool arguments; sanitized before persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,

    /// Operation result summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Event status: success, failure, granted, denied, ...
    pub status: String,

    /// Operation duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            user_id: None,
            server: None,
            tool: None,
            arguments: None,
            result: None,
            status: "success".to_string(),
            duration_ms: None,
            ip_address: None,
            session_id: None,
            metadata: HashMap::new(),
        }
    }
}

/// Argument keys whose values must never be persisted.
const SENSITIVE_KEY_FRAGMENTS: [&str; 7] = [
    "password",
    "secret",
    "token",
    "api_key",
    "credential",
    "auth",
    "private_key",
];

/// Replace sensitive values with `"[REDACTED]"`, recursing into nested
/// objects.
pub fn sanitize_arguments(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, entry) in map {
                let key_lower = key.to_lowercase();
                if SENSITIVE_KEY_FRAGMENTS.iter().any(|s| key_lower.contains(s)) {
                    sanitized.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else if entry.is_object() {
                    sanitized.insert(key.clone(), sanitize_arguments(entry));
                } else {
                    sanitized.insert(key.clone(), entry.clone());
                }
            }
            Value::Object(sanitized)
        }
        other => other.clone(),
    }
}

/// Filter for querying audit events.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub server: Option<String>,
    pub tool: Option<String>,
    pub event_types: Option<Vec<AuditEventType>>,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of events to return; 0 means the default of 100.
    pub limit: usize,
    pub offset: usize,
}

impl AuditFilter {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            100
        } else {
            self.limit
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(user_id) = &self.user_id {
            if event.user_id.as_ref() != Some(user_id) {
                return false;
            }
        }
        if let Some(server) = &self.server {
            if event.server.as_ref() != Some(server) {
                return false;
            }
        }
        if let Some(tool) = &self.tool {
            if event.tool.as_ref() != Some(tool) {
                return false;
            }
        }
        if let Some(event_types) = &self.event_types {
            if !event_types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if &event.status != status {
                return false;
            }
        }
        if let Some(start) = &self.start_time {
            if event.timestamp < *start {
                return false;
            }
        }
        if let Some(end) = &self.end_time {
            if event.timestamp > *end {
                return false;
            }
        }
        true
    }
}

/// Pluggable audit storage backend.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Persist one event. Returns false on sink failure.
    async fn store(&self, event: AuditEvent) -> bool;

    /// Query events, newest first, after filter application and
    /// pagination.
    async fn query(&self, filter: Option<&AuditFilter>) -> Vec<AuditEvent>;

    /// Delete events older than the timestamp; returns how many were
    /// removed.
    async fn delete_before(&self, timestamp: DateTime<Utc>) -> usize;
}

/// Bounded in-memory sink; the oldest event is evicted on overflow.
pub struct InMemoryAuditStorage {
    events: tokio::sync::Mutex<VecDeque<AuditEvent>>,
    max_size: usize,
}

impl Default for InMemoryAuditStorage {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryAuditStorage {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: tokio::sync::Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
            max_size,
        }
    }
}

#[async_trait]
impl AuditStorage for InMemoryAuditStorage {
    async fn store(&self, event: AuditEvent) -> bool {
        let mut events = self.events.lock().await;
        if events.len() == self.max_size {
            events.pop_front();
        }
        events.push_back(event);
        true
    }

    async fn query(&self, filter: Option<&AuditFilter>) -> Vec<AuditEvent> {
        let events = self.events.lock().await;
        let mut matched: Vec<AuditEvent> = match filter {
            None => events.iter().rev().take(100).cloned().collect(),
            Some(filter) => events
                .iter()
                .filter(|e| filter.matches(e))
                .skip(filter.offset)
                .take(filter.effective_limit())
                .cloned()
                .collect(),
        };
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
    }

    async fn delete_before(&self, timestamp: DateTime<Utc>) -> usize {
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= timestamp);
        before - events.len()
    }
}

/// Append-only JSON-Lines file sink.
///
/// One JSON object per line, UTF-8, ISO-8601 timestamps. Corrupt lines are
/// tolerated on read and preserved on rewrite.
pub struct FileAuditStorage {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileAuditStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_lines(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to read audit log");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl AuditStorage for FileAuditStorage {
    async fn store(&self, event: AuditEvent) -> bool {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize audit event");
                return false;
            }
        };

        let _guard = self.lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to store audit event");
                false
            }
        }
    }

    async fn query(&self, filter: Option<&AuditFilter>) -> Vec<AuditEvent> {
        let lines = {
            let _guard = self.lock.lock().await;
            self.read_lines().await
        };

        let mut events: Vec<AuditEvent> = Vec::new();
        for line in lines {
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => {
                    if filter.map_or(true, |f| f.matches(&event)) {
                        events.push(event);
                    }
                }
                Err(e) => warn!(error = %e, "invalid audit log entry"),
            }
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        match filter {
            Some(filter) => events
                .into_iter()
                .skip(filter.offset)
                .take(filter.effective_limit())
                .collect(),
            None => events.into_iter().take(100).collect(),
        }
    }

    async fn delete_before(&self, timestamp: DateTime<Utc>) -> usize {
        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await;
        if lines.is_empty() {
            return 0;
        }

        let mut kept = Vec::new();
        let mut deleted = 0;
        for line in lines {
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) if event.timestamp < timestamp => deleted += 1,
                // Parse failures are preserved rather than silently purged.
                _ => kept.push(line),
            }
        }

        let mut content = kept.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        if let Err(e) = tokio::fs::write(&self.path, content).await {
            error!(path = %self.path.display(), error = %e, "failed to rewrite audit log");
            return 0;
        }
        deleted
    }
}

/// Real-time handler invoked after each stored event.
pub type AuditEventHandler = Arc<dyn Fn(AuditEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into an [`AuditEventHandler`].
pub fn audit_event_handler<F, Fut>(f: F) -> AuditEventHandler
where
    F: Fn(AuditEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Audit logger: sanitizes, stores, and fans events out to real-time
/// handlers.
#[derive(Clone)]
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
    enabled: Arc<AtomicBool>,
    handlers: Arc<RwLock<Vec<AuditEventHandler>>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryAuditStorage::default()))
    }
}

impl AuditLogger {
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        Self {
            storage,
            enabled: Arc::new(AtomicBool::new(true)),
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Log an event. Arguments are sanitized here, before any sink sees
    /// the event. Returns false when logging is disabled or the sink
    /// fails.
    pub async fn log(&self, mut event: AuditEvent) -> bool {
        if !self.is_enabled() {
            return false;
        }

        if let Some(arguments) = &event.arguments {
            event.arguments = Some(sanitize_arguments(arguments));
        }

        let stored = self.storage.store(event.clone()).await;

        let handlers: Vec<AuditEventHandler> =
            self.handlers.read().expect("audit handlers poisoned").clone();
        for handler in handlers {
            if let Err(e) = tokio::spawn(handler(event.clone())).await {
                error!(error = %e, "audit handler failed");
            }
        }

        stored
    }

    /// Log a tool execution event.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_tool_execution(
        &self,
        user_id: &str,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
        status: &str,
        result: Option<String>,
        duration_ms: Option<f64>,
    ) -> bool {
        let mut event = AuditEvent::new(AuditEventType::ToolExecution);
        event.user_id = Some(user_id.to_string());
        event.server = Some(server.to_string());
        event.tool = Some(tool.to_string());
        event.arguments = arguments;
        event.status = status.to_string();
        event.result = result;
        event.duration_ms = duration_ms;
        self.log(event).await
    }

    /// Log an access control decision.
    pub async fn log_access(
        &self,
        user_id: &str,
        server: &str,
        tool: &str,
        granted: bool,
        reason: Option<&str>,
    ) -> bool {
        let mut event = AuditEvent::new(if granted {
            AuditEventType::AccessGranted
        } else {
            AuditEventType::AccessDenied
        });
        event.user_id = Some(user_id.to_string());
        event.server = Some(server.to_string());
        event.tool = Some(tool.to_string());
        event.status = if granted { "granted" } else { "denied" }.to_string();
        event.result = reason.map(String::from);
        self.log(event).await
    }

    /// Log a server lifecycle event.
    pub async fn log_server_event(
        &self,
        event_type: AuditEventType,
        server: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> bool {
        let mut event = AuditEvent::new(event_type);
        event.server = Some(server.to_string());
        event.status = status.to_string();
        event.result = error_message.map(String::from);
        self.log(event).await
    }

    pub async fn query(&self, filter: Option<&AuditFilter>) -> Vec<AuditEvent> {
        self.storage.query(filter).await
    }

    /// Recent activity for a user.
    pub async fn user_activity(&self, user_id: &str, hours: i64) -> Vec<AuditEvent> {
        let filter = AuditFilter {
            user_id: Some(user_id.to_string()),
            start_time: Some(Utc::now() - ChronoDuration::hours(hours)),
            ..Default::default()
        };
        self.query(Some(&filter)).await
    }

    /// Recent activity for a server.
    pub async fn server_activity(&self, server: &str, hours: i64) -> Vec<AuditEvent> {
        let filter = AuditFilter {
            server: Some(server.to_string()),
            start_time: Some(Utc::now() - ChronoDuration::hours(hours)),
            ..Default::default()
        };
        self.query(Some(&filter)).await
    }

    /// Delete events older than `days`; returns how many were removed.
    pub async fn cleanup(&self, days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let deleted = self.storage.delete_before(cutoff).await;
        info!(deleted, days, "cleaned up old audit events");
        deleted
    }

    pub fn add_handler(&self, handler: AuditEventHandler) {
        self.handlers
            .write()
            .expect("audit handlers poisoned")
            .push(handler);
    }

    pub fn remove_handler(&self, handler: &AuditEventHandler) {
        self.handlers
            .write()
            .expect("audit handlers poisoned")
            .retain(|h| !Arc::ptr_eq(h, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_redacts_sensitive_keys_recursively() {
        let args = json!({
            "password": "p",
            "nested": { "api_key": "k", "ok": "v" },
            "plain": 1,
        });

        let sanitized = sanitize_arguments(&args);
        assert_eq!(
            sanitized,
            json!({
                "password": "[REDACTED]",
                "nested": { "api_key": "[REDACTED]", "ok": "v" },
                "plain": 1,
            })
        );
    }

    #[test]
    fn test_sanitize_matches_key_fragments_case_insensitively() {
        let args = json!({"GITHUB_TOKEN": "t", "AuthHeader": "h", "name": "n"});
        let sanitized = sanitize_arguments(&args);
        assert_eq!(sanitized["GITHUB_TOKEN"], "[REDACTED]");
        assert_eq!(sanitized["AuthHeader"], "[REDACTED]");
        assert_eq!(sanitized["name"], "n");
    }

    #[test]
    fn test_event_type_serializes_snake_case() {
        let value = serde_json::to_value(AuditEventType::ToolExecution).unwrap();
        assert_eq!(value, json!("tool_execution"));
        let value = serde_json::to_value(AuditEventType::AccessDenied).unwrap();
        assert_eq!(value, json!("access_denied"));
    }

    #[tokio::test]
    async fn test_memory_sink_evicts_oldest_on_overflow() {
        let storage = InMemoryAuditStorage::new(2);
        for _ in 0..3 {
            storage.store(AuditEvent::new(AuditEventType::ToolExecution)).await;
        }

        let filter = AuditFilter {
            limit: 10,
            ..Default::default()
        };
        assert_eq!(storage.query(Some(&filter)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_filter_matching() {
        let storage = InMemoryAuditStorage::default();

        let mut event = AuditEvent::new(AuditEventType::ToolExecution);
        event.user_id = Some("u1".to_string());
        event.server = Some("files".to_string());
        storage.store(event).await;

        let mut other = AuditEvent::new(AuditEventType::AccessDenied);
        other.user_id = Some("u2".to_string());
        storage.store(other).await;

        let filter = AuditFilter {
            user_id: Some("u1".to_string()),
            ..Default::default()
        };
        let events = storage.query(Some(&filter)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].server.as_deref(), Some("files"));

        let filter = AuditFilter {
            event_types: Some(vec![AuditEventType::AccessDenied]),
            ..Default::default()
        };
        assert_eq!(storage.query(Some(&filter)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_logger_sanitizes_before_store() {
        let logger = AuditLogger::default();
        logger
            .log_tool_execution(
                "u1",
                "files",
                "login",
                Some(json!({"password": "p", "nested": {"api_key": "k", "ok": "v"}})),
                "success",
                None,
                Some(12.5),
            )
            .await;

        let events = logger.query(None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].arguments,
            Some(json!({
                "password": "[REDACTED]",
                "nested": {"api_key": "[REDACTED]", "ok": "v"},
            }))
        );
        assert!(events[0].duration_ms.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_disabled_logger_drops_events() {
        let logger = AuditLogger::default();
        logger.set_enabled(false);
        assert!(!logger.log(AuditEvent::new(AuditEventType::SystemStart)).await);
        assert!(logger.query(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_handlers_observe_events() {
        let logger = AuditLogger::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        logger.add_handler(audit_event_handler(move |event: AuditEvent| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(event.event_type);
            }
        }));

        logger.log(AuditEvent::new(AuditEventType::SystemStart)).await;
        assert_eq!(*seen.lock().unwrap(), vec![AuditEventType::SystemStart]);
    }

    #[tokio::test]
    async fn test_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let storage = FileAuditStorage::new(&path);

        let mut event = AuditEvent::new(AuditEventType::ToolExecution);
        event.user_id = Some("u1".to_string());
        assert!(storage.store(event).await);

        let events = storage.query(None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id.as_deref(), Some("u1"));

        // Serialized form is one JSON object per line with an ISO-8601
        // timestamp and snake_case event type.
        let content = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["event_type"], "tool_execution");
        assert!(line["timestamp"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_file_sink_tolerates_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        tokio::fs::write(&path, "not json\n").await.unwrap();

        let storage = FileAuditStorage::new(&path);
        storage.store(AuditEvent::new(AuditEventType::SystemStart)).await;

        assert_eq!(storage.query(None).await.len(), 1);

        // Corrupt lines survive a delete_before rewrite.
        let deleted = storage.delete_before(Utc::now() + ChronoDuration::hours(1)).await;
        assert_eq!(deleted, 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("not json"));
    }

    #[tokio::test]
    async fn test_delete_before_counts() {
        let storage = InMemoryAuditStorage::default();
        storage.store(AuditEvent::new(AuditEventType::SystemStart)).await;

        assert_eq!(storage.delete_before(Utc::now() - ChronoDuration::hours(1)).await, 0);
        assert_eq!(storage.delete_before(Utc::now() + ChronoDuration::hours(1)).await, 1);
    }
}
