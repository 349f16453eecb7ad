//! Server configuration loading.
//!
//! Server definitions come from YAML files, environment variables, or
//! programmatic construction. The YAML shape is a top-level `servers:`
//! list:
//!
//! ```yaml
//! servers:
//!   - name: azure-mcp
//!     command: python
//!     args: ["-m", "mcp_servers.azure"]
//!     env:
//!       AZURE_SUBSCRIPTION_ID: ${AZURE_SUBSCRIPTION_ID}
//!     enabled: true
//!     timeout: 30
//!
//!   - name: github-mcp
//!     command: npx
//!     args: "-y @modelcontextprotocol/server-github"
//!     env:
//!       GITHUB_PERSONAL_ACCESS_TOKEN: ${GITHUB_TOKEN}
//! ```
//!
//! `args` accepts a list or a whitespace-split string. Env values may
//! reference host environment variables as `${VAR}`; a missing variable
//! substitutes as empty with a warning. Unknown keys are ignored and a
//! malformed entry is skipped with a warning. Structural problems such as
//! duplicate names or out-of-range timeouts are reported by
//! [`ConfigLoader::validate`] rather than failing the load.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::error::{McpError, Result};
use crate::registry::RegisteredServer;

const DEFAULT_TIMEOUT_SECS: f64 = 30.0;
const TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<f64> = 1.0..=300.0;
const MAX_NAME_LEN: usize = 64;

/// A server definition parsed from configuration.
#[derive(Debug, Clone)]
pub struct ServerDefinition {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub transport: String,
    /// Operation timeout in seconds.
    pub timeout: f64,
    pub enabled: bool,
    pub cwd: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl ServerDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            transport: "stdio".to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
            enabled: true,
            cwd: None,
            description: None,
            tags: Vec::new(),
        }
    }

    /// Convert to a registry record.
    pub fn to_registered_server(&self) -> RegisteredServer {
        let mut server = RegisteredServer::new(&self.name, &self.command, self.args.clone());
        server.env = self.env.clone();
        server.transport = self.transport.clone();
        server.timeout = Duration::from_secs_f64(self.timeout);
        server.enabled = self.enabled;
        server.cwd = self.cwd.as_ref().map(Into::into);
        server
    }
}

/// Loader for MCP server configurations.
///
/// YAML loads are cached per path; `load_from_env` discovers definitions
/// from keys matching `^<PREFIX>SERVER_<ID>_(NAME|COMMAND|ARGS|ENV|ENABLED|TIMEOUT)$`.
pub struct ConfigLoader {
    env_prefix: String,
    env_var_pattern: Regex,
    cache: Mutex<HashMap<String, Vec<ServerDefinition>>>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new("MCP_")
    }
}

impl ConfigLoader {
    pub fn new(env_prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: env_prefix.into(),
            env_var_pattern: Regex::new(r"\$\{([^}]+)\}").expect("valid pattern"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load server definitions from a YAML file.
    ///
    /// Results are cached per path unless `reload` is set. Parse failures
    /// fail the load; individual malformed entries are skipped with a
    /// warning.
    pub fn load_from_file(&self, path: impl AsRef<Path>, reload: bool) -> Result<Vec<ServerDefinition>> {
        let path = path.as_ref();
        let key = path.display().to_string();

        if !reload {
            if let Some(cached) = self.cache.lock().expect("config cache poisoned").get(&key) {
                return Ok(cached.clone());
            }
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::Config(format!("cannot read configuration file {key}: {e}"))
        })?;
        let servers = self.load_from_str(&content)?;

        self.cache
            .lock()
            .expect("config cache poisoned")
            .insert(key.clone(), servers.clone());
        info!(path = %key, servers = servers.len(), "loaded server configurations");
        Ok(servers)
    }

    /// Load server definitions from YAML text.
    pub fn load_from_str(&self, content: &str) -> Result<Vec<ServerDefinition>> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| McpError::Config(format!("YAML parsing error: {e}")))?;
        self.load_from_value(&value)
    }

    /// Load server definitions from a parsed YAML document.
    pub fn load_from_value(&self, config: &Value) -> Result<Vec<ServerDefinition>> {
        let Some(list) = config.get("servers") else {
            return Ok(Vec::new());
        };
        let list = list
            .as_sequence()
            .ok_or_else(|| McpError::Config("'servers' must be a list".to_string()))?;

        let mut servers: Vec<ServerDefinition> = Vec::new();
        for (idx, entry) in list.iter().enumerate() {
            match self.parse_server_entry(entry) {
                Ok(server) => servers.push(server),
                Err(e) => warn!(index = idx, error = %e, "skipping malformed server entry"),
            }
        }
        Ok(servers)
    }

    /// Discover server definitions from environment variables.
    ///
    /// Key grammar (with the default `MCP_` prefix):
    ///
    /// ```text
    /// MCP_SERVER_1_NAME=my-server
    /// MCP_SERVER_1_COMMAND=python
    /// MCP_SERVER_1_ARGS=-m,mcp_servers.example
    /// MCP_SERVER_1_ENV=API_KEY=${MY_KEY},LOG_LEVEL=debug
    /// MCP_SERVER_1_ENABLED=true
    /// MCP_SERVER_1_TIMEOUT=30
    /// ```
    ///
    /// Ids with no name or command are skipped with a warning; ids are
    /// processed in sorted order for deterministic registration.
    pub fn load_from_env(&self) -> Vec<ServerDefinition> {
        let prefix = format!("{}SERVER_", self.env_prefix);
        let mut grouped: HashMap<String, HashMap<String, String>> = HashMap::new();

        for (key, value) in std::env::vars() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((server_id, field)) = rest.split_once('_') else {
                continue;
            };
            grouped
                .entry(server_id.to_string())
                .or_default()
                .insert(field.to_lowercase(), value);
        }

        let mut ids: Vec<String> = grouped.keys().cloned().collect();
        ids.sort();

        let mut servers = Vec::new();
        for id in ids {
            let fields = &grouped[&id];
            let (Some(name), Some(command)) = (fields.get("name"), fields.get("command")) else {
                warn!(id = %id, "skipping incomplete server config: missing name or command");
                continue;
            };

            let mut server = ServerDefinition::new(name, command);
            if let Some(args) = fields.get("args") {
                server.args = args.split(',').map(String::from).collect();
            }
            if let Some(env) = fields.get("env") {
                for pair in env.split(',') {
                    if let Some((k, v)) = pair.split_once('=') {
                        server.env.insert(k.to_string(), self.substitute_env_vars(v));
                    }
                }
            }
            if let Some(enabled) = fields.get("enabled") {
                server.enabled = enabled.eq_ignore_ascii_case("true");
            }
            if let Some(timeout) = fields.get("timeout") {
                match timeout.parse::<f64>() {
                    Ok(timeout) => server.timeout = timeout,
                    Err(e) => {
                        warn!(id = %id, error = %e, "skipping server config: bad timeout");
                        continue;
                    }
                }
            }
            servers.push(server);
        }

        if !servers.is_empty() {
            info!(servers = servers.len(), "loaded server configurations from environment");
        }
        servers
    }

    fn parse_server_entry(&self, entry: &Value) -> Result<ServerDefinition> {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::Config("server entry missing 'name'".to_string()))?;
        let command = entry
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::Config("server entry missing 'command'".to_string()))?;

        let mut server = ServerDefinition::new(name, command);

        // args: list form or whitespace-split string form
        match entry.get("args") {
            Some(Value::Sequence(args)) => {
                server.args = args
                    .iter()
                    .map(|a| match a {
                        Value::String(s) => s.clone(),
                        other => yaml_scalar_to_string(other),
                    })
                    .collect();
            }
            Some(Value::String(args)) => {
                server.args = args.split_whitespace().map(String::from).collect();
            }
            _ => {}
        }

        if let Some(env) = entry.get("env").and_then(Value::as_mapping) {
            for (key, value) in env {
                let Some(key) = key.as_str() else { continue };
                let value = match value {
                    Value::String(s) => self.substitute_env_vars(s),
                    other => yaml_scalar_to_string(other),
                };
                server.env.insert(key.to_string(), value);
            }
        }

        if let Some(transport) = entry.get("transport").and_then(Value::as_str) {
            server.transport = transport.to_string();
        }
        if let Some(timeout) = entry.get("timeout") {
            // Range problems are validate()'s to report, not the loader's.
            server.timeout = timeout
                .as_f64()
                .ok_or_else(|| McpError::Config("timeout must be a number".to_string()))?;
        }
        if let Some(enabled) = entry.get("enabled").and_then(Value::as_bool) {
            server.enabled = enabled;
        }
        if let Some(cwd) = entry.get("cwd").and_then(Value::as_str) {
            server.cwd = Some(cwd.to_string());
        }
        if let Some(description) = entry.get("description").and_then(Value::as_str) {
            server.description = Some(description.to_string());
        }
        if let Some(tags) = entry.get("tags").and_then(Value::as_sequence) {
            server.tags = tags
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }

        Ok(server)
    }

    /// Replace `${VAR}` references with host environment values; a missing
    /// variable substitutes as empty.
    pub fn substitute_env_vars(&self, value: &str) -> String {
        self.env_var_pattern
            .replace_all(value, |caps: &regex::Captures<'_>| {
                let var_name = &caps[1];
                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => {
                        warn!(variable = %var_name, "environment variable not found");
                        String::new()
                    }
                }
            })
            .into_owned()
    }

    /// Validate a configuration document, returning all problems found
    /// (empty means valid).
    pub fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();

        let Some(servers) = config.get("servers") else {
            errors.push("missing 'servers' key in configuration".to_string());
            return errors;
        };
        let Some(servers) = servers.as_sequence() else {
            errors.push("'servers' must be a list".to_string());
            return errors;
        };

        let mut names_seen: Vec<&str> = Vec::new();
        for (idx, server) in servers.iter().enumerate() {
            let prefix = format!("servers[{idx}]");

            if server.as_mapping().is_none() {
                errors.push(format!("{prefix}: must be a mapping"));
                continue;
            }

            match server.get("name").and_then(Value::as_str) {
                None => errors.push(format!("{prefix}: missing required field 'name'")),
                Some(name) => {
                    if name.is_empty() || name.len() > MAX_NAME_LEN {
                        errors.push(format!(
                            "{prefix}: name must be 1..={MAX_NAME_LEN} chars"
                        ));
                    }
                    if names_seen.contains(&name) {
                        errors.push(format!("{prefix}: duplicate server name '{name}'"));
                    }
                    names_seen.push(name);
                }
            }

            if server.get("command").and_then(Value::as_str).is_none() {
                errors.push(format!("{prefix}: missing required field 'command'"));
            }

            if let Some(transport) = server.get("transport").and_then(Value::as_str) {
                if !matches!(transport, "stdio" | "sse" | "websocket") {
                    errors.push(format!(
                        "{prefix}: invalid transport '{transport}', must be stdio, sse, or websocket"
                    ));
                }
            }

            if let Some(timeout) = server.get("timeout") {
                match timeout.as_f64() {
                    None => errors.push(format!("{prefix}: timeout must be a number")),
                    Some(timeout) if !TIMEOUT_RANGE_SECS.contains(&timeout) => {
                        errors.push(format!(
                            "{prefix}: timeout must be within 1..=300 seconds"
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        errors
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("config cache poisoned").clear();
    }
}

fn yaml_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_basic_yaml() {
        let loader = ConfigLoader::default();
        let servers = loader
            .load_from_str(
                r#"
servers:
  - name: files
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/data"]
    timeout: 60
    description: Filesystem access
    tags: [fs, local]
  - name: shell
    command: python
    args: "-m mcp_servers.shell"
    enabled: false
"#,
            )
            .unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "files");
        assert_eq!(servers[0].args.len(), 3);
        assert_eq!(servers[0].timeout, 60.0);
        assert_eq!(servers[0].tags, vec!["fs", "local"]);
        assert!(servers[0].enabled);

        // String args are split on whitespace.
        assert_eq!(servers[1].args, vec!["-m", "mcp_servers.shell"]);
        assert!(!servers[1].enabled);
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let loader = ConfigLoader::default();
        let servers = loader
            .load_from_str(
                r#"
servers:
  - name: good
    command: echo
  - name: no-command-here
  - command: no-name-here
  - name: word-timeout
    command: echo
    timeout: fast
"#,
            )
            .unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "good");
    }

    #[test]
    fn test_out_of_range_timeout_loads_but_is_flagged() {
        let loader = ConfigLoader::default();
        let content = r#"
servers:
  - name: slowpoke
    command: echo
    timeout: 900
"#;

        // The entry still loads; only validate() reports the range problem.
        let servers = loader.load_from_str(content).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].timeout, 900.0);

        let config: Value = serde_yaml::from_str(content).unwrap();
        let errors = loader.validate(&config);
        assert!(errors.iter().any(|e| e.contains("timeout")));
    }

    #[test]
    fn test_duplicate_names_load_but_are_flagged() {
        let loader = ConfigLoader::default();
        let content = r#"
servers:
  - name: twice
    command: a
  - name: twice
    command: b
"#;

        // Both entries load; validate() carries the duplicate report.
        let servers = loader.load_from_str(content).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].command, "a");
        assert_eq!(servers[1].command, "b");

        let config: Value = serde_yaml::from_str(content).unwrap();
        let errors = loader.validate(&config);
        assert!(errors.iter().any(|e| e.contains("duplicate server name 'twice'")));
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("MCP_FLEET_TEST_SUB", "resolved");
        let loader = ConfigLoader::default();

        assert_eq!(
            loader.substitute_env_vars("${MCP_FLEET_TEST_SUB}/suffix"),
            "resolved/suffix"
        );
        // Missing variables substitute as empty.
        assert_eq!(loader.substitute_env_vars("${MCP_FLEET_TEST_MISSING}x"), "x");
        assert_eq!(loader.substitute_env_vars("literal"), "literal");

        std::env::remove_var("MCP_FLEET_TEST_SUB");
    }

    #[test]
    fn test_env_values_are_substituted_in_yaml() {
        std::env::set_var("MCP_FLEET_TEST_KEY", "sk-123");
        let loader = ConfigLoader::default();
        let servers = loader
            .load_from_str(
                r#"
servers:
  - name: s
    command: c
    env:
      API_KEY: ${MCP_FLEET_TEST_KEY}
      PLAIN: value
"#,
            )
            .unwrap();

        assert_eq!(servers[0].env["API_KEY"], "sk-123");
        assert_eq!(servers[0].env["PLAIN"], "value");
        std::env::remove_var("MCP_FLEET_TEST_KEY");
    }

    #[test]
    fn test_load_from_env() {
        std::env::set_var("MCPTEST_SERVER_1_NAME", "env-server");
        std::env::set_var("MCPTEST_SERVER_1_COMMAND", "python");
        std::env::set_var("MCPTEST_SERVER_1_ARGS", "-m,mcp_servers.example");
        std::env::set_var("MCPTEST_SERVER_1_ENV", "LOG_LEVEL=debug");
        std::env::set_var("MCPTEST_SERVER_1_ENABLED", "false");
        std::env::set_var("MCPTEST_SERVER_1_TIMEOUT", "45");
        std::env::set_var("MCPTEST_SERVER_2_NAME", "incomplete");

        let loader = ConfigLoader::new("MCPTEST_");
        let servers = loader.load_from_env();

        assert_eq!(servers.len(), 1);
        let server = &servers[0];
        assert_eq!(server.name, "env-server");
        assert_eq!(server.args, vec!["-m", "mcp_servers.example"]);
        assert_eq!(server.env["LOG_LEVEL"], "debug");
        assert!(!server.enabled);
        assert_eq!(server.timeout, 45.0);

        for key in [
            "MCPTEST_SERVER_1_NAME",
            "MCPTEST_SERVER_1_COMMAND",
            "MCPTEST_SERVER_1_ARGS",
            "MCPTEST_SERVER_1_ENV",
            "MCPTEST_SERVER_1_ENABLED",
            "MCPTEST_SERVER_1_TIMEOUT",
            "MCPTEST_SERVER_2_NAME",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let loader = ConfigLoader::default();
        let config: Value = serde_yaml::from_str(
            r#"
servers:
  - name: ok
    command: echo
  - name: ok
    command: echo
  - command: nameless
  - name: bad
    command: echo
    transport: carrier-pigeon
    timeout: 0
"#,
        )
        .unwrap();

        let errors = loader.validate(&config);
        assert!(errors.iter().any(|e| e.contains("duplicate server name 'ok'")));
        assert!(errors.iter().any(|e| e.contains("missing required field 'name'")));
        assert!(errors.iter().any(|e| e.contains("invalid transport")));
        assert!(errors.iter().any(|e| e.contains("timeout")));
    }

    #[test]
    fn test_validate_missing_servers_key() {
        let loader = ConfigLoader::default();
        let config: Value = serde_yaml::from_str("other: 1").unwrap();
        let errors = loader.validate(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing 'servers'"));
    }

    #[test]
    fn test_file_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.yaml");
        std::fs::write(&path, "servers:\n  - name: a\n    command: c\n").unwrap();

        let loader = ConfigLoader::default();
        assert_eq!(loader.load_from_file(&path, false).unwrap().len(), 1);

        // Cached result survives a file change until reload is forced.
        std::fs::write(&path, "servers: []\n").unwrap();
        assert_eq!(loader.load_from_file(&path, false).unwrap().len(), 1);
        assert_eq!(loader.load_from_file(&path, true).unwrap().len(), 0);

        loader.clear_cache();
        assert_eq!(loader.load_from_file(&path, false).unwrap().len(), 0);
    }

    #[test]
    fn test_to_registered_server() {
        let mut definition = ServerDefinition::new("s", "cmd");
        definition.timeout = 12.0;
        definition.enabled = false;
        definition.cwd = Some("/tmp".to_string());

        let server = definition.to_registered_server();
        assert_eq!(server.name, "s");
        assert_eq!(server.timeout, Duration::from_secs(12));
        assert!(!server.enabled);
        assert_eq!(server.cwd.as_deref(), Some(Path::new("/tmp")));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let loader = ConfigLoader::default();
        let servers = loader
            .load_from_str(
                r#"
servers:
  - name: s
    command: c
    shiny_future_flag: true
"#,
            )
            .unwrap();
        assert_eq!(servers.len(), 1);
    }
}
