//! Permission management for MCP tool access.
//!
//! Access decisions are policy-driven: each [`PermissionPolicy`] names the
//! server and tool patterns it covers (glob syntax), the level it grants,
//! an explicit deny list that takes precedence over its grant, optional
//! dynamic conditions, and a priority. Policies attach to users and roles;
//! the highest-priority applicable policy decides, and the configured
//! default level governs when nothing applies.
//!
//! Levels form a total order: `None < Read < Execute < Admin`.
//!
//! All checks are synchronous pure state inspection; the interior lock is a
//! plain `std::sync::RwLock` and nothing here suspends.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{Local, NaiveTime};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Permission level hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None = 0,
    Read = 1,
    Execute = 2,
    Admin = 3,
}

/// Glob match with fnmatch semantics (`*` crosses `/`).
fn glob_match(pattern: &str, text: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(text),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid permission pattern");
            false
        }
    }
}

/// A single permission entry.
#[derive(Debug, Clone)]
pub struct Permission {
    /// Server name or pattern.
    pub server: String,
    /// Tool name or pattern.
    pub tool: String,
    pub level: PermissionLevel,
    /// Optional conditions for dynamic evaluation.
    pub conditions: Option<serde_json::Map<String, Value>>,
}

impl Permission {
    /// Whether this permission covers the given server and tool.
    pub fn matches(&self, server: &str, tool: &str) -> bool {
        glob_match(&self.server, server) && glob_match(&self.tool, tool)
    }
}

/// A policy defining permissions for a role or user.
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    /// Policy name (e.g. a role name).
    pub name: String,
    /// Server patterns this policy covers.
    pub servers: Vec<String>,
    /// Tool patterns this policy covers.
    pub tools: Vec<String>,
    /// Granted permission level.
    pub level: PermissionLevel,
    /// Explicit denials matched against `server/tool`; takes precedence
    /// over the grant.
    pub deny_list: Vec<String>,
    /// Optional dynamic conditions.
    pub conditions: Option<serde_json::Map<String, Value>>,
    /// Higher priority policies are evaluated first.
    pub priority: i32,
}

impl PermissionPolicy {
    pub fn new(name: impl Into<String>, level: PermissionLevel) -> Self {
        Self {
            name: name.into(),
            servers: vec!["*".to_string()],
            tools: vec!["*".to_string()],
            level,
            deny_list: Vec::new(),
            conditions: None,
            priority: 0,
        }
    }

    /// Evaluate this policy for the requested access.
    ///
    /// Returns `Some(true)` to grant, `Some(false)` to deny, and `None`
    /// when the policy does not apply to the server/tool at all.
    pub fn check(
        &self,
        server: &str,
        tool: &str,
        required_level: PermissionLevel,
    ) -> Option<bool> {
        let qualified = format!("{server}/{tool}");
        for pattern in &self.deny_list {
            if glob_match(pattern, &qualified) {
                return Some(false);
            }
        }

        if !self.servers.iter().any(|p| glob_match(p, server)) {
            return None;
        }
        if !self.tools.iter().any(|p| glob_match(p, tool)) {
            return None;
        }

        Some(self.level >= required_level)
    }
}

/// Custom condition evaluator: `(context, condition_value) -> allowed`.
pub type ConditionEvaluator =
    Box<dyn Fn(&HashMap<String, Value>, &Value) -> bool + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    policies: HashMap<String, PermissionPolicy>,
    user_policies: HashMap<String, HashSet<String>>,
    role_policies: HashMap<String, HashSet<String>>,
    default_level: Option<PermissionLevel>,
}

/// Manages permissions for MCP operations.
///
/// Policies are evaluated highest priority first; the first one whose
/// server/tool patterns match and whose conditions are satisfied decides.
#[derive(Default)]
pub struct PermissionManager {
    state: RwLock<ManagerState>,
    evaluators: RwLock<HashMap<String, ConditionEvaluator>>,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_policy(&self, policy: PermissionPolicy) {
        let name = policy.name.clone();
        self.state
            .write()
            .expect("permission state poisoned")
            .policies
            .insert(name.clone(), policy);
        info!(policy = %name, "added permission policy");
    }

    pub fn remove_policy(&self, name: &str) -> bool {
        let removed = self
            .state
            .write()
            .expect("permission state poisoned")
            .policies
            .remove(name)
            .is_some();
        if removed {
            info!(policy = %name, "removed permission policy");
        }
        removed
    }

    pub fn policy(&self, name: &str) -> Option<PermissionPolicy> {
        self.state
            .read()
            .expect("permission state poisoned")
            .policies
            .get(name)
            .cloned()
    }

    pub fn policies(&self) -> HashMap<String, PermissionPolicy> {
        self.state
            .read()
            .expect("permission state poisoned")
            .policies
            .clone()
    }

    /// Assign a policy to a user. Fails if the policy does not exist.
    pub fn assign_policy_to_user(&self, user_id: &str, policy_name: &str) -> bool {
        let mut state = self.state.write().expect("permission state poisoned");
        if !state.policies.contains_key(policy_name) {
            warn!(policy = %policy_name, "policy not found");
            return false;
        }
        state
            .user_policies
            .entry(user_id.to_string())
            .or_default()
            .insert(policy_name.to_string());
        true
    }

    /// Assign a policy to a role. Fails if the policy does not exist.
    pub fn assign_policy_to_role(&self, role: &str, policy_name: &str) -> bool {
        let mut state = self.state.write().expect("permission state poisoned");
        if !state.policies.contains_key(policy_name) {
            warn!(policy = %policy_name, "policy not found");
            return false;
        }
        state
            .role_policies
            .entry(role.to_string())
            .or_default()
            .insert(policy_name.to_string());
        true
    }

    /// Register a custom condition evaluator under a condition name.
    pub fn register_condition_evaluator(&self, name: impl Into<String>, evaluator: ConditionEvaluator) {
        self.evaluators
            .write()
            .expect("evaluators poisoned")
            .insert(name.into(), evaluator);
    }

    /// Default level applied when no policy matches.
    pub fn set_default_level(&self, level: PermissionLevel) {
        self.state
            .write()
            .expect("permission state poisoned")
            .default_level = Some(level);
    }

    /// Check whether an operation is permitted.
    ///
    /// Applicable policies are the user's plus those of each role; when
    /// neither yields any, every policy is considered (simple setups
    /// without assignments). Evaluation order is priority descending, and
    /// the first grant or deny wins.
    pub fn check_permission(
        &self,
        user_id: Option<&str>,
        roles: &[String],
        server: &str,
        tool: &str,
        level: PermissionLevel,
        context: &HashMap<String, Value>,
    ) -> bool {
        let state = self.state.read().expect("permission state poisoned");

        let mut applicable: Vec<&PermissionPolicy> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        if let Some(names) = user_id.and_then(|u| state.user_policies.get(u)) {
            for name in names {
                if let Some(policy) = state.policies.get(name) {
                    if seen.insert(name.as_str()) {
                        applicable.push(policy);
                    }
                }
            }
        }
        for role in roles {
            if let Some(names) = state.role_policies.get(role) {
                for name in names {
                    if let Some(policy) = state.policies.get(name) {
                        if seen.insert(name.as_str()) {
                            applicable.push(policy);
                        }
                    }
                }
            }
        }
        if applicable.is_empty() {
            applicable = state.policies.values().collect();
        }

        applicable.sort_by(|a, b| b.priority.cmp(&a.priority));

        for policy in applicable {
            if let Some(conditions) = &policy.conditions {
                if !context.is_empty() && !self.evaluate_conditions(conditions, context) {
                    continue;
                }
            }

            if let Some(result) = policy.check(server, tool, level) {
                debug!(
                    user = user_id.unwrap_or("anonymous"),
                    server = %server,
                    tool = %tool,
                    policy = %policy.name,
                    granted = result,
                    "permission decision"
                );
                return result;
            }
        }

        debug!(
            user = user_id.unwrap_or("anonymous"),
            server = %server,
            tool = %tool,
            "no policy applies, using default level"
        );
        state.default_level.unwrap_or(PermissionLevel::None) >= level
    }

    /// All policies applicable to a user via direct assignment or roles.
    pub fn user_policies(&self, user_id: &str, roles: &[String]) -> Vec<PermissionPolicy> {
        let state = self.state.read().expect("permission state poisoned");
        let mut result = Vec::new();
        let mut seen = HashSet::new();

        if let Some(names) = state.user_policies.get(user_id) {
            for name in names {
                if let Some(policy) = state.policies.get(name) {
                    if seen.insert(name.clone()) {
                        result.push(policy.clone());
                    }
                }
            }
        }
        for role in roles {
            if let Some(names) = state.role_policies.get(role) {
                for name in names {
                    if let Some(policy) = state.policies.get(name) {
                        if seen.insert(name.clone()) {
                            result.push(policy.clone());
                        }
                    }
                }
            }
        }
        result
    }

    fn evaluate_conditions(
        &self,
        conditions: &serde_json::Map<String, Value>,
        context: &HashMap<String, Value>,
    ) -> bool {
        let evaluators = self.evaluators.read().expect("evaluators poisoned");

        for (kind, value) in conditions {
            if let Some(evaluator) = evaluators.get(kind) {
                if !evaluator(context, value) {
                    return false;
                }
                continue;
            }
            match kind.as_str() {
                "time_range" => {
                    if !check_time_range(value) {
                        return false;
                    }
                }
                "ip_whitelist" => {
                    let ip = context.get("ip_address").and_then(Value::as_str);
                    if let (Some(ip), Some(allowed)) = (ip, value.as_array()) {
                        if !allowed.iter().any(|v| v.as_str() == Some(ip)) {
                            return false;
                        }
                    }
                }
                // Unknown condition kinds without an evaluator are ignored.
                _ => {}
            }
        }
        true
    }
}

/// `{start, end}` in HH:MM on the 24h local clock. Malformed ranges allow.
fn check_time_range(range: &Value) -> bool {
    let parse = |key: &str, fallback: &str| {
        let text = range.get(key).and_then(Value::as_str).unwrap_or(fallback);
        NaiveTime::parse_from_str(text, "%H:%M")
    };
    match (parse("start", "00:00"), parse("end", "23:59")) {
        (Ok(start), Ok(end)) => {
            let now = Local::now().time();
            start <= now && now <= end
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_context() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[test]
    fn test_level_ordering() {
        assert!(PermissionLevel::None < PermissionLevel::Read);
        assert!(PermissionLevel::Read < PermissionLevel::Execute);
        assert!(PermissionLevel::Execute < PermissionLevel::Admin);
    }

    #[test]
    fn test_permission_matches_globs() {
        let permission = Permission {
            server: "dev-*".to_string(),
            tool: "read_*".to_string(),
            level: PermissionLevel::Read,
            conditions: None,
        };
        assert!(permission.matches("dev-mcp", "read_file"));
        assert!(!permission.matches("prod-mcp", "read_file"));
        assert!(!permission.matches("dev-mcp", "write_file"));
    }

    #[test]
    fn test_policy_deny_list_takes_precedence() {
        let mut policy = PermissionPolicy::new("developer", PermissionLevel::Execute);
        policy.deny_list = vec!["*/delete_*".to_string()];

        assert_eq!(
            policy.check("files", "read_file", PermissionLevel::Execute),
            Some(true)
        );
        assert_eq!(
            policy.check("files", "delete_file", PermissionLevel::Execute),
            Some(false)
        );
    }

    #[test]
    fn test_policy_not_applicable() {
        let mut policy = PermissionPolicy::new("dev-only", PermissionLevel::Admin);
        policy.servers = vec!["dev-*".to_string()];
        assert_eq!(
            policy.check("prod-mcp", "anything", PermissionLevel::Read),
            None
        );
    }

    #[test]
    fn test_default_deny() {
        let manager = PermissionManager::new();
        assert!(!manager.check_permission(
            Some("u1"),
            &[],
            "files",
            "read_file",
            PermissionLevel::Execute,
            &no_context(),
        ));
    }

    #[test]
    fn test_default_level_governs_when_no_policy_applies() {
        let manager = PermissionManager::new();
        manager.set_default_level(PermissionLevel::Execute);
        assert!(manager.check_permission(
            None,
            &[],
            "files",
            "read_file",
            PermissionLevel::Execute,
            &no_context(),
        ));
    }

    #[test]
    fn test_priority_order() {
        let manager = PermissionManager::new();

        let mut deny_all = PermissionPolicy::new("deny-all", PermissionLevel::None);
        deny_all.priority = 0;
        manager.add_policy(deny_all);

        let mut admin = PermissionPolicy::new("admin", PermissionLevel::Admin);
        admin.priority = 100;
        manager.add_policy(admin);

        // The higher priority grant wins over the lower priority deny.
        assert!(manager.check_permission(
            Some("u1"),
            &[],
            "files",
            "read_file",
            PermissionLevel::Execute,
            &no_context(),
        ));
    }

    #[test]
    fn test_role_assignment_scopes_policies() {
        let manager = PermissionManager::new();
        manager.add_policy(PermissionPolicy::new("developer", PermissionLevel::Execute));
        manager.add_policy(PermissionPolicy::new("nobody", PermissionLevel::None));
        assert!(manager.assign_policy_to_role("dev", "nobody"));
        assert!(!manager.assign_policy_to_role("dev", "missing"));

        // The role only carries the "nobody" policy, so the unassigned
        // Execute grant must not apply.
        assert!(!manager.check_permission(
            Some("u1"),
            &["dev".to_string()],
            "files",
            "read_file",
            PermissionLevel::Execute,
            &no_context(),
        ));
    }

    #[test]
    fn test_ip_whitelist_condition() {
        let manager = PermissionManager::new();
        let mut policy = PermissionPolicy::new("office", PermissionLevel::Execute);
        policy.conditions = Some(
            json!({"ip_whitelist": ["10.0.0.1"]})
                .as_object()
                .unwrap()
                .clone(),
        );
        manager.add_policy(policy);

        let mut allowed = HashMap::new();
        allowed.insert("ip_address".to_string(), json!("10.0.0.1"));
        assert!(manager.check_permission(
            Some("u1"),
            &[],
            "files",
            "read_file",
            PermissionLevel::Execute,
            &allowed,
        ));

        let mut blocked = HashMap::new();
        blocked.insert("ip_address".to_string(), json!("203.0.113.9"));
        assert!(!manager.check_permission(
            Some("u1"),
            &[],
            "files",
            "read_file",
            PermissionLevel::Execute,
            &blocked,
        ));
    }

    #[test]
    fn test_malformed_time_range_allows() {
        assert!(check_time_range(&json!({"start": "not-a-time", "end": "25:99"})));
        assert!(check_time_range(&json!({"end": "99:99"})));
    }

    #[test]
    fn test_custom_condition_evaluator() {
        let manager = PermissionManager::new();
        manager.register_condition_evaluator(
            "mfa_verified",
            Box::new(|context, _value| {
                context.get("mfa").and_then(Value::as_bool) == Some(true)
            }),
        );

        let mut policy = PermissionPolicy::new("sensitive", PermissionLevel::Admin);
        policy.conditions = Some(json!({"mfa_verified": true}).as_object().unwrap().clone());
        manager.add_policy(policy);

        let mut context = HashMap::new();
        context.insert("mfa".to_string(), json!(false));
        assert!(!manager.check_permission(
            Some("u1"),
            &[],
            "vault",
            "unseal",
            PermissionLevel::Admin,
            &context,
        ));

        context.insert("mfa".to_string(), json!(true));
        assert!(manager.check_permission(
            Some("u1"),
            &[],
            "vault",
            "unseal",
            PermissionLevel::Admin,
            &context,
        ));
    }
}
