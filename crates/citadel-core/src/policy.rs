//! ACL policies: storage, compilation, and evaluation.
//!
//! Policies are JSON documents of path rules. Each rule maps a path pattern
//! to capabilities plus optional parameter constraints. Patterns are exact
//! matches, glob prefixes (trailing `*`), or templates that expand identity
//! attributes (`{{identity.entity.id}}`) against the requesting entity once
//! per evaluation.
//!
//! The effective decision is allow if at least one matching rule grants the
//! capability and no matching rule denies. `deny` overrides everything;
//! `root` bypasses checks entirely; `sudo` satisfies paths that demand it.
//! A deny rule marked soft-mandatory yields to a request carrying the
//! policy-override flag, and the bypass is reported back as a warning.
//!
//! Two built-in policies exist: `root` (all capabilities everywhere) and
//! `default` (token self-management plus cubbyhole access). Neither can be
//! modified or deleted.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::barrier::Barrier;
use crate::error::PolicyError;
use crate::identity::Entity;

/// Storage prefix for policy documents.
const POLICY_PREFIX: &str = "sys/policy/acl/";

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Create,
    Read,
    Update,
    Delete,
    List,
    /// Recursive listing.
    Scan,
    Patch,
    /// Required by some system paths in addition to the CRUD capability.
    Sudo,
    /// Bypasses all checks.
    Root,
    /// Overrides every grant on matching paths.
    Deny,
}

/// One path rule within a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    /// Exact path, glob prefix (`secret/data/team/*`), or identity template.
    pub pattern: String,
    pub capabilities: Vec<Capability>,
    /// Allowlist: when non-empty, only listed parameters may appear. A
    /// parameter mapped to an empty list accepts any value; otherwise the
    /// submitted value must be one of the listed values.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub allowed_parameters: HashMap<String, Vec<serde_json::Value>>,
    /// Denylist: listed parameters may never appear.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_parameters: Vec<String>,
    /// Parameters that must be present on write operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_parameters: Vec<String>,
    /// Bounds on requested response-wrapping TTLs, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_wrapping_ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wrapping_ttl: Option<i64>,
    /// Cap on list/scan page sizes through this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_limit: Option<i64>,
    /// MFA methods that must accompany requests through this rule.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mfa_methods: Vec<String>,
    /// Soft-mandatory rules deny by default but yield to an explicit
    /// policy-override request. Hard rules (the default) never yield.
    #[serde(default)]
    pub soft_mandatory: bool,
}

impl PathRule {
    /// A rule granting `capabilities` on `pattern`, no constraints.
    #[must_use]
    pub fn new(pattern: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            pattern: pattern.into(),
            capabilities,
            allowed_parameters: HashMap::new(),
            denied_parameters: Vec::new(),
            required_parameters: Vec::new(),
            min_wrapping_ttl: None,
            max_wrapping_ttl: None,
            pagination_limit: None,
            mfa_methods: Vec::new(),
            soft_mandatory: false,
        }
    }
}

/// A named policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub paths: Vec<PathRule>,
    /// Check-and-set version, bumped on every write.
    #[serde(default)]
    pub cas_version: u64,
}

/// The inputs to one ACL evaluation.
#[derive(Debug)]
pub struct AclRequest<'a> {
    pub path: &'a str,
    pub capability: Capability,
    /// Request body parameters, for allow/deny/required checks.
    pub parameters: Option<&'a serde_json::Map<String, serde_json::Value>>,
    /// Requested response-wrapping TTL, if any.
    pub wrap_ttl: Option<i64>,
    /// MFA methods satisfied on this request.
    pub mfa_methods: &'a [String],
    /// The caller asked to bypass soft-mandatory denies.
    pub policy_override: bool,
}

/// The outcome of an ACL evaluation.
#[derive(Debug, Clone, Default)]
pub struct AclDecision {
    pub allowed: bool,
    /// The token carries the root policy.
    pub root: bool,
    /// A matching rule granted `sudo`.
    pub sudo: bool,
    /// Tightest pagination limit among matching rules, if any set one.
    pub pagination_limit: Option<i64>,
    /// A soft-mandatory deny was bypassed; surfaced as a warning.
    pub overridden: bool,
    /// Human-readable reason when denied.
    pub deny_reason: Option<String>,
}

impl AclDecision {
    fn denied(reason: impl Into<String>) -> Self {
        Self {
            deny_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Stores and evaluates policies, with an in-memory compiled cache.
pub struct PolicyStore {
    barrier: Arc<Barrier>,
    cache: RwLock<HashMap<String, Arc<Policy>>>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

impl PolicyStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Write or update a policy, with optional check-and-set.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root`/`default`.
    /// - [`PolicyError::Invalid`] for an empty rule set.
    /// - [`PolicyError::CasMismatch`] when `cas` does not match the stored
    ///   version.
    pub async fn set(&self, mut policy: Policy, cas: Option<u64>) -> Result<(), PolicyError> {
        if is_builtin(&policy.name) {
            return Err(PolicyError::BuiltIn {
                name: policy.name,
            });
        }
        if policy.paths.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must have at least one path rule".to_owned(),
            });
        }

        let key = format!("{POLICY_PREFIX}{}", policy.name);
        let existing_version = match self.barrier.get(&key).await? {
            Some(raw) => serde_json::from_slice::<Policy>(&raw)
                .map(|p| p.cas_version)
                .unwrap_or(0),
            None => 0,
        };
        if let Some(expected) = cas {
            if expected != existing_version {
                return Err(PolicyError::CasMismatch {
                    name: policy.name,
                    expected,
                    found: existing_version,
                });
            }
        }
        policy.cas_version = existing_version + 1;

        let raw = serde_json::to_vec(&policy).map_err(|e| PolicyError::Invalid {
            reason: format!("policy encoding failed: {e}"),
        })?;
        self.barrier.put(&key, &raw).await?;

        info!(name = %policy.name, rules = policy.paths.len(), "policy written");
        self.cache
            .write()
            .await
            .insert(policy.name.clone(), Arc::new(policy));
        Ok(())
    }

    /// Fetch a policy by name. Built-ins are synthesized.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] when absent.
    pub async fn get(&self, name: &str) -> Result<Arc<Policy>, PolicyError> {
        if name == "root" {
            return Ok(Arc::new(root_policy()));
        }
        if name == "default" {
            return Ok(Arc::new(default_policy()));
        }

        if let Some(found) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(found));
        }

        let key = format!("{POLICY_PREFIX}{name}");
        let raw = self
            .barrier
            .get(&key)
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                name: name.to_owned(),
            })?;
        let policy: Policy = serde_json::from_slice(&raw).map_err(|e| PolicyError::Invalid {
            reason: format!("policy decoding failed: {e}"),
        })?;

        let policy = Arc::new(policy);
        self.cache
            .write()
            .await
            .insert(name.to_owned(), Arc::clone(&policy));
        Ok(policy)
    }

    /// Delete a policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::BuiltIn`] for `root`/`default`.
    pub async fn delete(&self, name: &str) -> Result<(), PolicyError> {
        if is_builtin(name) {
            return Err(PolicyError::BuiltIn {
                name: name.to_owned(),
            });
        }
        let key = format!("{POLICY_PREFIX}{name}");
        self.barrier.delete(&key).await?;
        self.cache.write().await.remove(name);
        info!(name = %name, "policy deleted");
        Ok(())
    }

    /// All policy names, built-ins included.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn list(&self) -> Result<Vec<String>, PolicyError> {
        let keys = self.barrier.list(POLICY_PREFIX).await?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(POLICY_PREFIX).map(String::from))
            .collect();
        for builtin in ["default", "root"] {
            if !names.iter().any(|n| n == builtin) {
                names.push(builtin.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Drop a cached compiled policy (cross-node invalidation hook).
    pub async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(name);
    }

    /// Evaluate the policies attached to a token against a request.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures while loading policies; unknown policy
    /// names are skipped.
    pub async fn evaluate(
        &self,
        policy_names: &[String],
        entity: Option<&Entity>,
        request: &AclRequest<'_>,
    ) -> Result<AclDecision, PolicyError> {
        // Root bypasses evaluation entirely.
        if policy_names.iter().any(|n| n == "root") {
            return Ok(AclDecision {
                allowed: true,
                root: true,
                sudo: true,
                pagination_limit: None,
                overridden: false,
                deny_reason: None,
            });
        }

        let mut matching: Vec<PathRule> = Vec::new();
        for name in policy_names {
            let policy = match self.get(name).await {
                Ok(p) => p,
                Err(PolicyError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            for rule in &policy.paths {
                if rule_matches(rule, request.path, entity) {
                    matching.push(rule.clone());
                }
            }
        }

        if matching.is_empty() {
            return Ok(AclDecision::denied(format!(
                "no policy grants access to '{}'",
                request.path
            )));
        }

        // Deny overrides everything. A soft-mandatory deny yields only to
        // an explicit override, which is surfaced back as a warning.
        let mut overridden = false;
        for rule in &matching {
            if !rule.capabilities.contains(&Capability::Deny) {
                continue;
            }
            if rule.soft_mandatory && request.policy_override {
                overridden = true;
                continue;
            }
            return Ok(AclDecision::denied(format!(
                "access to '{}' explicitly denied",
                request.path
            )));
        }

        // Union of capabilities over matching rules.
        let has = |cap: Capability| matching.iter().any(|r| r.capabilities.contains(&cap));
        let granted = has(request.capability) || has(Capability::Root);
        if !granted {
            return Ok(AclDecision::denied(format!(
                "capability {:?} not granted on '{}'",
                request.capability, request.path
            )));
        }

        // MFA requirements: every demanded method must be satisfied.
        for rule in &matching {
            for method in &rule.mfa_methods {
                if !request.mfa_methods.contains(method) {
                    return Ok(AclDecision::denied(format!(
                        "MFA method '{method}' required"
                    )));
                }
            }
        }

        // Parameter constraints.
        if let Some(reason) = check_parameters(&matching, request.parameters) {
            return Ok(AclDecision::denied(reason));
        }

        // Wrapping-TTL bounds.
        if let Some(wrap_ttl) = request.wrap_ttl {
            for rule in &matching {
                if let Some(min) = rule.min_wrapping_ttl {
                    if wrap_ttl < min {
                        return Ok(AclDecision::denied(format!(
                            "wrapping TTL below required minimum of {min}s"
                        )));
                    }
                }
                if let Some(max) = rule.max_wrapping_ttl {
                    if wrap_ttl > max {
                        return Ok(AclDecision::denied(format!(
                            "wrapping TTL above allowed maximum of {max}s"
                        )));
                    }
                }
            }
        }

        let pagination_limit = matching.iter().filter_map(|r| r.pagination_limit).min();

        Ok(AclDecision {
            allowed: true,
            root: false,
            sudo: has(Capability::Sudo),
            pagination_limit,
            overridden,
            deny_reason: None,
        })
    }
}

fn is_builtin(name: &str) -> bool {
    name == "root" || name == "default"
}

/// The built-in `root` policy.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        name: "root".to_owned(),
        paths: vec![PathRule::new("*", vec![Capability::Root])],
        cas_version: 0,
    }
}

/// The built-in `default` policy: token self-management and cubbyhole.
#[must_use]
pub fn default_policy() -> Policy {
    Policy {
        name: "default".to_owned(),
        paths: vec![
            PathRule::new("auth/token/lookup-self", vec![Capability::Read]),
            PathRule::new("auth/token/renew-self", vec![Capability::Update]),
            PathRule::new("auth/token/revoke-self", vec![Capability::Update]),
            PathRule::new(
                "cubbyhole/*",
                vec![
                    Capability::Create,
                    Capability::Read,
                    Capability::Update,
                    Capability::Delete,
                    Capability::List,
                ],
            ),
        ],
        cas_version: 0,
    }
}

/// Whether a rule matches a path, expanding identity templates first.
fn rule_matches(rule: &PathRule, path: &str, entity: Option<&Entity>) -> bool {
    let Some(pattern) = expand_template(&rule.pattern, entity) else {
        // Unresolvable template (no entity, unknown alias) never matches.
        return false;
    };

    if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        path == pattern
    }
}

/// Expand `{{identity....}}` segments against the resolved entity.
///
/// Supported: `identity.entity.id`, `identity.entity.name`,
/// `identity.entity.aliases.<mount accessor>.name`, and
/// `identity.entity.metadata.<key>`. Returns `None` when a referenced
/// attribute cannot be resolved.
fn expand_template(pattern: &str, entity: Option<&Entity>) -> Option<String> {
    if !pattern.contains("{{") {
        return Some(pattern.to_owned());
    }

    let entity = entity?;
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        let token = after[..end].trim();

        let value = match token {
            "identity.entity.id" => Some(entity.id.clone()),
            "identity.entity.name" => Some(entity.name.clone()),
            _ => {
                if let Some(alias_ref) = token.strip_prefix("identity.entity.aliases.") {
                    let accessor = alias_ref.strip_suffix(".name")?;
                    entity
                        .aliases
                        .iter()
                        .find(|a| a.mount_accessor == accessor)
                        .map(|a| a.name.clone())
                } else if let Some(meta_key) = token.strip_prefix("identity.entity.metadata.") {
                    entity.metadata.get(meta_key).cloned()
                } else {
                    None
                }
            }
        }?;

        out.push_str(&value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Some(out)
}

/// Enforce parameter allow/deny/required constraints from matching rules.
///
/// Returns a denial reason, or `None` when the parameters pass.
fn check_parameters(
    rules: &[PathRule],
    parameters: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Option<String> {
    let empty = serde_json::Map::new();
    let params = parameters.unwrap_or(&empty);

    // Required parameters from any matching rule must be present.
    for rule in rules {
        for required in &rule.required_parameters {
            if !params.contains_key(required) {
                return Some(format!("required parameter '{required}' missing"));
            }
        }
    }

    // Denied parameters from any matching rule may not appear.
    for rule in rules {
        for denied in &rule.denied_parameters {
            if params.contains_key(denied) {
                return Some(format!("parameter '{denied}' not permitted"));
            }
        }
    }

    // If any rule carries an allowlist, each submitted parameter must be
    // admitted by some rule's allowlist (with value constraints honored).
    let allowlists: Vec<&HashMap<String, Vec<serde_json::Value>>> = rules
        .iter()
        .filter(|r| !r.allowed_parameters.is_empty())
        .map(|r| &r.allowed_parameters)
        .collect();
    if !allowlists.is_empty() {
        for (name, value) in params {
            let admitted = allowlists.iter().any(|list| {
                list.get(name)
                    .map(|values| values.is_empty() || values.contains(value))
                    .unwrap_or(false)
            });
            if !admitted {
                return Some(format!("parameter '{name}' not permitted"));
            }
        }
    }

    None
}
