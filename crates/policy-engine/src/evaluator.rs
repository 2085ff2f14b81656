use std::net::IpAddr;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, trace};

use crate::decision::{PolicyDecision, ResolvedAction};
use crate::matcher::{compile_addr_glob, AccessRequest, CompiledMatcher};
use crate::schema::{DefaultAction, PolicyConfig, PolicyRule, RuleAction};

// ---------------------------------------------------------------------------
// Compiled forms
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CompiledRule {
    rule: PolicyRule,
    matchers: Vec<CompiledMatcher>,
}

#[derive(Debug)]
struct CompiledGrant {
    client: Regex,
    permissions: Vec<String>,
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Evaluates intercepted messages against a loaded [`PolicyConfig`].
///
/// Construct via [`PolicyEngine::new`], which pre-compiles every pattern.
pub struct PolicyEngine {
    config: PolicyConfig,
    /// Sorted by ascending priority (lowest number first).
    rules: Vec<CompiledRule>,
    grants: Vec<CompiledGrant>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("version", &self.config.version)
            .field("default_action", &self.config.default_action)
            .field("num_rules", &self.rules.len())
            .field("num_grants", &self.grants.len())
            .finish()
    }
}

impl PolicyEngine {
    /// Create an engine from a validated [`PolicyConfig`]. Returns an error if
    /// any glob pattern is invalid.
    pub fn new(config: PolicyConfig) -> Result<Self> {
        let mut sorted = config.rules.clone();
        // stable sort keeps file order among equal priorities
        sorted.sort_by_key(|r| r.priority);

        let rules = sorted
            .into_iter()
            .map(|rule| -> Result<CompiledRule> {
                let matchers = rule
                    .matchers
                    .iter()
                    .map(CompiledMatcher::compile)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| {
                        format!("failed to compile matchers for rule '{}'", rule.name)
                    })?;
                Ok(CompiledRule { rule, matchers })
            })
            .collect::<Result<Vec<_>>>()?;

        let grants = config
            .grants
            .iter()
            .map(|g| -> Result<CompiledGrant> {
                Ok(CompiledGrant {
                    client: compile_addr_glob(&g.client)?,
                    permissions: g.permissions.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()
            .context("failed to compile grants")?;

        Ok(Self {
            config,
            rules,
            grants,
        })
    }

    /// Permissive engine used when no policy file is configured.
    pub fn allow_all() -> Self {
        Self {
            config: PolicyConfig {
                version: "1.0".to_string(),
                default_action: DefaultAction::Allow,
                grants: Vec::new(),
                rules: Vec::new(),
            },
            rules: Vec::new(),
            grants: Vec::new(),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    // -- Evaluate entry points ------------------------------------------------

    /// Permissions to issue to `client_addr` for a token request.
    pub fn grant(&self, client_addr: IpAddr, requested: &[String]) -> Vec<String> {
        let addr = client_addr.to_canonical().to_string();
        match self.grants.iter().find(|g| g.client.is_match(&addr)) {
            Some(grant) => {
                let granted: Vec<String> = requested
                    .iter()
                    .filter(|p| grant.permissions.contains(p))
                    .cloned()
                    .collect();
                debug!(client_addr = %addr, ?granted, "permissions capped by grant");
                granted
            }
            None => requested.to_vec(),
        }
    }

    /// Evaluate one message.
    pub fn evaluate(&self, req: &AccessRequest<'_>) -> PolicyDecision {
        trace!(
            message_kind = req.message_kind,
            client_addr = %req.client_addr,
            "evaluating message against policy"
        );

        for cr in &self.rules {
            if cr.matchers.is_empty() {
                continue;
            }
            if cr.matchers.iter().all(|m| m.matches(req)) {
                debug!(rule = %cr.rule.name, message_kind = req.message_kind, "rule matched");
                return decision_from_rule(&cr.rule);
            }
        }

        match self.config.default_action {
            DefaultAction::Allow => PolicyDecision::allow_default("no rule matched"),
            DefaultAction::Deny => PolicyDecision::deny_default("no rule matched; default is deny"),
        }
    }

    /// Action configured for the named rule, used when enforcing a violation
    /// reported with that rule's name as its code.
    pub fn rule_action(&self, name: &str) -> Option<RuleAction> {
        self.rules
            .iter()
            .find(|cr| cr.rule.name == name)
            .map(|cr| cr.rule.action)
    }
}

fn decision_from_rule(rule: &PolicyRule) -> PolicyDecision {
    let action = match rule.action {
        RuleAction::Allow => ResolvedAction::Allow,
        RuleAction::Deny => ResolvedAction::Deny,
        RuleAction::Terminate => ResolvedAction::Terminate,
    };
    PolicyDecision {
        action,
        matched_rule: Some(rule.name.clone()),
        reason: rule
            .description
            .clone()
            .unwrap_or_else(|| format!("matched rule '{}'", rule.name)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
