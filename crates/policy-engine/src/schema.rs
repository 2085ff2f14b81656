use serde::{Deserialize, Serialize};

/// Top-level access policy loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Schema version; currently must be "1.0".
    pub version: String,
    /// Action taken when no rule matches.
    pub default_action: DefaultAction,
    /// Which permissions a client may be granted, by address.
    #[serde(default)]
    pub grants: Vec<GrantRule>,
    /// Rules evaluated against every intercepted message.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    Allow,
    Deny,
}

/// Caps the permission set issued to clients whose address matches `client`.
///
/// The first matching grant wins; the issued set is the intersection of the
/// requested permissions and `permissions`. Clients matching no grant receive
/// what they requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRule {
    /// Address glob, e.g. `"10.*"` or `"192.168.1.?"`.
    pub client: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A single policy rule. All matchers must match for the rule to fire (AND
/// logic); a rule without matchers never fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique rule name, reported as the violation code on denial.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Lower numeric priority is evaluated first. Default 100.
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub action: RuleAction,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

fn default_priority() -> i32 {
    100
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Forward the message.
    Allow,
    /// Drop the message, keep the session.
    Deny,
    /// Drop the message and end the session.
    Terminate,
}

/// A typed matcher checked against an [`AccessRequest`](crate::AccessRequest).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Matcher {
    /// Message kind name, `|`-separated alternatives (e.g. `"key_event|pointer_event"`).
    MessageKind { pattern: String },
    /// Client IP address glob.
    ClientAddr { pattern: String },
    /// File-transfer name glob; never matches messages without a file name.
    FileName { pattern: String },
    /// Matches when the session token lacks `permission`.
    LacksPermission { permission: String },
}
