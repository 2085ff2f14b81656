use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::schema::{Matcher, PolicyConfig};

/// Permission names a policy may refer to.
pub const KNOWN_PERMISSIONS: &[&str] = &["view_only", "remote_control"];

/// Load a [`PolicyConfig`] from a YAML file on disk.
///
/// Validates the config after deserialization (version, unique rule names,
/// permission names).
pub fn load_policy(path: impl AsRef<Path>) -> Result<PolicyConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    load_policy_from_str(&contents)
        .with_context(|| format!("failed to parse policy file: {}", path.display()))
}

/// Parse and validate a [`PolicyConfig`] from a YAML string.
pub fn load_policy_from_str(yaml: &str) -> Result<PolicyConfig> {
    let config: PolicyConfig = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &PolicyConfig) -> Result<()> {
    if config.version != "1.0" {
        bail!(
            "unsupported policy version '{}'; only '1.0' is supported",
            config.version
        );
    }

    for grant in &config.grants {
        if grant.client.trim().is_empty() {
            bail!("grant client pattern must not be empty");
        }
        for perm in &grant.permissions {
            check_permission(perm)
                .with_context(|| format!("in grant for '{}'", grant.client))?;
        }
    }

    let mut seen = HashSet::new();
    for rule in &config.rules {
        if rule.name.is_empty() {
            bail!("rule name must not be empty");
        }
        if !seen.insert(&rule.name) {
            bail!("duplicate rule name: '{}'", rule.name);
        }
        if rule.matchers.is_empty() {
            tracing::warn!(rule = %rule.name, "rule has no matchers and will never fire");
        }
        for matcher in &rule.matchers {
            if let Matcher::LacksPermission { permission } = matcher {
                check_permission(permission)
                    .with_context(|| format!("in rule '{}'", rule.name))?;
            }
        }
    }

    Ok(())
}

fn check_permission(name: &str) -> Result<()> {
    if !KNOWN_PERMISSIONS.contains(&name) {
        bail!(
            "unknown permission '{name}'; expected one of {}",
            KNOWN_PERMISSIONS.join(", ")
        );
    }
    Ok(())
}
