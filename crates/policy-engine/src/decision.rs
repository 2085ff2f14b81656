/// The outcome of evaluating one message against the loaded policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub action: ResolvedAction,
    /// Name of the rule that matched, if any.
    pub matched_rule: Option<String>,
    pub reason: String,
}

/// What the proxy should do with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAction {
    Allow,
    Deny,
    /// Deny and end the session.
    Terminate,
}

impl PolicyDecision {
    pub fn allow_default(reason: impl Into<String>) -> Self {
        Self {
            action: ResolvedAction::Allow,
            matched_rule: None,
            reason: reason.into(),
        }
    }

    pub fn deny_default(reason: impl Into<String>) -> Self {
        Self {
            action: ResolvedAction::Deny,
            matched_rule: None,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.action == ResolvedAction::Allow
    }

    /// Stable code reported for a denial: the matched rule name, or
    /// `default_deny` when the default action applied.
    pub fn violation_code(&self) -> Option<String> {
        if self.is_allowed() {
            return None;
        }
        Some(
            self.matched_rule
                .clone()
                .unwrap_or_else(|| "default_deny".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_constructors() {
        let d = PolicyDecision::allow_default("no rules matched");
        assert!(d.is_allowed());
        assert!(d.matched_rule.is_none());
        assert_eq!(d.violation_code(), None);

        let d = PolicyDecision::deny_default("default policy is deny");
        assert_eq!(d.action, ResolvedAction::Deny);
        assert_eq!(d.violation_code().as_deref(), Some("default_deny"));
    }

    #[test]
    fn violation_code_names_the_rule() {
        let d = PolicyDecision {
            action: ResolvedAction::Terminate,
            matched_rule: Some("no-executables".to_string()),
            reason: "matched".to_string(),
        };
        assert_eq!(d.violation_code().as_deref(), Some("no-executables"));
    }
}
