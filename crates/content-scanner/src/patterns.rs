//! Sensitive-content pattern library.
//!
//! Static catalogue of regexes applied to clipboard text, transferred file
//! names and file payloads. Each entry has a stable name used in threat
//! evidence, a [`PatternCategory`], and a regex string compiled by the
//! [`Scanner`](crate::scanner::Scanner).

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// What kind of sensitive data a pattern looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternCategory {
    /// Payment card numbers.
    FinancialData,
    /// National identifiers such as SSN-shaped digit groups.
    PersonalIdentifier,
    /// Words that commonly accompany credentials or classified material.
    CredentialKeyword,
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FinancialData => write!(f, "FinancialData"),
            Self::PersonalIdentifier => write!(f, "PersonalIdentifier"),
            Self::CredentialKeyword => write!(f, "CredentialKeyword"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern definition
// ---------------------------------------------------------------------------

/// A single detection pattern.
pub struct SensitivePattern {
    /// Short, snake_case identifier used in logs and findings.
    pub name: &'static str,
    pub category: PatternCategory,
    /// A regex string (compiled by [`crate::scanner::Scanner`]).
    pub pattern: &'static str,
}

// ---------------------------------------------------------------------------
// Pattern catalogue
// ---------------------------------------------------------------------------

/// The built-in pattern library.
pub static PATTERNS: &[SensitivePattern] = &[
    // ---- Financial -----------------------------------------------------
    SensitivePattern {
        name: "card_number",
        category: PatternCategory::FinancialData,
        pattern: r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b",
    },
    // ---- Personal identifiers -----------------------------------------
    SensitivePattern {
        name: "ssn",
        category: PatternCategory::PersonalIdentifier,
        pattern: r"\b\d{3}-\d{2}-\d{4}\b",
    },
    // ---- Credential keywords ------------------------------------------
    SensitivePattern {
        name: "password_keyword",
        category: PatternCategory::CredentialKeyword,
        pattern: r"(?i)password",
    },
    SensitivePattern {
        name: "secret_keyword",
        category: PatternCategory::CredentialKeyword,
        pattern: r"(?i)secret",
    },
    SensitivePattern {
        name: "confidential_keyword",
        category: PatternCategory::CredentialKeyword,
        pattern: r"(?i)confidential",
    },
];
