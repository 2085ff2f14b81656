use std::net::IpAddr;

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::schema::Matcher;

/// One intercepted message as seen by the policy.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    /// snake_case message kind, e.g. `"key_event"`.
    pub message_kind: &'a str,
    pub client_addr: IpAddr,
    /// Permissions held by the session token.
    pub permissions: &'a [String],
    /// Present for file-transfer messages.
    pub file_name: Option<&'a str>,
}

/// A pre-compiled [`Matcher`].
#[derive(Debug)]
pub(crate) enum CompiledMatcher {
    MessageKind { kinds: Vec<String> },
    ClientAddr { regex: Regex },
    FileName { glob: GlobMatcher },
    LacksPermission { permission: String },
}

impl CompiledMatcher {
    pub(crate) fn compile(m: &Matcher) -> Result<Self> {
        match m {
            Matcher::MessageKind { pattern } => Ok(Self::MessageKind {
                kinds: split_alternatives(pattern),
            }),
            Matcher::ClientAddr { pattern } => Ok(Self::ClientAddr {
                regex: compile_addr_glob(pattern)?,
            }),
            Matcher::FileName { pattern } => {
                let glob = Glob::new(pattern)
                    .with_context(|| format!("invalid file-name glob: {pattern}"))?
                    .compile_matcher();
                Ok(Self::FileName { glob })
            }
            Matcher::LacksPermission { permission } => Ok(Self::LacksPermission {
                permission: permission.clone(),
            }),
        }
    }

    pub(crate) fn matches(&self, req: &AccessRequest<'_>) -> bool {
        match self {
            Self::MessageKind { kinds } => kinds.iter().any(|k| k == req.message_kind),
            Self::ClientAddr { regex } => {
                regex.is_match(&req.client_addr.to_canonical().to_string())
            }
            Self::FileName { glob } => req.file_name.is_some_and(|name| glob.is_match(name)),
            Self::LacksPermission { permission } => {
                !req.permissions.iter().any(|p| p == permission)
            }
        }
    }
}

fn split_alternatives(pattern: &str) -> Vec<String> {
    pattern
        .split('|')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compile an address glob (`*`, `?`, `|` alternatives) into an anchored regex.
pub(crate) fn compile_addr_glob(pattern: &str) -> Result<Regex> {
    let alternatives: Vec<String> = pattern
        .split('|')
        .map(|alt| glob_to_regex(alt.trim()))
        .collect();
    let combined = format!("^(?:{})$", alternatives.join("|"));
    Regex::new(&combined).with_context(|| format!("invalid address pattern: {pattern}"))
}

/// Convert a simple glob (with `*` and `?` wildcards) into an unanchored
/// regex fragment.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '\\' | '|' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}
