//! Compiled scanner that checks text against the sensitive pattern library
//! and returns structured findings.

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use crate::patterns::PATTERNS;

/// Replacement written over every matched span by [`Scanner::redact`].
pub const REDACTION_MARK: &str = "[REDACTED]";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while constructing a [`Scanner`].
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("failed to compile regex pattern: {0}")]
    RegexCompile(#[from] regex::Error),
}

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

/// A single match produced by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// The `name` of the [`SensitivePattern`](crate::patterns::SensitivePattern) that matched.
    pub pattern_name: String,
    /// Category string (e.g. `"FinancialData"`).
    pub category: String,
    /// The literal substring that triggered the match.
    pub matched_text: String,
    /// Byte offset of the match within the scanned text.
    pub offset: usize,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// [`RegexSet`] for the "does anything match" question, plus one [`Regex`]
/// per pattern (same order as [`PATTERNS`]) to extract positions.
pub struct Scanner {
    regex_set: RegexSet,
    individual: Vec<Regex>,
}

impl Scanner {
    pub fn new() -> Result<Self, ScannerError> {
        let pattern_strings: Vec<&str> = PATTERNS.iter().map(|p| p.pattern).collect();

        let regex_set = RegexSet::new(&pattern_strings)?;
        let individual = pattern_strings
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(patterns = individual.len(), "content scanner compiled");

        Ok(Self {
            regex_set,
            individual,
        })
    }

    /// Scan `text` and return all findings sorted by byte offset.
    pub fn scan(&self, text: &str) -> Vec<Finding> {
        let mut findings: Vec<Finding> = Vec::new();

        for idx in self.regex_set.matches(text).into_iter() {
            let pattern_def = &PATTERNS[idx];
            for m in self.individual[idx].find_iter(text) {
                findings.push(Finding {
                    pattern_name: pattern_def.name.to_string(),
                    category: pattern_def.category.to_string(),
                    matched_text: m.as_str().to_string(),
                    offset: m.start(),
                });
            }
        }

        findings.sort_by_key(|f| f.offset);
        findings
    }

    /// Scan raw bytes (e.g. a file payload). Non-UTF-8 sequences are replaced
    /// before matching, so offsets refer to the lossy text.
    pub fn scan_bytes(&self, bytes: &[u8]) -> Vec<Finding> {
        self.scan(&String::from_utf8_lossy(bytes))
    }

    /// Cheap check that skips match extraction.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex_set.is_match(text)
    }

    /// Return `text` with every matched span replaced by [`REDACTION_MARK`].
    ///
    /// Overlapping matches are merged so each sensitive region is masked
    /// exactly once.
    pub fn redact(&self, text: &str) -> String {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for idx in self.regex_set.matches(text).into_iter() {
            spans.extend(self.individual[idx].find_iter(text).map(|m| (m.start(), m.end())));
        }
        if spans.is_empty() {
            return text.to_string();
        }
        spans.sort_unstable();

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in spans {
            if end <= cursor {
                continue;
            }
            if start >= cursor {
                out.push_str(&text[cursor..start]);
                out.push_str(REDACTION_MARK);
            }
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        out
    }

    pub fn pattern_count(&self) -> usize {
        self.individual.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> Scanner {
        Scanner::new().expect("scanner should compile")
    }

    // -- detection --

    #[test]
    fn detects_password_keyword_case_insensitively() {
        let findings = scanner().scan("My PassWord is 1234");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pattern_name, "password_keyword");
        assert_eq!(findings[0].matched_text, "PassWord");
        assert_eq!(findings[0].offset, 3);
    }

    #[test]
    fn detects_card_number_with_separators() {
        let s = scanner();
        for text in ["4111 1111 1111 1111", "4111-1111-1111-1111", "4111111111111111"] {
            let findings = s.scan(text);
            assert!(
                findings.iter().any(|f| f.category == "FinancialData"),
                "no card finding for {text}"
            );
        }
    }

    #[test]
    fn detects_ssn_shape() {
        let findings = scanner().scan("ssn: 123-45-6789");
        assert!(findings.iter().any(|f| f.pattern_name == "ssn"));
    }

    #[test]
    fn short_digit_runs_are_clean() {
        let s = scanner();
        assert!(s.scan("call me at 555 1234").is_empty());
        assert!(!s.is_match("order 12-34"));
    }

    #[test]
    fn multiple_matches_are_sorted_by_offset() {
        let findings = scanner().scan("confidential: the secret password");
        let names: Vec<_> = findings.iter().map(|f| f.pattern_name.as_str()).collect();
        assert_eq!(
            names,
            ["confidential_keyword", "secret_keyword", "password_keyword"]
        );
    }

    #[test]
    fn scan_bytes_tolerates_invalid_utf8() {
        let mut payload = b"\xff\xfeSECRET plans".to_vec();
        payload.push(0xc3);
        let findings = scanner().scan_bytes(&payload);
        assert!(findings.iter().any(|f| f.pattern_name == "secret_keyword"));
    }

    // -- redaction --

    #[test]
    fn redact_masks_every_match() {
        let redacted = scanner().redact("password 123-45-6789 ok");
        assert_eq!(redacted, "[REDACTED] [REDACTED] ok");
    }

    #[test]
    fn redact_leaves_clean_text_alone() {
        assert_eq!(scanner().redact("hello world"), "hello world");
    }

    #[test]
    fn pattern_count_matches_catalogue() {
        assert_eq!(scanner().pattern_count(), PATTERNS.len());
    }
}
