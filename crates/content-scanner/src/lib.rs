//! # content-scanner
//!
//! Finds sensitive content (card numbers, SSN-shaped identifiers, credential
//! keywords) in text that crosses an intercepted remote-control session:
//! clipboard transfers, file names and file payloads.
//!
//! 1. **[`patterns`]** -- static catalogue of regexes grouped by
//!    [`PatternCategory`](patterns::PatternCategory).
//! 2. **[`scanner`]** -- compiles the catalogue into a
//!    [`RegexSet`](regex::RegexSet), produces [`Finding`](scanner::Finding)
//!    values and can mask matches for audit previews.
//!
//! ## Quick start
//!
//! ```rust
//! use content_scanner::Scanner;
//!
//! let scanner = Scanner::new().unwrap();
//! let findings = scanner.scan("my password is 1234");
//! assert_eq!(findings[0].matched_text, "password");
//! ```

pub mod patterns;
pub mod scanner;

pub use patterns::{PatternCategory, SensitivePattern, PATTERNS};
pub use scanner::{Finding, Scanner, ScannerError};
