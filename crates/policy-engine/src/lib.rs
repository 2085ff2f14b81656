//! # policy-engine
//!
//! Access policy for intercepted RFB sessions. Loads a YAML policy file,
//! pre-compiles its patterns, and decides per message whether it may be
//! forwarded, must be dropped, or ends the session. Also caps the permission
//! set issued to each client address.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use policy_engine::{loader, AccessRequest, PolicyEngine};
//!
//! let config = loader::load_policy("policy.yaml").unwrap();
//! let engine = PolicyEngine::new(config).unwrap();
//! let permissions = vec!["view_only".to_string()];
//! let decision = engine.evaluate(&AccessRequest {
//!     message_kind: "key_event",
//!     client_addr: "10.0.0.5".parse().unwrap(),
//!     permissions: &permissions,
//!     file_name: None,
//! });
//! println!("{:?}", decision);
//! ```

mod decision;
mod evaluator;
pub mod loader;
mod matcher;
mod schema;

pub use decision::{PolicyDecision, ResolvedAction};
pub use evaluator::PolicyEngine;
pub use matcher::AccessRequest;
pub use schema::{DefaultAction, GrantRule, Matcher, PolicyConfig, PolicyRule, RuleAction};
