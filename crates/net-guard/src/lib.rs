//! # net-guard
//!
//! Connection-time address checks for the RFB interception proxy.
//!
//! - [`classify`] decides whether a client address is internal (private or
//!   loopback) or external; the risk scorer weighs external clients.
//! - [`blocklist`] holds addresses refused at accept time, either configured
//!   statically or added for a bounded period after a policy violation.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use net_guard::{is_internal, Blocklist};
//!
//! let ip = "8.8.8.8".parse().unwrap();
//! assert!(!is_internal(ip));
//!
//! let blocklist = Blocklist::new();
//! blocklist.block_for(ip, Duration::from_secs(3600), "auth_violation");
//! assert!(blocklist.is_blocked(ip));
//! ```

pub mod blocklist;
pub mod classify;

pub use blocklist::{BlockEntry, Blocklist};
pub use classify::{classify, is_internal, parse_addresses, AddressClass, GuardError};
