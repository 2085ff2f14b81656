//! Transparent RFB (VNC) interception proxy.
//!
//! The proxy sits between VNC viewers and a VNC server. The handshake is
//! forwarded untouched; after it, every message in either direction is
//! decoded, checked against static prevention switches and an external
//! authorization service, and observed for sensitive content and suspicious
//! behaviour before its original bytes are forwarded.
//!
//! ```text
//! viewer <--TCP-->  rfb-proxy  <--TCP-->  VNC server
//!                       |
//!        [prevention] [authorization] [events]
//!                       |
//!       audit / threat intel / provenance / broadcast
//! ```
//!
//! External services are reached only through the traits in
//! [`collaborator`]; [`memory`] has in-process implementations.

pub mod codec;
pub mod collaborator;
pub mod events;
pub mod gate;
pub mod handshake;
pub mod interceptor;
pub mod listener;
pub mod memory;
pub mod message;
pub mod relay;
pub mod risk;
pub mod session;
pub mod settings;
pub mod termination;

pub use codec::{DecodeError, DecodeOutcome, Decoder, DEFAULT_MAX_MESSAGE_LEN};
pub use collaborator::{
    AuditEvent, AuditKind, AuditService, AuthorizationService, Broadcaster, ChannelBroadcaster,
    CollaboratorError, Collaborators, EnforcementAction, ProvenanceService, SessionEvent,
    ThreatIntelService, ThreatType,
};
pub use interceptor::{Interceptor, Verdict};
pub use listener::{Proxy, ProxyError};
pub use message::{Direction, Message, MessageKind, ParsedMessage};
pub use session::{Permission, SessionEntry, SessionId, SessionSnapshot, SessionStatus, SessionStore};
pub use settings::{FailureMode, PreventionConfig, ProxySettings, Thresholds};
pub use termination::TerminationReason;
