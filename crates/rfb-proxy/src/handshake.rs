//! RFB handshake passthrough.
//!
//! Frames the version, security and init exchange so the relay knows where
//! the message stream starts. Every byte is forwarded unmodified; only the
//! security types the proxy can follow (None and VNC authentication) are
//! accepted. Anything else closes the connection.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION_LEN: usize = 12;
const VNC_AUTH_CHALLENGE_LEN: usize = 16;
const SERVER_INIT_FIXED_LEN: usize = 24;

/// Cap on reason strings and the desktop name.
const MAX_STRING_LEN: usize = 64 * 1024;

pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_VNC_AUTH: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("i/o error during handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed protocol version {0:?}")]
    BadVersion(String),

    #[error("server refused connection: {reason}")]
    SecurityFailed { reason: String },

    #[error("unsupported security type {0}")]
    UnsupportedSecurity(u32),

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("{field} length {len} exceeds limit")]
    Oversized { field: &'static str, len: usize },

    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),
}

/// Negotiated protocol revision, reduced to the three behaviours that matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl ProtocolVersion {
    /// Parse a 12-byte `RFB xxx.yyy\n` banner. Unknown 3.x minors below 7
    /// behave as 3.3; anything from 3.8 upwards behaves as 3.8.
    pub fn parse(banner: &[u8]) -> Result<Self, HandshakeError> {
        let bad = || HandshakeError::BadVersion(String::from_utf8_lossy(banner).into_owned());
        if banner.len() != VERSION_LEN || &banner[..4] != b"RFB " || banner[11] != b'\n' {
            return Err(bad());
        }
        let text = std::str::from_utf8(&banner[4..11]).map_err(|_| bad())?;
        let (major, minor) = text.split_once('.').ok_or_else(bad)?;
        let major: u32 = major.parse().map_err(|_| bad())?;
        let minor: u32 = minor.parse().map_err(|_| bad())?;

        Ok(match (major, minor) {
            (3, m) if m >= 8 => Self::V3_8,
            (3, 7) => Self::V3_7,
            (3, _) => Self::V3_3,
            (m, _) if m > 3 => Self::V3_8,
            _ => return Err(bad()),
        })
    }
}

/// What the proxy learned while forwarding the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeSummary {
    pub version: ProtocolVersion,
    pub security_type: u8,
    pub shared: bool,
    pub width: u16,
    pub height: u16,
    pub desktop_name: String,
}

/// [`passthrough`] bounded by `limit`.
pub async fn passthrough_within<C, S>(
    limit: Duration,
    client: &mut C,
    server: &mut S,
) -> Result<HandshakeSummary, HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, passthrough(client, server))
        .await
        .map_err(|_| HandshakeError::Timeout(limit))?
}

/// Forward the full handshake between `client` and `server`.
pub async fn passthrough<C, S>(client: &mut C, server: &mut S) -> Result<HandshakeSummary, HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ProtocolVersion: server offers, client answers with what both speak.
    forward_exact(server, client, VERSION_LEN).await?;
    let client_banner = forward_exact(client, server, VERSION_LEN).await?;
    let version = ProtocolVersion::parse(&client_banner)?;

    let security_type = negotiate_security(client, server, version).await?;

    match security_type {
        SECURITY_NONE => {}
        SECURITY_VNC_AUTH => {
            forward_exact(server, client, VNC_AUTH_CHALLENGE_LEN).await?;
            forward_exact(client, server, VNC_AUTH_CHALLENGE_LEN).await?;
        }
        other => return Err(HandshakeError::UnsupportedSecurity(other as u32)),
    }

    if version == ProtocolVersion::V3_8 || security_type != SECURITY_NONE {
        let result = forward_u32(server, client).await?;
        if result != 0 {
            let reason = if version == ProtocolVersion::V3_8 {
                forward_string(server, client, "failure reason").await?
            } else {
                String::new()
            };
            return Err(HandshakeError::AuthFailed { reason });
        }
    }

    // ClientInit
    let shared = forward_exact(client, server, 1).await?[0] != 0;

    // ServerInit
    let init = forward_exact(server, client, SERVER_INIT_FIXED_LEN).await?;
    let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]) as usize;
    if name_len > MAX_STRING_LEN {
        return Err(HandshakeError::Oversized {
            field: "desktop name",
            len: name_len,
        });
    }
    let name = forward_exact(server, client, name_len).await?;

    Ok(HandshakeSummary {
        version,
        security_type,
        shared,
        width: u16::from_be_bytes([init[0], init[1]]),
        height: u16::from_be_bytes([init[2], init[3]]),
        desktop_name: String::from_utf8_lossy(&name).into_owned(),
    })
}

async fn negotiate_security<C, S>(
    client: &mut C,
    server: &mut S,
    version: ProtocolVersion,
) -> Result<u8, HandshakeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    if version == ProtocolVersion::V3_3 {
        // server decides: u32 type, zero means failure
        let chosen = forward_u32(server, client).await?;
        if chosen == 0 {
            let reason = forward_string(server, client, "failure reason").await?;
            return Err(HandshakeError::SecurityFailed { reason });
        }
        return u8::try_from(chosen).map_err(|_| HandshakeError::UnsupportedSecurity(chosen));
    }

    let count = forward_exact(server, client, 1).await?[0];
    if count == 0 {
        let reason = forward_string(server, client, "failure reason").await?;
        return Err(HandshakeError::SecurityFailed { reason });
    }
    forward_exact(server, client, count as usize).await?;
    let chosen = forward_exact(client, server, 1).await?[0];
    Ok(chosen)
}

/// Read exactly `n` bytes from `from`, write them to `to`, and return them.
async fn forward_exact<R, W>(from: &mut R, to: &mut W, n: usize) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; n];
    from.read_exact(&mut buf).await?;
    to.write_all(&buf).await?;
    to.flush().await?;
    Ok(buf)
}

async fn forward_u32<R, W>(from: &mut R, to: &mut W) -> Result<u32, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let b = forward_exact(from, to, 4).await?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

async fn forward_string<R, W>(
    from: &mut R,
    to: &mut W,
    field: &'static str,
) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let len = forward_u32(from, to).await? as usize;
    if len > MAX_STRING_LEN {
        return Err(HandshakeError::Oversized { field, len });
    }
    let bytes = forward_exact(from, to, len).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
