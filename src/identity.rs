//! Caller identity derivation from request headers and the peer address.
//!
//! A bearer credential always wins over address heuristics. Addresses are
//! taken from proxy headers only as far as the deployment trusts them (see
//! [`IdentityConfig`]); anything that does not parse as an IP literal is
//! skipped, and a request with no usable address resolves to the shared
//! `0.0.0.0` sentinel.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use axum::http::header::{HeaderName, AUTHORIZATION};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::config::IdentityConfig;
use crate::error::{Result, TollgateError};

/// General forwarding header carrying `client, proxy1, proxy2`.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Single-address forwarding header.
pub const X_REAL_IP: &str = "x-real-ip";
/// Address used when nothing else resolves.
pub const SENTINEL_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The rate-limited principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Hex SHA-256 digest of a bearer token
    Credential(String),
    /// Network address of the caller
    Address(IpAddr),
}

impl Identifier {
    /// Identifier for a bearer token. Only the digest is kept.
    pub fn from_token(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        Identifier::Credential(format!("{:x}", digest))
    }

    /// The shared low-trust identity.
    pub fn sentinel() -> Self {
        Identifier::Address(SENTINEL_ADDRESS)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Credential(digest) => write!(f, "cred_{}", digest),
            Identifier::Address(addr) => write!(f, "ip_{}", addr),
        }
    }
}

/// Resolves a stable [`Identifier`] for each request.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    trusted_edge_header: Option<HeaderName>,
    trust_forwarded_headers: bool,
}

impl IdentityResolver {
    /// Build a resolver. Fails only if the configured edge header is not a
    /// valid header name.
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let trusted_edge_header = match config.trusted_edge_header.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Some(
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).map_err(|e| {
                    TollgateError::Config(format!("invalid trusted_edge_header {:?}: {}", name, e))
                })?,
            ),
            _ => None,
        };

        Ok(Self {
            trusted_edge_header,
            trust_forwarded_headers: config.trust_forwarded_headers,
        })
    }

    /// Derive the identifier for a request. Never fails.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Identifier {
        if let Some(token) = bearer_token(headers) {
            trace!("Identified caller by bearer credential");
            return Identifier::from_token(token);
        }

        Identifier::Address(self.client_address(headers, peer))
    }

    /// Resolve the caller's network address.
    pub fn client_address(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> IpAddr {
        if let Some(name) = &self.trusted_edge_header {
            if let Some(ip) = header_ip(headers, name.as_str()) {
                trace!(client_ip = %ip, header = %name, "Using trusted edge header");
                return ip;
            }
        }

        if self.trust_forwarded_headers {
            let forwarded = header_str(headers, X_FORWARDED_FOR)
                .and_then(|value| value.split(',').next())
                .and_then(parse_ip);
            if let Some(ip) = forwarded {
                trace!(client_ip = %ip, "Using first X-Forwarded-For entry");
                return ip;
            }

            if let Some(ip) = header_ip(headers, X_REAL_IP) {
                trace!(client_ip = %ip, "Using X-Real-IP");
                return ip;
            }
        }

        match peer {
            Some(ip) => ip,
            None => {
                trace!("No usable client address, using sentinel");
                SENTINEL_ADDRESS
            }
        }
    }
}

/// Extract a non-empty `Authorization: Bearer <token>` value.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    header_str(headers, name).and_then(parse_ip)
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse().ok()
}
