//! Derive the rate limited identity from an incoming request.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use thiserror::Error;

use crate::ratelimit::LimitClass;

/// Header carrying an API token.
pub const API_KEY_HEADER: &str = "API_KEY";

/// The request carried nothing to rate limit on.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("could not determine IP address")]
    NoAddress,
}

/// The identity a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key: String,
    pub class: LimitClass,
}

impl Identity {
    fn new(key: impl Into<String>, class: LimitClass) -> Self {
        Self {
            key: key.into(),
            class,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Pick the identity for a request.
///
/// A token in the `API_KEY` header wins. Otherwise the client IP is taken
/// from the first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer
/// address of the connection.
pub fn extract_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<Identity, ExtractError> {
    if let Some(token) = header_str(headers, API_KEY_HEADER) {
        return Ok(Identity::new(token, LimitClass::Token));
    }

    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|chain| chain.split(',').map(str::trim).find(|ip| !ip.is_empty()))
    {
        return Ok(Identity::new(first, LimitClass::Ip));
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return Ok(Identity::new(real_ip, LimitClass::Ip));
    }

    peer.map(|addr| Identity::new(addr.ip().to_string(), LimitClass::Ip))
        .ok_or(ExtractError::NoAddress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.9:51234".parse().unwrap())
    }

    #[test]
    fn test_token_takes_precedence() {
        let h = headers(&[("api_key", "abc123"), ("x-forwarded-for", "1.1.1.1")]);
        let identity = extract_identity(&h, peer()).unwrap();
        assert_eq!(identity, Identity::new("abc123", LimitClass::Token));
    }

    #[test]
    fn test_first_forwarded_address() {
        let h = headers(&[("x-forwarded-for", " 203.0.113.7 , 10.0.0.1")]);
        let identity = extract_identity(&h, peer()).unwrap();
        assert_eq!(identity, Identity::new("203.0.113.7", LimitClass::Ip));
    }

    #[test]
    fn test_real_ip_header() {
        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        let identity = extract_identity(&h, peer()).unwrap();
        assert_eq!(identity, Identity::new("198.51.100.2", LimitClass::Ip));
    }

    #[test]
    fn test_peer_address_without_port() {
        let identity = extract_identity(&HeaderMap::new(), peer()).unwrap();
        assert_eq!(identity, Identity::new("10.0.0.9", LimitClass::Ip));

        let v6: SocketAddr = "[::1]:8080".parse().unwrap();
        let identity = extract_identity(&HeaderMap::new(), Some(v6)).unwrap();
        assert_eq!(identity.key, "::1");
    }

    #[test]
    fn test_empty_token_falls_back_to_ip() {
        let h = headers(&[("api_key", "  ")]);
        let identity = extract_identity(&h, peer()).unwrap();
        assert_eq!(identity.class, LimitClass::Ip);
    }

    #[test]
    fn test_no_source_is_an_error() {
        let result = extract_identity(&HeaderMap::new(), None);
        assert!(matches!(result, Err(ExtractError::NoAddress)));
    }
}
