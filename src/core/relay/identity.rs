//! Network identity resolution.
//!
//! Derives the discovery scope of a relay connection from its transport
//! address, or from trusted proxy headers when running in production behind
//! Cloudflare. Two devices see each other only if their identities are equal.

use crate::core::config::DeploymentMode;
use crate::core::error::ConnectivityError;
use axum::http::HeaderMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const CF_ZERO_TRUST_CLIENT_IP: &str = "cf-zero-trust-client-ip";
const CF_WORKER: &str = "cf-worker";
const CF_RAY: &str = "cf-ray";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Scoping key computed once per connection. Immutable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkIdentity(String);

impl NetworkIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    mode: DeploymentMode,
}

impl IdentityResolver {
    pub fn new(mode: DeploymentMode) -> Self {
        Self { mode }
    }

    /// Admit or reject a connection and compute its identity.
    pub fn resolve(
        &self,
        peer: SocketAddr,
        headers: &HeaderMap,
    ) -> Result<NetworkIdentity, ConnectivityError> {
        let ip = client_ip(peer, headers);
        if !self.is_allowed(&ip, headers) {
            return Err(ConnectivityError::NotAllowed(ip));
        }
        Ok(self.identity_for(&ip, headers))
    }

    fn is_allowed(&self, ip: &str, headers: &HeaderMap) -> bool {
        if self.mode == DeploymentMode::Production && has_cloudflare_claim(headers) {
            return true;
        }
        if is_local_network(ip) {
            return true;
        }
        self.mode == DeploymentMode::Development
    }

    fn identity_for(&self, ip: &str, headers: &HeaderMap) -> NetworkIdentity {
        if self.mode == DeploymentMode::Production {
            for name in [CF_ZERO_TRUST_CLIENT_IP, CF_CONNECTING_IP] {
                if let Some(value) = header(headers, name) {
                    return NetworkIdentity(format!("cf-{value}"));
                }
            }
        }
        NetworkIdentity(format!("local-{}", subnet_of(ip)))
    }
}

/// Client address: `cf-connecting-ip`, then the first `x-forwarded-for`
/// hop, then the socket address with any IPv4-mapped prefix removed.
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap) -> String {
    if let Some(ip) = header(headers, CF_CONNECTING_IP) {
        return strip_mapped_prefix(ip).to_string();
    }
    if let Some(forwarded) = header(headers, X_FORWARDED_FOR) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return strip_mapped_prefix(first).to_string();
        }
    }
    match peer.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn has_cloudflare_claim(headers: &HeaderMap) -> bool {
    let via_cloudflare = [CF_CONNECTING_IP, CF_WORKER, CF_RAY]
        .iter()
        .any(|name| header(headers, name).is_some());
    let client_claim = [CF_ZERO_TRUST_CLIENT_IP, CF_CONNECTING_IP]
        .iter()
        .any(|name| header(headers, name).is_some());
    via_cloudflare && client_claim
}

fn strip_mapped_prefix(ip: &str) -> &str {
    ip.strip_prefix("::ffff:").unwrap_or(ip)
}

/// Loopback, RFC 1918, link-local and IPv6 unique-local addresses.
pub fn is_local_network(ip: &str) -> bool {
    let ip = strip_mapped_prefix(ip);
    if ip.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || is_unique_local(&v6) || is_unicast_link_local(&v6),
        Err(_) => false,
    }
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// First three IPv4 octets, or the first four IPv6 hextets (the /64).
fn subnet_of(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}")
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}", s[0], s[1], s[2], s[3])
        }
        Err(_) => ip.split('.').take(3).collect::<Vec<_>>().join("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn lan_peers_share_a_subnet_identity() {
        let resolver = IdentityResolver::new(DeploymentMode::Production);
        let a = resolver.resolve(addr("192.168.1.20:5000"), &HeaderMap::new()).unwrap();
        let b = resolver.resolve(addr("192.168.1.31:6000"), &HeaderMap::new()).unwrap();
        let c = resolver.resolve(addr("192.168.2.31:6000"), &HeaderMap::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "local-192.168.1");
        assert_ne!(a, c);
    }

    #[test]
    fn ipv4_mapped_socket_address_is_unwrapped() {
        let resolver = IdentityResolver::new(DeploymentMode::Production);
        let id = resolver
            .resolve(addr("[::ffff:10.0.0.7]:1"), &HeaderMap::new())
            .unwrap();
        assert_eq!(id.as_str(), "local-10.0.0");
    }

    #[test]
    fn public_address_is_rejected_in_production() {
        let resolver = IdentityResolver::new(DeploymentMode::Production);
        let err = resolver
            .resolve(addr("8.8.8.8:443"), &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err, ConnectivityError::NotAllowed("8.8.8.8".into()));
    }

    #[test]
    fn public_address_is_admitted_in_development() {
        let resolver = IdentityResolver::new(DeploymentMode::Development);
        let id = resolver.resolve(addr("8.8.8.8:443"), &HeaderMap::new()).unwrap();
        assert_eq!(id.as_str(), "local-8.8.8");
    }

    #[test]
    fn cloudflare_claims_define_identity_in_production() {
        let resolver = IdentityResolver::new(DeploymentMode::Production);
        let h = headers(&[
            ("cf-connecting-ip", "203.0.113.9"),
            ("cf-ray", "abc"),
        ]);
        let id = resolver.resolve(addr("172.67.1.1:443"), &h).unwrap();
        assert_eq!(id.as_str(), "cf-203.0.113.9");

        let h = headers(&[
            ("cf-connecting-ip", "203.0.113.9"),
            ("cf-zero-trust-client-ip", "198.51.100.4"),
        ]);
        let id = resolver.resolve(addr("172.67.1.1:443"), &h).unwrap();
        assert_eq!(id.as_str(), "cf-198.51.100.4");
    }

    #[test]
    fn cloudflare_headers_are_ignored_in_development() {
        let resolver = IdentityResolver::new(DeploymentMode::Development);
        let h = headers(&[("cf-connecting-ip", "203.0.113.9"), ("cf-ray", "abc")]);
        let id = resolver.resolve(addr("127.0.0.1:1"), &h).unwrap();
        assert_eq!(id.as_str(), "local-203.0.113");
    }

    #[test]
    fn forwarded_for_uses_first_hop() {
        let h = headers(&[("x-forwarded-for", "10.1.2.3, 172.16.0.1")]);
        assert_eq!(client_ip(addr("127.0.0.1:9"), &h), "10.1.2.3");
    }

    #[test]
    fn local_network_classification() {
        assert!(is_local_network("127.0.0.1"));
        assert!(is_local_network("localhost"));
        assert!(is_local_network("10.4.4.4"));
        assert!(is_local_network("169.254.10.1"));
        assert!(is_local_network("fd12:3456::1"));
        assert!(is_local_network("fe80::1"));
        assert!(is_local_network("::1"));
        assert!(!is_local_network("1.1.1.1"));
        assert!(!is_local_network("2001:db8::1"));
        assert!(!is_local_network("not-an-ip"));
    }

    #[test]
    fn ipv6_identity_uses_the_64_prefix() {
        let resolver = IdentityResolver::new(DeploymentMode::Production);
        let a = resolver.resolve(addr("[fd00:1:2:3::10]:1"), &HeaderMap::new()).unwrap();
        let b = resolver.resolve(addr("[fd00:1:2:3::99]:1"), &HeaderMap::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "local-fd00:1:2:3");
    }
}
