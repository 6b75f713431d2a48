//! Which destinations an exit will connect to.
//!
//! Rules are evaluated in order and the first match decides; without a match
//! the default action applies. With `block_private` set, loopback, private,
//! link-local, unspecified, broadcast and multicast destinations are refused
//! both as literal targets and after DNS resolution.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::RangeInclusive,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Addr, SocksSocketAddr};

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("invalid host pattern {0:?}")]
    Host(String),
    #[error("invalid port range {0:?}")]
    Ports(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

pub trait DestinationPolicy: Send + Sync {
    /// Decides on the requested target before it is resolved.
    fn check_target(&self, target: &SocksSocketAddr) -> Verdict;

    /// Decides on one resolved address of `target`.
    fn check_resolved(&self, _target: &SocksSocketAddr, _resolved: &SocketAddr) -> Verdict {
        Verdict::Allow
    }
}

/// Lets everything through.
pub struct AllowAll;

impl DestinationPolicy for AllowAll {
    fn check_target(&self, _target: &SocksSocketAddr) -> Verdict {
        Verdict::Allow
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
}

impl From<RuleAction> for Verdict {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => Verdict::Allow,
            RuleAction::Deny => Verdict::Deny,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub action: RuleAction,
    /// `*`, `example.com`, `*.example.com`, an IP or a CIDR block.
    pub host: String,
    /// `443` or `8000-8999`. Absent means every port.
    #[serde(default)]
    pub ports: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub default: RuleAction,
    pub block_private: bool,
    pub rules: Vec<RuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default: RuleAction::Allow,
            block_private: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum HostMatcher {
    Any,
    Exact(String),
    /// Matches the domain itself and everything below it.
    Suffix(String),
    Cidr(IpAddr, u8),
}

impl HostMatcher {
    fn parse(pattern: &str) -> Result<Self, PolicyError> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" {
            return Ok(HostMatcher::Any);
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err(PolicyError::Host(pattern));
            }
            return Ok(HostMatcher::Suffix(suffix.to_string()));
        }
        if let Some((ip, prefix)) = pattern.split_once('/') {
            let ip: IpAddr = ip.parse().map_err(|_| PolicyError::Host(pattern.clone()))?;
            let prefix: u8 = prefix.parse().map_err(|_| PolicyError::Host(pattern.clone()))?;
            let max = if ip.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(PolicyError::Host(pattern));
            }
            return Ok(HostMatcher::Cidr(ip, prefix));
        }
        if let Ok(ip) = pattern.parse::<IpAddr>() {
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            return Ok(HostMatcher::Cidr(ip, prefix));
        }
        if pattern.is_empty() || pattern.contains('*') {
            return Err(PolicyError::Host(pattern));
        }
        Ok(HostMatcher::Exact(pattern))
    }

    fn matches_host(&self, addr: &Addr) -> bool {
        match (self, addr) {
            (HostMatcher::Any, _) => true,
            (HostMatcher::Exact(name), Addr::Domain(domain)) => domain.eq_ignore_ascii_case(name),
            (HostMatcher::Suffix(suffix), Addr::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                domain == *suffix || domain.ends_with(&format!(".{suffix}"))
            }
            (HostMatcher::Cidr(network, prefix), Addr::Ipv4(ip)) => {
                in_cidr(IpAddr::V4(*ip), *network, *prefix)
            }
            (HostMatcher::Cidr(network, prefix), Addr::Ipv6(ip)) => {
                in_cidr(IpAddr::V6(*ip), *network, *prefix)
            }
            _ => false,
        }
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        match self {
            HostMatcher::Any => true,
            HostMatcher::Cidr(network, prefix) => in_cidr(ip, *network, *prefix),
            HostMatcher::Exact(_) | HostMatcher::Suffix(_) => false,
        }
    }
}

fn in_cidr(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            u32::from(ip) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(network)) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            u128::from(ip) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

fn parse_ports(ports: &str) -> Result<RangeInclusive<u16>, PolicyError> {
    let invalid = || PolicyError::Ports(ports.to_string());
    let (low, high) = match ports.split_once('-') {
        Some((low, high)) => (low.trim(), high.trim()),
        None => (ports.trim(), ports.trim()),
    };
    let low: u16 = low.parse().map_err(|_| invalid())?;
    let high: u16 = high.parse().map_err(|_| invalid())?;
    if low > high {
        return Err(invalid());
    }
    Ok(low..=high)
}

#[derive(Debug, Clone)]
struct Rule {
    action: RuleAction,
    host: HostMatcher,
    ports: Option<RangeInclusive<u16>>,
}

impl Rule {
    fn port_matches(&self, port: u16) -> bool {
        self.ports.as_ref().map_or(true, |range| range.contains(&port))
    }
}

/// Ordered allow/deny rules plus a default.
#[derive(Debug, Clone)]
pub struct RulePolicy {
    rules: Vec<Rule>,
    default: RuleAction,
    block_private: bool,
}

impl RulePolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Ok(Rule {
                    action: rule.action,
                    host: HostMatcher::parse(&rule.host)?,
                    ports: rule.ports.as_deref().map(parse_ports).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;
        Ok(Self {
            rules,
            default: config.default,
            block_private: config.block_private,
        })
    }
}

impl DestinationPolicy for RulePolicy {
    fn check_target(&self, target: &SocksSocketAddr) -> Verdict {
        if self.block_private {
            let literal = match &target.addr {
                Addr::Ipv4(ip) => Some(IpAddr::V4(*ip)),
                Addr::Ipv6(ip) => Some(IpAddr::V6(*ip)),
                Addr::Domain(domain) if domain.eq_ignore_ascii_case("localhost") => {
                    return Verdict::Deny
                }
                Addr::Domain(_) => None,
            };
            if literal.is_some_and(is_private) {
                return Verdict::Deny;
            }
        }
        self.rules
            .iter()
            .find(|rule| rule.port_matches(target.port) && rule.host.matches_host(&target.addr))
            .map_or(self.default, |rule| rule.action)
            .into()
    }

    fn check_resolved(&self, target: &SocksSocketAddr, resolved: &SocketAddr) -> Verdict {
        if self.block_private && is_private(resolved.ip()) {
            return Verdict::Deny;
        }
        // A domain target may still hit an IP deny rule once resolved.
        let denied = self.rules.iter().find(|rule| {
            rule.port_matches(target.port)
                && matches!(rule.host, HostMatcher::Cidr(..))
                && rule.host.matches_ip(resolved.ip())
        });
        match denied {
            Some(rule) if rule.action == RuleAction::Deny => Verdict::Deny,
            _ => Verdict::Allow,
        }
    }
}

/// Addresses an exit must not reach on behalf of the overlay.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_private_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(mapped) => is_private_v4(mapped),
            None => is_private_v6(ip),
        },
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        // shared address space, 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
        || a == 0
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}
