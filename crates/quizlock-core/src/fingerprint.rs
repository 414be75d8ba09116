//! Client fingerprint construction and exempt-subnet matching.
//!
//! A fingerprint is the concatenation of the session key, the client IP
//! (unless it falls inside an exempt subnet) and the raw user agent. No
//! delimiter separates the parts; stored locks were sealed over exactly
//! this layout, so changing it would block every attempt in flight.

use crate::error::{QuizlockError, QuizlockResult};
use crate::types::RequestContext;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Derived client identifier. Never persisted and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(<{} bytes>)", self.0.len())
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One entry of the exempt-subnet list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SubnetRule {
    /// `88.0.0.0/8`, `2001:db8::/32`, or a bare address (full-length prefix).
    Cidr { network: IpAddr, prefix_len: u8 },
    /// `10.1.2.10-20`: a run of addresses within the last octet.
    Range { head: [u8; 3], low: u8, high: u8 },
    /// `192.168.` or `10.1`: partial dotted address matched on octet boundaries.
    Prefix(String),
}

impl SubnetRule {
    fn parse(entry: &str) -> QuizlockResult<Self> {
        let invalid = |reason: &str| QuizlockError::InvalidSubnet {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        if let Some((addr, len)) = entry.split_once('/') {
            let network: IpAddr = addr
                .trim()
                .parse()
                .map_err(|_| invalid("network address does not parse"))?;
            let prefix_len: u8 = len
                .trim()
                .parse()
                .map_err(|_| invalid("prefix length is not a number"))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            if prefix_len > max {
                return Err(invalid("prefix length exceeds address width"));
            }
            return Ok(SubnetRule::Cidr {
                network,
                prefix_len,
            });
        }

        if let Ok(network) = entry.parse::<IpAddr>() {
            let prefix_len = if network.is_ipv4() { 32 } else { 128 };
            return Ok(SubnetRule::Cidr {
                network,
                prefix_len,
            });
        }

        if let Some((start, end)) = entry.split_once('-') {
            let start: Ipv4Addr = start
                .trim()
                .parse()
                .map_err(|_| invalid("range start is not an IPv4 address"))?;
            let high: u8 = end
                .trim()
                .parse()
                .map_err(|_| invalid("range end must be a final octet (0-255)"))?;
            let [a, b, c, low] = start.octets();
            if low > high {
                return Err(invalid("range end precedes range start"));
            }
            return Ok(SubnetRule::Range {
                head: [a, b, c],
                low,
                high,
            });
        }

        let prefix = entry.trim_end_matches('.');
        let groups: Vec<&str> = prefix.split('.').collect();
        let well_formed = !prefix.is_empty()
            && groups.len() <= 4
            && groups.iter().all(|g| g.parse::<u8>().is_ok());
        if !well_formed {
            return Err(invalid("expected CIDR, address, range or dotted prefix"));
        }
        Ok(SubnetRule::Prefix(prefix.to_string()))
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (
                SubnetRule::Cidr {
                    network: IpAddr::V4(net),
                    prefix_len,
                },
                IpAddr::V4(addr),
            ) => {
                let mask = if *prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(*prefix_len))
                };
                (u32::from(*addr) & mask) == (u32::from(*net) & mask)
            }
            (
                SubnetRule::Cidr {
                    network: IpAddr::V6(net),
                    prefix_len,
                },
                IpAddr::V6(addr),
            ) => {
                let mask = if *prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(*prefix_len))
                };
                (u128::from(*addr) & mask) == (u128::from(*net) & mask)
            }
            (SubnetRule::Range { head, low, high }, IpAddr::V4(addr)) => {
                let [a, b, c, d] = addr.octets();
                [a, b, c] == *head && (*low..=*high).contains(&d)
            }
            (SubnetRule::Prefix(prefix), IpAddr::V4(addr)) => {
                format!("{addr}.").starts_with(&format!("{prefix}."))
            }
            _ => false,
        }
    }
}

/// Parsed list of subnets whose addresses are left out of the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExemptSubnets {
    rules: Vec<SubnetRule>,
}

impl ExemptSubnets {
    /// Parse a comma-separated list such as `88.0.0.0/8, 77.77.0.0/16`.
    /// Blank entries are skipped; anything unparseable is rejected.
    pub fn parse(list: &str) -> QuizlockResult<Self> {
        let rules = list
            .split(|c: char| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(SubnetRule::parse)
            .collect::<QuizlockResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when `ip` parses and lies inside any configured subnet.
    pub fn contains(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.rules.iter().any(|rule| rule.contains(&addr)),
            Err(_) => false,
        }
    }
}

/// Build the fingerprint string from its raw parts.
pub fn build_fingerprint(
    session_key: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
    exempt: &ExemptSubnets,
) -> String {
    let mut out = String::with_capacity(
        session_key.len() + client_ip.map_or(0, str::len) + user_agent.map_or(0, str::len),
    );
    out.push_str(session_key);
    if let Some(ip) = client_ip.filter(|ip| !ip.is_empty()) {
        if !exempt.contains(ip) {
            out.push_str(ip);
        }
    }
    out.push_str(user_agent.unwrap_or(""));
    out
}

/// Fingerprint builder bound to one rule profile's exempt subnets.
#[derive(Debug, Clone, Default)]
pub struct FingerprintBuilder {
    exempt: ExemptSubnets,
}

impl FingerprintBuilder {
    pub fn new(exempt: ExemptSubnets) -> Self {
        Self { exempt }
    }

    pub fn build(&self, ctx: &RequestContext) -> Fingerprint {
        Fingerprint(build_fingerprint(
            &ctx.session_key,
            ctx.client_ip.as_deref(),
            ctx.user_agent.as_deref(),
            &self.exempt,
        ))
    }

    /// Whether the request's IP is left out of its fingerprint.
    pub fn ip_is_exempt(&self, ctx: &RequestContext) -> bool {
        ctx.client_ip
            .as_deref()
            .map_or(false, |ip| !ip.is_empty() && self.exempt.contains(ip))
    }
}
