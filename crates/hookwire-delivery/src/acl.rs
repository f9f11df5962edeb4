//! Egress access control for outbound deliveries.
//!
//! An `Acl` is a deny list built from IP addresses, CIDR ranges, domain
//! patterns and named presets. Anything not denied is allowed. The delivery
//! client consults it for every resolved address before connecting, so a
//! hostname that resolves into a private range is rejected even when the
//! name itself looks harmless.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// Named rule sets that expand to concrete ranges.
const PRESETS: &[(&str, &[&str])] = &[
    ("@private", &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]),
    ("@loopback", &["127.0.0.0/8", "::1/128"]),
    ("@linklocal", &["169.254.0.0/16", "fe80::/10"]),
    (
        "@reserved",
        &["0.0.0.0/8", "100.64.0.0/10", "192.0.0.0/24", "224.0.0.0/4", "240.0.0.0/4", "fc00::/7"],
    ),
    ("@default", &["@private", "@loopback", "@linklocal", "@reserved"]),
];

fn preset(name: &str) -> Option<&'static [&'static str]> {
    PRESETS.iter().find(|(preset, _)| *preset == name).map(|(_, rules)| *rules)
}

fn expand_presets<'a>(rules: impl IntoIterator<Item = &'a str>, out: &mut Vec<String>) {
    for rule in rules {
        match preset(rule) {
            Some(members) => expand_presets(members.iter().copied(), out),
            None => out.push(rule.to_string()),
        }
    }
}

/// Maps `::ffff:a.b.c.d` to `a.b.c.d`; other addresses are returned as-is.
pub fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// An IP network in prefix notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

/// Error returned when a CIDR string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrParseError(String);

impl fmt::Display for CidrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR: {}", self.0)
    }
}

impl std::error::Error for CidrParseError {}

impl Cidr {
    /// Whether `ip` falls inside this network. Address families never mix.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(addr) & mask
            },
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(addr) & mask
            },
            _ => false,
        }
    }

    /// Prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

fn v6_mask(prefix_len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0)
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| CidrParseError(s.to_string()))?;
        let network: IpAddr = addr.parse().map_err(|_| CidrParseError(s.to_string()))?;
        let prefix_len: u8 = prefix.parse().map_err(|_| CidrParseError(s.to_string()))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max || prefix.starts_with('+') {
            return Err(CidrParseError(s.to_string()));
        }

        let network = match network {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix_len))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix_len))),
        };
        Ok(Self { network, prefix_len })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Case-insensitive hostname pattern: exact, or `*.suffix` for subdomains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPattern(String);

impl DomainPattern {
    /// Creates a pattern, lowercasing it.
    pub fn new(pattern: &str) -> Self {
        Self(pattern.to_ascii_lowercase())
    }

    /// Whether `host` matches. `*.example.com` does not match `example.com`.
    pub fn matches(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        match self.0.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => host.ends_with(suffix),
            _ => self.0 == host,
        }
    }
}

/// Deny-list egress policy.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    ips: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    domains: Vec<DomainPattern>,
}

impl Acl {
    /// Builds a policy from deny rules, expanding presets recursively.
    ///
    /// Each rule is tried as an IP address, then as a CIDR, and otherwise
    /// kept as a domain pattern. Unknown `@names` therefore become domain
    /// rules that never match a real host.
    pub fn new<S: AsRef<str>>(rules: &[S]) -> Self {
        let mut expanded = Vec::new();
        expand_presets(rules.iter().map(AsRef::as_ref), &mut expanded);

        let mut acl = Self::default();
        for rule in expanded {
            if let Ok(ip) = rule.parse::<IpAddr>() {
                acl.ips.push(unmap(ip));
            } else if let Ok(cidr) = rule.parse::<Cidr>() {
                acl.cidrs.push(cidr);
            } else {
                acl.domains.push(DomainPattern::new(&rule));
            }
        }
        acl
    }

    /// A policy that allows everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// True when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.cidrs.is_empty() && self.domains.is_empty()
    }

    /// Whether a connection to `ip`, reached through `host`, is permitted.
    pub fn allow(&self, host: &str, ip: IpAddr) -> bool {
        let ip = unmap(ip);
        if self.ips.iter().any(|denied| *denied == ip) {
            return false;
        }
        if self.cidrs.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        !self.denies_host(host)
    }

    /// Whether a domain rule denies `host` regardless of its addresses.
    pub fn denies_host(&self, host: &str) -> bool {
        self.domains.iter().any(|domain| domain.matches(host))
    }

    /// Checks that a configured rule is a preset, IP, CIDR or hostname.
    ///
    /// # Errors
    ///
    /// Returns a description of the rejected rule.
    pub fn validate_rule(rule: &str) -> Result<(), String> {
        if preset(rule).is_some() || rule.parse::<IpAddr>().is_ok() || rule.parse::<Cidr>().is_ok()
        {
            return Ok(());
        }
        if is_hostname_pattern(rule) {
            return Ok(());
        }
        Err(format!("invalid rule '{rule}': requires IP, CIDR, hostname, or preset name"))
    }
}

fn is_hostname_pattern(rule: &str) -> bool {
    let name = rule.strip_prefix("*.").unwrap_or(rule);
    let labels: Vec<&str> = name.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
