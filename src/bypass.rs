//! Bypass - predicate deciding whether a (network, target) is forbidden.
//!
//! Rules are host literals, `*.suffix` wildcards, or CIDR blocks. A
//! whitelist bypass inverts the match: only listed targets are allowed.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::common::Network;

#[derive(Debug, Clone)]
enum Rule {
    Host(String),
    Suffix(String),
    Net(IpNet),
}

/// Target filter attached to services, hops and the MITM layer.
#[derive(Debug, Default)]
pub struct Bypass {
    rules: Vec<Rule>,
    whitelist: bool,
}

impl Bypass {
    pub fn new(patterns: &[String], whitelist: bool) -> Self {
        let rules = patterns
            .iter()
            .filter_map(|p| {
                let p = p.trim();
                if p.is_empty() {
                    return None;
                }
                if let Ok(net) = p.parse::<IpNet>() {
                    return Some(Rule::Net(net));
                }
                if let Ok(ip) = p.parse::<IpAddr>() {
                    return Some(Rule::Net(IpNet::from(ip)));
                }
                if let Some(suffix) = p.strip_prefix("*.") {
                    return Some(Rule::Suffix(format!(".{}", suffix.to_lowercase())));
                }
                Some(Rule::Host(p.to_lowercase()))
            })
            .collect();

        Self { rules, whitelist }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `addr` (host or host:port) is forbidden for `network`.
    pub fn contains(&self, _network: Network, addr: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }

        let host = addr
            .rsplit_once(':')
            .map(|(h, p)| if p.parse::<u16>().is_ok() { h } else { addr })
            .unwrap_or(addr);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let lower = host.to_lowercase();
        let ip: Option<IpAddr> = host.parse().ok();

        let matched = self.rules.iter().any(|rule| match rule {
            Rule::Host(h) => *h == lower,
            Rule::Suffix(s) => lower.ends_with(s.as_str()),
            Rule::Net(net) => ip.map(|ip| net.contains(&ip)).unwrap_or(false),
        });

        if self.whitelist {
            !matched
        } else {
            matched
        }
    }
}
