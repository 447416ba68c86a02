//! Admission control - accept/reject decided before any bytes are read.

use std::net::IpAddr;

use ipnet::IpNet;

/// Per-service admission filter over the client IP.
///
/// With `whitelist` set only listed clients are admitted; otherwise listed
/// clients are rejected. A rejected connection is closed silently.
#[derive(Debug, Default)]
pub struct Admission {
    nets: Vec<IpNet>,
    whitelist: bool,
}

impl Admission {
    pub fn new(patterns: &[String], whitelist: bool) -> Self {
        let nets = patterns
            .iter()
            .filter_map(|p| {
                let p = p.trim();
                p.parse::<IpNet>()
                    .ok()
                    .or_else(|| p.parse::<IpAddr>().ok().map(IpNet::from))
            })
            .collect();
        Self { nets, whitelist }
    }

    pub fn admit(&self, client: IpAddr) -> bool {
        if self.nets.is_empty() {
            return true;
        }
        let matched = self.nets.iter().any(|n| n.contains(&client));
        if self.whitelist {
            matched
        } else {
            !matched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist() {
        let a = Admission::new(&["192.168.0.0/16".to_string()], false);
        assert!(!a.admit("192.168.1.5".parse().unwrap()));
        assert!(a.admit("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_whitelist() {
        let a = Admission::new(&["127.0.0.1".to_string()], true);
        assert!(a.admit("127.0.0.1".parse().unwrap()));
        assert!(!a.admit("8.8.8.8".parse().unwrap()));
    }
}
