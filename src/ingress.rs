//! Ingress - host to endpoint rewrite table.
//!
//! Rules come from a static list plus an optional loader; a periodic task
//! rebuilds the map and publishes it atomically. Lookups try the exact
//! host, then the `.host` prefix form, then ever-shorter `.`-suffixes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub hostname: String,
    pub endpoint: String,
}

/// Source of additional rules (file, http, ...). Returns whole-rule lines.
#[async_trait]
pub trait RuleLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<String>>;
}

pub struct Ingress {
    rules: RwLock<Arc<HashMap<String, Rule>>>,
    statics: Vec<Rule>,
    loader: Option<Arc<dyn RuleLoader>>,
}

impl Ingress {
    pub fn new(statics: Vec<Rule>) -> Self {
        let ing = Self {
            rules: RwLock::new(Arc::new(HashMap::new())),
            statics,
            loader: None,
        };
        ing.rebuild(Vec::new());
        ing
    }

    pub fn with_loader(mut self, loader: Arc<dyn RuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Parse one `hostname endpoint` line; comments and blanks yield None.
    pub fn parse_line(line: &str) -> Option<Rule> {
        let line = line.replace('\t', " ");
        let line = line.split('#').next().unwrap_or("").trim();
        let mut parts = line.split_whitespace();
        let hostname = parts.next()?.to_string();
        let endpoint = parts.next()?.to_string();
        Some(Rule { hostname, endpoint })
    }

    fn rebuild(&self, loaded: Vec<Rule>) {
        let mut map = HashMap::new();
        for rule in self.statics.iter().chain(loaded.iter()) {
            if rule.hostname.is_empty() || rule.endpoint.is_empty() {
                continue;
            }
            // `*.example.org` is stored as its suffix form `.example.org`
            let mut host = rule.hostname.to_lowercase();
            if let Some(stripped) = host.strip_prefix('*') {
                host = stripped.to_string();
            }
            map.insert(host, rule.clone());
        }
        debug!("ingress: loaded {} rules", map.len());
        *self.rules.write() = Arc::new(map);
    }

    pub async fn reload(&self) -> Result<()> {
        let mut loaded = Vec::new();
        if let Some(loader) = &self.loader {
            for line in loader.load().await? {
                if let Some(rule) = Self::parse_line(&line) {
                    loaded.push(rule);
                }
            }
        }
        self.rebuild(loaded);
        Ok(())
    }

    /// Periodic reload; `period` below one second is clamped.
    pub async fn reload_loop(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let period = period.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!("ingress reload: {}", e);
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Look up the rewrite rule for a host (port is stripped).
    pub fn get_rule(&self, host: &str) -> Option<Rule> {
        if host.is_empty() {
            return None;
        }
        let host = host
            .rsplit_once(':')
            .map(|(h, p)| if p.parse::<u16>().is_ok() { h } else { host })
            .unwrap_or(host)
            .to_lowercase();

        let rules = self.rules.read().clone();

        if let Some(rule) = rules.get(&host) {
            return Some(rule.clone());
        }
        if let Some(rule) = rules.get(&format!(".{}", host)) {
            return Some(rule.clone());
        }
        // longest suffix by dot boundary
        let mut rest = host.as_str();
        while let Some(idx) = rest.find('.') {
            let suffix = &rest[idx..];
            if let Some(rule) = rules.get(suffix) {
                return Some(rule.clone());
            }
            rest = &rest[idx + 1..];
        }
        None
    }

    /// Current rules, for the control API.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().values().cloned().collect()
    }

    /// Replace the static rule set and republish (control API mutation).
    pub fn set_rules(&mut self, rules: Vec<Rule>) {
        self.statics = rules;
        self.rebuild(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingress(rules: &[(&str, &str)]) -> Ingress {
        Ingress::new(
            rules
                .iter()
                .map(|(h, e)| Rule {
                    hostname: h.to_string(),
                    endpoint: e.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_lookup_order() {
        let ing = ingress(&[
            ("app.example.org", "10.0.0.1:80"),
            ("*.example.org", "10.0.0.2:80"),
            (".org", "10.0.0.3:80"),
        ]);

        // exact beats wildcard
        assert_eq!(
            ing.get_rule("app.example.org:443").unwrap().endpoint,
            "10.0.0.1:80"
        );
        // wildcard suffix
        assert_eq!(
            ing.get_rule("db.example.org").unwrap().endpoint,
            "10.0.0.2:80"
        );
        // shortest suffix still reachable
        assert_eq!(ing.get_rule("other.org").unwrap().endpoint, "10.0.0.3:80");
        assert!(ing.get_rule("example.net").is_none());
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(
            Ingress::parse_line("app.example.org 10.0.0.1:80 # comment"),
            Some(Rule {
                hostname: "app.example.org".into(),
                endpoint: "10.0.0.1:80".into()
            })
        );
        assert_eq!(Ingress::parse_line("# all comment"), None);
        assert_eq!(Ingress::parse_line("lonely-host"), None);
    }

    #[tokio::test]
    async fn test_loader_merged_on_reload() {
        struct L;
        #[async_trait]
        impl RuleLoader for L {
            async fn load(&self) -> Result<Vec<String>> {
                Ok(vec!["dynamic.example 10.9.9.9:80".to_string()])
            }
        }

        let ing = ingress(&[("static.example", "10.1.1.1:80")]).with_loader(Arc::new(L));
        assert!(ing.get_rule("dynamic.example").is_none());
        ing.reload().await.unwrap();
        assert_eq!(
            ing.get_rule("dynamic.example").unwrap().endpoint,
            "10.9.9.9:80"
        );
        assert_eq!(
            ing.get_rule("static.example").unwrap().endpoint,
            "10.1.1.1:80"
        );
    }
}
