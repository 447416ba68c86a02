//! Nodes and their health markers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::common::{Address, RequestMeta};
use crate::transport::Transport;

/// One upstream endpoint with its transport stack.
///
/// Nodes are immutable after registration; reload replaces the whole set.
pub struct Node {
    pub name: String,
    pub addr: Address,
    pub transport: Arc<Transport>,
    pub marker: Arc<Marker>,
    pub filter: NodeFilter,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: Address, transport: Arc<Transport>) -> Self {
        Self {
            name: name.into(),
            addr,
            transport,
            marker: Arc::new(Marker::default()),
            filter: NodeFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Per-node request filter: a node only serves requests matching its
/// host/protocol/path patterns.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Host pattern: exact, or `*.suffix`
    pub host: Option<String>,
    pub protocol: Option<String>,
    /// Path prefix
    pub path: Option<String>,
}

impl NodeFilter {
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.protocol.is_none() && self.path.is_none()
    }

    pub fn matches(&self, req: &RequestMeta) -> bool {
        if let Some(pattern) = &self.host {
            let host = req.host.rsplit_once(':').map(|(h, _)| h).unwrap_or(&req.host);
            let ok = match pattern.strip_prefix("*.") {
                Some(suffix) => {
                    host.ends_with(&format!(".{}", suffix)) || host == suffix
                }
                None => host == pattern,
            };
            if !ok {
                return false;
            }
        }
        if let Some(proto) = &self.protocol {
            if !proto.is_empty() && *proto != req.proto {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if !path.is_empty() && !req.path.starts_with(path.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Failure tracker driving liveness:
///
/// ```text
/// healthy -> (failure) -> counting -> (>= max_fails within window) -> dead
///        ^                                                             |
///        +------------------- fail_timeout elapsed  ------------------+
/// ```
pub struct Marker {
    fails: AtomicU32,
    /// millis since UNIX_EPOCH of the most recent failure
    last_fail_ms: AtomicU64,
}

impl Default for Marker {
    fn default() -> Self {
        Self {
            fails: AtomicU32::new(0),
            last_fail_ms: AtomicU64::new(0),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Marker {
    pub fn mark_failed(&self) {
        self.fails.fetch_add(1, Ordering::AcqRel);
        self.last_fail_ms.store(now_ms(), Ordering::Release);
    }

    /// A success clears the failure streak.
    pub fn reset(&self) {
        self.fails.store(0, Ordering::Release);
    }

    pub fn fail_count(&self) -> u32 {
        self.fails.load(Ordering::Acquire)
    }

    /// Live means fewer than `max_fails` consecutive failures, or the
    /// cooldown has elapsed since the last one (the node gets probed again).
    pub fn is_live(&self, max_fails: u32, fail_timeout: Duration) -> bool {
        let fails = self.fails.load(Ordering::Acquire);
        if fails < max_fails.max(1) {
            return true;
        }
        let last = self.last_fail_ms.load(Ordering::Acquire);
        let elapsed = now_ms().saturating_sub(last);
        if elapsed >= fail_timeout.as_millis() as u64 {
            // cooldown over; allow one probe streak again
            self.fails.store(0, Ordering::Release);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_transitions() {
        let m = Marker::default();
        let window = Duration::from_secs(30);

        assert!(m.is_live(3, window));
        m.mark_failed();
        m.mark_failed();
        assert!(m.is_live(3, window), "counting but below max_fails");
        m.mark_failed();
        assert!(!m.is_live(3, window), "dead after max_fails");
    }

    #[test]
    fn test_marker_revives_after_timeout() {
        let m = Marker::default();
        m.mark_failed();
        assert!(!m.is_live(1, Duration::from_secs(600)));
        // zero timeout: cooldown is instantly over
        assert!(m.is_live(1, Duration::from_millis(0)));
        // the probe reset the streak
        assert_eq!(m.fail_count(), 0);
    }

    #[test]
    fn test_filter_host_wildcard() {
        let f = NodeFilter {
            host: Some("*.example.org".to_string()),
            ..Default::default()
        };
        let mut req = RequestMeta::default();
        req.host = "api.example.org:443".into();
        assert!(f.matches(&req));
        req.host = "example.com:443".into();
        assert!(!f.matches(&req));
    }
}
