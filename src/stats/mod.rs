//! Traffic statistics.
//!
//! `Stats` is a set of atomic counters safe to share across the wrapper
//! stack; `HandlerStats` keys them per client for the observer loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Counter kinds tracked per client and per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    TotalConns,
    CurrentConns,
    InputBytes,
    OutputBytes,
    TotalErrs,
}

/// Concurrency-safe counter set.
#[derive(Default)]
pub struct Stats {
    total_conns: AtomicU64,
    current_conns: AtomicU64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    total_errs: AtomicU64,
    updated: AtomicBool,
    reset_traffic: bool,
}

impl Stats {
    pub fn new(reset_traffic: bool) -> Self {
        Self {
            reset_traffic,
            ..Default::default()
        }
    }

    pub fn add(&self, kind: Kind, delta: i64) {
        let counter = match kind {
            Kind::TotalConns => &self.total_conns,
            Kind::CurrentConns => &self.current_conns,
            Kind::InputBytes => &self.input_bytes,
            Kind::OutputBytes => &self.output_bytes,
            Kind::TotalErrs => &self.total_errs,
        };
        if delta >= 0 {
            counter.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            // saturating decrement for the gauge-like counters
            let mut cur = counter.load(Ordering::Relaxed);
            loop {
                let next = cur.saturating_sub((-delta) as u64);
                match counter.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(v) => cur = v,
                }
            }
        }
        self.updated.store(true, Ordering::Release);
    }

    pub fn get(&self, kind: Kind) -> u64 {
        match kind {
            Kind::TotalConns => self.total_conns.load(Ordering::Relaxed),
            Kind::CurrentConns => self.current_conns.load(Ordering::Relaxed),
            Kind::InputBytes => self.input_bytes.load(Ordering::Relaxed),
            Kind::OutputBytes => self.output_bytes.load(Ordering::Relaxed),
            Kind::TotalErrs => self.total_errs.load(Ordering::Relaxed),
        }
    }

    /// Consume the updated flag; optionally reset traffic counters
    /// (used by the observer snapshot when `reset_traffic` is configured).
    pub fn take_updated(&self) -> bool {
        let updated = self.updated.swap(false, Ordering::AcqRel);
        if updated && self.reset_traffic {
            self.input_bytes.store(0, Ordering::Relaxed);
            self.output_bytes.store(0, Ordering::Relaxed);
        }
        updated
    }

    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }
}

/// One observer event - a cumulative per-client snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub service: String,
    pub client: String,
    pub total_conns: u64,
    pub current_conns: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_errs: u64,
}

/// Per-client stats map owned by one handler.
pub struct HandlerStats {
    service: String,
    reset_traffic: bool,
    stats: RwLock<HashMap<String, Arc<Stats>>>,
}

impl HandlerStats {
    pub fn new(service: impl Into<String>, reset_traffic: bool) -> Self {
        Self {
            service: service.into(),
            reset_traffic,
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Stats object for one client, created on first use.
    pub fn stats(&self, client: &str) -> Arc<Stats> {
        if let Some(found) = self.stats.read().get(client) {
            return found.clone();
        }

        let mut stats = self.stats.write();
        stats
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(Stats::new(self.reset_traffic)))
            .clone()
    }

    /// Snapshot of every client updated since the previous snapshot.
    pub fn events(&self) -> Vec<Event> {
        let stats = self.stats.read();
        let mut events = Vec::new();
        for (client, s) in stats.iter() {
            if !s.is_updated() {
                continue;
            }
            let event = Event {
                service: self.service.clone(),
                client: client.clone(),
                total_conns: s.get(Kind::TotalConns),
                current_conns: s.get(Kind::CurrentConns),
                input_bytes: s.get(Kind::InputBytes),
                output_bytes: s.get(Kind::OutputBytes),
                total_errs: s.get(Kind::TotalErrs),
            };
            s.take_updated();
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_monotonic() {
        let s = Stats::new(false);
        s.add(Kind::InputBytes, 10);
        s.add(Kind::InputBytes, 5);
        assert_eq!(s.get(Kind::InputBytes), 15);
    }

    #[test]
    fn test_current_conns_saturates() {
        let s = Stats::new(false);
        s.add(Kind::CurrentConns, -1);
        assert_eq!(s.get(Kind::CurrentConns), 0);
    }

    #[test]
    fn test_events_only_for_updated_clients() {
        let hs = HandlerStats::new("svc", false);
        hs.stats("alice").add(Kind::TotalConns, 1);
        let _ = hs.stats("bob"); // never touched

        let events = hs.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client, "alice");
        assert_eq!(events[0].total_conns, 1);

        // second snapshot sees nothing new
        assert!(hs.events().is_empty());
    }

    #[test]
    fn test_reset_traffic_zeroes_bytes_after_snapshot() {
        let hs = HandlerStats::new("svc", true);
        let s = hs.stats("alice");
        s.add(Kind::InputBytes, 100);
        assert_eq!(hs.events()[0].input_bytes, 100);
        assert_eq!(s.get(Kind::InputBytes), 0);
    }
}
