//! Observer - periodic per-client stats export.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::stats::{Event, HandlerStats};

/// Minimum tick period; configured values below this are clamped.
pub const MIN_OBSERVER_PERIOD: Duration = Duration::from_secs(1);
/// Default tick period.
pub const DEFAULT_OBSERVER_PERIOD: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, events: Vec<Event>) -> Result<()>;
}

/// Observer that logs events (the in-tree sink).
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
    async fn observe(&self, events: Vec<Event>) -> Result<()> {
        for ev in events {
            debug!(
                target: "observer",
                "{}/{}: conns={}/{} in={} out={} errs={}",
                ev.service, ev.client, ev.current_conns, ev.total_conns,
                ev.input_bytes, ev.output_bytes, ev.total_errs,
            );
        }
        Ok(())
    }
}

/// Tick loop driving one handler's stats into an observer.
///
/// A batch that fails to deliver is retained and retried on the next tick
/// (back-pressure of one period). Exits on shutdown.
pub async fn observe_loop(
    stats: Arc<HandlerStats>,
    observer: Arc<dyn Observer>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = period.max(MIN_OBSERVER_PERIOD);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending: Vec<Event> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    if observer.observe(pending.clone()).await.is_ok() {
                        pending.clear();
                    }
                    continue;
                }

                let events = stats.events();
                if events.is_empty() {
                    continue;
                }
                if observer.observe(events.clone()).await.is_err() {
                    pending = events;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Kind;
    use parking_lot::Mutex;

    struct FlakyObserver {
        fail_first: Mutex<bool>,
        seen: Mutex<Vec<Vec<Event>>>,
    }

    #[async_trait]
    impl Observer for FlakyObserver {
        async fn observe(&self, events: Vec<Event>) -> Result<()> {
            let mut fail = self.fail_first.lock();
            if *fail {
                *fail = false;
                return Err(crate::error::Error::Timeout);
            }
            self.seen.lock().push(events);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_retried_next_tick() {
        let stats = Arc::new(HandlerStats::new("svc", false));
        stats.stats("alice").add(Kind::TotalConns, 1);

        let observer = Arc::new(FlakyObserver {
            fail_first: Mutex::new(true),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(observe_loop(
            stats.clone(),
            observer.clone(),
            Duration::from_secs(1),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let _ = tx.send(());
        let _ = handle.await;

        let seen = observer.seen.lock();
        assert_eq!(seen.len(), 1, "retained batch delivered exactly once");
        assert_eq!(seen[0][0].client, "alice");
    }
}
