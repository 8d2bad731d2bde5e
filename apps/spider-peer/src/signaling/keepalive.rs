use std::time::Duration;

use spider_proto::Signal;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::OutboundQueue;
use crate::session::shutdown::Shutdown;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

/// Periodic `ping` on the relay channel, independent of negotiation.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    period: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl Keepalive {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns the number of pings handed to the queue once stopped.
    pub fn spawn(self, queue: OutboundQueue, shutdown: Shutdown) -> JoinHandle<u64> {
        tokio::spawn(self.run(queue, shutdown))
    }

    pub async fn run(self, queue: OutboundQueue, shutdown: Shutdown) -> u64 {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_triggered() {
                break;
            }
            let queued = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                queued = queue.enqueue(Signal::keepalive()) => queued,
            };
            match queued {
                Ok(()) => {
                    sent += 1;
                    tracing::trace!(target = "signaling", sent, "keepalive queued");
                }
                Err(err) => {
                    tracing::debug!(target = "signaling", error = %err, "keepalive stopped");
                    break;
                }
            }
        }
        sent
    }
}
