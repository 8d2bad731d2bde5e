use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use spider_proto::Signal;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ChannelWriter;
use crate::session::shutdown::{CloseReason, Shutdown};

pub const MIN_CAPACITY: usize = 2;
pub const MAX_CAPACITY: usize = 8;
pub const DEFAULT_CAPACITY: usize = 4;
/// How long the writer may take to close once draining stops.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("outbound queue closed")]
    Closed,
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
}

/// Producer handle for the relay channel. Cheap to clone; every clone feeds
/// the same bounded buffer, which a single [`QueueConsumer`] drains in
/// arrival order.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Signal>,
    counters: Arc<QueueCounters>,
}

impl OutboundQueue {
    /// Capacity is clamped to `MIN_CAPACITY..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> (Self, QueueConsumer) {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(QueueCounters::default());
        (
            Self {
                tx,
                counters: Arc::clone(&counters),
            },
            QueueConsumer { rx, counters },
        )
    }

    /// Waits only while the buffer is full.
    pub async fn enqueue(&self, signal: Signal) -> Result<(), QueueError> {
        let kind = signal.kind();
        self.tx.send(signal).await.map_err(|_| QueueError::Closed)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target = "signaling", %kind, "outbound message queued");
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct QueueConsumer {
    rx: mpsc::Receiver<Signal>,
    counters: Arc<QueueCounters>,
}

impl QueueConsumer {
    /// Takes the next buffered message without waiting.
    pub fn try_next(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    pub fn spawn<W>(self, writer: W, shutdown: Shutdown) -> JoinHandle<()>
    where
        W: ChannelWriter + 'static,
    {
        tokio::spawn(self.drain(writer, shutdown))
    }

    /// Sends every queued message through `writer` until shutdown, then
    /// closes the writer. A send failure ends the session.
    pub async fn drain<W>(mut self, mut writer: W, shutdown: Shutdown)
    where
        W: ChannelWriter,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => next,
            };
            let Some(signal) = next else {
                break;
            };
            let kind = signal.kind();
            let envelope = match signal.encode() {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(target = "signaling", %kind, error = %err, "dropping unencodable message");
                    continue;
                }
            };
            let sent = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sent = writer.send(&envelope) => sent,
            };
            if let Err(err) = sent {
                tracing::error!(target = "signaling", %kind, error = %err, stage = "send", "relay send failed");
                shutdown.trigger(CloseReason::SendFailed(err.to_string()));
                break;
            }
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target = "signaling", %kind, "sent");
        }
        self.rx.close();
        match tokio::time::timeout(CLOSE_GRACE, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(target = "signaling", error = %err, "relay close failed"),
            Err(_) => tracing::warn!(target = "signaling", "relay close timed out"),
        }
    }
}
