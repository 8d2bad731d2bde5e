use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::transport::ConnectivityState;

/// Why a session entered `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    TransportState(ConnectivityState),
    ChannelClosed,
    ChannelError(String),
    SendFailed(String),
    Negotiation(String),
    Interrupted,
}

impl CloseReason {
    /// Clean closes map to exit code 0.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            CloseReason::TransportState(_) | CloseReason::ChannelClosed | CloseReason::Interrupted
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TransportState(state) => write!(f, "transport {state}"),
            CloseReason::ChannelClosed => f.write_str("relay channel closed"),
            CloseReason::ChannelError(err) => write!(f, "relay channel error: {err}"),
            CloseReason::SendFailed(err) => write!(f, "relay send failed: {err}"),
            CloseReason::Negotiation(err) => write!(f, "negotiation failed: {err}"),
            CloseReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Exactly-once close trigger shared by every task of a session.
///
/// The first call to [`Shutdown::trigger`] records its reason and cancels the
/// token; later calls are no-ops and report `false`.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                tracing::trace!(target = "signaling", %reason, "close already triggered");
                return false;
            }
            tracing::info!(target = "signaling", %reason, "session closing");
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger(CloseReason::TransportState(ConnectivityState::Failed)));
        assert!(!shutdown.trigger(CloseReason::ChannelClosed));
        assert_eq!(
            shutdown.reason(),
            Some(CloseReason::TransportState(ConnectivityState::Failed))
        );
        assert!(shutdown.token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_close_once() {
        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();
        for n in 0..16 {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if n % 2 == 0 {
                    shutdown.trigger(CloseReason::TransportState(ConnectivityState::Disconnected))
                } else {
                    shutdown.trigger(CloseReason::ChannelClosed)
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        shutdown.cancelled().await;
    }

    #[test]
    fn clean_reasons() {
        assert!(CloseReason::ChannelClosed.is_clean());
        assert!(CloseReason::Interrupted.is_clean());
        assert!(!CloseReason::SendFailed("x".into()).is_clean());
        assert!(!CloseReason::Negotiation("x".into()).is_clean());
    }
}
