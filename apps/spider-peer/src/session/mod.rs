//! Session run loop: one negotiator fed by a relay reader pump and the
//! transport's event channel, with the outbound queue's writer and the
//! keepalive ticking alongside. Every exit path funnels through
//! [`Shutdown`] and then the same orderly teardown.

use std::sync::Arc;
use std::time::Duration;

use spider_proto::CandidateInit;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod negotiator;
pub mod shutdown;

pub use negotiator::{CandidateEncoding, NegotiationState, Negotiator, Role, SessionError};
pub use shutdown::{CloseReason, Shutdown};

use crate::signaling::keepalive::{self, Keepalive};
use crate::signaling::queue::{DEFAULT_CAPACITY, QueueConsumer};
use crate::signaling::{ChannelError, ChannelReader, ChannelWriter, Frame, OutboundQueue};
use crate::transport::{PeerEventReceiver, PeerTransport, SessionDescription};

const INBOUND_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub keepalive_interval: Duration,
    pub queue_capacity: usize,
    pub candidate_encoding: CandidateEncoding,
}

impl SessionConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            keepalive_interval: keepalive::DEFAULT_PERIOD,
            queue_capacity: DEFAULT_CAPACITY,
            candidate_encoding: CandidateEncoding::default(),
        }
    }
}

/// What a finished session looked like.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub reason: CloseReason,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub applied_candidates: Vec<CandidateInit>,
    pub sent_candidates: usize,
    pub reached_negotiated: bool,
}

/// Observer and close capability for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: watch::Receiver<NegotiationState>,
    shutdown: Shutdown,
}

impl SessionHandle {
    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Resolves once the session reports `target`, or `Closed` if it ends
    /// first.
    pub async fn wait_for(&self, target: NegotiationState) -> NegotiationState {
        let mut rx = self.state.clone();
        match rx
            .wait_for(|state| *state == target || *state == NegotiationState::Closed)
            .await
        {
            Ok(state) => *state,
            Err(_) => NegotiationState::Closed,
        }
    }

    pub fn close(&self, reason: CloseReason) -> bool {
        self.shutdown.trigger(reason)
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }
}

pub struct Session<T: PeerTransport + ?Sized> {
    config: SessionConfig,
    transport: Arc<T>,
    events: PeerEventReceiver,
    queue: OutboundQueue,
    consumer: QueueConsumer,
    negotiator: Negotiator<T>,
    shutdown: Shutdown,
}

impl<T> Session<T>
where
    T: PeerTransport + ?Sized + 'static,
{
    pub fn new(
        config: SessionConfig,
        transport: Arc<T>,
        events: PeerEventReceiver,
    ) -> (Self, SessionHandle) {
        let shutdown = Shutdown::new();
        let (queue, consumer) = OutboundQueue::new(config.queue_capacity);
        let negotiator = Negotiator::new(
            config.role,
            Arc::clone(&transport),
            queue.clone(),
            config.candidate_encoding,
            shutdown.clone(),
        );
        let handle = SessionHandle {
            state: negotiator.subscribe(),
            shutdown: shutdown.clone(),
        };
        let session = Self {
            config,
            transport,
            events,
            queue,
            consumer,
            negotiator,
            shutdown,
        };
        (session, handle)
    }

    pub async fn run<W, R>(self, writer: W, reader: R) -> SessionOutcome
    where
        W: ChannelWriter + 'static,
        R: ChannelReader + 'static,
    {
        let Session {
            config,
            transport,
            mut events,
            queue,
            consumer,
            mut negotiator,
            shutdown,
        } = self;

        tracing::info!(
            target = "signaling",
            role = ?config.role,
            keepalive_secs = config.keepalive_interval.as_secs_f64(),
            queue_capacity = queue.capacity(),
            "session starting"
        );

        let writer_task = consumer.spawn(writer, shutdown.clone());
        let (frames_tx, mut frames) = mpsc::channel(INBOUND_BUFFER);
        let reader_task = tokio::spawn(pump_inbound(reader, frames_tx, shutdown.clone()));
        let keepalive_task =
            Keepalive::new(config.keepalive_interval).spawn(queue.clone(), shutdown.clone());
        drop(queue);

        if let Some(Err(err)) = step(&shutdown, negotiator.start()).await {
            fail(&mut negotiator, err, "start");
        }

        let mut events_open = true;
        while !shutdown.is_triggered() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                inbound = frames.recv() => match inbound {
                    Some(Ok(frame)) => {
                        if let Some(Err(err)) = step(&shutdown, negotiator.handle_frame(frame)).await {
                            fail(&mut negotiator, err, "inbound");
                        }
                    }
                    Some(Err(ChannelError::Closed)) | None => {
                        negotiator.close(CloseReason::ChannelClosed);
                    }
                    Some(Err(err)) => {
                        tracing::error!(target = "signaling", error = %err, stage = "receive", "relay receive failed");
                        negotiator.close(CloseReason::ChannelError(err.to_string()));
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Some(Err(err)) = step(&shutdown, negotiator.handle_peer_event(event)).await {
                            fail(&mut negotiator, err, "transport-event");
                        }
                    }
                    None => {
                        tracing::debug!(target = "transport", "peer event stream ended");
                        events_open = false;
                    }
                },
            }
        }
        negotiator.mark_closed();

        drop(frames);
        join("keepalive", keepalive_task).await;
        join("relay-writer", writer_task).await;
        join("relay-reader", reader_task).await;
        if let Err(err) = transport.close().await {
            tracing::warn!(target = "transport", error = %err, "transport close failed");
        }

        let reason = shutdown.reason().unwrap_or(CloseReason::ChannelClosed);
        tracing::info!(
            target = "signaling",
            %reason,
            negotiated = negotiator.reached_negotiated(),
            applied = negotiator.applied_candidates().len(),
            sent = negotiator.sent_candidates(),
            "session closed"
        );
        SessionOutcome {
            reason,
            local_description: negotiator.local_description().cloned(),
            remote_description: negotiator.remote_description().cloned(),
            applied_candidates: negotiator.applied_candidates().to_vec(),
            sent_candidates: negotiator.sent_candidates(),
            reached_negotiated: negotiator.reached_negotiated(),
        }
    }
}

fn fail<T: PeerTransport + ?Sized>(negotiator: &mut Negotiator<T>, err: SessionError, stage: &str) {
    if err.is_fatal() {
        tracing::error!(target = "signaling", error = %err, stage, "negotiation failed");
        negotiator.close(CloseReason::Negotiation(err.to_string()));
    } else {
        tracing::warn!(target = "signaling", error = %err, stage, "dropping inbound message");
    }
}

async fn pump_inbound<R: ChannelReader>(
    mut reader: R,
    frames: mpsc::Sender<Result<Frame, ChannelError>>,
    shutdown: Shutdown,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = reader.receive() => received,
        };
        let last = received.is_err();
        let forwarded = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = frames.send(received) => sent.is_ok(),
        };
        if last || !forwarded {
            break;
        }
    }
}

/// Runs one negotiator step unless shutdown fires first. A step parked on a
/// full outbound queue is abandoned.
async fn step<F>(shutdown: &Shutdown, work: F) -> Option<Result<(), SessionError>>
where
    F: Future<Output = Result<(), SessionError>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        result = work => Some(result),
    }
}

async fn join<O>(name: &str, task: JoinHandle<O>) {
    if let Err(err) = task.await {
        tracing::warn!(target = "signaling", task = name, error = %err, "session task ended abnormally");
    }
}
