//! In-process relay stand-in: two endpoints whose writers feed each other's
//! readers. Frames cross as JSON text so the decode path matches the
//! websocket adapter.

use async_trait::async_trait;
use spider_proto::Envelope;
use tokio::sync::mpsc;

use super::{ChannelError, ChannelReader, ChannelWriter, Frame};

pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl MemoryWriter {
    /// Pushes raw text as-is, bypassing envelope encoding.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(text.into()).map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl ChannelWriter for MemoryWriter {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        let text = envelope.to_json()?;
        self.send_raw(text)
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.tx.take();
        Ok(())
    }
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ChannelReader for MemoryReader {
    async fn receive(&mut self) -> Result<Frame, ChannelError> {
        match self.rx.recv().await {
            Some(text) => Ok(Envelope::from_json(&text)),
            None => Err(ChannelError::Closed),
        }
    }
}

pub struct MemoryEndpoint {
    pub writer: MemoryWriter,
    pub reader: MemoryReader,
}

pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryEndpoint {
            writer: MemoryWriter { tx: Some(a_tx) },
            reader: MemoryReader { rx: a_rx },
        },
        MemoryEndpoint {
            writer: MemoryWriter { tx: Some(b_tx) },
            reader: MemoryReader { rx: b_rx },
        },
    )
}
