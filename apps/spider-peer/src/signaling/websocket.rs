use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use spider_proto::Envelope;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use url::Url;

use super::{ChannelError, ChannelReader, ChannelWriter, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: Url,
    /// Accept self-signed or otherwise unverifiable relay certificates.
    pub accept_invalid_certs: bool,
}

impl ConnectOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            accept_invalid_certs: false,
        }
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    fn connector(&self) -> Result<Option<Connector>, ChannelError> {
        match self.url.scheme() {
            "wss" => {
                let mut builder = native_tls::TlsConnector::builder();
                if self.accept_invalid_certs {
                    builder
                        .danger_accept_invalid_certs(true)
                        .danger_accept_invalid_hostnames(true);
                }
                Ok(Some(Connector::NativeTls(builder.build()?)))
            }
            "ws" => Ok(None),
            other => Err(ChannelError::InvalidUrl {
                url: self.url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }
}

/// Opens the relay websocket and splits it into independently owned halves.
pub async fn connect(
    options: &ConnectOptions,
) -> Result<(WebSocketWriter, WebSocketReader), ChannelError> {
    let connector = options.connector()?;
    tracing::debug!(
        target = "signaling",
        url = %options.url,
        insecure = options.accept_invalid_certs,
        "connecting relay websocket"
    );
    let (stream, _response) =
        connect_async_tls_with_config(options.url.as_str(), None, false, connector)
            .await
            .map_err(|err| ChannelError::Connect {
                url: options.url.to_string(),
                reason: err.to_string(),
            })?;
    tracing::info!(target = "signaling", url = %options.url, "relay websocket connected");
    let (sink, stream) = stream.split();
    Ok((
        WebSocketWriter { sink, closed: false },
        WebSocketReader { stream },
    ))
}

pub struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl ChannelWriter for WebSocketWriter {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let text = envelope.to_json()?;
        tracing::trace!(
            target = "signaling",
            event = "ws_out",
            kind = %envelope.kind,
            len = text.len()
        );
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(ChannelError::Send(err.to_string())),
        }
    }
}

pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl ChannelReader for WebSocketReader {
    async fn receive(&mut self) -> Result<Frame, ChannelError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "ws_in",
                        kind = "text",
                        len = text.len()
                    );
                    return Ok(Envelope::from_json(&text));
                }
                Ok(Message::Binary(data)) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "ws_in",
                        kind = "binary",
                        len = data.len()
                    );
                    return Ok(Envelope::from_slice(&data));
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(target = "signaling", ?frame, "relay sent close frame");
                    return Err(ChannelError::Closed);
                }
                Ok(_) => {}
                Err(
                    err @ (WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
                ) => {
                    tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                    return Err(ChannelError::Closed);
                }
                Err(err) => return Err(ChannelError::Receive(err.to_string())),
            }
        }
        Err(ChannelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ws_needs_no_connector() {
        let options = ConnectOptions::new(Url::parse("ws://127.0.0.1:8267/live/ws/pub").unwrap());
        assert!(options.connector().unwrap().is_none());
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let options = ConnectOptions::new(Url::parse("https://relay.example/live").unwrap());
        assert!(matches!(
            options.connector(),
            Err(ChannelError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn secure_scheme_builds_tls_connector() {
        let options = ConnectOptions::new(Url::parse("wss://relay.example/live/ws/sub").unwrap())
            .accept_invalid_certs(true);
        assert!(matches!(
            options.connector().unwrap(),
            Some(Connector::NativeTls(_))
        ));
    }
}
