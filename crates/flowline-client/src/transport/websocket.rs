use std::time::Duration;

use async_trait::async_trait;
use flowline_proto::{EnginePacket, OpenHandshake, SocketPacket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{
    DisconnectReason, LinkCommand, LinkSignal, OpenRequest, Transport, TransportError,
    TransportLink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

pub const DEFAULT_SOCKET_PATH: &str = "/socket.io/";
const ENGINE_QUERY: &str = "EIO=4&transport=websocket";
const FALLBACK_LIVENESS: Duration = Duration::from_secs(45);

/// Socket.IO v4 client over a plain WebSocket (no polling upgrade).
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    path: String,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            path: DEFAULT_SOCKET_PATH.to_string(),
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Engine.IO websocket URL for a normalized endpoint.
    pub fn socket_url(&self, endpoint: &Url) -> Result<Url, TransportError> {
        let mut ws = endpoint.clone();
        let scheme = match endpoint.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme {other:?} in {endpoint}"
                )))
            }
        };
        ws.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(format!("cannot use {scheme} for {endpoint}")))?;
        ws.set_path(&self.path);
        ws.set_query(Some(ENGINE_QUERY));
        ws.set_fragment(None);
        Ok(ws)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: &OpenRequest) -> Result<TransportLink, TransportError> {
        let url = self.socket_url(&request.endpoint)?;
        let auth = request.auth.clone();

        let attempt = async {
            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Io(format!("websocket connect failed: {err}")))?;
            tracing::debug!(target: "flowline::transport", url = %url, "websocket connected");
            let (mut sink, mut source) = stream.split();
            let (open, sid) = handshake(&mut sink, &mut source, auth).await?;
            Ok::<_, TransportError>((sink, source, open, sid))
        };
        let (sink, source, open, sid) = tokio::time::timeout(request.connect_timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout)??;

        tracing::debug!(
            target: "flowline::transport",
            engine_sid = %open.sid,
            sid = sid.as_deref().unwrap_or("-"),
            ping_interval = open.ping_interval,
            ping_timeout = open.ping_timeout,
            "namespace connected"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        // The writer is left to finish on its own so a queued close still
        // reaches the server after the link is dropped.
        tokio::spawn(write_loop(sink, command_rx, frame_rx));
        let reader = tokio::spawn(read_loop(source, frame_tx, signal_tx, liveness(&open)));

        Ok(TransportLink::new(sid, command_tx, signal_rx).with_task(reader))
    }
}

fn liveness(open: &OpenHandshake) -> Duration {
    let millis = open.ping_interval.saturating_add(open.ping_timeout);
    if millis == 0 {
        FALLBACK_LIVENESS
    } else {
        Duration::from_millis(millis)
    }
}

async fn handshake(
    sink: &mut WsSink,
    source: &mut WsSource,
    auth: Option<Value>,
) -> Result<(OpenHandshake, Option<String>), TransportError> {
    let open = loop {
        let text = next_text(source).await?;
        match EnginePacket::decode(&text) {
            Ok(EnginePacket::Open(open)) => break open,
            Ok(EnginePacket::Noop) => continue,
            Ok(other) => {
                return Err(TransportError::Protocol(format!(
                    "expected engine open packet, got {other:?}"
                )))
            }
            Err(err) => return Err(TransportError::Protocol(err.to_string())),
        }
    };

    send_text(sink, EnginePacket::from(&SocketPacket::connect(auth)).encode()).await?;

    loop {
        let text = next_text(source).await?;
        let packet =
            EnginePacket::decode(&text).map_err(|err| TransportError::Protocol(err.to_string()))?;
        match packet {
            EnginePacket::Ping(data) => send_text(sink, EnginePacket::Pong(data).encode()).await?,
            EnginePacket::Message(body) => {
                match SocketPacket::decode(&body)
                    .map_err(|err| TransportError::Protocol(err.to_string()))?
                {
                    SocketPacket::Connect { data, .. } => {
                        let sid = data
                            .as_ref()
                            .and_then(|data| data.get("sid"))
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        return Ok((open, sid));
                    }
                    SocketPacket::ConnectError { data, .. } => {
                        return Err(TransportError::Rejected(rejection_message(&data)));
                    }
                    other => {
                        tracing::trace!(
                            target: "flowline::transport",
                            packet = ?other,
                            "ignoring packet before namespace connect"
                        );
                    }
                }
            }
            EnginePacket::Close => {
                return Err(TransportError::Io("server closed the session during handshake".into()))
            }
            _ => {}
        }
    }
}

fn rejection_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| data.to_string())
}

async fn next_text(source: &mut WsSource) -> Result<String, TransportError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Io("websocket closed during handshake".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(TransportError::Io(err.to_string())),
        }
    }
}

async fn send_text(sink: &mut WsSink, text: String) -> Result<(), TransportError> {
    sink.send(Message::Text(text))
        .await
        .map_err(|err| TransportError::Io(err.to_string()))
}

async fn write_loop(
    mut sink: WsSink,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    mut frames: mpsc::UnboundedReceiver<String>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Emit { name, payload }) => {
                    tracing::trace!(target: "flowline::transport", event = %name, "ws_out");
                    let text = EnginePacket::from(&SocketPacket::event(name, payload)).encode();
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let goodbye = EnginePacket::from(&SocketPacket::disconnect()).encode();
                    let _ = sink.send(Message::Text(goodbye)).await;
                    let _ = sink.send(Message::Close(None)).await;
                    tracing::debug!(target: "flowline::transport", "websocket closed by client");
                    break;
                }
            },
            Some(text) = frames.recv() => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    frames: mpsc::UnboundedSender<String>,
    signals: mpsc::UnboundedSender<LinkSignal>,
    liveness: Duration,
) {
    let reason = loop {
        let next = match tokio::time::timeout(liveness, source.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(target: "flowline::transport", ?liveness, "no ping from server");
                break DisconnectReason::PingTimeout;
            }
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                tracing::trace!(target: "flowline::transport", len = text.len(), "ws_in");
                match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Ping(data)) => {
                        let _ = frames.send(EnginePacket::Pong(data).encode());
                    }
                    Ok(EnginePacket::Message(body)) => match SocketPacket::decode(&body) {
                        Ok(SocketPacket::Event { name, args, .. }) => {
                            let payload = args.into_iter().next().unwrap_or(Value::Null);
                            if signals.send(LinkSignal::Event { name, payload }).is_err() {
                                return;
                            }
                        }
                        Ok(SocketPacket::Disconnect { .. }) => {
                            break DisconnectReason::ServerDisconnect;
                        }
                        Ok(SocketPacket::ConnectError { data, .. }) => {
                            tracing::warn!(
                                target: "flowline::transport",
                                error = %rejection_message(&data),
                                "connect error after handshake"
                            );
                        }
                        Ok(other) => {
                            tracing::trace!(target: "flowline::transport", packet = ?other, "ignored");
                        }
                        Err(err) => {
                            tracing::warn!(target: "flowline::transport", "undecodable packet: {err}");
                        }
                    },
                    Ok(EnginePacket::Close) => break DisconnectReason::TransportClose,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target: "flowline::transport", "undecodable engine packet: {err}");
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break DisconnectReason::TransportClose,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target: "flowline::transport", "websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target: "flowline::transport", "websocket error: {err}");
                    }
                }
                break DisconnectReason::TransportError;
            }
        }
    };
    let _ = signals.send(LinkSignal::Closed(reason));
}
