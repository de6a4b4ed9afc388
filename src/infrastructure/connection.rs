use crate::domain::models::TimerState;
use crate::infrastructure::config::ServerEndpoint;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    StateReceived(TimerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Outbound control frames.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ready,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Handle the coordinator uses to drive the live channel.
pub trait ConnectionHandle: Send + Sync {
    /// Opens (or re-opens) the channel to `endpoint`. Replaces an open connection.
    fn connect(&self, endpoint: &ServerEndpoint);
    /// Returns `false` when the message was dropped because no connection is open.
    fn send(&self, message: &ControlMessage) -> bool;
    fn close(&self);
    fn status(&self) -> ConnectionStatus;
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum Control {
    Connect(Url),
    Send(String),
    Close,
}

enum SessionEnd {
    Dropped,
    Replaced(Url),
    Closed,
}

/// WebSocket client backed by a supervisor task that owns the socket,
/// reconnects after failures and keeps the link alive with pings.
pub struct WebSocketClient {
    control_tx: mpsc::UnboundedSender<Control>,
    status_rx: watch::Receiver<ConnectionStatus>,
    supervisor: JoinHandle<()>,
}

impl WebSocketClient {
    pub fn spawn(settings: ConnectionSettings, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let supervisor = tokio::spawn(supervise(settings, control_rx, events, status_tx));
        Self {
            control_tx,
            status_rx,
            supervisor,
        }
    }
}

impl ConnectionHandle for WebSocketClient {
    fn connect(&self, endpoint: &ServerEndpoint) {
        match endpoint.websocket_url() {
            Ok(url) => {
                if self.control_tx.send(Control::Connect(url)).is_err() {
                    debug!("connect ignored; client already closed");
                }
            }
            Err(error) => warn!(%error, %endpoint, "cannot connect to invalid endpoint"),
        }
    }

    fn send(&self, message: &ControlMessage) -> bool {
        if self.status() != ConnectionStatus::Connected {
            return false;
        }
        match serde_json::to_string(message) {
            Ok(text) => self.control_tx.send(Control::Send(text)).is_ok(),
            Err(error) => {
                warn!(%error, "failed to encode control message");
                false
            }
        }
    }

    fn close(&self) {
        let _ = self.control_tx.send(Control::Close);
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(
    settings: ConnectionSettings,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut target: Option<Url> = None;
    let mut reconnect_at: Option<Instant> = None;

    loop {
        let Some(url) = target.clone() else {
            match control_rx.recv().await {
                Some(Control::Connect(url)) => target = Some(url),
                Some(Control::Send(_)) => {}
                Some(Control::Close) | None => break,
            }
            continue;
        };

        if let Some(deadline) = reconnect_at {
            tokio::select! {
                _ = time::sleep_until(deadline) => reconnect_at = None,
                command = control_rx.recv() => match command {
                    Some(Control::Connect(next)) => {
                        target = Some(next);
                        reconnect_at = None;
                    }
                    Some(Control::Send(_)) => {}
                    Some(Control::Close) | None => break,
                },
            }
            continue;
        }

        status_tx.send_replace(ConnectionStatus::Connecting);
        debug!(%url, "connecting");
        let attempt = time::timeout(settings.connect_timeout, connect_async(url.as_str()));
        tokio::pin!(attempt);
        let outcome = loop {
            tokio::select! {
                result = &mut attempt => break Some(result),
                command = control_rx.recv() => match command {
                    Some(Control::Connect(next)) => {
                        target = Some(next);
                        break None;
                    }
                    Some(Control::Send(_)) => {}
                    Some(Control::Close) | None => {
                        status_tx.send_replace(ConnectionStatus::Closed);
                        return;
                    }
                },
            }
        };

        let stream = match outcome {
            None => continue,
            Some(Ok(Ok((stream, _response)))) => stream,
            Some(Ok(Err(error))) => {
                warn!(%url, %error, "websocket connect failed");
                schedule_reconnect(&settings, &mut reconnect_at, &status_tx, &events);
                continue;
            }
            Some(Err(_elapsed)) => {
                warn!(%url, timeout_secs = settings.connect_timeout.as_secs(), "websocket connect timed out");
                schedule_reconnect(&settings, &mut reconnect_at, &status_tx, &events);
                continue;
            }
        };

        info!(%url, "websocket connected");
        status_tx.send_replace(ConnectionStatus::Connected);
        let _ = events.send(ConnectionEvent::Connected);

        match run_session(stream, &settings, &mut control_rx, &events).await {
            SessionEnd::Dropped => {
                info!(%url, "websocket disconnected");
                schedule_reconnect(&settings, &mut reconnect_at, &status_tx, &events);
            }
            SessionEnd::Replaced(next) => {
                info!(from = %url, to = %next, "websocket endpoint replaced");
                status_tx.send_replace(ConnectionStatus::Disconnected);
                let _ = events.send(ConnectionEvent::Disconnected);
                target = Some(next);
                reconnect_at = None;
            }
            SessionEnd::Closed => break,
        }
    }

    status_tx.send_replace(ConnectionStatus::Closed);
}

fn schedule_reconnect(
    settings: &ConnectionSettings,
    reconnect_at: &mut Option<Instant>,
    status_tx: &watch::Sender<ConnectionStatus>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    status_tx.send_replace(ConnectionStatus::Disconnected);
    let _ = events.send(ConnectionEvent::Disconnected);
    *reconnect_at = Some(Instant::now() + settings.reconnect_delay);
}

async fn run_session(
    stream: WsStream,
    settings: &ConnectionSettings,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> SessionEnd {
    let (mut sink, mut source) = stream.split();
    let mut ping = time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch_text(text.as_str(), events),
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed websocket");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%error, "websocket read failed");
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            },
            _ = ping.tick() => {
                if awaiting_pong {
                    warn!("ping unanswered; dropping half-open websocket");
                    return SessionEnd::Dropped;
                }
                if let Err(error) = sink.send(Message::Ping(Vec::new().into())).await {
                    warn!(%error, "websocket ping failed");
                    return SessionEnd::Dropped;
                }
                awaiting_pong = true;
            }
            command = control_rx.recv() => match command {
                Some(Control::Send(text)) => {
                    if let Err(error) = sink.send(Message::Text(text.into())).await {
                        warn!(%error, "websocket send failed");
                        return SessionEnd::Dropped;
                    }
                }
                Some(Control::Connect(next)) => {
                    let _ = sink.send(close_message("reconnecting")).await;
                    return SessionEnd::Replaced(next);
                }
                Some(Control::Close) | None => {
                    let _ = sink.send(close_message("client closed")).await;
                    let _ = sink.close().await;
                    return SessionEnd::Closed;
                }
            },
        }
    }
}

fn close_message(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_string().into(),
    }))
}

fn dispatch_text(text: &str, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, "ignoring malformed websocket frame");
            return;
        }
    };
    if frame.kind != "state" {
        debug!(kind = %frame.kind, "ignoring websocket frame");
        return;
    }
    let Some(data) = frame.data else {
        warn!("state frame without data");
        return;
    };
    match serde_json::from_value::<TimerState>(data) {
        Ok(state) => {
            let _ = events.send(ConnectionEvent::StateReceived(state));
        }
        Err(error) => warn!(%error, "ignoring malformed state push"),
    }
}
