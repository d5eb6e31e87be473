//! Auto-reconnecting G HUB WebSocket session
//!
//! Each connection gets its own socket reader task and a fresh inbound
//! channel, so nothing from a previous connection leaks into the next one.
//! The session loop feeds inbound frames and rescan commands through the
//! [`Reconciler`] and carries out the resulting actions.

use futures_util::{SinkExt, StreamExt};
use hidbatt_core::{BackoffPolicy, DeviceMessage};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::GHubError;
use crate::message::GHubEvent;
use crate::reconciler::{Action, Reconciler};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = futures_util::stream::SplitSink<Socket, Message>;

/// `[ghub]` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GHubConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_url")]
    pub url: String,
    /// `timeout_ms` bounds each connection attempt; the delays ramp up
    /// between consecutive failures and reset after a successful connect.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: BackoffPolicy,
}

fn default_enabled() -> bool {
    true
}

fn default_url() -> String {
    "ws://localhost:9010".to_string()
}

fn default_reconnect_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 6,
        timeout_ms: 5000,
        initial_delay_ms: 1000,
        max_delay_ms: 30_000,
        multiplier: 2.0,
    }
}

impl Default for GHubConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            url: default_url(),
            reconnect_backoff: default_reconnect_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Forget every G HUB device and list them again
    Rescan,
}

/// Control handle for a running session
#[derive(Debug, Clone)]
pub struct GHubHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl GHubHandle {
    /// Request a full rediscovery; `false` when the session has stopped
    pub async fn rescan(&self) -> bool {
        self.commands.send(SessionCommand::Rescan).await.is_ok()
    }
}

/// Why a connection ended
enum Disconnect {
    /// The socket closed or failed; reconnect
    Socket,
    /// The registry is gone; stop the session
    Shutdown,
}

pub struct GHubSession {
    config: GHubConfig,
    messages: mpsc::Sender<DeviceMessage>,
    commands: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
}

impl GHubSession {
    pub fn new(config: GHubConfig, messages: mpsc::Sender<DeviceMessage>) -> (Self, GHubHandle) {
        let (tx, rx) = mpsc::channel(8);
        let session = Self {
            config,
            messages,
            commands: rx,
            commands_open: true,
        };
        (session, GHubHandle { commands: tx })
    }

    async fn connect(&self) -> Result<Socket, GHubError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(ORIGIN, HeaderValue::from_static("file://"));
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("json"));

        let timeout = self.config.reconnect_backoff.timeout();
        match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(GHubError::ConnectTimeout(timeout)),
        }
    }

    /// Connect, reconcile and reconnect until the registry goes away
    pub async fn run(mut self) -> Result<(), GHubError> {
        let mut failures: u32 = 0;
        loop {
            match self.connect().await {
                Ok(socket) => {
                    failures = 0;
                    info!(url = %self.config.url, "Connected to G HUB");
                    match self.run_connection(socket).await {
                        Disconnect::Shutdown => return Ok(()),
                        Disconnect::Socket => {
                            warn!(url = %self.config.url, "G HUB connection lost");
                            let actions = Reconciler::new().on_disconnected();
                            if self.emit_all(actions).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    debug!(url = %self.config.url, error = %e, failures, "G HUB connect failed");
                }
            }

            let policy = &self.config.reconnect_backoff;
            let step = failures.max(1).min(policy.max_attempts.max(1));
            let delay = policy.delay_for(step + 1);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to G HUB");
            tokio::time::sleep(delay).await;

            if self.messages.is_closed() {
                return Ok(());
            }
        }
    }

    async fn run_connection(&mut self, socket: Socket) -> Disconnect {
        let (mut sink, mut stream) = socket.split();

        let (frame_tx, mut frames) = mpsc::channel::<String>(64);
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if frame_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "G HUB closed the socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "G HUB socket error");
                        break;
                    }
                }
            }
        });

        let mut reconciler = Reconciler::new();
        let mut outcome = self.perform(reconciler.on_connected(), &mut sink).await;

        while outcome.is_none() {
            tokio::select! {
                frame = frames.recv() => match frame {
                    None => outcome = Some(Disconnect::Socket),
                    Some(text) => match GHubEvent::decode(&text) {
                        Ok(Some(event)) => {
                            outcome = self.perform(reconciler.handle(event), &mut sink).await;
                        }
                        Ok(None) => {}
                        Err(e) => debug!(error = %e, "Ignoring undecodable G HUB frame"),
                    },
                },
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(SessionCommand::Rescan) => {
                            info!("G HUB rescan requested");
                            outcome = self.perform(reconciler.rediscover(), &mut sink).await;
                        }
                        None => self.commands_open = false,
                    }
                }
            }
        }

        reader.abort();
        outcome.unwrap_or(Disconnect::Socket)
    }

    /// Carry out reconciler actions; `Some` ends the connection
    async fn perform(&self, actions: Vec<Action>, sink: &mut SocketSink) -> Option<Disconnect> {
        for action in actions {
            match action {
                Action::Emit(message) => {
                    if self.messages.send(message).await.is_err() {
                        return Some(Disconnect::Shutdown);
                    }
                }
                Action::Send(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, path = %envelope.path, "Could not encode request");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, path = %envelope.path, "G HUB send failed");
                        return Some(Disconnect::Socket);
                    }
                }
            }
        }
        None
    }

    async fn emit_all(&self, actions: Vec<Action>) -> Result<(), GHubError> {
        for action in actions {
            if let Action::Emit(message) = action {
                self.messages
                    .send(message)
                    .await
                    .map_err(|_| GHubError::RegistryClosed)?;
            }
        }
        Ok(())
    }
}
