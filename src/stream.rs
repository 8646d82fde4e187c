//! Live trade stream: connection lifecycle, subscription management, and
//! bounded-backoff reconnection.
//!
//! The socket is owned exclusively by a spawned task; at most one connection
//! exists at a time. Callers drive it through [`StreamHandle`] commands and
//! consume [`StreamEvent`]s from an unbounded channel.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ReconnectConfig};
use crate::types::{ConnectionStatus, Trade, TradeFilter};
use crate::wire::{ClientMessage, ServerMessage};

/// Close code for an intentional disconnect. A close carrying it is never
/// auto-reconnected.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Everything the stream task needs, captured at spawn time.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub reconnect: ReconnectConfig,
}

impl StreamConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            url: config.endpoints.stream_endpoint()?.to_string(),
            reconnect: config.reconnect.clone(),
        })
    }
}

/// Control messages accepted by the stream task.
#[derive(Debug)]
pub enum StreamCommand {
    /// Replace the active filter, retargeting the live subscription in place.
    SetFilter(TradeFilter),
    /// Reset the attempt counter and reconnect immediately.
    Reconnect,
    /// Close with the intentional code and end the task.
    Shutdown,
}

/// Everything the stream surfaces to its consumer.
#[derive(Debug)]
pub enum StreamEvent {
    Status {
        status: ConnectionStatus,
        attempts: u32,
    },
    Subscribed {
        subscription_id: String,
    },
    Trade(Trade),
    /// Non-fatal stream failure; the task keeps running.
    StreamError(String),
    /// Attempts exhausted; only a manual reconnect resumes the stream.
    Exhausted,
    /// Inbound frame that carried no trade; marks the stream alive.
    Heartbeat,
}

/// Owner-side handle for the spawned stream task.
///
/// Dropping the handle closes the command channel, which the task treats as
/// a shutdown: the socket is closed with the intentional code on every exit
/// path.
pub struct StreamHandle {
    commands: mpsc::UnboundedSender<StreamCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    /// Spawn the stream task and return the handle plus its event channel.
    pub fn spawn(
        config: StreamConfig,
        filter: TradeFilter,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            StreamTask {
                config,
                filter,
                events: event_tx,
                attempts: 0,
                subscription_id: None,
            }
            .run(command_rx)
            .await;
        });
        (
            Self {
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    pub fn set_filter(&self, filter: TradeFilter) {
        let _ = self.commands.send(StreamCommand::SetFilter(filter));
    }

    pub fn reconnect(&self) {
        let _ = self.commands.send(StreamCommand::Reconnect);
    }

    /// Request an intentional close and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        let _ = self.task.await;
    }
}

/// What to do after the connection dropped with `close_code` (`None` covers
/// transport errors and streams that end without a close frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry after the given backoff delay.
    Retry(Duration),
    /// Attempts exhausted; park until a manual reconnect.
    GiveUp,
    /// Intentional close; park without touching the attempt counter.
    Stop,
}

/// Exponential backoff: `base * 2^attempt`, capped at `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap)
}

pub fn reconnect_decision(
    close_code: Option<u16>,
    attempts: u32,
    config: &ReconnectConfig,
) -> ReconnectDecision {
    if close_code == Some(NORMAL_CLOSE_CODE) {
        return ReconnectDecision::Stop;
    }
    if attempts >= config.max_attempts {
        return ReconnectDecision::GiveUp;
    }
    ReconnectDecision::Retry(backoff_delay(
        attempts,
        config.base_delay(),
        config.max_delay(),
    ))
}

/// Why `drive` handed the connection back.
enum Disconnect {
    /// Server close frame (with its code) or the stream ended without one.
    Closed(Option<u16>),
    /// Transport-level failure.
    Lost(String),
    /// Manual reconnect command.
    ForceReconnect,
    Shutdown,
}

struct StreamTask {
    config: StreamConfig,
    filter: TradeFilter,
    events: mpsc::UnboundedSender<StreamEvent>,
    attempts: u32,
    subscription_id: Option<String>,
}

impl StreamTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<StreamCommand>) {
        loop {
            self.emit_status(ConnectionStatus::Connecting);
            let disconnect = match connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    info!(url = %self.config.url, "Stream connected");
                    self.attempts = 0;
                    self.emit_status(ConnectionStatus::Connected);
                    self.drive(ws, &mut commands).await
                }
                Err(e) => Disconnect::Lost(format!("connect failed: {e}")),
            };
            self.subscription_id = None;

            let keep_running = match disconnect {
                Disconnect::Shutdown => false,
                Disconnect::ForceReconnect => {
                    self.attempts = 0;
                    continue;
                }
                Disconnect::Lost(reason) => {
                    warn!("Stream connection lost: {reason}");
                    self.emit(StreamEvent::StreamError(reason));
                    self.recover(None, &mut commands).await
                }
                Disconnect::Closed(code) => {
                    info!(?code, "Stream closed by server");
                    self.recover(code, &mut commands).await
                }
            };

            if !keep_running {
                self.emit_status(ConnectionStatus::Disconnected);
                return;
            }
        }
    }

    /// Pump one open connection until it drops or a command ends it.
    async fn drive(
        &mut self,
        ws: WsStream,
        commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    ) -> Disconnect {
        let (mut write, mut read) = ws.split();

        if let Err(e) = send_json(&mut write, &ClientMessage::subscribe(&self.filter)).await {
            return Disconnect::Lost(format!("subscribe: {e}"));
        }

        let mut ping = tokio::time::interval(self.config.reconnect.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await; // first tick resolves immediately

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                        return Disconnect::Lost(format!("ping: {e}"));
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(StreamCommand::SetFilter(filter)) => {
                        self.filter = filter;
                        // No ack yet means the original subscribe is still in
                        // flight; send a fresh subscribe instead of an update.
                        let msg = match &self.subscription_id {
                            Some(id) => ClientMessage::update(&self.filter, id),
                            None => ClientMessage::subscribe(&self.filter),
                        };
                        if let Err(e) = send_json(&mut write, &msg).await {
                            return Disconnect::Lost(format!("filter update: {e}"));
                        }
                    }
                    Some(StreamCommand::Reconnect) => {
                        close_intentional(&mut write).await;
                        return Disconnect::ForceReconnect;
                    }
                    Some(StreamCommand::Shutdown) | None => {
                        close_intentional(&mut write).await;
                        return Disconnect::Shutdown;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                        self.emit(StreamEvent::Heartbeat);
                    }
                    Some(Ok(Message::Pong(_))) => self.emit(StreamEvent::Heartbeat),
                    Some(Ok(Message::Close(close))) => {
                        let code = close.map(|f| u16::from(f.code));
                        return Disconnect::Closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                    None => return Disconnect::Closed(None),
                },
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Ack { subscription_id }) => {
                info!(%subscription_id, "Subscription acknowledged");
                self.subscription_id = Some(subscription_id.clone());
                self.emit(StreamEvent::Subscribed { subscription_id });
            }
            Ok(ServerMessage::Event { data }) => match data.into_trade() {
                Some(trade) => self.emit(StreamEvent::Trade(trade)),
                None => {
                    debug!("Dropping order event with unusable fields");
                    self.emit(StreamEvent::Heartbeat);
                }
            },
            Ok(ServerMessage::Error { message }) => {
                warn!("Stream error message: {message}");
                // still a live frame from the server
                self.emit(StreamEvent::Heartbeat);
                self.emit(StreamEvent::StreamError(message));
            }
            Err(e) => {
                debug!("Ignoring unrecognized frame: {e}");
                self.emit(StreamEvent::Heartbeat);
            }
        }
    }

    /// Handle a dropped connection. Returns false when the task should end.
    async fn recover(
        &mut self,
        close_code: Option<u16>,
        commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    ) -> bool {
        match reconnect_decision(close_code, self.attempts, &self.config.reconnect) {
            ReconnectDecision::Stop => {
                info!("Clean close from server; waiting for a manual reconnect");
                self.emit_status(ConnectionStatus::Disconnected);
                self.park(commands).await
            }
            ReconnectDecision::GiveUp => {
                warn!(attempts = self.attempts, "Reconnect attempts exhausted");
                self.emit(StreamEvent::Exhausted);
                self.emit_status(ConnectionStatus::Disconnected);
                self.park(commands).await
            }
            ReconnectDecision::Retry(delay) => {
                self.attempts += 1;
                self.emit_status(ConnectionStatus::Connecting);
                debug!(attempt = self.attempts, ?delay, "Backing off before reconnect");
                self.wait_backoff(delay, commands).await
            }
        }
    }

    /// Sleep out the backoff delay while still servicing commands. A manual
    /// reconnect cuts the wait short. Returns false when the task should end.
    async fn wait_backoff(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = commands.recv() => match cmd {
                    Some(StreamCommand::SetFilter(filter)) => self.filter = filter,
                    Some(StreamCommand::Reconnect) => {
                        self.attempts = 0;
                        return true;
                    }
                    Some(StreamCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    /// Hold after a clean close or exhaustion. Only a reconnect command (or
    /// shutdown) leaves this state.
    async fn park(&mut self, commands: &mut mpsc::UnboundedReceiver<StreamCommand>) -> bool {
        loop {
            match commands.recv().await {
                Some(StreamCommand::SetFilter(filter)) => self.filter = filter,
                Some(StreamCommand::Reconnect) => {
                    info!("Manual reconnect requested");
                    self.attempts = 0;
                    return true;
                }
                Some(StreamCommand::Shutdown) | None => return false,
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, status: ConnectionStatus) {
        self.emit(StreamEvent::Status {
            status,
            attempts: self.attempts,
        });
    }
}

async fn send_json(write: &mut WsSink, msg: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(msg).context("serialize stream message")?;
    write
        .send(Message::Text(json.into()))
        .await
        .context("send stream message")?;
    Ok(())
}

/// Close with the intentional code so the peer sees a deliberate disconnect.
async fn close_intentional(write: &mut WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client closing".into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {e}");
    }
}
