//! Connection wrapper tying the [`CallController`] to a signaling server.
//!
//! One task owns the controller and serializes everything that can touch a
//! call session: user commands, inbound signaling frames, remote media
//! stream arrivals and the negotiation deadline. No two transitions for
//! the same session ever run concurrently.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use videocall_protocol::{ClientId, SignalMessage};

use crate::controller::{CallController, CallEvent, CallState};
use crate::error::{Error, Result};
use crate::media::{MediaBackend, MediaConfig, StreamHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side knobs. Always explicit, never ambient.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// How long to wait for negotiation progress from the peer before the
    /// call attempt is classified as failed. Bounds the silent-drop policy
    /// of the server: an unreachable peer produces no signal at all.
    pub negotiation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

enum Command {
    PlaceCall { peer: ClientId, config: MediaConfig },
    Accept { config: MediaConfig },
    Reject,
    End,
    Rename(ClientId),
}

/// Handle to a connected endpoint.
///
/// Created with [`CallClient::connect`], which claims (or requests) an
/// identifier and spawns the driving task. User intents go in through the
/// methods below; state changes come back as [`CallEvent`]s from
/// [`CallClient::next_event`]. Dropping the handle hangs up any call in
/// progress and closes the connection.
pub struct CallClient {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl CallClient {
    /// Connect to a signaling server instance and claim `identifier`, or
    /// ask for a generated guest identifier when `None`. The outcome
    /// arrives as the first [`CallEvent::IdAssigned`] or
    /// [`CallEvent::IdTaken`] event.
    ///
    /// # Errors
    /// [`Error::Transport`] if the WebSocket connection cannot be opened.
    pub async fn connect<B: MediaBackend>(
        url: &str,
        identifier: Option<ClientId>,
        backend: B,
        config: ClientConfig,
    ) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        info!("connected to signaling server at {}", url);
        let (ws_tx, ws_rx) = ws.split();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        signal_tx
            .send(SignalMessage::Init(identifier))
            .map_err(|_| Error::SignalingClosed)?;
        tokio::spawn(write_signals(signal_rx, ws_tx));

        let controller =
            CallController::new(backend, config.negotiation_timeout, signal_tx, event_tx);
        tokio::spawn(run_call_loop(controller, ws_rx, command_rx));

        Ok(Self { commands, events })
    }

    /// Next state change, or `None` once the driving task has stopped.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    /// Ring `peer` and start negotiating as initiator.
    ///
    /// # Errors
    /// [`Error::SignalingClosed`] if the connection is gone.
    pub fn place_call(&self, peer: ClientId, config: MediaConfig) -> Result<()> {
        self.command(Command::PlaceCall { peer, config })
    }

    /// Accept the currently ringing inbound call.
    ///
    /// # Errors
    /// [`Error::SignalingClosed`] if the connection is gone.
    pub fn accept_call(&self, config: MediaConfig) -> Result<()> {
        self.command(Command::Accept { config })
    }

    /// Reject the currently ringing inbound call.
    ///
    /// # Errors
    /// [`Error::SignalingClosed`] if the connection is gone.
    pub fn reject_call(&self) -> Result<()> {
        self.command(Command::Reject)
    }

    /// Hang up whatever call activity is in progress. A no-op when idle.
    ///
    /// # Errors
    /// [`Error::SignalingClosed`] if the connection is gone.
    pub fn end_call(&self) -> Result<()> {
        self.command(Command::End)
    }

    /// Request a different rendezvous identifier.
    ///
    /// # Errors
    /// [`Error::SignalingClosed`] if the connection is gone.
    pub fn rename(&self, id: ClientId) -> Result<()> {
        self.command(Command::Rename(id))
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SignalingClosed)
    }
}

async fn write_signals(
    mut signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
    mut ws_tx: SplitSink<WsStream, Message>,
) {
    while let Some(message) = signal_rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize signaling message: {}", e);
                continue;
            }
        };
        if let Err(e) = ws_tx.send(Message::Text(text)).await {
            error!("websocket send error: {}", e);
            break;
        }
    }
}

async fn run_call_loop<B: MediaBackend>(
    mut controller: CallController<B>,
    mut ws_rx: SplitStream<WsStream>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    // the active session's remote stream receiver, tagged with its
    // generation so deliveries for a torn-down session can be told apart
    let mut remote: Option<(u64, mpsc::UnboundedReceiver<StreamHandle>)> = None;

    loop {
        let deadline = controller.deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => apply_command(&mut controller, &mut remote, command),
                // the handle was dropped: hang up and wind down
                None => {
                    controller.end_call();
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(message) => controller.handle_signal(message),
                    Err(e) => error!("malformed message from signaling server: {}", e),
                },
                Some(Ok(_)) => {} // pings, pongs and close frames
                Some(Err(e)) => {
                    warn!("signaling connection error: {}", e);
                    controller.connection_lost();
                    break;
                }
                None => {
                    info!("signaling connection closed");
                    controller.connection_lost();
                    break;
                }
            },
            stream = next_remote_stream(&mut remote) => match stream {
                Some((generation, handle)) => controller.on_remote_stream(generation, handle),
                // the platform dropped its sender, no more streams coming
                None => remote = None,
            },
            () = sleep_until_deadline(deadline) => controller.on_deadline(),
        }

        if *controller.state() == CallState::Idle {
            // a torn-down session's receiver must not be polled again
            remote = None;
        }
    }
}

fn apply_command<B: MediaBackend>(
    controller: &mut CallController<B>,
    remote: &mut Option<(u64, mpsc::UnboundedReceiver<StreamHandle>)>,
    command: Command,
) {
    match command {
        Command::PlaceCall { peer, config } => match controller.place_call(peer, &config) {
            Ok(streams) => *remote = Some(streams),
            Err(e) => warn!("failed to place call: {}", e),
        },
        Command::Accept { config } => match controller.accept_call(&config) {
            Ok(streams) => *remote = Some(streams),
            Err(e) => warn!("failed to accept call: {}", e),
        },
        Command::Reject => {
            if let Err(e) = controller.reject_call() {
                warn!("failed to reject call: {}", e);
            }
        }
        Command::End => controller.end_call(),
        Command::Rename(id) => {
            if let Err(e) = controller.rename(id) {
                warn!("failed to request rename: {}", e);
            }
        }
    }
}

async fn next_remote_stream(
    remote: &mut Option<(u64, mpsc::UnboundedReceiver<StreamHandle>)>,
) -> Option<(u64, StreamHandle)> {
    match remote {
        Some((generation, rx)) => rx.recv().await.map(|handle| (*generation, handle)),
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
