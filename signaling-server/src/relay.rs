//! Per-connection message loop: identifier claims and blind forwarding of
//! signaling messages between exactly two identifiers at a time.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt, TryFutureExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;
use videocall_protocol::{ClientId, SignalMessage};

use crate::directory::{ClientTx, Directory, Pairings};

/// Serves one client connection until the transport drops, then cleans up
/// its directory entry and notifies a paired peer, if any.
pub async fn client_connected(ws: WebSocket, directory: Arc<Directory>, pairings: Arc<Pairings>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (tx, rx) = mpsc::unbounded_channel();
    let mut rx = UnboundedReceiverStream::new(rx);

    tokio::task::spawn(async move {
        while let Some(message) = rx.next().await {
            ws_tx
                .send(message)
                .unwrap_or_else(|e| error!("websocket send error: {}", e))
                .await;
        }
    });

    // Assigned on a successful init and used to stamp forwarded messages
    // with the sender's identity.
    let mut client_id: Option<ClientId> = None;

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!("websocket error (id={:?}): {}", client_id, e);
                break;
            }
        };

        // an error is local to this one message, the connection keeps serving
        if let Err(e) = client_message(&mut client_id, &tx, msg, &directory, &pairings).await {
            error!("failed to handle message from {:?}: {:#}", client_id, e);
        }
    }

    client_disconnected(client_id, &directory, &pairings).await;
}

async fn client_message(
    client_id: &mut Option<ClientId>,
    tx: &ClientTx,
    msg: Message,
    directory: &Directory,
    pairings: &Pairings,
) -> anyhow::Result<()> {
    let text = match msg {
        Message::Text(text) => text,
        // pings and pongs are handled by axum, a close frame ends the read loop
        _ => return Ok(()),
    };
    let request: SignalMessage =
        serde_json::from_str(&text).context("malformed signaling message")?;
    debug!("message received from {:?}: {:?}", client_id, request);

    match request {
        SignalMessage::Init(requested) => match requested {
            Some(id) => claim(client_id, tx, id, directory, pairings).await?,
            None => {
                let id = register_guest(directory, tx).await;
                info!("assigned generated identifier {}", id);
                send(tx, &SignalMessage::IdAssigned(id.clone()))?;
                *client_id = Some(id);
            }
        },
        SignalMessage::Rename(new_id) => {
            claim(client_id, tx, new_id, directory, pairings).await?;
        }
        SignalMessage::CallRequest(to) => {
            let from = sender(client_id)?;
            match directory.lookup(&to).await {
                Some(peer_tx) => {
                    send(&peer_tx, &SignalMessage::CallRequest(from.clone()))?;
                    if !pairings.link(from.clone(), to.clone()).await {
                        debug!("{} or {} already in a call, not pairing", from, to);
                    }
                }
                // fail-soft: no call is established, the caller times out
                None => debug!("dropping call request from {} to unknown {}", from, to),
            }
        }
        SignalMessage::SdpOffer(to, payload) => {
            let from = sender(client_id)?;
            forward(directory, &from, &to, SignalMessage::SdpOffer(from.clone(), payload)).await?;
        }
        SignalMessage::SdpAnswer(to, payload) => {
            let from = sender(client_id)?;
            forward(directory, &from, &to, SignalMessage::SdpAnswer(from.clone(), payload)).await?;
        }
        SignalMessage::IceCandidate(to, candidate) => {
            let from = sender(client_id)?;
            forward(
                directory,
                &from,
                &to,
                SignalMessage::IceCandidate(from.clone(), candidate),
            )
            .await?;
        }
        SignalMessage::CallEnd(to) => {
            let from = sender(client_id)?;
            forward(directory, &from, &to, SignalMessage::CallEnd(from.clone())).await?;
            pairings.unlink(&from).await;
        }
        SignalMessage::IdAssigned(_) | SignalMessage::IdTaken(_) => {
            warn!("{:?} sent a server-only message, ignoring", client_id);
        }
    }

    Ok(())
}

/// Claim a chosen identifier, either as the first init or as a rename.
/// Collision policy: reject. The claimant keeps whatever identifier it had
/// before and may retry with a different name.
async fn claim(
    client_id: &mut Option<ClientId>,
    tx: &ClientTx,
    new_id: ClientId,
    directory: &Directory,
    pairings: &Pairings,
) -> anyhow::Result<()> {
    let result = match client_id.as_ref() {
        Some(old) => directory.rename(old, new_id.clone(), tx).await,
        None => directory.register(new_id.clone(), tx.clone()).await,
    };

    match result {
        Ok(()) => {
            if let Some(old) = client_id.as_ref() {
                pairings.rename(old, new_id.clone()).await;
                info!("client {} renamed to {}", old, new_id);
            } else {
                info!("client registered as {}", new_id);
            }
            send(tx, &SignalMessage::IdAssigned(new_id.clone()))?;
            *client_id = Some(new_id);
        }
        Err(taken) => {
            debug!("identifier {} rejected: {}", new_id, taken);
            send(tx, &SignalMessage::IdTaken(new_id))?;
        }
    }
    Ok(())
}

/// Generate a guest identifier that is unique at assignment time; the
/// register loop guards against the (unlikely) generated collision.
async fn register_guest(directory: &Directory, tx: &ClientTx) -> ClientId {
    loop {
        let candidate: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let id = ClientId::new(format!("guest-{}", candidate));
        if directory.register(id.clone(), tx.clone()).await.is_ok() {
            return id;
        }
    }
}

async fn forward(
    directory: &Directory,
    from: &ClientId,
    to: &ClientId,
    message: SignalMessage,
) -> anyhow::Result<()> {
    match directory.lookup(to).await {
        Some(peer_tx) => send(&peer_tx, &message),
        None => {
            // the peer disconnected mid-negotiation; the sender's own
            // negotiation timeout bounds the wait
            debug!("dropping {:?} from {} to unknown {}", message, from, to);
            Ok(())
        }
    }
}

fn sender(client_id: &Option<ClientId>) -> anyhow::Result<ClientId> {
    client_id
        .clone()
        .ok_or_else(|| anyhow!("message sent before a successful init"))
}

fn send(tx: &ClientTx, message: &SignalMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message).context("failed to serialize response")?;
    tx.send(Message::Text(text))
        .map_err(|_| anyhow!("connection's writer task is gone"))
}

async fn client_disconnected(
    client_id: Option<ClientId>,
    directory: &Directory,
    pairings: &Pairings,
) {
    let Some(id) = client_id else { return };
    info!("client disconnected: {}", id);
    directory.unregister(&id).await;

    // synthetic call-end so the surviving peer does not wait out a timeout
    if let Some(peer) = pairings.unlink(&id).await {
        if let Some(peer_tx) = directory.lookup(&peer).await {
            if let Err(e) = send(&peer_tx, &SignalMessage::CallEnd(id.clone())) {
                warn!("failed to notify {} about {} disconnecting: {:#}", peer, id, e);
            }
        }
    }
}
