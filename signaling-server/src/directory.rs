//! Rendezvous directory mapping client identifiers to live connections.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};
use videocall_protocol::ClientId;

/// Sending half of one client's outbound message queue. The receiving half
/// is drained by that connection's writer task.
pub type ClientTx = mpsc::UnboundedSender<Message>;

/// Registration or rename collided with an identifier that is currently
/// connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierTaken;

impl Display for IdentifierTaken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "identifier is taken by a connected client")
    }
}

impl std::error::Error for IdentifierTaken {}

/// Process-wide map from [`ClientId`] to the connection currently holding
/// it. The single shared mutable resource of the server; every mutating
/// operation takes the write lock so concurrent claims of the same
/// identifier leave exactly one winner.
#[derive(Debug, Default)]
pub struct Directory {
    inner: RwLock<HashMap<ClientId, ClientTx>>,
}

impl Directory {
    /// Install `id -> tx`, failing if the identifier is already held.
    pub async fn register(&self, id: ClientId, tx: ClientTx) -> Result<(), IdentifierTaken> {
        match self.inner.write().await.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(())
            }
            Entry::Occupied(_) => Err(IdentifierTaken),
        }
    }

    /// Remove the identifier. Idempotent, an absent id is a no-op.
    pub async fn unregister(&self, id: &ClientId) {
        self.inner.write().await.remove(id);
    }

    /// Resolve an identifier to its connection, if currently registered.
    pub async fn lookup(&self, id: &ClientId) -> Option<ClientTx> {
        self.inner.read().await.get(id).cloned()
    }

    /// Atomically move the connection registered under `old` to `new`.
    /// Holds the write lock across both steps so no lookup can observe the
    /// directory with neither identifier present. If `old` was never
    /// registered this degrades to a plain registration of `new`, which is
    /// what a rename from an unregistered client means.
    pub async fn rename(
        &self,
        old: &ClientId,
        new: ClientId,
        fallback_tx: &ClientTx,
    ) -> Result<(), IdentifierTaken> {
        if *old == new {
            return Ok(());
        }
        let mut map = self.inner.write().await;
        if map.contains_key(&new) {
            return Err(IdentifierTaken);
        }
        let tx = map.remove(old).unwrap_or_else(|| fallback_tx.clone());
        map.insert(new, tx);
        Ok(())
    }
}

/// Symmetric table of who is currently in a call with whom. Kept so that a
/// transport drop can be turned into a synthetic call-end for the surviving
/// peer instead of leaving it to time out.
#[derive(Debug, Default)]
pub struct Pairings {
    inner: RwLock<HashMap<ClientId, ClientId>>,
}

impl Pairings {
    /// Record `a` and `b` as calling each other. Refused (returns `false`)
    /// if either side is already paired; a request to a busy target gets
    /// ignored at that endpoint, so its established pairing must survive.
    pub async fn link(&self, a: ClientId, b: ClientId) -> bool {
        let mut map = self.inner.write().await;
        if map.contains_key(&a) || map.contains_key(&b) {
            return false;
        }
        map.insert(a.clone(), b.clone());
        map.insert(b, a);
        true
    }

    /// Drop the pairing involving `id`, returning the peer it was paired
    /// with. Idempotent.
    pub async fn unlink(&self, id: &ClientId) -> Option<ClientId> {
        let mut map = self.inner.write().await;
        let peer = map.remove(id)?;
        if map.get(&peer) == Some(id) {
            map.remove(&peer);
        }
        Some(peer)
    }

    /// Peer currently paired with `id`, if any.
    pub async fn peer_of(&self, id: &ClientId) -> Option<ClientId> {
        self.inner.read().await.get(id).cloned()
    }

    /// Re-key a pairing after an identifier rename so an in-flight call
    /// survives the rename.
    pub async fn rename(&self, old: &ClientId, new: ClientId) {
        let mut map = self.inner.write().await;
        if let Some(peer) = map.remove(old) {
            if let Some(back) = map.get_mut(&peer) {
                *back = new.clone();
            }
            map.insert(new, peer);
        }
    }
}
