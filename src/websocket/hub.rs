use crate::websocket::{session::Peer, CloseCode, Message};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::{debug, trace};

/// Registry of open WebSocket sessions.
///
/// Sessions join when the upgrade completes and leave when they end, so
/// a hub can broadcast to every open session or close them all.
///
/// # Examples
/// ```no_run
/// use kiln::{websocket::{Echo, Hub, WebSocket}, Registry};
/// use std::sync::Arc;
///
/// let hub = Arc::new(Hub::new());
///
/// let mut registry = Registry::new();
/// registry.add(WebSocket::new("/live", Echo).hub(hub.clone()));
///
/// // later, from any thread
/// hub.broadcast("tick");
/// ```
#[derive(Debug, Default)]
pub struct Hub {
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
}

/// Keeps a session registered in its hub until dropped.
pub(crate) struct Membership {
    hub: Weak<Hub>,
    id: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().remove(&self.id);
        }
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn join(self: &Arc<Self>, peer: &Arc<Peer>) -> Membership {
        self.lock().insert(peer.id(), peer.clone());
        Membership {
            hub: Arc::downgrade(self),
            id: peer.id(),
        }
    }

    /// Sends `message` to every open session and returns how many received it.
    pub fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let mut delivered = 0;

        for peer in self.snapshot() {
            match peer.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => trace!(id = peer.id(), error = %err, "broadcast skipped"),
            }
        }
        delivered
    }

    /// Starts the closing handshake on every open session.
    pub fn close_all(&self, code: CloseCode, reason: &str) -> usize {
        let closed = self
            .snapshot()
            .iter()
            .filter(|peer| matches!(peer.close(code, reason), Ok(true)))
            .count();
        debug!(closed, code = code.as_u16(), "hub closed sessions");
        closed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Peers are written to outside the registry lock.
    fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Peer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
