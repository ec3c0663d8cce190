// Message bus: envelope stamping, outbound routing, and handler dispatch.
//
// Outbound, the bus owns one `ConnectionWriter` per linked peer and writes
// encoded envelopes to one (`send_to`) or all (`broadcast`) of them. A write
// failure detaches that link and reports the peer back to the caller; the
// peer's reader thread will notice the dead socket independently, so the
// caller only has to log.
//
// Inbound, `dispatch` runs every handler subscribed to the envelope's
// `MessageKind`. Handlers are isolated from each other and from the caller:
// an `Err` or a panic in one handler is logged and the rest still run. This
// keeps a misbehaving game-side observer from taking down a receive loop.
//
// The bus also stamps outgoing envelopes (`envelope`) with the local sender
// id, a per-sender message id, the wall-clock timestamp and the wire version.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::time::{SystemTime, UNIX_EPOCH};

use wayfarer_protocol::{Envelope, Message, MessageId, MessageKind, PeerId, WIRE_VERSION, encode};

use crate::connection::ConnectionWriter;

pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

type Handler = Box<dyn FnMut(&Envelope) -> HandlerResult + Send>;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct MessageBus {
    local_id: PeerId,
    next_message_id: u64,
    links: BTreeMap<PeerId, ConnectionWriter>,
    handlers: HashMap<MessageKind, Vec<Handler>>,
}

impl MessageBus {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            next_message_id: 0,
            links: BTreeMap::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Wrap a body in a freshly stamped envelope from this process.
    pub fn envelope(&mut self, body: Message) -> Envelope {
        let message_id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        Envelope {
            wire_version: WIRE_VERSION,
            message_id,
            sender: self.local_id,
            timestamp_ms: unix_millis(),
            body,
        }
    }

    pub fn attach(&mut self, peer: PeerId, writer: ConnectionWriter) {
        if let Some(mut old) = self.links.insert(peer, writer) {
            old.close();
        }
    }

    /// Drop the link to `peer`, closing its socket.
    pub fn detach(&mut self, peer: PeerId) {
        if let Some(mut writer) = self.links.remove(&peer) {
            writer.close();
        }
    }

    pub fn is_linked(&self, peer: PeerId) -> bool {
        self.links.contains_key(&peer)
    }

    pub fn linked_peers(&self) -> Vec<PeerId> {
        self.links.keys().copied().collect()
    }

    /// Send to one peer. Returns false (and detaches) if the write failed or
    /// the peer isn't linked.
    pub fn send_to(&mut self, peer: PeerId, envelope: &Envelope) -> bool {
        let bytes = match encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("dropping unencodable {:?}: {e}", envelope.kind());
                return false;
            }
        };
        self.write_bytes(peer, &bytes)
    }

    /// Send to every linked peer. Returns the peers whose write failed.
    pub fn broadcast(&mut self, envelope: &Envelope) -> Vec<PeerId> {
        self.broadcast_except(None, envelope)
    }

    /// Send to every linked peer other than `except`.
    pub fn broadcast_except(&mut self, except: Option<PeerId>, envelope: &Envelope) -> Vec<PeerId> {
        let bytes = match encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("dropping unencodable {:?}: {e}", envelope.kind());
                return Vec::new();
            }
        };
        let targets: Vec<PeerId> = self
            .links
            .keys()
            .copied()
            .filter(|p| Some(*p) != except)
            .collect();
        targets
            .into_iter()
            .filter(|peer| !self.write_bytes(*peer, &bytes))
            .collect()
    }

    fn write_bytes(&mut self, peer: PeerId, bytes: &[u8]) -> bool {
        let Some(writer) = self.links.get_mut(&peer) else {
            return false;
        };
        match writer.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("write to {peer} failed: {e}");
                self.detach(peer);
                false
            }
        }
    }

    /// Register `handler` for every envelope of `kind`.
    pub fn subscribe<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Envelope) -> HandlerResult + Send + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Run the handlers for this envelope's kind. Returns how many completed
    /// successfully.
    pub fn dispatch(&mut self, envelope: &Envelope) -> usize {
        let kind = envelope.kind();
        let Some(handlers) = self.handlers.get_mut(&kind) else {
            return 0;
        };
        let mut ok = 0;
        for (index, handler) in handlers.iter_mut().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => log::warn!("{kind:?} handler #{index} failed: {e}"),
                Err(_) => log::warn!("{kind:?} handler #{index} panicked"),
            }
        }
        ok
    }

    /// Close every link.
    pub fn close_all(&mut self) {
        for (_, mut writer) in std::mem::take(&mut self.links) {
            writer.close();
        }
    }
}
