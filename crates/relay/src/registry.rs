//! Path registry
//!
//! Maps a path id to its slot: at most one initiator, up to 254 responders,
//! the queue of responders waiting for a pairing, and the active pair.
//! Every slot has its own lock, so two paths never contend; the outer map
//! lock is only held to find or retire a slot. Empty slots are removed.
//!
//! The registry never touches a connection directly. It talks to connection
//! tasks through their [`ClientHandle`]: a bounded event queue for messages
//! and an unbounded control channel for drop requests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use signalcraft_core::{
    negotiate, Address, CloseCode, Disconnected, Message, NewInitiator, NewResponder, PathId,
    TaskOffer, TaskSelector,
};

use crate::{RelayError, Result};

/// Process-unique connection number
pub type ConnectionId = u64;

/// Something a connection task must do on behalf of the registry or its peer
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Encrypt and send a relay message
    Notify(Message),
    /// A partner was assigned; `notice` announces the negotiated task
    Paired {
        peer: Address,
        generation: u64,
        notice: Message,
    },
    /// A client left the path
    PeerLeft(Address),
    /// Opaque frame from the partner, forwarded as is
    Relay(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Queue bound exceeded, the receiver is being dropped
    Full,
    /// Receiver already gone
    Gone,
}

/// The registry's and peers' view of a connection task
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    events: mpsc::Sender<Event>,
    control: mpsc::UnboundedSender<CloseCode>,
}

impl ClientHandle {
    pub fn new(
        id: ConnectionId,
        events: mpsc::Sender<Event>,
        control: mpsc::UnboundedSender<CloseCode>,
    ) -> Self {
        Self {
            id,
            events,
            control,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event without waiting. A full queue drops the receiver.
    pub fn deliver(&self, event: Event) -> std::result::Result<(), DeliveryError> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Connection {} outbound queue full", self.id);
                self.drop_with(CloseCode::Backpressure);
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Gone),
        }
    }

    /// Ask the connection to flush pending events and close
    pub fn drop_with(&self, code: CloseCode) {
        // The task may already be gone
        let _ = self.control.send(code);
    }
}

/// Result of registering an initiator
#[derive(Debug, Clone, PartialEq)]
pub struct InitiatorAdmission {
    /// Responders currently on the path
    pub responders: Vec<Address>,
    /// Previous initiator that was evicted
    pub evicted: Option<ConnectionId>,
}

/// Result of registering a responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderAdmission {
    pub address: Address,
    pub initiator_connected: bool,
}

/// The active pair of a path
#[derive(Debug, Clone)]
pub struct ActivePair {
    pub initiator: ClientHandle,
    pub responder: ClientHandle,
    pub responder_address: Address,
    pub generation: u64,
}

struct Member {
    handle: ClientHandle,
    offer: TaskOffer,
}

#[derive(Default)]
struct PathSlot {
    initiator: Option<Member>,
    responders: BTreeMap<Address, Member>,
    /// Unpaired responders in pairing order
    waiting: VecDeque<Address>,
    paired: Option<Address>,
    /// Bumped with every new pair, so frames from an earlier pairing never
    /// reach a later partner
    generation: u64,
    /// Removed from the map; lookups must retry
    retired: bool,
}

impl PathSlot {
    fn is_empty(&self) -> bool {
        self.initiator.is_none() && self.responders.is_empty()
    }
}

pub struct PathRegistry {
    paths: Mutex<HashMap<PathId, Arc<Mutex<PathSlot>>>>,
    selector: Arc<dyn TaskSelector>,
    max_responders: usize,
}

impl PathRegistry {
    pub fn new(selector: Arc<dyn TaskSelector>, max_responders: usize) -> Self {
        Self {
            paths: Mutex::new(HashMap::new()),
            selector,
            max_responders,
        }
    }

    /// Admit an authenticated initiator, evicting the previous one.
    ///
    /// The evicted initiator receives `disconnected` for its own address and
    /// is then dropped with `DropByInitiator`. Its partner, if any, returns to
    /// the front of the queue. Pairing is attempted right away; responders
    /// left waiting receive a `new-initiator` availability notice.
    pub fn register_initiator(
        &self,
        path: &PathId,
        handle: ClientHandle,
        offer: TaskOffer,
    ) -> InitiatorAdmission {
        let selector = self.selector.clone();
        let admission = self.with_slot(path, true, |slot| {
            let mut evicted = None;
            if let Some(old) = slot.initiator.take() {
                info!(
                    "Path {}: evicting initiator (connection {})",
                    path.short(),
                    old.handle.id()
                );
                let notice = Message::Disconnected(Disconnected {
                    id: Address::INITIATOR,
                });
                let _ = old.handle.deliver(Event::Notify(notice));
                old.handle.drop_with(CloseCode::DropByInitiator);
                if let Some(address) = slot.paired.take() {
                    slot.waiting.push_front(address);
                    if let Some(responder) = slot.responders.get(&address) {
                        let _ = responder.handle.deliver(Event::PeerLeft(Address::INITIATOR));
                    }
                }
                evicted = Some(old.handle.id());
            }

            slot.initiator = Some(Member { handle, offer });
            let responders = slot.responders.keys().copied().collect();

            try_pair(path, slot, selector.as_ref());
            for address in &slot.waiting {
                if let Some(responder) = slot.responders.get(address) {
                    let notice = Message::NewInitiator(NewInitiator::default());
                    let _ = responder.handle.deliver(Event::Notify(notice));
                }
            }

            InitiatorAdmission {
                responders,
                evicted,
            }
        });
        admission.unwrap_or(InitiatorAdmission {
            responders: Vec::new(),
            evicted: None,
        })
    }

    /// Admit an authenticated responder on the lowest free address.
    ///
    /// With an idle initiator present the pair is formed immediately; with a
    /// busy one the initiator receives a `new-responder` availability notice.
    pub fn enqueue_responder(
        &self,
        path: &PathId,
        handle: ClientHandle,
        offer: TaskOffer,
    ) -> Result<ResponderAdmission> {
        let selector = self.selector.clone();
        let max_responders = self.max_responders;
        self.with_slot(path, true, |slot| {
            if slot.responders.len() >= max_responders {
                return Err(RelayError::PathFull);
            }
            let address = Address::responder_slots()
                .find(|address| !slot.responders.contains_key(address))
                .ok_or(RelayError::PathFull)?;

            slot.responders.insert(address, Member { handle, offer });
            slot.waiting.push_back(address);
            debug!("Path {}: responder {} queued", path.short(), address);

            let initiator_connected = slot.initiator.is_some();
            if slot.paired.is_some() {
                if let Some(initiator) = &slot.initiator {
                    let notice = Message::NewResponder(NewResponder {
                        id: address,
                        task: None,
                        data: None,
                    });
                    let _ = initiator.handle.deliver(Event::Notify(notice));
                }
            } else {
                try_pair(path, slot, selector.as_ref());
            }

            Ok(ResponderAdmission {
                address,
                initiator_connected,
            })
        })
        .unwrap_or(Err(RelayError::Internal("path slot unavailable".to_string())))
    }

    /// Form a pair if the path has an idle initiator and a queued responder,
    /// and return the active pair.
    pub fn pair(&self, path: &PathId) -> Option<ActivePair> {
        let selector = self.selector.clone();
        self.with_slot(path, false, |slot| {
            try_pair(path, slot, selector.as_ref());
            let responder_address = slot.paired?;
            Some(ActivePair {
                initiator: slot.initiator.as_ref()?.handle.clone(),
                responder: slot.responders.get(&responder_address)?.handle.clone(),
                responder_address,
                generation: slot.generation,
            })
        })
        .flatten()
    }

    /// Partner of connection `id` at `address`, if it is part of the active
    /// pair and that pair is still the one formed as `generation`
    pub fn peer_of(
        &self,
        path: &PathId,
        id: ConnectionId,
        address: Address,
        generation: u64,
    ) -> Option<(Address, ClientHandle)> {
        self.with_slot(path, false, |slot| {
            let paired = slot.paired?;
            if slot.generation != generation {
                return None;
            }
            if address.is_initiator() {
                if slot.initiator.as_ref()?.handle.id() != id {
                    return None;
                }
                let responder = slot.responders.get(&paired)?;
                Some((paired, responder.handle.clone()))
            } else {
                if paired != address || slot.responders.get(&address)?.handle.id() != id {
                    return None;
                }
                let initiator = slot.initiator.as_ref()?;
                Some((Address::INITIATOR, initiator.handle.clone()))
            }
        })
        .flatten()
    }

    /// Drop a responder at the request of the path's initiator
    pub fn drop_responder(
        &self,
        path: &PathId,
        initiator: ConnectionId,
        responder: Address,
        code: CloseCode,
    ) -> bool {
        self.with_slot(path, false, |slot| {
            match &slot.initiator {
                Some(member) if member.handle.id() == initiator => {}
                _ => return false,
            }
            match slot.responders.get(&responder) {
                Some(member) => {
                    info!(
                        "Path {}: initiator drops responder {} ({})",
                        path.short(),
                        responder,
                        code
                    );
                    member.handle.drop_with(code);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    /// Remove connection `id` from its slot and notify whoever is left.
    ///
    /// Returns `false` when the connection no longer occupies the slot.
    pub fn release(&self, path: &PathId, id: ConnectionId, address: Address) -> bool {
        let selector = self.selector.clone();
        self.with_slot(path, false, |slot| {
            if address.is_initiator() {
                match &slot.initiator {
                    Some(member) if member.handle.id() == id => {}
                    _ => return false,
                }
                slot.initiator = None;
                if let Some(partner) = slot.paired.take() {
                    slot.waiting.push_front(partner);
                }
                for responder in slot.responders.values() {
                    let _ = responder.handle.deliver(Event::PeerLeft(Address::INITIATOR));
                }
                info!("Path {}: initiator left", path.short());
                true
            } else if address.is_responder() {
                match slot.responders.get(&address) {
                    Some(member) if member.handle.id() == id => {}
                    _ => return false,
                }
                slot.responders.remove(&address);
                slot.waiting.retain(|queued| *queued != address);
                if let Some(initiator) = &slot.initiator {
                    let _ = initiator.handle.deliver(Event::PeerLeft(address));
                }
                info!("Path {}: responder {} left", path.short(), address);
                if slot.paired == Some(address) {
                    slot.paired = None;
                    try_pair(path, slot, selector.as_ref());
                }
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Number of live paths
    pub fn path_count(&self) -> usize {
        self.paths.lock().len()
    }

    /// Number of registered connections over all paths
    pub fn connection_count(&self) -> usize {
        self.slots()
            .iter()
            .map(|slot| {
                let slot = slot.lock();
                usize::from(slot.initiator.is_some()) + slot.responders.len()
            })
            .sum()
    }

    /// Whether any slot still references connection `id`
    pub fn references(&self, id: ConnectionId) -> bool {
        self.slots().iter().any(|slot| {
            let slot = slot.lock();
            slot.initiator.as_ref().map_or(false, |m| m.handle.id() == id)
                || slot.responders.values().any(|m| m.handle.id() == id)
        })
    }

    fn slots(&self) -> Vec<Arc<Mutex<PathSlot>>> {
        self.paths.lock().values().cloned().collect()
    }

    /// Run `f` with exclusive access to the slot of `path`
    fn with_slot<R>(
        &self,
        path: &PathId,
        create: bool,
        f: impl FnOnce(&mut PathSlot) -> R,
    ) -> Option<R> {
        let mut f = Some(f);
        loop {
            let slot = {
                let mut paths = self.paths.lock();
                match paths.get(path) {
                    Some(slot) => slot.clone(),
                    None if create => paths.entry(*path).or_default().clone(),
                    None => return None,
                }
            };
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            let result = (f.take()?)(&mut *guard);
            let empty = guard.is_empty();
            drop(guard);
            if empty {
                self.retire(path, &slot);
            }
            return Some(result);
        }
    }

    fn retire(&self, path: &PathId, slot: &Arc<Mutex<PathSlot>>) {
        let mut paths = self.paths.lock();
        let mut guard = slot.lock();
        if guard.retired || !guard.is_empty() {
            return;
        }
        guard.retired = true;
        if paths.get(path).map_or(false, |current| Arc::ptr_eq(current, slot)) {
            paths.remove(path);
            debug!("Path {}: removed", path.short());
        }
    }
}

/// Pair the idle initiator with the first compatible queued responder.
///
/// Queued responders without a common task are dropped with `NoSharedTask`.
fn try_pair(path: &PathId, slot: &mut PathSlot, selector: &dyn TaskSelector) -> Option<Address> {
    if slot.paired.is_some() {
        return None;
    }
    let initiator = slot.initiator.as_ref()?;
    while let Some(address) = slot.waiting.pop_front() {
        let Some(responder) = slot.responders.get(&address) else {
            continue;
        };
        match negotiate(selector, &initiator.offer, &responder.offer) {
            Some(negotiated) => {
                slot.paired = Some(address);
                slot.generation += 1;
                let generation = slot.generation;
                info!(
                    "Path {}: paired responder {} on task {}",
                    path.short(),
                    address,
                    negotiated
                );
                let _ = initiator.handle.deliver(Event::Paired {
                    peer: address,
                    generation,
                    notice: Message::NewResponder(NewResponder {
                        id: address,
                        task: Some(negotiated.task.clone()),
                        data: Some(negotiated.responder_data),
                    }),
                });
                let _ = responder.handle.deliver(Event::Paired {
                    peer: Address::INITIATOR,
                    generation,
                    notice: Message::NewInitiator(NewInitiator {
                        task: Some(negotiated.task),
                        data: Some(negotiated.initiator_data),
                    }),
                });
                return Some(address);
            }
            None => {
                warn!(
                    "Path {}: responder {} shares no task with the initiator",
                    path.short(),
                    address
                );
                responder.handle.drop_with(CloseCode::NoSharedTask);
            }
        }
    }
    None
}
