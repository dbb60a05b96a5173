//! Room membership and event fan-out.
//!
//! A room is nothing more than an entry in the `rooms` map: it appears on
//! the first join and disappears when its last member leaves. Each peer also
//! remembers the rooms it joined so a disconnect can drop every membership
//! without scanning the whole map.
//!
//! Lock order is always `peers` before `rooms`. Fan-out snapshots a room's
//! members and releases the room before touching any peer.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use shared::{BookingId, Location, PeerCommand, RelayEvent};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One live connection to the relay.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer_{}", self.0.simple())
    }
}

struct Peer {
    tx: mpsc::Sender<RelayEvent>,
    rooms: HashSet<BookingId>,
}

pub struct RoomRelay {
    rooms: DashMap<BookingId, HashSet<PeerId>>,
    peers: DashMap<PeerId, Peer>,
    send_queue: usize,
}

impl RoomRelay {
    pub fn new(send_queue: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            peers: DashMap::new(),
            send_queue: send_queue.max(1),
        }
    }

    /// Register a connection. Events for it arrive on the returned receiver.
    pub fn connect(&self) -> (PeerId, mpsc::Receiver<RelayEvent>) {
        let id = PeerId::new();
        let (tx, rx) = mpsc::channel(self.send_queue);
        self.peers.insert(
            id.clone(),
            Peer {
                tx,
                rooms: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Add `peer_id` to the room. Joining twice is harmless. Returns false
    /// only when the peer is not (or no longer) connected.
    pub fn join(&self, peer_id: &PeerId, booking_id: &BookingId) -> bool {
        let Some(mut peer) = self.peers.get_mut(peer_id) else {
            tracing::debug!(peer_id = %peer_id, booking_id = %booking_id, "join from unknown peer");
            return false;
        };

        self.rooms
            .entry(booking_id.clone())
            .or_default()
            .insert(peer_id.clone());
        if peer.rooms.insert(booking_id.clone()) {
            tracing::info!(peer_id = %peer_id, booking_id = %booking_id, "joined room");
        }
        true
    }

    /// Drop a single membership, keeping the connection.
    pub fn leave_room(&self, peer_id: &PeerId, booking_id: &BookingId) -> bool {
        let Some(mut peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        if !peer.rooms.remove(booking_id) {
            return false;
        }
        self.remove_member(peer_id, booking_id);
        tracing::info!(peer_id = %peer_id, booking_id = %booking_id, "left room");
        true
    }

    /// Forget the connection and every membership it held. Nothing is
    /// delivered to it once this returns.
    pub fn leave(&self, peer_id: &PeerId) {
        let Some((_, peer)) = self.peers.remove(peer_id) else {
            return;
        };
        for booking_id in &peer.rooms {
            self.remove_member(peer_id, booking_id);
        }
        tracing::info!(peer_id = %peer_id, rooms = peer.rooms.len(), "peer disconnected");
    }

    /// Forward a position to every other member of the room. Returns the
    /// number of peers it was queued for.
    pub fn relay_location(
        &self,
        sender: &PeerId,
        booking_id: &BookingId,
        location: Location,
    ) -> usize {
        if !location.is_finite() {
            tracing::debug!(peer_id = %sender, booking_id = %booking_id, "dropping non-finite location");
            return 0;
        }
        let event = RelayEvent::ReceiveLocation {
            booking_id: booking_id.clone(),
            location,
        };
        self.fan_out(booking_id, Some(sender), event)
    }

    /// Deliver the acknowledgement to the whole room, sender included.
    pub fn relay_acknowledge(&self, booking_id: &BookingId, message: Option<String>) -> usize {
        let event = RelayEvent::acknowledged(booking_id.clone(), message);
        let delivered = self.fan_out(booking_id, None, event);
        tracing::info!(booking_id = %booking_id, delivered, "booking acknowledged");
        delivered
    }

    pub fn handle(&self, peer_id: &PeerId, command: PeerCommand) {
        match command {
            PeerCommand::JoinBooking { booking_id } => {
                self.join(peer_id, &booking_id);
            }
            PeerCommand::LeaveBooking { booking_id } => {
                self.leave_room(peer_id, &booking_id);
            }
            PeerCommand::SendLocation {
                booking_id,
                location,
            } => {
                let delivered = self.relay_location(peer_id, &booking_id, location);
                tracing::trace!(peer_id = %peer_id, booking_id = %booking_id, delivered, "location relayed");
            }
            PeerCommand::SendAck {
                booking_id,
                message,
            } => {
                self.relay_acknowledge(&booking_id, message);
            }
        }
    }

    pub fn member_count(&self, booking_id: &BookingId) -> usize {
        self.rooms.get(booking_id).map_or(0, |members| members.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn remove_member(&self, peer_id: &PeerId, booking_id: &BookingId) {
        self.rooms.remove_if_mut(booking_id, |_, members| {
            members.remove(peer_id);
            members.is_empty()
        });
    }

    fn fan_out(&self, booking_id: &BookingId, except: Option<&PeerId>, event: RelayEvent) -> usize {
        let recipients: Vec<PeerId> = match self.rooms.get(booking_id) {
            Some(members) => members
                .iter()
                .filter(|member| Some(*member) != except)
                .cloned()
                .collect(),
            None => return 0,
        };

        recipients
            .iter()
            .filter(|recipient| self.deliver(recipient, event.clone()))
            .count()
    }

    /// Queue without waiting so one slow peer never holds up the rest.
    fn deliver(&self, peer_id: &PeerId, event: RelayEvent) -> bool {
        let Some(tx) = self.peers.get(peer_id).map(|peer| peer.tx.clone()) else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer_id = %peer_id, "send queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(peer_id = %peer_id, "peer connection already closed");
                false
            }
        }
    }
}
