//! Live data connections, one active entry per peer.
//!
//! A peer may briefly have more than one link (both sides dialing at once).
//! Both ends keep the same one: the link dialed by the smaller id wins, ties
//! going to the smaller connection id. The losing link is handed back to the
//! caller to close, so every peer ends up with exactly one open link.

use std::collections::{HashMap, hash_map::Entry};

use tracing::debug;
use vibespace_core::PeerId;

use crate::transport::{ConnectionId, Direction, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    id: ConnectionId,
    peer: PeerId,
    direction: Direction,
    state: ConnectionState,
}

impl Connection {
    pub fn dialing(id: ConnectionId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            direction: Direction::Outbound,
            state: ConnectionState::Connecting,
        }
    }

    pub fn opened(id: ConnectionId, peer: PeerId, direction: Direction) -> Self {
        Self {
            id,
            peer,
            direction,
            state: ConnectionState::Open,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Lower ranks are kept. Both ends of a link compute the same rank.
    fn rank(&self, local: &str) -> (bool, ConnectionId) {
        let dialer = match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => self.peer.as_str(),
        };
        let smaller = local.min(self.peer.as_str());
        (dialer != smaller, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First link for the peer.
    Registered,
    /// The link was already the active one.
    Unchanged,
    /// The new link took over; the previous one must be closed.
    Replaced(Connection),
    /// Another link is kept; the new one must be closed.
    Rejected(Connection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The active connection for the peer went away.
    Active(Connection),
    /// An outbound dial that never opened.
    Dial(Connection),
    /// A superseded or unknown link; nothing depends on it.
    Ignored,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    local: PeerId,
    active: HashMap<PeerId, Connection>,
    dialing: HashMap<PeerId, Connection>,
}

impl ConnectionRegistry {
    pub fn new(local: impl Into<PeerId>) -> Self {
        Self {
            local: local.into(),
            active: HashMap::new(),
            dialing: HashMap::new(),
        }
    }

    /// Record an outbound dial. Returns `false` when the peer is already
    /// connected or being dialed, in which case the caller must not dial.
    pub fn begin_dial(&mut self, connection: Connection) -> bool {
        if self.is_known(connection.peer()) {
            return false;
        }
        self.dialing.insert(connection.peer.clone(), connection);
        true
    }

    /// Store `connection` as the active link for its peer, or settle which of
    /// two links to the same peer survives.
    pub fn register(&mut self, mut connection: Connection) -> Registration {
        connection.state = ConnectionState::Open;
        // Any pending dial is settled here; if it opens later it is ranked then.
        self.dialing.remove(&connection.peer);

        match self.active.entry(connection.peer.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(connection);
                Registration::Registered
            }
            Entry::Occupied(slot) if slot.get().id == connection.id => Registration::Unchanged,
            Entry::Occupied(mut slot) => {
                if connection.rank(&self.local) < slot.get().rank(&self.local) {
                    let mut previous = slot.insert(connection);
                    previous.state = ConnectionState::Closed;
                    Registration::Replaced(previous)
                } else {
                    connection.state = ConnectionState::Closed;
                    Registration::Rejected(connection)
                }
            }
        }
    }

    /// Drop whatever `conn` refers to.
    pub fn unregister(&mut self, conn: ConnectionId, peer: &str) -> Removal {
        if self.active.get(peer).is_some_and(|c| c.id == conn) {
            if let Some(mut connection) = self.active.remove(peer) {
                connection.state = ConnectionState::Closed;
                return Removal::Active(connection);
            }
        }
        if self.dialing.get(peer).is_some_and(|c| c.id == conn) {
            if let Some(mut connection) = self.dialing.remove(peer) {
                connection.state = ConnectionState::Closed;
                return Removal::Dial(connection);
            }
        }
        Removal::Ignored
    }

    pub fn get(&self, peer: &str) -> Option<&Connection> {
        self.active.get(peer)
    }

    pub fn has(&self, peer: &str) -> bool {
        self.active.contains_key(peer)
    }

    pub fn is_dialing(&self, peer: &str) -> bool {
        self.dialing.contains_key(peer)
    }

    pub fn is_known(&self, peer: &str) -> bool {
        self.has(peer) || self.is_dialing(peer)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Registered peers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers = self.active.keys().cloned().collect::<Vec<_>>();
        peers.sort();
        peers
    }

    /// Send `payload` over every open connection. Returns how many accepted it.
    pub fn broadcast<T: Transport + ?Sized>(&self, transport: &T, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for connection in self.active.values().filter(|c| c.is_open()) {
            match transport.send(connection.id, payload.to_vec()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(peer = %connection.peer, "broadcast skipped: {}", err),
            }
        }
        delivered
    }

    /// Remove and return every tracked link, active and pending alike.
    pub fn drain(&mut self) -> Vec<ConnectionId> {
        self.active
            .drain()
            .map(|(_, c)| c.id)
            .chain(self.dialing.drain().map(|(_, c)| c.id))
            .collect()
    }
}
