//! In-process switchboard implementing [`Transport`].
//!
//! Every bound identifier gets an event channel; links and call legs are
//! shared entries visible to both ends under one id. Dropping a transport
//! unbinds it and closes everything it was part of.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;
use tracing::{debug, trace};
use vibespace_core::{PeerId, validate_peer_id};

use crate::media::{MediaStream, RemoteStream};
use crate::transport::{CallId, ConnectionId, Direction, Transport, TransportError, TransportEvent};

#[derive(Debug)]
struct Link {
    a: PeerId,
    b: PeerId,
}

impl Link {
    fn other(&self, local: &str) -> Option<&PeerId> {
        if self.a == local {
            Some(&self.b)
        } else if self.b == local {
            Some(&self.a)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct CallLeg {
    caller: PeerId,
    callee: PeerId,
    caller_stream: String,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    links: HashMap<ConnectionId, Link>,
    calls: HashMap<CallId, CallLeg>,
    next_id: u64,
}

impl NetworkState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&self, peer: &str, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(peer) {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `peer_id` on this network.
    pub fn bind(
        &self,
        peer_id: &str,
    ) -> Result<(MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        validate_peer_id(peer_id).map_err(|err| TransportError::Relay(err.to_string()))?;
        let mut state = self.state();
        if state.endpoints.contains_key(peer_id) {
            return Err(TransportError::IdTaken(peer_id.to_owned()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.insert(peer_id.to_owned(), tx);
        debug!(peer = %peer_id, "memory endpoint bound");
        Ok((
            MemoryTransport {
                local: peer_id.to_owned(),
                network: self.clone(),
            },
            rx,
        ))
    }

    pub fn is_bound(&self, peer_id: &str) -> bool {
        self.state().endpoints.contains_key(peer_id)
    }

    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unbind(&self, local: &str) {
        let mut state = self.state();
        state.endpoints.remove(local);

        let links = state
            .links
            .iter()
            .filter_map(|(conn, link)| link.other(local).map(|peer| (*conn, peer.clone())))
            .collect::<Vec<_>>();
        for (conn, peer) in links {
            state.links.remove(&conn);
            state.emit(
                &peer,
                TransportEvent::Closed {
                    conn,
                    peer: local.to_owned(),
                },
            );
        }

        let calls = state
            .calls
            .iter()
            .filter_map(|(call, leg)| {
                if leg.caller == local {
                    Some((*call, leg.callee.clone()))
                } else if leg.callee == local {
                    Some((*call, leg.caller.clone()))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        for (call, peer) in calls {
            state.calls.remove(&call);
            state.emit(
                &peer,
                TransportEvent::CallClosed {
                    call,
                    peer: local.to_owned(),
                },
            );
        }
        debug!(peer = %local, "memory endpoint unbound");
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.local
    }

    fn connect(&self, peer: &str) -> ConnectionId {
        let mut state = self.network.state();
        let conn = ConnectionId(state.allocate());
        if !state.endpoints.contains_key(peer) || peer == self.local {
            trace!(peer = %peer, "dial target not bound");
            state.emit(
                &self.local,
                TransportEvent::Failed {
                    conn,
                    peer: peer.to_owned(),
                    error: TransportError::PeerUnavailable(peer.to_owned()),
                },
            );
            return conn;
        }

        state.links.insert(
            conn,
            Link {
                a: self.local.clone(),
                b: peer.to_owned(),
            },
        );
        state.emit(
            &self.local,
            TransportEvent::Opened {
                conn,
                peer: peer.to_owned(),
                direction: Direction::Outbound,
            },
        );
        state.emit(
            peer,
            TransportEvent::Opened {
                conn,
                peer: self.local.clone(),
                direction: Direction::Inbound,
            },
        );
        conn
    }

    fn send(&self, conn: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError> {
        let state = self.network.state();
        let peer = state
            .links
            .get(&conn)
            .and_then(|link| link.other(&self.local))
            .ok_or(TransportError::NotOpen(conn))?;
        let tx = state
            .endpoints
            .get(peer)
            .ok_or(TransportError::NotOpen(conn))?;
        tx.send(TransportEvent::Data {
            conn,
            peer: self.local.clone(),
            payload,
        })
        .map_err(|_| TransportError::NotOpen(conn))
    }

    fn close(&self, conn: ConnectionId) {
        let mut state = self.network.state();
        let Some(peer) = state
            .links
            .get(&conn)
            .and_then(|link| link.other(&self.local))
            .cloned()
        else {
            return;
        };
        state.links.remove(&conn);
        state.emit(
            &self.local,
            TransportEvent::Closed {
                conn,
                peer: peer.clone(),
            },
        );
        state.emit(
            &peer,
            TransportEvent::Closed {
                conn,
                peer: self.local.clone(),
            },
        );
    }

    fn call(&self, peer: &str, local: &MediaStream) -> CallId {
        let mut state = self.network.state();
        let call = CallId(state.allocate());
        if !state.endpoints.contains_key(peer) {
            state.emit(
                &self.local,
                TransportEvent::CallFailed {
                    call,
                    peer: peer.to_owned(),
                    error: TransportError::PeerUnavailable(peer.to_owned()),
                },
            );
            return call;
        }
        state.calls.insert(
            call,
            CallLeg {
                caller: self.local.clone(),
                callee: peer.to_owned(),
                caller_stream: local.id().to_owned(),
            },
        );
        state.emit(
            peer,
            TransportEvent::IncomingCall {
                call,
                peer: self.local.clone(),
            },
        );
        call
    }

    fn answer(&self, call: CallId, local: &MediaStream) -> Result<(), TransportError> {
        let state = self.network.state();
        let leg = state
            .calls
            .get(&call)
            .filter(|leg| leg.callee == self.local)
            .ok_or(TransportError::UnknownCall(call))?;
        state.emit(
            &leg.callee,
            TransportEvent::CallStream {
                call,
                peer: leg.caller.clone(),
                stream: RemoteStream {
                    peer: leg.caller.clone(),
                    stream_id: leg.caller_stream.clone(),
                },
            },
        );
        state.emit(
            &leg.caller,
            TransportEvent::CallStream {
                call,
                peer: leg.callee.clone(),
                stream: RemoteStream {
                    peer: leg.callee.clone(),
                    stream_id: local.id().to_owned(),
                },
            },
        );
        Ok(())
    }

    fn hang_up(&self, call: CallId) {
        let mut state = self.network.state();
        let Some(leg) = state.calls.remove(&call) else {
            return;
        };
        state.emit(
            &leg.caller,
            TransportEvent::CallClosed {
                call,
                peer: leg.callee.clone(),
            },
        );
        state.emit(
            &leg.callee,
            TransportEvent::CallClosed {
                call,
                peer: leg.caller.clone(),
            },
        );
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(&self.local);
    }
}
