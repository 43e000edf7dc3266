pub mod bootstrap;
pub mod config;
pub mod gossip;
pub mod media;
pub mod memory;
pub mod messaging;
pub mod presence;
pub mod registry;
pub mod session;
pub mod transport;
pub mod voice;
pub mod ws;

pub use config::{MeshConfig, SavedNodeConfig};
pub use media::{MediaDevices, MediaStream, RemoteStream, SyntheticMedia};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use session::{
    LocalProfile, MeshHandle, MeshSession, MeshSnapshot, SessionCommand, SessionUpdate,
    spawn_session,
};
pub use transport::{CallId, ConnectionId, Direction, Transport, TransportError, TransportEvent};
pub use ws::WsTransport;
