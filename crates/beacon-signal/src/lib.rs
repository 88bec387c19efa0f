//! Beacon Signal Server
//!
//! Rendezvous and relay service for peer-to-peer clients. Peers connect via
//! WebSocket, receive a server-assigned id, and exchange signaling payloads
//! through the server until they can talk to each other directly.
//!
//! # Protocol
//!
//! 1. Client connects and receives `WELCOME` with its peer id
//! 2. Existing peers receive `NEW_PEER`
//! 3. Client sends `IDENTIFY` to attach an alias; others receive `PEER_JOINED`
//! 4. Offers, answers and candidates are relayed to the peer named in `to`
//! 5. Clients send `HEARTBEAT` to stay registered; silent peers are evicted
//! 6. Remaining peers receive `PEER_LEFT` when a peer goes away

pub mod credentials;
pub mod http;
pub mod messages;
pub mod registry;
pub mod router;
pub mod server;
pub mod sweeper;

pub use credentials::{CredentialError, CredentialStore};
pub use http::HttpState;
pub use messages::{InboundEvent, PeerSummary, ServerMessage};
pub use registry::{PeerSnapshot, PeerState, Registry, RelayAddr};
pub use server::{Gateway, SignalServer};
pub use sweeper::{IdleSweeper, PeerCloser};
