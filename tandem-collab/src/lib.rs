//! # tandem-collab — Realtime sync transport for tandem documents
//!
//! Keeps a local Document converged with a relay server and with other
//! transports of the same room in this process.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐    WebSocket     ┌─────────────┐
//! │ SyncTransport │ ◄──────────────► │ Relay       │
//! │ (per room)    │  varuint frames  │ (server)    │
//! └──────┬────────┘                  └─────────────┘
//!        │ update hook / apply_diff
//!        ▼
//! ┌───────────────┐                  ┌──────────────┐
//! │ Document      │                  │ LocalHub     │
//! │ (tandem-core) │                  │ (fallback    │
//! └───────────────┘                  │  fan-out)    │
//!                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — varuint framing and the seven message types
//! - [`event`] — CBOR application events
//! - [`awareness`] — presence states with clocks and expiry
//! - [`state`] — connection state machine and backoff
//! - [`subscription`] — event type subscriptions and callbacks
//! - [`broadcast`] — in-process fallback channel
//! - [`socket`] — socket abstraction and the WebSocket connector
//! - [`config`] — transport options and URL building
//! - [`transport`] — the `SyncTransport` handle and its actor
//! - [`storage`] — RocksDB backend for the capture log

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod event;
pub mod protocol;
pub mod socket;
pub mod state;
pub mod storage;
pub mod subscription;
pub mod transport;

pub use awareness::{Awareness, AwarenessChange, ClientId};
pub use broadcast::{BroadcastGroup, BroadcastStats, LocalFrame, LocalHub};
pub use config::TransportConfig;
pub use event::EventMessage;
pub use protocol::{Decoder, Encoder, Message, MessageType, ProtocolError, SyncMessage};
pub use socket::{Connector, Socket, SocketPeer, TransportError, WebSocketConnector};
pub use state::{backoff_delay, ConnectionState, ConnectionStateMachine, ConnectionStatus, Intent};
pub use storage::{LogMetadata, RocksOpStore, StoreConfig};
pub use subscription::{CallbackId, EventCallback, EventSubscriptionRegistry};
pub use transport::{SyncTransport, SyncTransportBuilder, TransportEvent};
