//! `arena_server`
//!
//! Server-side systems:
//! - Physics scene behind a single mutex (rapier backend)
//! - Message multiplexer over a pluggable transport
//! - Fixed-rate synchronization core broadcasting snapshots
//!
//! Networking model:
//! - TCP: handshake plus the reliable-ordered channel
//! - UDP: the unreliable-unordered channel (snapshots, echoes, poses)

pub mod clock;
pub mod codec;
pub mod error;
pub mod mux;
pub mod physics;
pub mod scene;
pub mod server;
pub mod transport;

pub use error::{SceneError, ServerError, TransportError};
pub use server::GameServer;
