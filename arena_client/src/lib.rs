//! `arena_client`
//!
//! Client-side systems:
//! - Handshake and connect-ack (reliable stream)
//! - Pose, echo and sweep requests
//! - Collection of rigidbody, player and score updates

pub mod client;

pub use client::{ClientState, ConnectError, GameClient, WorldView};
