//! Transport contract.
//!
//! The synchronization core only needs non-blocking polls: queue messages
//! per slot and channel, flush them once per tick, drain whatever arrived.
//! Reliability and ordering of channel 0 and connection liveness belong to
//! the transport implementation.

use std::net::SocketAddr;

use arena_shared::net::{Channel, GameMessage, MessageType};

pub mod loopback;
pub mod socket;

pub use loopback::LoopbackTransport;
pub use socket::SocketTransport;

/// Connection state change reported by [`Transport::receive_packets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    Connected(usize),
    Disconnected(usize),
}

pub trait Transport: Send {
    /// False once the transport can no longer serve clients.
    fn is_running(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn max_clients(&self) -> usize;

    /// Informs the transport of the current virtual time, in seconds.
    fn advance_time(&mut self, time: f64);

    /// Pulls everything that arrived since the last call into per-slot
    /// queues and reports connection changes, in the order they happened.
    fn receive_packets(&mut self) -> Vec<SlotEvent>;

    /// Flushes every queued outbound message.
    fn send_packets(&mut self);

    fn is_client_connected(&self, slot: usize) -> bool;

    /// Allocates a message of `kind` for `slot` with a default payload.
    fn create_message(&mut self, _slot: usize, kind: MessageType) -> GameMessage {
        GameMessage::new(kind)
    }

    /// Queues `msg` for `slot`. Dropped when the slot is not connected.
    fn send_message(&mut self, slot: usize, channel: Channel, msg: GameMessage);

    /// Next inbound message for `slot` on `channel`, if any. The caller owns
    /// the message; dropping it releases it.
    fn receive_message(&mut self, slot: usize, channel: Channel) -> Option<GameMessage>;

    /// Disconnects every slot and releases network resources.
    fn stop(&mut self);
}
