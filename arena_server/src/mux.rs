//! Message channel multiplexer.
//!
//! Drains every connected slot's channels into a single handler and builds
//! outbound messages through the transport's allocator.

use arena_shared::net::{Channel, GameMessage, MessageType};

use crate::transport::Transport;

pub struct Multiplexer<T> {
    transport: T,
}

impl<T: Transport> Multiplexer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Hands every queued inbound message to `handler`, slot by slot, the
    /// reliable channel before the unreliable one. Returns how many messages
    /// were dispatched.
    pub fn receive_and_dispatch<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, usize, GameMessage),
    {
        let mut dispatched = 0;
        for slot in 0..self.transport.max_clients() {
            if !self.transport.is_client_connected(slot) {
                continue;
            }
            for channel in Channel::ALL {
                while let Some(msg) = self.transport.receive_message(slot, channel) {
                    handler(self, slot, msg);
                    dispatched += 1;
                }
            }
        }
        dispatched
    }

    /// Allocates a `kind` message for `slot`, lets `build` fill it in and
    /// queues it on `channel`.
    pub fn send<F>(&mut self, slot: usize, channel: Channel, kind: MessageType, build: F)
    where
        F: FnOnce(&mut GameMessage),
    {
        let mut msg = self.transport.create_message(slot, kind);
        build(&mut msg);
        debug_assert_eq!(msg.kind(), kind, "builder changed the message kind");
        self.transport.send_message(slot, channel, msg);
    }

    pub fn connected_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.transport.max_clients())
            .filter(move |&slot| self.transport.is_client_connected(slot))
    }

    pub fn for_each_connected_slot<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Self, usize),
    {
        for slot in 0..self.transport.max_clients() {
            if self.transport.is_client_connected(slot) {
                f(self, slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[test]
    fn dispatch_visits_reliable_before_unreliable() {
        let mut transport = LoopbackTransport::new(3);
        transport.connect();
        transport.connect();
        transport.push_inbound(1, Channel::UnreliableUnordered, GameMessage::Test(3));
        transport.push_inbound(0, Channel::UnreliableUnordered, GameMessage::Test(2));
        transport.push_inbound(1, Channel::ReliableOrdered, GameMessage::Test(4));
        transport.push_inbound(0, Channel::ReliableOrdered, GameMessage::Test(1));
        transport.receive_packets();

        let mut mux = Multiplexer::new(transport);
        let mut seen = Vec::new();
        let n = mux.receive_and_dispatch(|_, slot, msg| seen.push((slot, msg)));

        assert_eq!(n, 4);
        assert_eq!(
            seen,
            vec![
                (0, GameMessage::Test(1)),
                (0, GameMessage::Test(2)),
                (1, GameMessage::Test(4)),
                (1, GameMessage::Test(3)),
            ]
        );
        assert_eq!(mux.receive_and_dispatch(|_, _, _| {}), 0);
    }

    #[test]
    fn handler_can_reply_through_the_multiplexer() {
        let mut transport = LoopbackTransport::new(1);
        transport.connect();
        transport.push_inbound(0, Channel::ReliableOrdered, GameMessage::Test(9));
        transport.receive_packets();

        let mut mux = Multiplexer::new(transport);
        mux.receive_and_dispatch(|mux, slot, msg| {
            if let GameMessage::Test(n) = msg {
                mux.send(slot, Channel::ReliableOrdered, MessageType::Test, |m| {
                    *m = GameMessage::Test(n * 2)
                });
            }
        });
        mux.transport_mut().send_packets();
        assert_eq!(
            mux.transport_mut().take_sent(0),
            vec![(Channel::ReliableOrdered, GameMessage::Test(18))]
        );
    }

    #[test]
    fn connected_slots_skips_free_slots() {
        let mut transport = LoopbackTransport::new(4);
        transport.connect();
        transport.connect();
        transport.connect();
        transport.receive_packets();
        transport.disconnect(1);

        let mut mux = Multiplexer::new(transport);
        assert_eq!(mux.connected_slots().collect::<Vec<_>>(), vec![0, 2]);

        let mut visited = Vec::new();
        mux.for_each_connected_slot(|_, slot| visited.push(slot));
        assert_eq!(visited, vec![0, 2]);
    }
}
