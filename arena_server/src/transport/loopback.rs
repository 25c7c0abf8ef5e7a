//! In-process transport.
//!
//! Messages never leave the process: tests and tools push inbound messages
//! directly into a slot's queues and read back what the server flushed.

use std::{collections::VecDeque, net::SocketAddr};

use arena_shared::net::{Channel, GameMessage};

use super::{SlotEvent, Transport};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    #[default]
    Free,
    /// Occupied, not yet reported by `receive_packets`.
    Pending,
    Connected,
}

#[derive(Debug, Default)]
struct LoopbackSlot {
    status: SlotStatus,
    inbound: [VecDeque<GameMessage>; Channel::COUNT],
    outbound: Vec<(Channel, GameMessage)>,
    sent: Vec<(Channel, GameMessage)>,
}

#[derive(Debug)]
pub struct LoopbackTransport {
    running: bool,
    time: f64,
    slots: Vec<LoopbackSlot>,
    events: Vec<SlotEvent>,
    flushes: u64,
}

impl LoopbackTransport {
    pub fn new(max_clients: usize) -> Self {
        Self {
            running: true,
            time: 0.0,
            slots: (0..max_clients).map(|_| LoopbackSlot::default()).collect(),
            events: Vec::new(),
            flushes: 0,
        }
    }

    /// Occupies the first free slot. The slot counts as connected once the
    /// next `receive_packets` reports it.
    pub fn connect(&mut self) -> Option<usize> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.status == SlotStatus::Free)?;
        self.slots[slot].status = SlotStatus::Pending;
        self.events.push(SlotEvent::Connected(slot));
        Some(slot)
    }

    pub fn disconnect(&mut self, slot: usize) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        match s.status {
            SlotStatus::Free => {}
            SlotStatus::Pending => {
                *s = LoopbackSlot::default();
                self.events.retain(|e| *e != SlotEvent::Connected(slot));
            }
            SlotStatus::Connected => {
                *s = LoopbackSlot::default();
                self.events.push(SlotEvent::Disconnected(slot));
            }
        }
    }

    /// Queues an inbound message as if `slot`'s client had sent it.
    pub fn push_inbound(&mut self, slot: usize, channel: Channel, msg: GameMessage) {
        if let Some(s) = self
            .slots
            .get_mut(slot)
            .filter(|s| s.status != SlotStatus::Free)
        {
            s.inbound[channel.index()].push_back(msg);
        }
    }

    /// Messages flushed to `slot` since the last call, in send order.
    pub fn take_sent(&mut self, slot: usize) -> Vec<(Channel, GameMessage)> {
        self.slots
            .get_mut(slot)
            .map(|s| std::mem::take(&mut s.sent))
            .unwrap_or_default()
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of `send_packets` calls so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

impl Transport for LoopbackTransport {
    fn is_running(&self) -> bool {
        self.running
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn max_clients(&self) -> usize {
        self.slots.len()
    }

    fn advance_time(&mut self, time: f64) {
        self.time = time;
    }

    fn receive_packets(&mut self) -> Vec<SlotEvent> {
        let events = std::mem::take(&mut self.events);
        for event in &events {
            if let SlotEvent::Connected(slot) = *event {
                self.slots[slot].status = SlotStatus::Connected;
            }
        }
        events
    }

    fn send_packets(&mut self) {
        self.flushes += 1;
        for slot in &mut self.slots {
            let queued = std::mem::take(&mut slot.outbound);
            slot.sent.extend(queued);
        }
    }

    fn is_client_connected(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.status == SlotStatus::Connected)
    }

    fn send_message(&mut self, slot: usize, channel: Channel, msg: GameMessage) {
        if let Some(s) = self
            .slots
            .get_mut(slot)
            .filter(|s| s.status == SlotStatus::Connected)
        {
            s.outbound.push((channel, msg));
        }
    }

    fn receive_message(&mut self, slot: usize, channel: Channel) -> Option<GameMessage> {
        self.slots
            .get_mut(slot)?
            .inbound[channel.index()]
            .pop_front()
    }

    fn stop(&mut self) {
        self.running = false;
        for slot in &mut self.slots {
            slot.status = SlotStatus::Free;
            slot.inbound.iter_mut().for_each(VecDeque::clear);
            slot.outbound.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_held_until_flushed() {
        let mut t = LoopbackTransport::new(2);
        let slot = t.connect().unwrap();
        assert_eq!(t.receive_packets(), vec![SlotEvent::Connected(slot)]);

        t.send_message(slot, Channel::ReliableOrdered, GameMessage::Test(1));
        assert!(t.take_sent(slot).is_empty());
        t.send_packets();
        assert_eq!(
            t.take_sent(slot),
            vec![(Channel::ReliableOrdered, GameMessage::Test(1))]
        );
    }

    #[test]
    fn full_transport_refuses_connections() {
        let mut t = LoopbackTransport::new(1);
        assert_eq!(t.connect(), Some(0));
        assert!(!t.is_client_connected(0));
        assert_eq!(t.connect(), None);
        assert_eq!(t.receive_packets(), vec![SlotEvent::Connected(0)]);
        assert!(t.is_client_connected(0));

        t.disconnect(0);
        assert!(!t.is_client_connected(0));
        assert_eq!(t.connect(), Some(0));
        // never reported, so no disconnect either
        t.disconnect(0);
        assert_eq!(t.receive_packets(), vec![SlotEvent::Disconnected(0)]);
    }

    #[test]
    fn disconnected_slots_drop_traffic() {
        let mut t = LoopbackTransport::new(1);
        t.push_inbound(0, Channel::ReliableOrdered, GameMessage::Test(3));
        t.send_message(0, Channel::ReliableOrdered, GameMessage::Test(4));
        t.send_packets();
        assert!(t.receive_message(0, Channel::ReliableOrdered).is_none());
        assert!(t.take_sent(0).is_empty());
    }
}
