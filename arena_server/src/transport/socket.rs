//! Socket transport.
//!
//! Networking model:
//! - TCP: handshake plus the reliable-ordered channel (length-prefixed frames)
//! - UDP: the unreliable-unordered channel, one message per datagram, on the
//!   same port as the listener
//!
//! Socket I/O happens on background tasks (accept, one reader and one writer
//! per connection). The tick loop only touches channels and the UDP socket
//! through non-blocking calls.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    time::Duration,
};

use arena_shared::net::{
    frame_bytes, read_frame, write_frame, Channel, GameMessage, Handshake, WireError,
    MAX_DATAGRAM_LEN, PROTOCOL_VERSION,
};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use super::{SlotEvent, Transport};
use crate::error::TransportError;

/// How long a new TCP connection may take to send its `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum LinkEvent {
    Handshake {
        stream: TcpStream,
        peer: SocketAddr,
        udp_port: u16,
    },
    Message {
        slot: usize,
        generation: u64,
        msg: GameMessage,
    },
    Closed {
        slot: usize,
        generation: u64,
    },
    ListenerFailed,
}

struct Connection {
    /// Distinguishes this connection from earlier occupants of the same slot.
    generation: u64,
    udp_peer: SocketAddr,
    reliable_tx: mpsc::UnboundedSender<Bytes>,
    inbound: [VecDeque<GameMessage>; Channel::COUNT],
    outbound: [Vec<GameMessage>; Channel::COUNT],
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct SocketTransport {
    local_addr: SocketAddr,
    udp: UdpSocket,
    slots: Vec<Option<Connection>>,
    peers: HashMap<SocketAddr, usize>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    accept_task: Option<JoinHandle<()>>,
    running: bool,
    time: f64,
}

impl SocketTransport {
    /// Binds the listener and the UDP socket and starts accepting clients.
    pub async fn start(addr: &str, max_clients: usize) -> Result<Self, TransportError> {
        let requested: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::Address(addr.to_string()))?;
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| TransportError::Bind {
                port: requested.port(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                port: requested.port(),
                source,
            })?;
        let udp = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| TransportError::Bind {
                port: local_addr.port(),
                source,
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, events_tx.clone()));
        info!(%local_addr, max_clients, "Transport listening");

        Ok(Self {
            local_addr,
            udp,
            slots: (0..max_clients).map(|_| None).collect(),
            peers: HashMap::new(),
            next_generation: 0,
            events_tx,
            events_rx,
            accept_task: Some(accept_task),
            running: true,
            time: 0.0,
        })
    }

    /// Virtual time last reported by the tick loop.
    pub fn time(&self) -> f64 {
        self.time
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, udp_port: u16) -> Option<usize> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            info!(%peer, "Refusing connection: server full");
            tokio::spawn(async move {
                let mut stream = stream;
                deny(&mut stream, "server full").await;
            });
            return None;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Could not disable Nagle");
        }
        let udp_peer = SocketAddr::new(peer.ip(), udp_port);
        self.next_generation += 1;
        let generation = self.next_generation;

        let (read_half, write_half) = stream.into_split();
        let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            read_half,
            slot,
            generation,
            self.events_tx.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            reliable_rx,
            slot,
            generation,
            self.events_tx.clone(),
        ));

        self.peers.insert(udp_peer, slot);
        self.slots[slot] = Some(Connection {
            generation,
            udp_peer,
            reliable_tx,
            inbound: Default::default(),
            outbound: Default::default(),
            reader,
            writer,
        });
        info!(slot, %peer, %udp_peer, "Transport admitted client");
        Some(slot)
    }

    fn connection_mut(&mut self, slot: usize, generation: u64) -> Option<&mut Connection> {
        self.slots
            .get_mut(slot)?
            .as_mut()
            .filter(|c| c.generation == generation)
    }

    fn drop_connection(&mut self, slot: usize) {
        if let Some(conn) = self.slots.get_mut(slot).and_then(Option::take) {
            self.peers.remove(&conn.udp_peer);
            debug!(slot, "Transport released slot");
        }
    }

    fn receive_datagrams(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    let Some(&slot) = self.peers.get(&from) else {
                        debug!(%from, "Datagram from unknown peer");
                        continue;
                    };
                    match GameMessage::decode(&buf[..n]) {
                        Ok(Some(msg)) => {
                            if let Some(conn) = self.slots[slot].as_mut() {
                                conn.inbound[Channel::UnreliableUnordered.index()].push_back(msg);
                            }
                        }
                        Ok(None) => debug!(slot, "Skipping datagram with unknown tag"),
                        Err(e) => debug!(slot, error = %e, "Dropping malformed datagram"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
    }
}

impl Transport for SocketTransport {
    fn is_running(&self) -> bool {
        self.running
            && self
                .accept_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn max_clients(&self) -> usize {
        self.slots.len()
    }

    fn advance_time(&mut self, time: f64) {
        self.time = time;
    }

    fn receive_packets(&mut self) -> Vec<SlotEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                LinkEvent::Handshake {
                    stream,
                    peer,
                    udp_port,
                } => {
                    if !self.running {
                        continue;
                    }
                    if let Some(slot) = self.admit(stream, peer, udp_port) {
                        events.push(SlotEvent::Connected(slot));
                    }
                }
                LinkEvent::Message {
                    slot,
                    generation,
                    msg,
                } => {
                    if let Some(conn) = self.connection_mut(slot, generation) {
                        conn.inbound[Channel::ReliableOrdered.index()].push_back(msg);
                    }
                }
                LinkEvent::Closed { slot, generation } => {
                    if self.connection_mut(slot, generation).is_some() {
                        self.drop_connection(slot);
                        events.push(SlotEvent::Disconnected(slot));
                    }
                }
                LinkEvent::ListenerFailed => self.running = false,
            }
        }
        self.receive_datagrams();
        events
    }

    fn send_packets(&mut self) {
        let mut datagram = BytesMut::with_capacity(MAX_DATAGRAM_LEN);
        for (slot, conn) in self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, c)| c.as_mut().map(|c| (i, c)))
        {
            for msg in conn.outbound[Channel::ReliableOrdered.index()].drain(..) {
                match frame_bytes(&msg.to_bytes()) {
                    // a closed writer is reported through its Closed event
                    Ok(frame) => {
                        let _ = conn.reliable_tx.send(frame);
                    }
                    Err(e) => warn!(slot, error = %e, "Could not frame message"),
                }
            }
            for msg in conn.outbound[Channel::UnreliableUnordered.index()].drain(..) {
                datagram.clear();
                msg.encode(&mut datagram);
                match self.udp.try_send_to(&datagram, conn.udp_peer) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        debug!(slot, "UDP send buffer full, dropping datagram");
                    }
                    Err(e) => debug!(slot, error = %e, "UDP send failed"),
                }
            }
        }
    }

    fn is_client_connected(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(Option::is_some)
    }

    fn send_message(&mut self, slot: usize, channel: Channel, msg: GameMessage) {
        if let Some(conn) = self.slots.get_mut(slot).and_then(Option::as_mut) {
            conn.outbound[channel.index()].push(msg);
        }
    }

    fn receive_message(&mut self, slot: usize, channel: Channel) -> Option<GameMessage> {
        self.slots
            .get_mut(slot)?
            .as_mut()?
            .inbound[channel.index()]
            .pop_front()
    }

    fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for slot in 0..self.slots.len() {
            self.drop_connection(slot);
        }
        self.running = false;
        info!(local_addr = %self.local_addr, "Transport stopped");
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<LinkEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    match time::timeout(HANDSHAKE_TIMEOUT, read_hello(stream)).await {
                        Ok(Ok(Some((stream, udp_port)))) => {
                            let _ = events.send(LinkEvent::Handshake {
                                stream,
                                peer,
                                udp_port,
                            });
                        }
                        Ok(Ok(None)) => debug!(%peer, "Connection closed during handshake"),
                        Ok(Err(e)) => debug!(%peer, error = %e, "Handshake failed"),
                        Err(_) => debug!(%peer, "Handshake timed out"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Listener failed");
                let _ = events.send(LinkEvent::ListenerFailed);
                return;
            }
        }
    }
}

async fn read_hello(mut stream: TcpStream) -> Result<Option<(TcpStream, u16)>, WireError> {
    let Some(frame) = read_frame(&mut stream).await? else {
        return Ok(None);
    };
    match Handshake::decode(&frame)? {
        Handshake::Hello { protocol, udp_port } if protocol == PROTOCOL_VERSION => {
            Ok(Some((stream, udp_port)))
        }
        Handshake::Hello { protocol, .. } => {
            deny(&mut stream, &format!("unsupported protocol {protocol}")).await;
            Ok(None)
        }
        Handshake::Denied { .. } => Err(WireError::Handshake("client sent a denial")),
    }
}

async fn deny(stream: &mut TcpStream, reason: &str) {
    let denied = Handshake::Denied {
        reason: reason.to_string(),
    };
    if write_frame(stream, &denied.to_bytes()).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    slot: usize,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match GameMessage::decode(&frame) {
                Ok(Some(msg)) => {
                    if events
                        .send(LinkEvent::Message {
                            slot,
                            generation,
                            msg,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => debug!(slot, "Skipping message with unknown tag"),
                Err(e) => debug!(slot, error = %e, "Dropping malformed message"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(slot, error = %e, "Reliable stream failed");
                break;
            }
        }
    }
    let _ = events.send(LinkEvent::Closed { slot, generation });
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    slot: usize,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(slot, error = %e, "Reliable write failed");
            let _ = events.send(LinkEvent::Closed { slot, generation });
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    async fn poll_events(transport: &mut SocketTransport, want: usize) -> Vec<SlotEvent> {
        let mut events = Vec::new();
        for _ in 0..200 {
            events.extend(transport.receive_packets());
            if events.len() >= want {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        events
    }

    async fn hello(server: SocketAddr, udp: &UdpSocket) -> TcpStream {
        let mut stream = TcpStream::connect(server).await.unwrap();
        let hello = Handshake::Hello {
            protocol: PROTOCOL_VERSION,
            udp_port: udp.local_addr().unwrap().port(),
        };
        write_frame(&mut stream, &hello.to_bytes()).await.unwrap();
        stream
    }

    async fn client_udp() -> UdpSocket {
        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_admits_and_routes_both_channels() {
        let mut transport = SocketTransport::start("127.0.0.1:0", 2).await.unwrap();
        let server = transport.local_addr().unwrap();
        let udp = client_udp().await;
        let mut stream = hello(server, &udp).await;

        assert_eq!(
            poll_events(&mut transport, 1).await,
            vec![SlotEvent::Connected(0)]
        );
        assert!(transport.is_client_connected(0));

        // unreliable inbound
        udp.send_to(&GameMessage::Test(5).to_bytes(), server)
            .await
            .unwrap();
        // reliable inbound
        write_frame(&mut stream, &GameMessage::Test(6).to_bytes())
            .await
            .unwrap();

        let mut got = Vec::new();
        for _ in 0..200 {
            transport.receive_packets();
            for channel in Channel::ALL {
                while let Some(msg) = transport.receive_message(0, channel) {
                    got.push((channel, msg));
                }
            }
            if got.len() == 2 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        got.sort_by_key(|(c, _)| c.index());
        assert_eq!(
            got,
            vec![
                (Channel::ReliableOrdered, GameMessage::Test(6)),
                (Channel::UnreliableUnordered, GameMessage::Test(5)),
            ]
        );

        // outbound on both channels
        transport.send_message(0, Channel::ReliableOrdered, GameMessage::ClientConnected(0));
        transport.send_message(
            0,
            Channel::UnreliableUnordered,
            GameMessage::UpdateScore { p1: 1, p2: 2 },
        );
        transport.send_packets();

        let frame = time::timeout(Duration::from_secs(2), read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            GameMessage::decode(&frame).unwrap(),
            Some(GameMessage::ClientConnected(0))
        );
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let n = time::timeout(Duration::from_secs(2), udp.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            GameMessage::decode(&buf[..n]).unwrap(),
            Some(GameMessage::UpdateScore { p1: 1, p2: 2 })
        );
        transport.stop();
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn full_server_denies_and_disconnect_frees_slot() {
        let mut transport = SocketTransport::start("127.0.0.1:0", 1).await.unwrap();
        let server = transport.local_addr().unwrap();

        let udp_a = client_udp().await;
        let stream_a = hello(server, &udp_a).await;
        assert_eq!(
            poll_events(&mut transport, 1).await,
            vec![SlotEvent::Connected(0)]
        );

        let udp_b = client_udp().await;
        let mut stream_b = hello(server, &udp_b).await;
        let mut denied = None;
        for _ in 0..200 {
            transport.receive_packets();
            if let Ok(frame) = time::timeout(Duration::from_millis(5), read_frame(&mut stream_b)).await {
                denied = frame.unwrap();
                break;
            }
        }
        let denied = Handshake::decode(&denied.expect("denial frame")).unwrap();
        assert_eq!(
            denied,
            Handshake::Denied {
                reason: "server full".into()
            }
        );

        drop(stream_a);
        assert_eq!(
            poll_events(&mut transport, 1).await,
            vec![SlotEvent::Disconnected(0)]
        );
        assert!(!transport.is_client_connected(0));
    }

    #[tokio::test]
    async fn bind_failure_reports_port() {
        let first = SocketTransport::start("127.0.0.1:0", 1).await.unwrap();
        let taken = first.local_addr().unwrap();
        let err = SocketTransport::start(&taken.to_string(), 1)
            .await
            .err()
            .expect("second bind must fail");
        match err {
            TransportError::Bind { port, .. } => assert_eq!(port, taken.port()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            SocketTransport::start("not an address", 1).await,
            Err(TransportError::Address(_))
        ));
    }
}
