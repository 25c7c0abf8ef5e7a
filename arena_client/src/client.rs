//! Client implementation.
//!
//! The client maintains:
//! - A reliable stream (handshake, connect-ack, scores, test replies)
//! - An unreliable datagram socket (poses out; snapshots and echoes in)
//! - The latest view of the world as reported by the server

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use arena_shared::{
    config::ClientConfig,
    net::{
        read_frame, write_frame, GameMessage, Handshake, NetTransform, NetVec3, PlayerPose,
        RigidbodyState, SweepForceInput, TransformData, UnreliableConn, PROTOCOL_VERSION,
    },
};
use thiserror::Error;
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

/// How long to wait for the server's connect-ack.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("server refused connection: {0}")]
    Denied(String),
    #[error("no connect-ack within {0:?}")]
    Timeout(Duration),
    #[error("server closed the connection during the handshake")]
    Closed,
}

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    /// The reliable stream ended.
    Disconnected,
}

/// Everything the server has told this client so far. Snapshots overwrite
/// older ones by id.
#[derive(Debug, Default, Clone)]
pub struct WorldView {
    pub scores: Option<(i32, i32)>,
    pub score_updates: usize,
    pub bodies: HashMap<i32, RigidbodyState>,
    pub players: HashMap<i32, PlayerPose>,
    pub echoes: Vec<TransformData>,
    pub test_replies: Vec<i32>,
}

impl WorldView {
    fn apply(&mut self, msg: GameMessage) {
        match msg {
            GameMessage::Test(n) => self.test_replies.push(n),
            GameMessage::TransformInfo(data) => self.echoes.push(data),
            GameMessage::RigidbodyInfo(state) => {
                self.bodies.insert(state.id, state);
            }
            GameMessage::PlayerUpdate(pose) => {
                self.players.insert(pose.id, pose);
            }
            GameMessage::UpdateScore { p1, p2 } => {
                self.scores = Some((p1, p2));
                self.score_updates += 1;
            }
            GameMessage::ClientConnected(slot) => debug!(slot, "Repeated connect-ack"),
            GameMessage::SweepForceInput(_) => debug!("Ignoring client-bound sweep"),
        }
    }
}

/// High-level game client.
pub struct GameClient {
    pub slot: i32,
    pub state: ClientState,
    pub world: WorldView,

    writer: OwnedWriteHalf,
    reliable_rx: mpsc::UnboundedReceiver<GameMessage>,
    reader: JoinHandle<()>,
    pub unreliable: UnreliableConn,
}

impl GameClient {
    /// Connects, performs the handshake and waits for the connect-ack.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let bind_ip = if server_addr.ip().is_loopback() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let unreliable = UnreliableConn::connect(SocketAddr::new(bind_ip, 0), server_addr).await?;
        let udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let mut stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        stream.set_nodelay(true).context("set_nodelay")?;
        let hello = Handshake::Hello {
            protocol: PROTOCOL_VERSION,
            udp_port,
        };
        write_frame(&mut stream, &hello.to_bytes())
            .await
            .context("send hello")?;

        let ack = time::timeout(CONNECT_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| ConnectError::Timeout(CONNECT_TIMEOUT))?
            .context("read connect-ack")?
            .ok_or(ConnectError::Closed)?;
        let slot = match GameMessage::decode(&ack).context("decode connect-ack")? {
            Some(GameMessage::ClientConnected(slot)) => slot,
            Some(other) => anyhow::bail!("expected connect-ack, got {other:?}"),
            None => match Handshake::decode(&ack).context("decode handshake")? {
                Handshake::Denied { reason } => return Err(ConnectError::Denied(reason).into()),
                other => anyhow::bail!("unexpected handshake {other:?}"),
            },
        };
        info!(slot, udp_port, "Connected to server");

        let (mut read_half, writer) = stream.into_split();
        let (tx, reliable_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => match GameMessage::decode(&frame) {
                        Ok(Some(msg)) => {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Ok(None) => debug!("Skipping reliable message with unknown tag"),
                        Err(e) => warn!(error = %e, "Dropping malformed reliable message"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Reliable connection error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            slot,
            state: ClientState::Connected,
            world: WorldView::default(),
            writer,
            reliable_rx,
            reader,
            unreliable,
        })
    }

    /// Drains everything that has arrived on both channels. Returns the
    /// number of messages applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.reliable_rx.try_recv() {
                Ok(msg) => {
                    self.world.apply(msg);
                    applied += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if self.state != ClientState::Disconnected {
                        info!(slot = self.slot, "Disconnected from server");
                        self.state = ClientState::Disconnected;
                    }
                    break;
                }
            }
        }
        loop {
            match self.unreliable.try_recv() {
                Ok(Some(msg)) => {
                    self.world.apply(msg);
                    applied += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Dropping datagram");
                    break;
                }
            }
        }
        applied
    }

    /// Polls until `done` holds or `timeout` elapses. Returns whether `done`
    /// was reached.
    pub async fn poll_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&WorldView) -> bool,
    {
        let deadline = time::Instant::now() + timeout;
        loop {
            self.poll();
            if done(&self.world) {
                return true;
            }
            if time::Instant::now() >= deadline || self.state == ClientState::Disconnected {
                return false;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn send_reliable(&mut self, msg: &GameMessage) -> anyhow::Result<()> {
        write_frame(&mut self.writer, &msg.to_bytes())
            .await
            .context("reliable send")?;
        Ok(())
    }

    /// Sends `Test(n)`; the server answers `Test(n + 1)` reliably.
    pub async fn send_test(&mut self, n: i32) -> anyhow::Result<()> {
        self.send_reliable(&GameMessage::Test(n)).await
    }

    /// Sends a transform for the server to echo back unreliably.
    pub async fn send_transform(&self, data: TransformData) -> anyhow::Result<()> {
        self.unreliable.send(&GameMessage::TransformInfo(data)).await
    }

    pub async fn send_player_update(
        &self,
        head: NetTransform,
        left_hand: NetTransform,
        right_hand: NetTransform,
    ) -> anyhow::Result<()> {
        let pose = PlayerPose {
            id: self.slot,
            head,
            left_hand,
            right_hand,
        };
        self.unreliable.send(&GameMessage::PlayerUpdate(pose)).await
    }

    /// Requests a sweep push. `distance == 0.0` lets the server pick its default.
    pub async fn send_sweep(
        &mut self,
        direction: NetVec3,
        position: NetVec3,
        radius: f32,
        distance: f32,
    ) -> anyhow::Result<()> {
        let input = SweepForceInput {
            direction,
            position,
            radius,
            distance,
        };
        self.send_reliable(&GameMessage::SweepForceInput(input)).await
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use arena_shared::net::NetQuat;

    use super::*;

    #[test]
    fn world_view_keeps_latest_snapshot_per_id() {
        let mut world = WorldView::default();
        let body = |x: f32| RigidbodyState {
            id: 4,
            transform: NetTransform {
                position: NetVec3::new(x, 0.0, 0.0),
                orientation: NetQuat::IDENTITY,
            },
            ..Default::default()
        };
        world.apply(GameMessage::RigidbodyInfo(body(1.0)));
        world.apply(GameMessage::RigidbodyInfo(body(2.0)));
        world.apply(GameMessage::UpdateScore { p1: 1, p2: 0 });
        world.apply(GameMessage::UpdateScore { p1: 1, p2: 1 });
        world.apply(GameMessage::Test(8));

        assert_eq!(world.bodies.len(), 1);
        assert_eq!(world.bodies[&4].transform.position.x, 2.0);
        assert_eq!(world.scores, Some((1, 1)));
        assert_eq!(world.score_updates, 2);
        assert_eq!(world.test_replies, vec![8]);
    }
}
