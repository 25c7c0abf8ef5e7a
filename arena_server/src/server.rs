//! Synchronization core.
//!
//! One authoritative tick, run at a fixed rate:
//! 1. transport liveness
//! 2. advance transport time
//! 3. receive packets, connect/disconnect hooks, dispatch inbound messages
//! 4. step the scene (tick mode) and broadcast score changes
//! 5. rigidbody snapshot to every connected slot
//! 6. player snapshots: every other connected slot, to every connected slot
//! 7. flush
//!
//! Inbound handlers and the physics step both go through the scene mutex;
//! snapshots are taken as one owned read and broadcast after the lock is
//! released.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};

use arena_shared::{
    config::{PhysicsMode, ServerConfig},
    net::{Channel, GameMessage, MessageType, PlayerPose, RigidbodyState},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Pacing, TickClock},
    codec,
    error::ServerError,
    mux::Multiplexer,
    physics::{PhysicsBackend, RapierBackend},
    scene::{SceneSnapshot, ScorePair, SharedScene, SimulationScene},
    transport::{SlotEvent, SocketTransport, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Created, scene not initialized.
    Idle,
    /// Accepting clients and ticking.
    Running,
    /// Shut down; the transport and the scene are released.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran { dispatched: usize },
    Stopped,
}

/// Cooperative stop signal for a running server.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }
}

pub struct GameServer<T: Transport> {
    cfg: ServerConfig,
    mux: Multiplexer<T>,
    scene: SharedScene,
    state: ServerState,
    ticks: u64,
    running: Arc<AtomicBool>,
    scores_tx: mpsc::UnboundedSender<ScorePair>,
    scores_rx: mpsc::UnboundedReceiver<ScorePair>,
    /// Last score pair queued to each slot.
    sent_scores: Vec<Option<ScorePair>>,
    physics_thread: Option<JoinHandle<()>>,
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer<SocketTransport> {
    /// Binds a socket transport at `cfg.server_addr` and builds a server on
    /// the rapier backend.
    pub async fn bind(cfg: ServerConfig) -> Result<Self, ServerError> {
        cfg.validate()?;
        let transport = SocketTransport::start(&cfg.server_addr, cfg.max_clients).await?;
        let backend = Box::new(RapierBackend::new(cfg.physics.clone()));
        Self::new(cfg, transport, backend)
    }
}

impl<T: Transport> GameServer<T> {
    pub fn new(
        cfg: ServerConfig,
        transport: T,
        backend: Box<dyn PhysicsBackend>,
    ) -> Result<Self, ServerError> {
        cfg.validate()?;
        if !transport.is_running() {
            let port = transport
                .local_addr()
                .or_else(|| cfg.server_addr.parse::<SocketAddr>().ok())
                .map_or(0, |addr| addr.port());
            error!(port, "Could not start server");
            return Err(ServerError::Startup { port });
        }

        let scene = SimulationScene::new(&cfg.physics, backend).into_shared();
        let (scores_tx, scores_rx) = mpsc::unbounded_channel();
        let sent_scores = vec![None; transport.max_clients()];
        Ok(Self {
            cfg,
            mux: Multiplexer::new(transport),
            scene,
            state: ServerState::Idle,
            ticks: 0,
            running: Arc::new(AtomicBool::new(true)),
            scores_tx,
            scores_rx,
            sent_scores,
            physics_thread: None,
            console_rx: None,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn scene(&self) -> &SharedScene {
        &self.scene
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.transport().local_addr()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.mux.transport_mut()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Initializes the scene and starts accepting traffic.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Idle {
            return Err(ServerError::InvalidState {
                action: "start",
                state: self.state,
            });
        }

        {
            let mut scene = self.scene.lock();
            scene.init_scene()?;
            let scores = self.scores_tx.clone();
            scene.set_score_hook(Box::new(move |pair| {
                // receiver lives as long as the server
                let _ = scores.send(pair);
            }));
        }

        if self.cfg.physics_mode == PhysicsMode::FreeRunning {
            self.physics_thread = Some(self.spawn_physics_thread()?);
        }
        self.state = ServerState::Running;
        info!(
            addr = ?self.local_addr(),
            tick_hz = self.cfg.tick_hz,
            max_clients = self.mux.transport().max_clients(),
            physics_mode = ?self.cfg.physics_mode,
            "Server started"
        );
        Ok(())
    }

    fn spawn_physics_thread(&self) -> Result<JoinHandle<()>, ServerError> {
        let scene = Arc::clone(&self.scene);
        let running = Arc::clone(&self.running);
        std::thread::Builder::new()
            .name("physics".into())
            .spawn(move || {
                // Unpaced: every step advances the world by `physics.dt`.
                let mut steps = 0u64;
                while running.load(Ordering::Acquire) {
                    if let Err(e) = scene.lock().update() {
                        warn!(error = %e, "Physics thread stopping");
                        break;
                    }
                    steps += 1;
                    // let the tick take the scene lock between steps
                    std::thread::yield_now();
                }
                debug!(steps, "Physics thread finished");
            })
            .map_err(ServerError::PhysicsThread)
    }

    fn virtual_time(&self) -> f64 {
        self.ticks as f64 * self.cfg.tick_interval().as_secs_f64()
    }

    /// Executes one network tick.
    pub fn tick(&mut self) -> Result<TickOutcome, ServerError> {
        match self.state {
            ServerState::Running => {}
            ServerState::Stopped => return Ok(TickOutcome::Stopped),
            ServerState::Idle => {
                return Err(ServerError::InvalidState {
                    action: "tick",
                    state: self.state,
                })
            }
        }

        if !self.mux.transport().is_running() {
            warn!("Transport is no longer running");
            self.shutdown();
            return Ok(TickOutcome::Stopped);
        }

        let now = self.virtual_time();
        self.mux.transport_mut().advance_time(now);

        // Changes made before this tick reach existing clients before any
        // connect-ack reads the current pair.
        self.broadcast_scores();
        for event in self.mux.transport_mut().receive_packets() {
            match event {
                SlotEvent::Connected(slot) => self.on_client_connected(slot),
                SlotEvent::Disconnected(slot) => {
                    info!(slot, "Client disconnected");
                    self.forget_scores(slot);
                }
            }
        }
        let scene = &self.scene;
        let dispatched = self
            .mux
            .receive_and_dispatch(|mux, slot, msg| handle_message(mux, scene, slot, msg));

        if self.cfg.physics_mode == PhysicsMode::Tick {
            self.scene.lock().update()?;
        }
        self.broadcast_scores();

        let snapshot = self.scene.lock().snapshot();
        self.broadcast_snapshot(&snapshot);

        self.mux.transport_mut().send_packets();
        self.ticks += 1;
        Ok(TickOutcome::Ran { dispatched })
    }

    fn on_client_connected(&mut self, slot: usize) {
        let scores = self.scene.lock().scores();
        info!(slot, p1 = scores.p1, p2 = scores.p2, "Client connected");
        self.mux.send(
            slot,
            Channel::ReliableOrdered,
            MessageType::ClientConnected,
            |m| *m = GameMessage::ClientConnected(slot as i32),
        );
        send_score(&mut self.mux, &mut self.sent_scores, slot, scores);
    }

    fn forget_scores(&mut self, slot: usize) {
        if let Some(sent) = self.sent_scores.get_mut(slot) {
            *sent = None;
        }
    }

    fn broadcast_scores(&mut self) {
        while let Ok(pair) = self.scores_rx.try_recv() {
            debug!(p1 = pair.p1, p2 = pair.p2, "Broadcasting score");
            let sent_scores = &mut self.sent_scores;
            self.mux.for_each_connected_slot(|mux, slot| {
                send_score(mux, sent_scores, slot, pair);
            });
        }
    }

    fn broadcast_snapshot(&mut self, snapshot: &SceneSnapshot) {
        let connected: Vec<usize> = self.mux.connected_slots().collect();
        for &slot in &connected {
            for actor in snapshot.actors.iter() {
                let state = RigidbodyState {
                    id: actor.id.0 as i32,
                    transform: codec::transform_from_engine(&actor.pose),
                    linear_velocity: codec::vec3_from_engine(&actor.linear_velocity),
                    angular_velocity: codec::vec3_from_engine(&actor.angular_velocity),
                };
                self.mux.send(
                    slot,
                    Channel::UnreliableUnordered,
                    MessageType::RigidbodyInfo,
                    |m| *m = GameMessage::RigidbodyInfo(state),
                );
            }

            for &other in connected.iter().filter(|&&other| other != slot) {
                let Some(player) = snapshot.players.get(other) else {
                    continue;
                };
                let pose = PlayerPose {
                    id: other as i32,
                    head: codec::transform_from_app(player.head),
                    left_hand: codec::transform_from_app(player.left_hand),
                    right_hand: codec::transform_from_app(player.right_hand),
                };
                self.mux.send(
                    slot,
                    Channel::UnreliableUnordered,
                    MessageType::PlayerUpdate,
                    |m| *m = GameMessage::PlayerUpdate(pose),
                );
            }
        }
    }

    /// Ticks at `tick_hz` until stopped, then shuts down.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        if self.state == ServerState::Idle {
            self.start()?;
        }
        let mut clock = TickClock::new(self.cfg.tick_interval(), Instant::now());

        while self.running.load(Ordering::Acquire) {
            self.process_console_commands();
            if let Pacing::Wait(wait) = clock.poll(Instant::now()) {
                tokio::time::sleep(wait).await;
                continue;
            }

            let started = Instant::now();
            match self.tick() {
                Ok(TickOutcome::Ran { .. }) => clock.mark_tick(started),
                Ok(TickOutcome::Stopped) => break,
                Err(e) => {
                    error!(error = %e, "Tick failed");
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        info!(ticks = clock.ticks(), interval = ?clock.interval(), "Server loop finished");
        self.shutdown();
        Ok(())
    }

    /// Stops physics, releases the scene and the transport. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Stopped;
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.physics_thread.take() {
            if handle.join().is_err() {
                warn!("Physics thread panicked");
            }
        }
        if let Err(e) = self.scene.lock().cleanup() {
            debug!(error = %e, "Scene already released");
        }
        self.mux.transport_mut().stop();
        info!(ticks = self.ticks, "Server stopped");
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = match self.console_rx.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => Vec::new(),
        };
        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command and returns its output lines.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Vec::new();
        };

        match command {
            "status" => {
                let (step, actors, scores) = {
                    let scene = self.scene.lock();
                    (scene.step_count(), scene.actor_count(), scene.scores())
                };
                let connected: Vec<usize> = self.mux.connected_slots().collect();
                let mut out = vec![
                    format!("Server state: {:?}", self.state),
                    format!("Tick: {}", self.ticks),
                    format!(
                        "Physics: {:?}, step {step}, {actors} actors",
                        self.cfg.physics_mode
                    ),
                    format!("Score: {} - {}", scores.p1, scores.p2),
                    format!(
                        "Clients: {}/{}",
                        connected.len(),
                        self.mux.transport().max_clients()
                    ),
                ];
                out.extend(connected.iter().map(|slot| format!("  slot {slot}")));
                out
            }
            "score" => {
                let parsed = match tokens.as_slice() {
                    [_, p1, p2] => p1.parse::<i32>().ok().zip(p2.parse::<i32>().ok()),
                    _ => None,
                };
                let Some((p1, p2)) = parsed else {
                    return vec!["Usage: score <p1> <p2>".to_string()];
                };
                if self.scene.lock().set_scores(p1, p2) {
                    info!(p1, p2, "Score changed");
                    vec![format!("Score set to {p1} - {p2}")]
                } else {
                    vec!["Score unchanged".to_string()]
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.running.store(false, Ordering::Release);
                vec!["Stopping server".to_string()]
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }
}

impl<T: Transport> Drop for GameServer<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Queues `pair` for `slot` unless it is the last pair queued there, so a
/// change racing a connect-ack reaches the new slot once.
fn send_score<T: Transport>(
    mux: &mut Multiplexer<T>,
    sent_scores: &mut [Option<ScorePair>],
    slot: usize,
    pair: ScorePair,
) {
    let Some(sent) = sent_scores.get_mut(slot) else {
        return;
    };
    if *sent == Some(pair) {
        return;
    }
    *sent = Some(pair);
    let ScorePair { p1, p2 } = pair;
    mux.send(slot, Channel::ReliableOrdered, MessageType::UpdateScore, |m| {
        *m = GameMessage::UpdateScore { p1, p2 }
    });
}

/// Routes one inbound message. Every arm is terminal.
fn handle_message<T: Transport>(
    mux: &mut Multiplexer<T>,
    scene: &Mutex<SimulationScene>,
    slot: usize,
    msg: GameMessage,
) {
    match msg {
        GameMessage::Test(n) => {
            debug!(slot, n, "Test message");
            mux.send(slot, Channel::ReliableOrdered, MessageType::Test, |m| {
                *m = GameMessage::Test(n.wrapping_add(1))
            });
        }
        GameMessage::TransformInfo(data) => {
            mux.send(
                slot,
                Channel::UnreliableUnordered,
                MessageType::TransformInfo,
                |m| *m = GameMessage::TransformInfo(data),
            );
        }
        GameMessage::SweepForceInput(input) => {
            let result = scene.lock().apply_directional_force(
                codec::vec3_to_engine(input.direction),
                codec::vec3_to_engine(input.position),
                input.radius,
                input.distance,
            );
            match result {
                Ok(pushed) => debug!(slot, pushed, "Sweep applied"),
                Err(e) => warn!(slot, error = %e, "Sweep rejected"),
            }
        }
        GameMessage::PlayerUpdate(pose) => {
            let result = scene.lock().update_player_state(
                slot,
                codec::transform_to_app(pose.head),
                codec::transform_to_app(pose.left_hand),
                codec::transform_to_app(pose.right_hand),
            );
            if let Err(e) = result {
                warn!(slot, error = %e, "Player update rejected");
            }
        }
        GameMessage::RigidbodyInfo(_)
        | GameMessage::ClientConnected(_)
        | GameMessage::UpdateScore { .. } => {
            debug!(slot, kind = ?msg.kind(), "Ignoring server-bound message of outbound-only kind");
        }
    }
}

/// Helper for tests: a socket server on an ephemeral localhost port.
pub async fn bind_ephemeral(
    tick_hz: u32,
) -> Result<(GameServer<SocketTransport>, ServerConfig), ServerError> {
    let mut cfg = ServerConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        ..Default::default()
    };
    let server = GameServer::bind(cfg.clone()).await?;
    if let Some(addr) = server.local_addr() {
        cfg.server_addr = addr.to_string();
    }
    Ok((server, cfg))
}
