//! Simulation scene.
//!
//! Owns the physics backend, the per-slot player state, the per-step actor
//! snapshot and the score pair. The scene is shared as [`SharedScene`]; every
//! reader and writer goes through that one mutex, so a snapshot never mixes
//! actor state from two different steps.

use std::sync::Arc;

use arena_shared::{config::PhysicsConfig, math::Pose, net::MAX_PLAYERS};
use parking_lot::Mutex;
use rapier3d::na::Vector3;
use tracing::debug;

use crate::{
    error::SceneError,
    physics::{ActorId, ActorState, PhysicsBackend, Sweep},
};

/// The scene behind its single synchronization boundary.
pub type SharedScene = Arc<Mutex<SimulationScene>>;

/// Observer invoked synchronously whenever the score pair changes.
pub type ScoreHook = Box<dyn Fn(ScorePair) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScorePair {
    pub p1: i32,
    pub p2: i32,
}

/// Last pose reported by a slot's client.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub head: Pose,
    pub left_hand: Pose,
    pub right_hand: Pose,
}

/// Owned, consistent read of the scene.
#[derive(Debug, Clone)]
pub struct SceneSnapshot {
    /// Number of physics steps taken when the snapshot was read.
    pub step: u64,
    pub actors: Arc<[ActorState]>,
    pub players: [PlayerState; MAX_PLAYERS],
    pub scores: ScorePair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    CleanedUp,
}

pub struct SimulationScene {
    backend: Box<dyn PhysicsBackend>,
    dt: f32,
    sweep_default_distance: f32,
    lifecycle: Lifecycle,
    step: u64,
    actors: Arc<[ActorState]>,
    players: [PlayerState; MAX_PLAYERS],
    scores: ScorePair,
    score_hook: Option<ScoreHook>,
}

impl SimulationScene {
    pub fn new(cfg: &PhysicsConfig, backend: Box<dyn PhysicsBackend>) -> Self {
        Self {
            backend,
            dt: cfg.dt,
            sweep_default_distance: cfg.sweep_default_distance,
            lifecycle: Lifecycle::Uninitialized,
            step: 0,
            actors: Arc::from(Vec::new()),
            players: [PlayerState::default(); MAX_PLAYERS],
            scores: ScorePair::default(),
            score_hook: None,
        }
    }

    pub fn into_shared(self) -> SharedScene {
        Arc::new(Mutex::new(self))
    }

    /// One-time world setup. Must precede any [`update`](Self::update).
    pub fn init_scene(&mut self) -> Result<(), SceneError> {
        match self.lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized => return Err(SceneError::AlreadyInitialized),
            Lifecycle::CleanedUp => return Err(SceneError::CleanedUp),
        }
        self.backend.init();
        self.lifecycle = Lifecycle::Initialized;
        self.refresh_actors();
        debug!(actors = self.actors.len(), "Scene initialized");
        Ok(())
    }

    /// Advances physics by one step and refreshes the actor snapshot.
    pub fn update(&mut self) -> Result<(), SceneError> {
        self.ensure_initialized()?;
        self.backend.step(self.dt);
        self.step += 1;
        self.refresh_actors();
        Ok(())
    }

    /// Releases physics resources. No other operation is valid afterwards.
    pub fn cleanup(&mut self) -> Result<(), SceneError> {
        if self.lifecycle == Lifecycle::CleanedUp {
            return Err(SceneError::CleanedUp);
        }
        self.backend.cleanup();
        self.lifecycle = Lifecycle::CleanedUp;
        self.actors = Arc::from(Vec::new());
        self.score_hook = None;
        Ok(())
    }

    /// One-shot area push along `direction` from `origin`.
    ///
    /// `distance == 0.0` uses the configured default distance. Returns the
    /// number of actors the sweep caught.
    pub fn apply_directional_force(
        &mut self,
        direction: Vector3<f32>,
        origin: Vector3<f32>,
        radius: f32,
        distance: f32,
    ) -> Result<usize, SceneError> {
        self.ensure_initialized()?;
        let distance = if distance == 0.0 {
            self.sweep_default_distance
        } else {
            distance
        };
        Ok(self.backend.apply_sweep(&Sweep {
            direction,
            origin,
            radius,
            distance,
        }))
    }

    /// Overwrites the slot's player state. Last write wins.
    pub fn update_player_state(
        &mut self,
        slot: usize,
        head: Pose,
        left_hand: Pose,
        right_hand: Pose,
    ) -> Result<(), SceneError> {
        let player = self
            .players
            .get_mut(slot)
            .ok_or(SceneError::SlotOutOfRange {
                slot,
                max: MAX_PLAYERS,
            })?;
        *player = PlayerState {
            head,
            left_hand,
            right_hand,
        };
        Ok(())
    }

    pub fn player_state(&self, slot: usize) -> Result<PlayerState, SceneError> {
        self.players
            .get(slot)
            .copied()
            .ok_or(SceneError::SlotOutOfRange {
                slot,
                max: MAX_PLAYERS,
            })
    }

    pub fn player_states(&self) -> [PlayerState; MAX_PLAYERS] {
        self.players
    }

    /// Visits every dynamic actor of the latest step, in engine order.
    pub fn for_each_actor(&self, mut visitor: impl FnMut(ActorId, &ActorState)) {
        for actor in self.actors.iter() {
            visitor(actor.id, actor);
        }
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn snapshot(&self) -> SceneSnapshot {
        SceneSnapshot {
            step: self.step,
            actors: Arc::clone(&self.actors),
            players: self.players,
            scores: self.scores,
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn set_score_hook(&mut self, hook: ScoreHook) {
        self.score_hook = Some(hook);
    }

    pub fn scores(&self) -> ScorePair {
        self.scores
    }

    /// Records a new score pair; the hook fires only when it changed.
    pub fn set_scores(&mut self, p1: i32, p2: i32) -> bool {
        let next = ScorePair { p1, p2 };
        if next == self.scores {
            return false;
        }
        self.scores = next;
        if let Some(hook) = &self.score_hook {
            hook(next);
        }
        true
    }

    fn ensure_initialized(&self) -> Result<(), SceneError> {
        match self.lifecycle {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Uninitialized => Err(SceneError::NotInitialized),
            Lifecycle::CleanedUp => Err(SceneError::CleanedUp),
        }
    }

    fn refresh_actors(&mut self) {
        let mut actors = Vec::with_capacity(self.backend.actor_count());
        self.backend.for_each_dynamic(&mut |a| actors.push(*a));
        self.actors = Arc::from(actors);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use arena_shared::math::{Quat, Vec3};

    use super::*;
    use crate::physics::fake::FakeBackend;

    fn scene_with(backend: FakeBackend) -> SimulationScene {
        SimulationScene::new(&PhysicsConfig::default(), Box::new(backend))
    }

    fn pose(x: f32) -> Pose {
        Pose::new(Vec3::new(x, 1.0, 2.0), Quat::new(0.0, 1.0, 0.0, 0.0))
    }

    #[test]
    fn lifecycle_is_enforced() {
        let mut scene = scene_with(FakeBackend::with_actors(1));
        assert_eq!(scene.update(), Err(SceneError::NotInitialized));
        scene.init_scene().unwrap();
        assert_eq!(scene.init_scene(), Err(SceneError::AlreadyInitialized));
        scene.update().unwrap();
        scene.cleanup().unwrap();
        assert_eq!(scene.update(), Err(SceneError::CleanedUp));
        assert_eq!(scene.cleanup(), Err(SceneError::CleanedUp));
        assert_eq!(scene.actor_count(), 0);
    }

    #[test]
    fn out_of_range_slot_is_an_error() {
        let mut scene = scene_with(FakeBackend::default());
        let err = scene
            .update_player_state(MAX_PLAYERS, pose(0.0), pose(0.0), pose(0.0))
            .unwrap_err();
        assert_eq!(
            err,
            SceneError::SlotOutOfRange {
                slot: MAX_PLAYERS,
                max: MAX_PLAYERS
            }
        );
        assert!(scene.player_state(MAX_PLAYERS).is_err());
        // nothing was clamped into the last slot
        assert_eq!(
            scene.player_state(MAX_PLAYERS - 1).unwrap(),
            PlayerState::default()
        );
    }

    #[test]
    fn player_state_last_write_wins() {
        let mut scene = scene_with(FakeBackend::default());
        scene
            .update_player_state(1, pose(1.0), pose(2.0), pose(3.0))
            .unwrap();
        scene
            .update_player_state(1, pose(4.0), pose(5.0), pose(6.0))
            .unwrap();
        let snap = scene.snapshot();
        assert_eq!(snap.players[1].head, pose(4.0));
        assert_eq!(snap.players[1].left_hand, pose(5.0));
        assert_eq!(snap.players[1].right_hand, pose(6.0));
        assert_eq!(snap.players[0], PlayerState::default());
    }

    #[test]
    fn player_states_returns_the_whole_array() {
        let mut scene = scene_with(FakeBackend::default());
        scene
            .update_player_state(0, pose(1.0), pose(2.0), pose(3.0))
            .unwrap();
        scene
            .update_player_state(2, pose(7.0), pose(8.0), pose(9.0))
            .unwrap();

        let states = scene.player_states();
        assert_eq!(states.len(), MAX_PLAYERS);
        assert_eq!(
            states[0],
            PlayerState {
                head: pose(1.0),
                left_hand: pose(2.0),
                right_hand: pose(3.0),
            }
        );
        assert_eq!(states[2].head, pose(7.0));
        assert_eq!(states[2].right_hand, pose(9.0));
        for slot in [1, 3] {
            assert_eq!(states[slot], PlayerState::default());
        }
        assert_eq!(states, scene.snapshot().players);
    }

    #[test]
    fn sweep_distance_defaults_when_zero() {
        let backend = FakeBackend::default();
        let sweeps = Arc::clone(&backend.sweeps);
        let mut scene = scene_with(backend);
        scene.init_scene().unwrap();

        let dir = Vector3::new(0.0, 0.0, 1.0);
        scene
            .apply_directional_force(dir, Vector3::zeros(), 0.3, 0.0)
            .unwrap();
        scene
            .apply_directional_force(dir, Vector3::zeros(), 0.3, 5.0)
            .unwrap();

        let sweeps = sweeps.lock();
        assert_eq!(sweeps.len(), 2);
        assert_eq!(
            sweeps[0].distance,
            PhysicsConfig::default().sweep_default_distance
        );
        assert_eq!(sweeps[1].distance, 5.0);
        assert_eq!(sweeps[1].radius, 0.3);
    }

    #[test]
    fn actors_are_visited_in_stable_order() {
        let mut scene = scene_with(FakeBackend::with_actors(3));
        scene.init_scene().unwrap();
        scene.update().unwrap();
        let mut first = Vec::new();
        scene.for_each_actor(|id, _| first.push(id));
        let mut second = Vec::new();
        scene.for_each_actor(|id, _| second.push(id));
        assert_eq!(first, vec![ActorId(0), ActorId(1), ActorId(2)]);
        assert_eq!(first, second);
    }

    #[test]
    fn score_hook_fires_on_change_only() {
        let mut scene = scene_with(FakeBackend::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        scene.set_score_hook(Box::new(move |s| sink.lock().push(s)));

        assert!(scene.set_scores(1, 0));
        assert!(!scene.set_scores(1, 0));
        assert!(scene.set_scores(1, 2));
        assert_eq!(
            *seen.lock(),
            vec![ScorePair { p1: 1, p2: 0 }, ScorePair { p1: 1, p2: 2 }]
        );
        assert_eq!(scene.scores(), ScorePair { p1: 1, p2: 2 });
    }

    #[test]
    fn concurrent_steps_never_tear_a_snapshot() {
        let mut scene = scene_with(FakeBackend::with_actors(8));
        scene.init_scene().unwrap();
        let shared = scene.into_shared();
        let done = Arc::new(AtomicBool::new(false));

        let stepper = {
            let shared = Arc::clone(&shared);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    shared.lock().update().unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        while !done.load(Ordering::SeqCst) {
            let snap = shared.lock().snapshot();
            let expected = snap.step as f32;
            for actor in snap.actors.iter() {
                assert_eq!(actor.pose.translation.vector.x, expected);
                assert_eq!(actor.linear_velocity.x, expected);
            }
        }
        stepper.join().unwrap();
        assert_eq!(shared.lock().step_count(), 2_000);
    }
}
