//! Physics abstraction.
//!
//! The scene talks to the physics engine only through [`PhysicsBackend`]:
//! create the world, step it, enumerate dynamic actors, push actors with a
//! swept sphere, tear it down. [`RapierBackend`] is the production engine.

use arena_shared::config::PhysicsConfig;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rapier3d::na::{Isometry3, Vector3};
use rapier3d::prelude::*;
use tracing::debug;

/// Stable actor id, assigned when the body is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u32);

/// Pose and velocities of one dynamic actor, in engine types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorState {
    pub id: ActorId,
    pub pose: Isometry3<f32>,
    pub linear_velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
}

/// Swept-sphere push request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sweep {
    pub direction: Vector3<f32>,
    pub origin: Vector3<f32>,
    pub radius: f32,
    pub distance: f32,
}

/// Physics engine contract.
pub trait PhysicsBackend: Send {
    /// Creates the initial world.
    fn init(&mut self);
    /// Advances the world by `dt` seconds.
    fn step(&mut self, dt: f32);
    /// Visits every dynamic actor. Order is stable within one call.
    fn for_each_dynamic(&self, visitor: &mut dyn FnMut(&ActorState));
    /// Pushes every dynamic actor caught by the sweep; returns how many.
    fn apply_sweep(&mut self, sweep: &Sweep) -> usize;
    /// Drops all bodies and colliders.
    fn cleanup(&mut self);
    fn actor_count(&self) -> usize;
}

const BALL_RADIUS: f32 = 0.25;
const GRID_SPACING: f32 = 0.75;
const SPAWN_HEIGHT: f32 = 1.0;

/// Rapier-backed world: a static ground slab and a grid of dynamic balls.
pub struct RapierBackend {
    cfg: PhysicsConfig,
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: BroadPhaseMultiSap,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
}

impl RapierBackend {
    pub fn new(cfg: PhysicsConfig) -> Self {
        let [gx, gy, gz] = cfg.gravity;
        Self {
            cfg,
            pipeline: PhysicsPipeline::new(),
            gravity: vector![gx, gy, gz],
            integration_parameters: IntegrationParameters::default(),
            islands: IslandManager::new(),
            broad_phase: BroadPhaseMultiSap::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
        }
    }

    fn spawn_bodies(&mut self) {
        let count = self.cfg.body_count;
        let side = (count as f32).sqrt().ceil().max(1.0) as u32;
        let offset = (side - 1) as f32 * GRID_SPACING * 0.5;
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);

        for i in 0..count {
            let x = (i % side) as f32 * GRID_SPACING - offset + rng.gen_range(-0.1..0.1);
            let z = (i / side) as f32 * GRID_SPACING - offset + rng.gen_range(-0.1..0.1);
            let body = RigidBodyBuilder::dynamic()
                .translation(vector![x, SPAWN_HEIGHT, z])
                .user_data(u128::from(i))
                .build();
            let handle = self.bodies.insert(body);
            let collider = ColliderBuilder::ball(BALL_RADIUS).restitution(0.4).build();
            self.colliders
                .insert_with_parent(collider, handle, &mut self.bodies);
        }
    }
}

impl PhysicsBackend for RapierBackend {
    fn init(&mut self) {
        let ground = ColliderBuilder::cuboid(50.0, 0.1, 50.0)
            .translation(vector![0.0, -0.1, 0.0])
            .build();
        self.colliders.insert(ground);
        self.spawn_bodies();
        debug!(bodies = self.bodies.len(), "Physics world created");
    }

    fn step(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );
    }

    fn for_each_dynamic(&self, visitor: &mut dyn FnMut(&ActorState)) {
        for (_, body) in self.bodies.iter() {
            if !body.is_dynamic() {
                continue;
            }
            visitor(&ActorState {
                id: ActorId(body.user_data as u32),
                pose: *body.position(),
                linear_velocity: *body.linvel(),
                angular_velocity: *body.angvel(),
            });
        }
    }

    fn apply_sweep(&mut self, sweep: &Sweep) -> usize {
        let len = sweep.direction.norm();
        if !(len > f32::EPSILON) {
            debug!(?sweep, "Ignoring sweep without direction");
            return 0;
        }
        let dir = sweep.direction / len;
        let end = sweep.origin + dir * sweep.distance;
        let impulse = dir * self.cfg.sweep_impulse;

        let mut pushed = 0;
        for (_, body) in self.bodies.iter_mut() {
            if !body.is_dynamic() {
                continue;
            }
            if distance_to_segment(body.translation(), &sweep.origin, &end) <= sweep.radius {
                body.apply_impulse(impulse, true);
                pushed += 1;
            }
        }
        pushed
    }

    fn cleanup(&mut self) {
        self.bodies = RigidBodySet::new();
        self.colliders = ColliderSet::new();
        self.islands = IslandManager::new();
        self.broad_phase = BroadPhaseMultiSap::new();
        self.narrow_phase = NarrowPhase::new();
        self.impulse_joints = ImpulseJointSet::new();
        self.multibody_joints = MultibodyJointSet::new();
        self.ccd_solver = CCDSolver::new();
    }

    fn actor_count(&self) -> usize {
        self.bodies.iter().filter(|(_, b)| b.is_dynamic()).count()
    }
}

/// Distance from `p` to the segment `a..b`.
pub fn distance_to_segment(p: &Vector3<f32>, a: &Vector3<f32>, b: &Vector3<f32>) -> f32 {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    let t = if len_sq > 0.0 {
        ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (a + ab * t - p).norm()
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted backend for scene/server tests.

    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Actors move along +x by one unit per step; sweeps are recorded.
    #[derive(Clone, Default)]
    pub struct FakeBackend {
        pub actors: Vec<ActorState>,
        pub sweeps: Arc<Mutex<Vec<Sweep>>>,
    }

    impl FakeBackend {
        pub fn with_actors(count: u32) -> Self {
            Self {
                actors: (0..count)
                    .map(|i| ActorState {
                        id: ActorId(i),
                        pose: Isometry3::translation(0.0, i as f32, 0.0),
                        linear_velocity: Vector3::zeros(),
                        angular_velocity: Vector3::zeros(),
                    })
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl PhysicsBackend for FakeBackend {
        fn init(&mut self) {}

        fn step(&mut self, _dt: f32) {
            for actor in &mut self.actors {
                actor.pose.translation.vector.x += 1.0;
                actor.linear_velocity.x = actor.pose.translation.vector.x;
            }
        }

        fn for_each_dynamic(&self, visitor: &mut dyn FnMut(&ActorState)) {
            for actor in &self.actors {
                visitor(actor);
            }
        }

        fn apply_sweep(&mut self, sweep: &Sweep) -> usize {
            self.sweeps.lock().push(*sweep);
            0
        }

        fn cleanup(&mut self) {
            self.actors.clear();
        }

        fn actor_count(&self) -> usize {
            self.actors.len()
        }
    }
}
