use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rapier2d::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const GROUND_COLLISION_GROUP: Group = Group::GROUP_1;
const ROBOT_COLLISION_GROUP: Group = Group::GROUP_2;
const SPAWN_CLEARANCE: f32 = 0.005;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RobotId(pub u64);

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "robot#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyLabel {
    Ground,
    Boundary,
    Cart(RobotId),
    Head(RobotId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Part {
    Cart,
    Head,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Fixed physics step in seconds.
    pub dt: f32,
    pub gravity: f32,
    pub ground_half_width: f32,
    pub ground_thickness: f32,
    /// Side walls sit at `±boundary_offset` from the origin.
    pub boundary_offset: f32,
    pub boundary_height: f32,
    pub initial_impulse: f32,
    pub noise_impulse: f32,
    pub noise_interval_seconds: f32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            dt: 1.0 / 120.0,
            gravity: -9.81,
            ground_half_width: 40.0,
            ground_thickness: 1.0,
            boundary_offset: 6.0,
            boundary_height: 4.0,
            initial_impulse: 0.05,
            noise_impulse: 0.01,
            noise_interval_seconds: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RobotConfig {
    pub spawn_x: f32,
    pub cart_width: f32,
    pub cart_height: f32,
    pub cart_mass: f32,
    pub pendulum_length: f32,
    pub head_radius: f32,
    pub head_mass: f32,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            spawn_x: 0.0,
            cart_width: 1.0,
            cart_height: 0.2,
            cart_mass: 1.0,
            pendulum_length: 1.2,
            head_radius: 0.15,
            head_mass: 0.3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RobotPose {
    pub cart: [f32; 2],
    pub cart_velocity: [f32; 2],
    pub head: [f32; 2],
}

impl RobotPose {
    /// Angle of the rod from vertical; zero when upright, positive leaning toward +x.
    pub fn angle(&self) -> f32 {
        let dx = self.head[0] - self.cart[0];
        let dy = self.head[1] - self.cart[1];
        dx.atan2(dy)
    }
}

struct RobotBodies {
    cart: RigidBodyHandle,
    head: RigidBodyHandle,
}

pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    event_collector: ChannelEventCollector,
    collision_events: Receiver<CollisionEvent>,
    contact_force_events: Receiver<ContactForceEvent>,
    labels: HashMap<ColliderHandle, BodyLabel>,
    robots: HashMap<RobotId, RobotBodies>,
    next_robot: u64,
    has_ground: bool,
    config: WorldConfig,
    rng: SmallRng,
}

impl PhysicsWorld {
    pub fn new(config: &WorldConfig, seed: u64) -> Self {
        let mut world = Self::empty(config, seed);
        world.build_scenery();
        world
    }

    /// World without scenery; robots cannot be spawned into it.
    pub fn empty(config: &WorldConfig, seed: u64) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.dt;
        let (collision_send, collision_events) = mpsc::channel();
        let (contact_force_send, contact_force_events) = mpsc::channel();

        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![0.0, config.gravity],
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            event_collector: ChannelEventCollector::new(collision_send, contact_force_send),
            collision_events,
            contact_force_events,
            labels: HashMap::new(),
            robots: HashMap::new(),
            next_robot: 0,
            has_ground: false,
            config: config.clone(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn build_scenery(&mut self) {
        let scenery = self.bodies.insert(RigidBodyBuilder::fixed().build());
        let half_thickness = self.config.ground_thickness * 0.5;
        let ground = ColliderBuilder::cuboid(self.config.ground_half_width, half_thickness)
            .translation(vector![0.0, -half_thickness])
            .friction(0.0)
            .restitution(0.0)
            .collision_groups(scenery_groups())
            .build();
        let handle = self
            .colliders
            .insert_with_parent(ground, scenery, &mut self.bodies);
        self.labels.insert(handle, BodyLabel::Ground);

        let half_height = self.config.boundary_height * 0.5;
        for side in [-1.0f32, 1.0] {
            let wall = ColliderBuilder::cuboid(0.1, half_height)
                .translation(vector![side * self.config.boundary_offset, half_height])
                .friction(0.0)
                .restitution(0.0)
                .collision_groups(scenery_groups())
                .build();
            let handle = self
                .colliders
                .insert_with_parent(wall, scenery, &mut self.bodies);
            self.labels.insert(handle, BodyLabel::Boundary);
        }
        self.has_ground = true;
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn dt(&self) -> f32 {
        self.integration_parameters.dt
    }

    pub fn robot_count(&self) -> usize {
        self.robots.len()
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn contains_robot(&self, id: RobotId) -> bool {
        self.robots.contains_key(&id)
    }

    pub fn label(&self, collider: ColliderHandle) -> Option<BodyLabel> {
        self.labels.get(&collider).copied()
    }

    pub fn spawn_robot(&mut self, robot: &RobotConfig) -> Result<RobotId> {
        if !self.has_ground {
            return Err(Error::MissingContainer("ground"));
        }
        let id = RobotId(self.next_robot);
        self.next_robot += 1;

        let cart_y = robot.cart_height * 0.5 + SPAWN_CLEARANCE;
        let cart = self.bodies.insert(
            RigidBodyBuilder::dynamic()
                .translation(vector![robot.spawn_x, cart_y])
                .lock_rotations()
                .build(),
        );
        let cart_collider = ColliderBuilder::cuboid(robot.cart_width * 0.5, robot.cart_height * 0.5)
            .mass(robot.cart_mass)
            .friction(0.0)
            .restitution(0.0)
            .collision_groups(robot_groups())
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let cart_handle = self
            .colliders
            .insert_with_parent(cart_collider, cart, &mut self.bodies);

        let head = self.bodies.insert(
            RigidBodyBuilder::dynamic()
                .translation(vector![robot.spawn_x, cart_y + robot.pendulum_length])
                .build(),
        );
        let head_collider = ColliderBuilder::ball(robot.head_radius)
            .mass(robot.head_mass)
            .restitution(0.0)
            .collision_groups(robot_groups())
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let head_handle = self
            .colliders
            .insert_with_parent(head_collider, head, &mut self.bodies);

        let rod = RevoluteJointBuilder::new()
            .local_anchor1(point![0.0, 0.0])
            .local_anchor2(point![0.0, -robot.pendulum_length])
            .contacts_enabled(false);
        self.impulse_joints.insert(cart, head, rod, true);

        self.labels.insert(cart_handle, BodyLabel::Cart(id));
        self.labels.insert(head_handle, BodyLabel::Head(id));
        self.robots.insert(id, RobotBodies { cart, head });
        debug!("spawned {id} at x={:.2}", robot.spawn_x);
        Ok(id)
    }

    pub fn remove_robot(&mut self, id: RobotId) -> bool {
        let Some(robot) = self.robots.remove(&id) else {
            return false;
        };
        for body in [robot.head, robot.cart] {
            if let Some(removed) = self.bodies.remove(
                body,
                &mut self.island_manager,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            ) {
                for collider in removed.colliders() {
                    self.labels.remove(collider);
                }
            }
        }
        debug!("removed {id}");
        true
    }

    pub fn apply_force(&mut self, id: RobotId, force: f32) -> Result<()> {
        let body = self.body_mut(id, Part::Cart)?;
        body.reset_forces(true);
        body.add_force(vector![force, 0.0], true);
        Ok(())
    }

    pub fn apply_impulse(&mut self, id: RobotId, part: Part, impulse: [f32; 2]) -> Result<()> {
        let body = self.body_mut(id, part)?;
        body.apply_impulse(vector![impulse[0], impulse[1]], true);
        Ok(())
    }

    /// Random impulse on the head, mostly horizontal, bounded by `magnitude / 2` per axis.
    pub fn perturb_head(&mut self, id: RobotId, magnitude: f32) -> Result<()> {
        let x = (self.rng.random::<f32>() - 0.5) * magnitude;
        let y = (self.rng.random::<f32>() - 0.5) * magnitude * 0.1;
        self.apply_impulse(id, Part::Head, [x, y])
    }

    pub fn pose(&self, id: RobotId) -> Result<RobotPose> {
        let robot = self.robots.get(&id).ok_or(Error::UnknownRobot(id))?;
        let cart = self
            .bodies
            .get(robot.cart)
            .ok_or(Error::MissingContainer("cart body"))?;
        let head = self
            .bodies
            .get(robot.head)
            .ok_or(Error::MissingContainer("pendulum head body"))?;
        let cart_pos = cart.translation();
        let cart_vel = cart.linvel();
        let head_pos = head.translation();
        Ok(RobotPose {
            cart: [cart_pos.x, cart_pos.y],
            cart_velocity: [cart_vel.x, cart_vel.y],
            head: [head_pos.x, head_pos.y],
        })
    }

    /// Advances one fixed step and returns robots with a new fall contact.
    ///
    /// A fall is the head touching ground or a boundary, or the cart touching a
    /// boundary. The same robot may be reported on several steps.
    pub fn step(&mut self) -> Vec<RobotId> {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &self.event_collector,
        );

        while self.contact_force_events.try_recv().is_ok() {}
        let mut fallen = Vec::new();
        while let Ok(event) = self.collision_events.try_recv() {
            let CollisionEvent::Started(a, b, _) = event else {
                continue;
            };
            if let Some(robot) = self.fall_contact(a, b) {
                if !fallen.contains(&robot) {
                    fallen.push(robot);
                }
            }
        }
        fallen
    }

    fn fall_contact(&self, a: ColliderHandle, b: ColliderHandle) -> Option<RobotId> {
        let pair = (self.label(a)?, self.label(b)?);
        match pair {
            (BodyLabel::Head(robot), BodyLabel::Ground | BodyLabel::Boundary)
            | (BodyLabel::Ground | BodyLabel::Boundary, BodyLabel::Head(robot))
            | (BodyLabel::Cart(robot), BodyLabel::Boundary)
            | (BodyLabel::Boundary, BodyLabel::Cart(robot)) => Some(robot),
            _ => None,
        }
    }

    fn body_mut(&mut self, id: RobotId, part: Part) -> Result<&mut RigidBody> {
        let robot = self.robots.get(&id).ok_or(Error::UnknownRobot(id))?;
        let handle = match part {
            Part::Cart => robot.cart,
            Part::Head => robot.head,
        };
        self.bodies
            .get_mut(handle)
            .ok_or(Error::MissingContainer("robot body"))
    }
}

fn scenery_groups() -> InteractionGroups {
    InteractionGroups::new(
        GROUND_COLLISION_GROUP,
        ROBOT_COLLISION_GROUP,
        InteractionTestMode::And,
    )
}

fn robot_groups() -> InteractionGroups {
    InteractionGroups::new(
        ROBOT_COLLISION_GROUP,
        GROUND_COLLISION_GROUP,
        InteractionTestMode::And,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> PhysicsWorld {
        PhysicsWorld::new(&WorldConfig::default(), 9)
    }

    #[test]
    fn spawning_without_ground_reports_missing_container() {
        let mut world = PhysicsWorld::empty(&WorldConfig::default(), 1);
        let err = world.spawn_robot(&RobotConfig::default()).unwrap_err();
        assert!(matches!(err, Error::MissingContainer("ground")));
    }

    #[test]
    fn spawned_robot_starts_upright() {
        let mut world = world();
        let robot = world.spawn_robot(&RobotConfig::default()).unwrap();
        let pose = world.pose(robot).unwrap();
        assert!(pose.angle().abs() < 1e-6);
        assert!(pose.head[1] > pose.cart[1]);
    }

    #[test]
    fn remove_robot_drops_bodies_and_labels() {
        let mut world = world();
        let scenery_bodies = world.body_count();
        let robot = world.spawn_robot(&RobotConfig::default()).unwrap();
        assert_eq!(world.body_count(), scenery_bodies + 2);
        assert!(world.remove_robot(robot));
        assert!(!world.remove_robot(robot));
        assert_eq!(world.body_count(), scenery_bodies);
        assert_eq!(world.labels.len(), 3);
        assert!(matches!(world.pose(robot), Err(Error::UnknownRobot(_))));
        assert!(world.apply_force(robot, 1.0).is_err());
    }

    #[test]
    fn robot_ids_are_never_reused() {
        let mut world = world();
        let first = world.spawn_robot(&RobotConfig::default()).unwrap();
        world.remove_robot(first);
        let second = world.spawn_robot(&RobotConfig::default()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn uncontrolled_pendulum_falls_and_is_reported() {
        let mut world = world();
        let robot = world.spawn_robot(&RobotConfig::default()).unwrap();
        world.apply_impulse(robot, Part::Head, [0.2, 0.0]).unwrap();
        let mut fell = false;
        for _ in 0..1200 {
            if world.step().contains(&robot) {
                fell = true;
                break;
            }
        }
        assert!(fell, "pendulum never reported a fall");
        assert!(world.pose(robot).unwrap().angle().abs() > 1.0);
    }

    #[test]
    fn contact_classification_ignores_cart_on_ground() {
        let mut world = world();
        let robot = world.spawn_robot(&RobotConfig::default()).unwrap();
        let handle_of = |wanted: BodyLabel| {
            world
                .labels
                .iter()
                .find(|(_, label)| **label == wanted)
                .map(|(handle, _)| *handle)
                .unwrap()
        };
        let ground = handle_of(BodyLabel::Ground);
        let wall = handle_of(BodyLabel::Boundary);
        let cart = handle_of(BodyLabel::Cart(robot));
        let head = handle_of(BodyLabel::Head(robot));

        assert_eq!(world.fall_contact(cart, ground), None);
        assert_eq!(world.fall_contact(ground, cart), None);
        assert_eq!(world.fall_contact(head, ground), Some(robot));
        assert_eq!(world.fall_contact(wall, head), Some(robot));
        assert_eq!(world.fall_contact(cart, wall), Some(robot));
        assert_eq!(world.fall_contact(cart, head), None);
    }

    #[test]
    fn settling_cart_is_not_reported_as_fallen() {
        let mut world = world();
        let robot = world.spawn_robot(&RobotConfig::default()).unwrap();
        for _ in 0..5 {
            assert!(!world.step().contains(&robot));
        }
    }

    #[test]
    fn overlapping_robots_pass_through_each_other() {
        let mut world = world();
        let first = world.spawn_robot(&RobotConfig::default()).unwrap();
        let second = world.spawn_robot(&RobotConfig::default()).unwrap();
        for _ in 0..5 {
            let fallen = world.step();
            assert!(!fallen.contains(&first) && !fallen.contains(&second));
        }
        let a = world.pose(first).unwrap();
        let b = world.pose(second).unwrap();
        assert!((a.cart[0] - b.cart[0]).abs() < 1e-4);
        assert!(a.cart[0].abs() < 1e-3);
    }
}
