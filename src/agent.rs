use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ControlConfig;
use crate::error::{Error, Result};
use crate::policy::{Observation, ObservationScale, Policy, RobotState};
use crate::scheduler::{Scheduler, Task, TaskId};
use crate::world::{PhysicsWorld, RobotConfig, RobotId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpisodeConfig {
    pub robot: RobotConfig,
    pub control: ControlConfig,
    pub observation: ObservationScale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    Fell,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Termination {
    pub agent: AgentId,
    pub generation: u32,
    /// Simulated seconds between start and termination.
    pub fitness: f32,
    pub cause: TerminationCause,
}

#[derive(Clone, Copy, Debug)]
struct Episode {
    robot: RobotId,
    started_at: f64,
    control_task: TaskId,
    noise_task: TaskId,
    last_sample: Option<(f64, f32)>,
}

#[derive(Clone, Copy, Debug)]
enum AgentState {
    Ready,
    Running(Episode),
    Finished,
}

#[derive(Debug)]
pub struct Agent {
    id: AgentId,
    generation: u32,
    policy: Policy,
    state: AgentState,
    fitness: Option<f32>,
}

impl Agent {
    pub fn new(id: AgentId, generation: u32, policy: Policy) -> Self {
        Self {
            id,
            generation,
            policy,
            state: AgentState::Ready,
            fitness: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut Policy {
        &mut self.policy
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, AgentState::Running(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, AgentState::Finished)
    }

    pub fn robot(&self) -> Option<RobotId> {
        match self.state {
            AgentState::Running(episode) => Some(episode.robot),
            _ => None,
        }
    }

    pub fn fitness(&self) -> Result<f32> {
        self.fitness.ok_or(Error::MissingFitness(self.id))
    }

    pub fn start(
        &mut self,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
        episode: &EpisodeConfig,
    ) -> Result<RobotId> {
        if !matches!(self.state, AgentState::Ready) {
            return Err(Error::AlreadyStarted(self.id));
        }
        let robot = world.spawn_robot(&episode.robot)?;
        let initial_impulse = world.config().initial_impulse;
        world.perturb_head(robot, initial_impulse)?;

        let control_task = scheduler.every(episode.control.interval(), Task::Control(self.id));
        let noise_task = scheduler.every(
            world.config().noise_interval_seconds,
            Task::Noise(robot),
        );
        self.state = AgentState::Running(Episode {
            robot,
            started_at: scheduler.now(),
            control_task,
            noise_task,
            last_sample: None,
        });
        Ok(robot)
    }

    pub fn tick(&mut self, world: &mut PhysicsWorld, now: f64, episode: &EpisodeConfig) -> Result<()> {
        let AgentState::Running(running) = &mut self.state else {
            return Ok(());
        };
        let pose = world.pose(running.robot)?;
        let angle = pose.angle();
        let (elapsed, angular_velocity) = match running.last_sample {
            Some((at, previous)) if now > at => {
                let elapsed = (now - at) as f32;
                (elapsed, (angle - previous) / elapsed)
            }
            _ => (episode.control.interval(), 0.0),
        };
        running.last_sample = Some((now, angle));

        let state = RobotState {
            cart_position: pose.cart[0],
            cart_velocity: pose.cart_velocity[0],
            angle,
            angular_velocity,
        };
        let observation = Observation::new(state, &episode.observation);
        let output = self.policy.evaluate(&observation, elapsed).clamp(-1.0, 1.0);
        world.apply_force(running.robot, output * episode.control.force_scale)
    }

    pub fn age(&self, now: f64) -> Option<f32> {
        match self.state {
            AgentState::Running(episode) => Some((now - episode.started_at) as f32),
            _ => None,
        }
    }

    pub fn timed_out(&self, now: f64, control: &ControlConfig) -> bool {
        match (self.age(now), control.episode_timeout_seconds) {
            (Some(age), Some(limit)) => age >= limit,
            _ => false,
        }
    }

    /// Ends the episode. Only the first call yields a `Termination`.
    ///
    /// Periodic tasks are cancelled before the robot leaves the world, so no
    /// control update can touch a removed body.
    pub fn terminate(
        &mut self,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
        now: f64,
        cause: TerminationCause,
    ) -> Option<Termination> {
        let AgentState::Running(episode) = self.state else {
            return None;
        };
        scheduler.cancel(episode.control_task);
        scheduler.cancel(episode.noise_task);
        world.remove_robot(episode.robot);

        let fitness = ((now - episode.started_at) as f32).max(0.0);
        self.fitness = Some(fitness);
        self.state = AgentState::Finished;
        Some(Termination {
            agent: self.id,
            generation: self.generation,
            fitness,
            cause,
        })
    }

    pub fn cancel(&mut self, world: &mut PhysicsWorld, scheduler: &mut Scheduler) -> bool {
        let AgentState::Running(episode) = self.state else {
            return false;
        };
        scheduler.cancel(episode.control_task);
        scheduler.cancel(episode.noise_task);
        world.remove_robot(episode.robot);
        self.state = AgentState::Finished;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{FeedForward, NetworkLayout};
    use crate::pid::PidConfig;
    use crate::world::WorldConfig;

    fn setup() -> (PhysicsWorld, Scheduler, EpisodeConfig) {
        (
            PhysicsWorld::new(&WorldConfig::default(), 3),
            Scheduler::new(),
            EpisodeConfig::default(),
        )
    }

    #[test]
    fn double_fall_keeps_first_fitness() {
        let (mut world, mut scheduler, episode) = setup();
        let mut agent = Agent::new(AgentId(1), 0, Policy::pid(&PidConfig::default()));
        agent.start(&mut world, &mut scheduler, &episode).unwrap();

        scheduler.advance(0.5);
        let now = scheduler.now();
        let first = agent
            .terminate(&mut world, &mut scheduler, now, TerminationCause::Fell)
            .unwrap();
        assert_eq!(first.fitness, 0.5);
        assert_eq!(first.agent, AgentId(1));

        scheduler.advance(0.5);
        let now = scheduler.now();
        let second = agent.terminate(&mut world, &mut scheduler, now, TerminationCause::Fell);
        assert!(second.is_none());
        assert_eq!(agent.fitness().unwrap(), 0.5);
    }

    #[test]
    fn fitness_measures_survival_late_in_a_long_run() {
        let (mut world, mut scheduler, episode) = setup();
        scheduler.advance(300_000.0);
        let mut agent = Agent::new(AgentId(1), 0, Policy::pid(&PidConfig::default()));
        agent.start(&mut world, &mut scheduler, &episode).unwrap();
        for _ in 0..120 {
            scheduler.advance(1.0 / 120.0);
        }
        let now = scheduler.now();
        let termination = agent
            .terminate(&mut world, &mut scheduler, now, TerminationCause::Fell)
            .unwrap();
        assert!((termination.fitness - 1.0).abs() < 1e-4, "fitness {}", termination.fitness);
    }

    #[test]
    fn termination_unregisters_tasks_and_removes_robot() {
        let (mut world, mut scheduler, episode) = setup();
        let mut agent = Agent::new(AgentId(1), 0, Policy::pid(&PidConfig::default()));
        let robot = agent.start(&mut world, &mut scheduler, &episode).unwrap();
        assert_eq!(scheduler.len(), 2);
        agent.terminate(&mut world, &mut scheduler, 0.0, TerminationCause::Fell);
        assert!(scheduler.is_empty());
        assert!(!world.contains_robot(robot));
        assert!(agent.tick(&mut world, 1.0, &episode).is_ok());
    }

    #[test]
    fn start_twice_is_rejected() {
        let (mut world, mut scheduler, episode) = setup();
        let mut agent = Agent::new(AgentId(4), 0, Policy::pid(&PidConfig::default()));
        agent.start(&mut world, &mut scheduler, &episode).unwrap();
        let err = agent.start(&mut world, &mut scheduler, &episode).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted(AgentId(4))));
    }

    #[test]
    fn start_without_ground_leaves_agent_ready() {
        let mut world = PhysicsWorld::empty(&WorldConfig::default(), 0);
        let mut scheduler = Scheduler::new();
        let mut agent = Agent::new(AgentId(2), 0, Policy::pid(&PidConfig::default()));
        let err = agent
            .start(&mut world, &mut scheduler, &EpisodeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::MissingContainer(_)));
        assert!(!agent.is_running());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn cancelled_agent_has_no_fitness() {
        let (mut world, mut scheduler, episode) = setup();
        let mut agent = Agent::new(AgentId(1), 0, Policy::pid(&PidConfig::default()));
        agent.start(&mut world, &mut scheduler, &episode).unwrap();
        assert!(agent.cancel(&mut world, &mut scheduler));
        assert!(matches!(agent.fitness(), Err(Error::MissingFitness(_))));
        assert_eq!(world.robot_count(), 0);
        assert!(agent.terminate(&mut world, &mut scheduler, 1.0, TerminationCause::Fell).is_none());
    }

    #[test]
    fn saturated_policy_drives_cart_toward_positive_x() {
        let (mut world, mut scheduler, episode) = setup();
        let layout = NetworkLayout::default();
        let mut parameters = FeedForward::zeroed(layout.clone()).parameters().to_vec();
        if let Some(bias) = parameters.last_mut() {
            bias.values_mut()[0] = 4.0;
        }
        let policy = Policy::network_with(layout, parameters).unwrap();
        let mut agent = Agent::new(AgentId(9), 0, policy);
        let robot = agent.start(&mut world, &mut scheduler, &episode).unwrap();

        for _ in 0..60 {
            for task in scheduler.advance(world.dt()) {
                if task == Task::Control(AgentId(9)) {
                    agent.tick(&mut world, scheduler.now(), &episode).unwrap();
                }
            }
            world.step();
        }
        assert!(world.pose(robot).unwrap().cart[0] > 0.3);
    }

    #[test]
    fn timeout_applies_only_when_configured() {
        let (mut world, mut scheduler, mut episode) = setup();
        let mut agent = Agent::new(AgentId(1), 0, Policy::pid(&PidConfig::default()));
        agent.start(&mut world, &mut scheduler, &episode).unwrap();
        episode.control.episode_timeout_seconds = Some(1.0);
        assert!(!agent.timed_out(0.5, &episode.control));
        assert!(agent.timed_out(1.0, &episode.control));
        episode.control.episode_timeout_seconds = None;
        assert!(!agent.timed_out(100.0, &episode.control));
    }
}
