use std::mem;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::{Agent, AgentId, EpisodeConfig, TerminationCause};
use crate::config::{EvolutionSettings, TrainerConfig};
use crate::error::Result;
use crate::evolution::{EvolutionManager, GenerationSummary, Phase, Progress};
use crate::policy::Policy;
use crate::scheduler::{Scheduler, Task};
use crate::tensor::Tensor;
use crate::world::{Part, PhysicsWorld, RobotId};

const BASELINE_AGENT: AgentId = AgentId(u64::MAX);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    fn sign(self) -> f32 {
        match self {
            Self::Left => -1.0,
            Self::Right => 1.0,
        }
    }
}

pub enum Session {
    Idle,
    Evolution(EvolutionManager),
    Baseline(Agent),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    GenerationStarted {
        generation: u32,
        population: usize,
    },
    AgentTerminated {
        generation: u32,
        agent: u64,
        fitness: f32,
        cause: TerminationCause,
    },
    GenerationComplete {
        summary: GenerationSummary,
    },
    EvolutionFinished {
        summary: GenerationSummary,
        champion_fitness: Option<f32>,
        champion_parameters: Option<Vec<Tensor>>,
    },
    EvolutionStopped {
        generation: u32,
        cancelled: usize,
    },
    BaselineStarted {
        target_position: f32,
    },
    BaselineTerminated {
        fitness: f32,
        cause: TerminationCause,
    },
}

/// The single timeline: every world mutation happens inside `step` or one of the session commands.
pub struct Simulation {
    config: TrainerConfig,
    episode: EpisodeConfig,
    world: PhysicsWorld,
    scheduler: Scheduler,
    session: Session,
    runs: u64,
}

impl Simulation {
    pub fn new(config: TrainerConfig) -> Self {
        let world = PhysicsWorld::new(&config.world, config.seed);
        let episode = EpisodeConfig {
            robot: config.robot.clone(),
            control: config.control.clone(),
            observation: config.observation.clone(),
        };
        Self {
            config,
            episode,
            world,
            scheduler: Scheduler::new(),
            session: Session::Idle,
            runs: 0,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn world(&self) -> &PhysicsWorld {
        &self.world
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn evolution(&self) -> Option<&EvolutionManager> {
        match &self.session {
            Session::Evolution(manager) => Some(manager),
            _ => None,
        }
    }

    pub fn sim_time(&self) -> f64 {
        self.scheduler.now()
    }

    pub fn is_active(&self) -> bool {
        match &self.session {
            Session::Idle => false,
            Session::Evolution(manager) => manager.phase() == Phase::Running,
            Session::Baseline(agent) => agent.is_running(),
        }
    }

    /// Advances the clock one physics step: due tasks first, then physics, then falls.
    pub fn step(&mut self) -> Result<Vec<SimEvent>> {
        let mut events = Vec::new();
        let dt = self.world.dt();
        for task in self.scheduler.advance(dt) {
            self.dispatch(task, &mut events)?;
        }
        for robot in self.world.step() {
            self.robot_fell(robot, &mut events)?;
        }
        Ok(events)
    }

    fn dispatch(&mut self, task: Task, events: &mut Vec<SimEvent>) -> Result<()> {
        match task {
            Task::Noise(robot) => {
                if self.world.contains_robot(robot) {
                    let magnitude = self.world.config().noise_impulse;
                    self.world.perturb_head(robot, magnitude)?;
                }
            }
            Task::Control(agent) => match &mut self.session {
                Session::Evolution(manager) => {
                    if let Some(progress) = manager.tick(agent, &mut self.world, &mut self.scheduler)? {
                        push_progress(manager, progress, events);
                    }
                }
                Session::Baseline(baseline) if baseline.id() == agent => {
                    baseline.tick(&mut self.world, self.scheduler.now(), &self.episode)?;
                }
                _ => debug!("dropping control tick for {agent} with no live session"),
            },
        }
        Ok(())
    }

    fn robot_fell(&mut self, robot: RobotId, events: &mut Vec<SimEvent>) -> Result<()> {
        match &mut self.session {
            Session::Evolution(manager) => {
                if let Some(progress) = manager.robot_fell(robot, &mut self.world, &mut self.scheduler)? {
                    push_progress(manager, progress, events);
                }
            }
            Session::Baseline(baseline) if baseline.robot() == Some(robot) => {
                let now = self.scheduler.now();
                if let Some(termination) =
                    baseline.terminate(&mut self.world, &mut self.scheduler, now, TerminationCause::Fell)
                {
                    info!("baseline fell after {:.2}s", termination.fitness);
                    events.push(SimEvent::BaselineTerminated {
                        fitness: termination.fitness,
                        cause: termination.cause,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn start_evolution(&mut self, settings: EvolutionSettings) -> Result<SimEvent> {
        let mut manager = EvolutionManager::new(settings, self.episode.clone(), self.next_seed())?;
        self.end_session();
        manager.start(&mut self.world, &mut self.scheduler)?;
        let event = SimEvent::GenerationStarted {
            generation: manager.generation(),
            population: manager.population().len(),
        };
        self.session = Session::Evolution(manager);
        Ok(event)
    }

    /// Cancels a running evolution; the manager stays inspectable in `Stopped`.
    pub fn stop_evolution(&mut self) -> Option<SimEvent> {
        let Session::Evolution(manager) = &mut self.session else {
            return None;
        };
        if manager.phase() != Phase::Running {
            return None;
        }
        let cancelled = manager.stop(&mut self.world, &mut self.scheduler);
        Some(SimEvent::EvolutionStopped {
            generation: manager.generation(),
            cancelled,
        })
    }

    pub fn start_baseline(&mut self) -> Result<SimEvent> {
        self.end_session();
        let mut agent = Agent::new(BASELINE_AGENT, 0, Policy::pid(&self.config.pid));
        agent.start(&mut self.world, &mut self.scheduler, &self.episode)?;
        info!("baseline started with target position {}", self.config.pid.target_position);
        self.session = Session::Baseline(agent);
        Ok(SimEvent::BaselineStarted {
            target_position: self.config.pid.target_position,
        })
    }

    /// Moves the baseline's set point. Returns `false` when no baseline is running.
    pub fn set_target_position(&mut self, target: f32) -> bool {
        match &mut self.session {
            Session::Baseline(agent) if agent.is_running() => {
                agent.policy_mut().set_target_position(target)
            }
            _ => false,
        }
    }

    pub fn push(&mut self, direction: Direction) -> Result<usize> {
        let robots = match &self.session {
            Session::Idle => Vec::new(),
            Session::Evolution(manager) => manager.running_robots(),
            Session::Baseline(agent) => agent.robot().into_iter().collect(),
        };
        let impulse = direction.sign() * self.config.control.push_impulse;
        for robot in &robots {
            self.world.apply_impulse(*robot, Part::Cart, [impulse, 0.0])?;
        }
        Ok(robots.len())
    }

    fn end_session(&mut self) {
        match mem::replace(&mut self.session, Session::Idle) {
            Session::Idle => {}
            Session::Evolution(mut manager) => {
                manager.stop(&mut self.world, &mut self.scheduler);
            }
            Session::Baseline(mut agent) => {
                agent.cancel(&mut self.world, &mut self.scheduler);
            }
        }
    }

    fn next_seed(&mut self) -> u64 {
        self.runs += 1;
        self.config.seed.wrapping_add(self.runs.wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }
}

fn push_progress(manager: &EvolutionManager, progress: Progress, events: &mut Vec<SimEvent>) {
    let (termination, summary) = match progress {
        Progress::Ignored => return,
        Progress::Counted { termination, .. } => (termination, None),
        Progress::GenerationComplete {
            termination,
            summary,
        }
        | Progress::Finished {
            termination,
            summary,
        } => (termination, Some(summary)),
    };
    events.push(SimEvent::AgentTerminated {
        generation: termination.generation,
        agent: termination.agent.0,
        fitness: termination.fitness,
        cause: termination.cause,
    });
    let Some(summary) = summary else {
        return;
    };
    if manager.phase() == Phase::Done {
        let champion = manager.champion();
        events.push(SimEvent::EvolutionFinished {
            summary,
            champion_fitness: champion.map(|champion| champion.fitness),
            champion_parameters: champion.map(|champion| champion.parameters.clone()),
        });
    } else {
        events.push(SimEvent::GenerationComplete { summary });
        events.push(SimEvent::GenerationStarted {
            generation: manager.generation(),
            population: manager.population().len(),
        });
    }
}
