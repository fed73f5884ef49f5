use std::collections::{HashMap, HashSet};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentId, EpisodeConfig, Termination, TerminationCause};
use crate::config::EvolutionSettings;
use crate::error::{Error, Result};
use crate::genetic::{Candidate, GeneticAlgorithm};
use crate::policy::Policy;
use crate::scheduler::Scheduler;
use crate::tensor::Tensor;
use crate::world::{PhysicsWorld, RobotId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Done,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub generation: u32,
    pub population: usize,
    pub best_fitness: f32,
    pub mean_fitness: f32,
    pub worst_fitness: f32,
    pub elite_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Champion {
    pub generation: u32,
    pub fitness: f32,
    pub parameters: Vec<Tensor>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    Ignored,
    Counted {
        termination: Termination,
        completed: usize,
    },
    GenerationComplete {
        termination: Termination,
        summary: GenerationSummary,
    },
    Finished {
        termination: Termination,
        summary: GenerationSummary,
    },
}

pub struct EvolutionManager {
    settings: EvolutionSettings,
    episode: EpisodeConfig,
    ga: GeneticAlgorithm,
    rng: SmallRng,
    phase: Phase,
    generation: u32,
    population: Vec<Agent>,
    by_agent: HashMap<AgentId, usize>,
    by_robot: HashMap<RobotId, usize>,
    counted: HashSet<AgentId>,
    next_agent: u64,
    history: Vec<GenerationSummary>,
    champion: Option<Champion>,
    final_parameters: Option<Vec<Vec<Tensor>>>,
}

impl EvolutionManager {
    pub fn new(settings: EvolutionSettings, episode: EpisodeConfig, seed: u64) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            ga: GeneticAlgorithm::from_settings(&settings),
            settings,
            episode,
            rng: SmallRng::seed_from_u64(seed),
            phase: Phase::Idle,
            generation: 0,
            population: Vec::new(),
            by_agent: HashMap::new(),
            by_robot: HashMap::new(),
            counted: HashSet::new(),
            next_agent: 0,
            history: Vec::new(),
            champion: None,
            final_parameters: None,
        })
    }

    pub fn settings(&self) -> &EvolutionSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn population(&self) -> &[Agent] {
        &self.population
    }

    pub fn terminations(&self) -> usize {
        self.counted.len()
    }

    pub fn history(&self) -> &[GenerationSummary] {
        &self.history
    }

    pub fn champion(&self) -> Option<&Champion> {
        self.champion.as_ref()
    }

    /// Parameter sets bred after the final generation; never instantiated.
    pub fn final_parameters(&self) -> Option<&[Vec<Tensor>]> {
        self.final_parameters.as_deref()
    }

    pub fn running_robots(&self) -> Vec<RobotId> {
        self.population.iter().filter_map(Agent::robot).collect()
    }

    pub fn start(&mut self, world: &mut PhysicsWorld, scheduler: &mut Scheduler) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::InvalidPhase("start evolution"));
        }
        let mut population = Vec::with_capacity(self.settings.population_size);
        for _ in 0..self.settings.population_size {
            let policy = Policy::random_network(self.settings.network.clone(), &mut self.rng);
            population.push(Agent::new(self.allocate_id(), 0, policy));
        }
        self.generation = 0;
        self.phase = Phase::Running;
        info!(
            "evolution started: population {}, mutation rate {}, {} generations",
            self.settings.population_size, self.settings.mutation_rate, self.settings.total_generations
        );
        self.launch(population, world, scheduler)
    }

    pub fn tick(
        &mut self,
        agent: AgentId,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
    ) -> Result<Option<Progress>> {
        let Some(&index) = self.by_agent.get(&agent) else {
            return Ok(None);
        };
        let now = scheduler.now();
        let member = &mut self.population[index];
        member.tick(world, now, &self.episode)?;
        if !member.timed_out(now, &self.episode.control) {
            return Ok(None);
        }
        match member.terminate(world, scheduler, now, TerminationCause::TimedOut) {
            Some(termination) => self.on_termination(termination, world, scheduler).map(Some),
            None => Ok(None),
        }
    }

    pub fn robot_fell(
        &mut self,
        robot: RobotId,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
    ) -> Result<Option<Progress>> {
        let Some(&index) = self.by_robot.get(&robot) else {
            return Ok(None);
        };
        let now = scheduler.now();
        match self.population[index].terminate(world, scheduler, now, TerminationCause::Fell) {
            Some(termination) => self.on_termination(termination, world, scheduler).map(Some),
            None => Ok(None),
        }
    }

    pub fn on_termination(
        &mut self,
        termination: Termination,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
    ) -> Result<Progress> {
        if self.phase != Phase::Running || termination.generation != self.generation {
            debug!(
                "ignoring termination of {} from generation {} (current {})",
                termination.agent, termination.generation, self.generation
            );
            return Ok(Progress::Ignored);
        }
        if !self.by_agent.contains_key(&termination.agent) {
            return Ok(Progress::Ignored);
        }
        if !self.counted.insert(termination.agent) {
            return Err(Error::DoubleTermination(termination.agent));
        }

        let completed = self.counted.len();
        if completed < self.population.len() {
            return Ok(Progress::Counted {
                termination,
                completed,
            });
        }

        let summary = self.complete_generation(world, scheduler)?;
        if self.phase == Phase::Done {
            Ok(Progress::Finished {
                termination,
                summary,
            })
        } else {
            Ok(Progress::GenerationComplete {
                termination,
                summary,
            })
        }
    }

    pub fn stop(&mut self, world: &mut PhysicsWorld, scheduler: &mut Scheduler) -> usize {
        if self.phase != Phase::Running {
            return 0;
        }
        let mut cancelled = 0;
        for agent in &mut self.population {
            if agent.cancel(world, scheduler) {
                cancelled += 1;
            }
        }
        self.by_robot.clear();
        self.by_agent.clear();
        self.counted.clear();
        self.phase = Phase::Stopped;
        info!(
            "evolution stopped in generation {}: {cancelled} agents cancelled",
            self.generation
        );
        cancelled
    }

    fn complete_generation(
        &mut self,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
    ) -> Result<GenerationSummary> {
        let fitness: Vec<f32> = self
            .population
            .iter()
            .map(Agent::fitness)
            .collect::<Result<_>>()?;
        let candidates: Vec<Candidate<'_>> = self
            .population
            .iter()
            .zip(&fitness)
            .map(|(agent, fitness)| Candidate {
                parameters: agent.policy().parameters(),
                fitness: *fitness,
            })
            .collect();
        let next = self.ga.next_generation(&candidates, &mut self.rng)?;

        let (best_index, best_fitness) = fitness
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (index, value)| {
                if value > best.1 { (index, value) } else { best }
            });
        let summary = GenerationSummary {
            generation: self.generation,
            population: fitness.len(),
            best_fitness,
            mean_fitness: fitness.iter().sum::<f32>() / fitness.len() as f32,
            worst_fitness: fitness.iter().copied().fold(f32::INFINITY, f32::min),
            elite_count: self.ga.elite_count(fitness.len()),
        };
        let improved = self
            .champion
            .as_ref()
            .is_none_or(|champion| best_fitness > champion.fitness);
        if improved {
            self.champion = Some(Champion {
                generation: self.generation,
                fitness: best_fitness,
                parameters: self.population[best_index].policy().parameters().to_vec(),
            });
        }
        info!(
            "generation {} complete: best {:.2}s, mean {:.2}s, worst {:.2}s",
            summary.generation, summary.best_fitness, summary.mean_fitness, summary.worst_fitness
        );
        self.history.push(summary.clone());

        self.generation += 1;
        self.counted.clear();
        self.by_agent.clear();
        self.by_robot.clear();

        if self.generation >= self.settings.total_generations {
            self.population.clear();
            self.final_parameters = Some(next);
            self.phase = Phase::Done;
            info!(
                "evolution finished after {} generations; champion fitness {:.2}s",
                self.generation,
                self.champion.as_ref().map_or(0.0, |champion| champion.fitness)
            );
            return Ok(summary);
        }

        let mut population = Vec::with_capacity(next.len());
        for parameters in next {
            let policy = Policy::network_with(self.settings.network.clone(), parameters)?;
            population.push(Agent::new(self.allocate_id(), self.generation, policy));
        }
        self.launch(population, world, scheduler)?;
        Ok(summary)
    }

    fn launch(
        &mut self,
        population: Vec<Agent>,
        world: &mut PhysicsWorld,
        scheduler: &mut Scheduler,
    ) -> Result<()> {
        self.population = population;
        self.by_agent.clear();
        self.by_robot.clear();
        for index in 0..self.population.len() {
            let agent = &mut self.population[index];
            match agent.start(world, scheduler, &self.episode) {
                Ok(robot) => {
                    self.by_agent.insert(agent.id(), index);
                    self.by_robot.insert(robot, index);
                }
                Err(err) => {
                    for agent in &mut self.population {
                        agent.cancel(world, scheduler);
                    }
                    self.by_agent.clear();
                    self.by_robot.clear();
                    self.phase = Phase::Stopped;
                    warn!("generation {} failed to launch: {err}", self.generation);
                    return Err(err);
                }
            }
        }
        debug!(
            "generation {} launched with {} agents",
            self.generation,
            self.population.len()
        );
        Ok(())
    }

    fn allocate_id(&mut self) -> AgentId {
        let id = AgentId(self.next_agent);
        self.next_agent += 1;
        id
    }
}
