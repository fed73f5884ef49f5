use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{RunSpeed, TrainerConfig};
use crate::error::Result;
use crate::evolution::Phase;
use crate::simulation::{Direction, Session, SimEvent, Simulation};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const FAST_BATCH_STEPS: usize = 240;
const REALTIME_FRAME_SECONDS: f32 = 1.0 / 60.0;
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    StartEvolution {
        population_size: usize,
        mutation_rate: f32,
        total_generations: u32,
    },
    StopEvolution,
    StartBaseline,
    SetTargetPosition(f32),
    Push(Direction),
    Shutdown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Idle,
    Evolution,
    Baseline,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainerStatus {
    pub session: SessionKind,
    pub active: bool,
    pub sim_time: f64,
    pub phase: Option<Phase>,
    pub generation: u32,
    pub total_generations: u32,
    pub population_size: usize,
    pub terminations: usize,
    pub running_robots: usize,
    pub champion_fitness: Option<f32>,
    pub last_mean_fitness: Option<f32>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrainerEvent {
    Status { status: TrainerStatus },
    Simulation { event: SimEvent },
    Error { message: String },
}

/// Handle to the simulation thread. Commands queue up and are applied between step batches.
pub struct Trainer {
    config: TrainerConfig,
    commands: Mutex<VecDeque<Command>>,
    shared: Mutex<TrainerStatus>,
    events: broadcast::Sender<TrainerEvent>,
}

impl Trainer {
    pub fn spawn(config: TrainerConfig) -> Result<(Arc<Self>, JoinHandle<()>)> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let trainer = Arc::new(Self {
            config,
            commands: Mutex::new(VecDeque::new()),
            shared: Mutex::new(TrainerStatus::default()),
            events,
        });
        let worker = Arc::clone(&trainer);
        let handle = std::thread::spawn(move || run_worker(worker));
        Ok((trainer, handle))
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrainerEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> TrainerStatus {
        self.shared
            .lock()
            .expect("trainer status mutex poisoned")
            .clone()
    }

    pub fn start_evolution(&self, population_size: usize, mutation_rate: f32, total_generations: u32) {
        self.enqueue(Command::StartEvolution {
            population_size,
            mutation_rate,
            total_generations,
        });
    }

    pub fn stop_evolution(&self) {
        self.enqueue(Command::StopEvolution);
    }

    pub fn start_baseline(&self) {
        self.enqueue(Command::StartBaseline);
    }

    pub fn set_target_position(&self, target: f32) {
        self.enqueue(Command::SetTargetPosition(target));
    }

    pub fn push(&self, direction: Direction) {
        self.enqueue(Command::Push(direction));
    }

    pub fn shutdown(&self) {
        self.enqueue(Command::Shutdown);
    }

    fn enqueue(&self, command: Command) {
        self.commands
            .lock()
            .expect("trainer command mutex poisoned")
            .push_back(command);
    }

    fn drain_commands(&self) -> Vec<Command> {
        self.commands
            .lock()
            .expect("trainer command mutex poisoned")
            .drain(..)
            .collect()
    }

    fn update_status(&self, status: TrainerStatus) {
        {
            let mut shared = self.shared.lock().expect("trainer status mutex poisoned");
            *shared = status.clone();
        }
        self.publish(TrainerEvent::Status { status });
    }

    fn publish(&self, event: TrainerEvent) {
        // No subscribers is fine; the status mutex still holds the latest state.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, message: String) {
        error!("{message}");
        self.publish(TrainerEvent::Error { message });
    }
}

fn run_worker(trainer: Arc<Trainer>) {
    let mut sim = Simulation::new(trainer.config.clone());
    let dt = sim.world().dt();
    let realtime_steps = ((REALTIME_FRAME_SECONDS / dt).round() as usize).max(1);
    let mut pacing_anchor: Option<(Instant, usize)> = None;
    info!("trainer worker started (run speed {:?})", trainer.config.run_speed);

    loop {
        let mut changed = false;
        for command in trainer.drain_commands() {
            if command == Command::Shutdown {
                info!("trainer worker shutting down at t={:.2}s", sim.sim_time());
                return;
            }
            match apply_command(&mut sim, &trainer.config, command) {
                Ok(Some(event)) => trainer.publish(TrainerEvent::Simulation { event }),
                Ok(None) => {}
                Err(err) => trainer.emit_error(format!("command failed: {err}")),
            }
            changed = true;
            pacing_anchor = None;
        }

        if !sim.is_active() {
            if changed {
                trainer.update_status(status_of(&sim));
            }
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        let batch = match trainer.config.run_speed {
            RunSpeed::Realtime => realtime_steps,
            RunSpeed::Fast => FAST_BATCH_STEPS,
        };
        for _ in 0..batch {
            match sim.step() {
                Ok(events) => {
                    for event in events {
                        trainer.publish(TrainerEvent::Simulation { event });
                    }
                }
                Err(err) => {
                    trainer.emit_error(format!("simulation step failed: {err}"));
                    sim.stop_evolution();
                    break;
                }
            }
            if !sim.is_active() {
                break;
            }
        }
        trainer.update_status(status_of(&sim));

        if trainer.config.run_speed == RunSpeed::Realtime {
            let (started, steps_done) = pacing_anchor.get_or_insert_with(|| (Instant::now(), 0));
            *steps_done += batch;
            let target_elapsed = Duration::from_secs_f32(*steps_done as f32 * dt);
            let elapsed = started.elapsed();
            if target_elapsed > elapsed {
                std::thread::sleep(target_elapsed - elapsed);
            } else if elapsed - target_elapsed > Duration::from_secs(1) {
                warn!("simulation is running behind real time; resetting pacing");
                pacing_anchor = None;
            }
        }
    }
}

fn apply_command(sim: &mut Simulation, config: &TrainerConfig, command: Command) -> Result<Option<SimEvent>> {
    match command {
        Command::StartEvolution {
            population_size,
            mutation_rate,
            total_generations,
        } => {
            let mut settings = config.evolution.clone();
            settings.population_size = population_size;
            settings.mutation_rate = mutation_rate;
            settings.total_generations = total_generations;
            sim.start_evolution(settings).map(Some)
        }
        Command::StopEvolution => Ok(sim.stop_evolution()),
        Command::StartBaseline => sim.start_baseline().map(Some),
        Command::SetTargetPosition(target) => {
            if !sim.set_target_position(target) {
                warn!("target position {target} ignored: no baseline is running");
            }
            Ok(None)
        }
        Command::Push(direction) => {
            let pushed = sim.push(direction)?;
            info!("pushed {pushed} robots {direction:?}");
            Ok(None)
        }
        Command::Shutdown => Ok(None),
    }
}

fn status_of(sim: &Simulation) -> TrainerStatus {
    let mut status = TrainerStatus {
        active: sim.is_active(),
        sim_time: sim.sim_time(),
        running_robots: sim.world().robot_count(),
        ..TrainerStatus::default()
    };
    match sim.session() {
        Session::Idle => {}
        Session::Baseline(_) => status.session = SessionKind::Baseline,
        Session::Evolution(manager) => {
            status.session = SessionKind::Evolution;
            status.phase = Some(manager.phase());
            status.generation = manager.generation();
            status.total_generations = manager.settings().total_generations;
            status.population_size = manager.settings().population_size;
            status.terminations = manager.terminations();
            status.champion_fitness = manager.champion().map(|champion| champion.fitness);
            status.last_mean_fitness = manager.history().last().map(|summary| summary.mean_fitness);
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn quick_config() -> TrainerConfig {
        let mut config = TrainerConfig::default();
        config.control.episode_timeout_seconds = Some(0.5);
        config
    }

    fn wait_for<F>(rx: &mut broadcast::Receiver<TrainerEvent>, mut found: F) -> bool
    where
        F: FnMut(&TrainerEvent) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(60);
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(event) if found(&event) => return true,
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Closed) => return false,
            }
        }
        false
    }

    #[test]
    fn spawn_rejects_invalid_config() {
        let mut config = TrainerConfig::default();
        config.world.dt = 0.0;
        assert!(Trainer::spawn(config).is_err());
    }

    #[test]
    fn headless_evolution_reports_completion() {
        let (trainer, handle) = Trainer::spawn(quick_config()).unwrap();
        let mut rx = trainer.subscribe();
        trainer.start_evolution(4, 0.05, 2);
        let finished = wait_for(&mut rx, |event| {
            matches!(
                event,
                TrainerEvent::Simulation {
                    event: SimEvent::EvolutionFinished { .. }
                }
            )
        });
        assert!(finished);
        trainer.shutdown();
        handle.join().unwrap();
        let status = trainer.status();
        assert_eq!(status.session, SessionKind::Evolution);
        assert_eq!(status.phase, Some(Phase::Done));
        assert_eq!(status.generation, 2);
    }

    #[test]
    fn bad_start_command_surfaces_an_error_event() {
        let (trainer, handle) = Trainer::spawn(quick_config()).unwrap();
        let mut rx = trainer.subscribe();
        trainer.start_evolution(1, 0.05, 2);
        let errored = wait_for(&mut rx, |event| matches!(event, TrainerEvent::Error { .. }));
        assert!(errored);
        trainer.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn baseline_status_is_published() {
        let (trainer, handle) = Trainer::spawn(quick_config()).unwrap();
        let mut rx = trainer.subscribe();
        trainer.start_baseline();
        let seen = wait_for(&mut rx, |event| {
            matches!(
                event,
                TrainerEvent::Status { status } if status.session == SessionKind::Baseline
            )
        });
        assert!(seen);
        trainer.shutdown();
        handle.join().unwrap();
    }
}
