use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use pendulum_evo::{Direction, RunSpeed, SimEvent, Trainer, TrainerConfig, TrainerEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pendulum-evo",
    version,
    about = "Balance inverted pendulums with a PID baseline or evolved network policies"
)]
struct Cli {
    /// JSON config file; fields it omits keep their defaults.
    #[arg(long, env = "PENDULUM_CONFIG")]
    config: Option<PathBuf>,

    /// Pace the simulation to wall-clock time instead of running flat out.
    #[arg(long)]
    realtime: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evolve network policies until the configured generation count is reached.
    Train {
        #[arg(long)]
        population: Option<usize>,
        #[arg(long)]
        mutation_rate: Option<f32>,
        #[arg(long)]
        generations: Option<u32>,
    },
    /// Run the cascaded PID controller on a single robot.
    Baseline {
        /// Cart set point in metres.
        #[arg(long, allow_hyphen_values = true)]
        target: Option<f32>,
        /// Wall-clock seconds to run before stopping; runs until a fall when omitted.
        #[arg(long)]
        seconds: Option<f32>,
        /// Give the cart a shove once it is running.
        #[arg(long, value_parser = parse_direction)]
        push: Option<Direction>,
    },
}

fn parse_direction(raw: &str) -> std::result::Result<Direction, String> {
    match raw.to_ascii_lowercase().as_str() {
        "left" | "l" => Ok(Direction::Left),
        "right" | "r" => Ok(Direction::Right),
        _ => Err(format!("expected 'left' or 'right', got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => TrainerConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrainerConfig::default(),
    };
    config.apply_env_overrides();
    if cli.realtime {
        config.run_speed = RunSpeed::Realtime;
    }

    match cli.command {
        Command::Train {
            population,
            mutation_rate,
            generations,
        } => {
            if let Some(population) = population {
                config.evolution.population_size = population;
            }
            if let Some(mutation_rate) = mutation_rate {
                config.evolution.mutation_rate = mutation_rate;
            }
            if let Some(generations) = generations {
                config.evolution.total_generations = generations;
            }
            train(config).await
        }
        Command::Baseline {
            target,
            seconds,
            push,
        } => baseline(config, target, seconds, push).await,
    }
}

async fn train(config: TrainerConfig) -> Result<()> {
    let (trainer, worker) = Trainer::spawn(config).context("invalid trainer configuration")?;
    let mut events = trainer.subscribe();
    let settings = trainer.config().evolution.clone();
    trainer.start_evolution(
        settings.population_size,
        settings.mutation_rate,
        settings.total_generations,
    );

    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; stopping evolution");
                trainer.stop_evolution();
                break;
            }
            received = events.recv() => match received {
                Ok(TrainerEvent::Simulation {
                    event: SimEvent::EvolutionFinished {
                        summary,
                        champion_fitness,
                        champion_parameters,
                    },
                }) => {
                    let scalars: usize = champion_parameters
                        .iter()
                        .flatten()
                        .map(|tensor| tensor.values().len())
                        .sum();
                    info!(
                        "training finished: last generation mean {:.2}s, champion {:.2}s over {scalars} parameters",
                        summary.mean_fitness,
                        champion_fitness.unwrap_or_default()
                    );
                    break;
                }
                Ok(TrainerEvent::Error { message }) => {
                    failure = Some(message);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("event stream lagged by {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    trainer.shutdown();
    worker
        .join()
        .map_err(|_| anyhow!("trainer worker panicked"))?;
    if let Some(message) = failure {
        bail!("training aborted: {message}");
    }
    Ok(())
}

async fn baseline(
    config: TrainerConfig,
    target: Option<f32>,
    seconds: Option<f32>,
    push: Option<Direction>,
) -> Result<()> {
    let limit = time_limit(seconds)?;
    let (trainer, worker) = Trainer::spawn(config).context("invalid trainer configuration")?;
    let mut events = trainer.subscribe();
    trainer.start_baseline();
    if let Some(target) = target {
        trainer.set_target_position(target);
    }
    if let Some(direction) = push {
        trainer.push(direction);
    }

    let limit = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(limit);

    loop {
        tokio::select! {
            _ = &mut limit => {
                info!("time limit reached");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break;
            }
            received = events.recv() => match received {
                Ok(TrainerEvent::Simulation {
                    event: SimEvent::BaselineTerminated { fitness, cause },
                }) => {
                    info!("baseline ended ({cause:?}) after {fitness:.2}s of simulated time");
                    break;
                }
                Ok(TrainerEvent::Error { message }) => warn!("trainer reported: {message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("event stream lagged by {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    let status = trainer.status();
    info!("baseline stopped at t={:.2}s", status.sim_time);
    trainer.shutdown();
    worker
        .join()
        .map_err(|_| anyhow!("trainer worker panicked"))?;
    Ok(())
}

fn time_limit(seconds: Option<f32>) -> Result<Option<Duration>> {
    seconds
        .map(|seconds| Duration::try_from_secs_f32(seconds.max(0.0)))
        .transpose()
        .context("invalid --seconds value")
}
