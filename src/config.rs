use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::network::NetworkLayout;
use crate::pid::PidConfig;
use crate::policy::ObservationScale;
use crate::world::{RobotConfig, WorldConfig};

pub const SEED_ENV_VAR: &str = "PENDULUM_SEED";
pub const RUN_SPEED_ENV_VAR: &str = "PENDULUM_RUN_SPEED";
const DEFAULT_SEED: u64 = 42;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSpeed {
    Realtime,
    #[default]
    Fast,
}

impl RunSpeed {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "realtime" | "real_time" | "1x" => Some(Self::Realtime),
            "fast" | "max" => Some(Self::Fast),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub frequency_hz: f32,
    /// Newtons applied to the cart for a policy output of 1.0.
    pub force_scale: f32,
    /// Episodes reaching this age end as timed out. `None` lets an episode run forever.
    pub episode_timeout_seconds: Option<f32>,
    /// Magnitude of a manual left/right push, as a horizontal impulse on the cart.
    pub push_impulse: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 50.0,
            force_scale: 15.0,
            episode_timeout_seconds: Some(60.0),
            push_impulse: 1.5,
        }
    }
}

impl ControlConfig {
    pub fn interval(&self) -> f32 {
        1.0 / self.frequency_hz
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolutionSettings {
    pub population_size: usize,
    /// Per-scalar mutation probability in `[0, 1]`.
    pub mutation_rate: f32,
    pub total_generations: u32,
    /// Share of each generation copied unchanged into the next one.
    pub elite_fraction: f32,
    /// Mutations add a uniform offset in `[-mutation_step, mutation_step]`.
    pub mutation_step: f32,
    pub network: NetworkLayout,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            population_size: 50,
            mutation_rate: 0.05,
            total_generations: 20,
            elite_fraction: 0.1,
            mutation_step: 0.05,
            network: NetworkLayout::default(),
        }
    }
}

impl EvolutionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.population_size < 2 {
            return Err(Error::PopulationTooSmall(self.population_size));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return invalid(format!(
                "mutation_rate must be within [0, 1]; got {}",
                self.mutation_rate
            ));
        }
        if !(0.0..=1.0).contains(&self.elite_fraction) {
            return invalid(format!(
                "elite_fraction must be within [0, 1]; got {}",
                self.elite_fraction
            ));
        }
        if !(self.mutation_step >= 0.0) {
            return invalid(format!(
                "mutation_step must be non-negative; got {}",
                self.mutation_step
            ));
        }
        if self.total_generations == 0 {
            return invalid("total_generations must be at least 1".to_string());
        }
        if self.network.inputs != 4 || self.network.outputs != 1 {
            return invalid(format!(
                "network must map 4 inputs to 1 output; got {} -> {}",
                self.network.inputs, self.network.outputs
            ));
        }
        if self.network.hidden.contains(&0) {
            return invalid("hidden layers must have at least one unit".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainerConfig {
    /// Seed for world perturbations and the genetic algorithm.
    pub seed: u64,
    pub run_speed: RunSpeed,
    pub world: WorldConfig,
    pub robot: RobotConfig,
    pub control: ControlConfig,
    pub observation: ObservationScale,
    pub evolution: EvolutionSettings,
    pub pid: PidConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            run_speed: RunSpeed::default(),
            world: WorldConfig::default(),
            robot: RobotConfig::default(),
            control: ControlConfig::default(),
            observation: ObservationScale::default(),
            evolution: EvolutionSettings::default(),
            pid: PidConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Applies `PENDULUM_SEED` and `PENDULUM_RUN_SPEED`; bad values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw_value) = lookup(SEED_ENV_VAR) {
            match raw_value.trim().parse::<u64>() {
                Ok(seed) => self.seed = seed,
                Err(_) => warn!(
                    "{SEED_ENV_VAR} must be an unsigned integer; got '{raw_value}'. Using {}",
                    self.seed
                ),
            }
        }
        if let Some(raw_value) = lookup(RUN_SPEED_ENV_VAR) {
            match RunSpeed::parse(&raw_value) {
                Some(speed) => self.run_speed = speed,
                None => warn!(
                    "{RUN_SPEED_ENV_VAR} must be 'realtime' or 'fast'; got '{raw_value}'. Using {:?}",
                    self.run_speed
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.world.dt > 0.0) {
            return invalid(format!("world.dt must be positive; got {}", self.world.dt));
        }
        if !(self.world.noise_interval_seconds > 0.0) {
            return invalid(format!(
                "world.noise_interval_seconds must be positive; got {}",
                self.world.noise_interval_seconds
            ));
        }
        if !(self.world.boundary_offset > self.robot.cart_width * 0.5) {
            return invalid("world.boundary_offset leaves no room for the cart".to_string());
        }
        if !(self.control.frequency_hz > 0.0) {
            return invalid(format!(
                "control.frequency_hz must be positive; got {}",
                self.control.frequency_hz
            ));
        }
        if let Some(timeout) = self.control.episode_timeout_seconds {
            if !(timeout > 0.0) {
                return invalid(format!(
                    "control.episode_timeout_seconds must be positive; got {timeout}"
                ));
            }
        }
        let robot = &self.robot;
        let sizes = [
            robot.cart_width,
            robot.cart_height,
            robot.cart_mass,
            robot.pendulum_length,
            robot.head_radius,
            robot.head_mass,
        ];
        if sizes.iter().any(|value| !(*value > 0.0)) {
            return invalid("robot dimensions and masses must be positive".to_string());
        }
        let scale = &self.observation;
        let divisors = [
            scale.position,
            scale.velocity,
            scale.angle,
            scale.angular_velocity,
        ];
        if divisors.iter().any(|value| *value == 0.0 || !value.is_finite()) {
            return invalid("observation scales must be finite and non-zero".to_string());
        }
        self.evolution.validate()
    }
}

fn invalid<T>(message: String) -> Result<T> {
    Err(Error::InvalidConfig(message))
}
