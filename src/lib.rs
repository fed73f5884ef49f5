pub mod agent;
pub mod config;
pub mod error;
pub mod evolution;
pub mod genetic;
pub mod network;
pub mod pid;
pub mod policy;
pub mod scheduler;
pub mod simulation;
pub mod tensor;
pub mod trainer;
pub mod world;

pub use agent::{Agent, AgentId, EpisodeConfig, Termination, TerminationCause};
pub use config::{ControlConfig, EvolutionSettings, RunSpeed, TrainerConfig};
pub use error::{Error, Result};
pub use evolution::{Champion, EvolutionManager, GenerationSummary, Phase, Progress};
pub use genetic::{Candidate, GeneticAlgorithm};
pub use policy::{Observation, ObservationScale, Policy, RobotState};
pub use simulation::{Direction, Session, SimEvent, Simulation};
pub use tensor::Tensor;
pub use trainer::{Trainer, TrainerEvent, TrainerStatus};
pub use world::{PhysicsWorld, RobotConfig, RobotId, WorldConfig};
