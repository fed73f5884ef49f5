use thiserror::Error;

use crate::agent::AgentId;
use crate::world::RobotId;

/// Errors raised by policies, agents, the physics adapter and the trainer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parameter shapes {actual:?} do not match architecture {expected:?}")]
    ShapeMismatch {
        expected: Vec<Vec<usize>>,
        actual: Vec<Vec<usize>>,
    },
    #[error("required world mount point `{0}` is missing")]
    MissingContainer(&'static str),
    #[error("agent {0} terminated more than once")]
    DoubleTermination(AgentId),
    #[error("agent {0} has no recorded fitness")]
    MissingFitness(AgentId),
    #[error("population of {0} is too small; at least 2 individuals are required")]
    PopulationTooSmall(usize),
    #[error("robot {0} is not present in the world")]
    UnknownRobot(RobotId),
    #[error("agent {0} was already started")]
    AlreadyStarted(AgentId),
    #[error("cannot {0} in the current phase")]
    InvalidPhase(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
