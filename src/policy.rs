use std::f32::consts::PI;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::{FeedForward, NetworkLayout};
use crate::pid::{CascadedPid, PidConfig, PidGains};
use crate::tensor::{Tensor, ensure_same_shapes, shapes_of};

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq)]
pub struct RobotState {
    pub cart_position: f32,
    pub cart_velocity: f32,
    /// Pendulum angle from vertical, positive when the head leans toward +x.
    pub angle: f32,
    pub angular_velocity: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservationScale {
    pub position_center: f32,
    pub position: f32,
    pub velocity: f32,
    pub angle: f32,
    pub angular_velocity: f32,
}

impl Default for ObservationScale {
    fn default() -> Self {
        Self {
            position_center: 0.0,
            position: 4.0,
            velocity: 5.0,
            angle: PI,
            angular_velocity: 10.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub raw: RobotState,
    /// `[position, angle, velocity, angular_velocity]`, scaled.
    pub normalized: [f32; 4],
}

impl Observation {
    pub fn new(raw: RobotState, scale: &ObservationScale) -> Self {
        let normalized = [
            (raw.cart_position - scale.position_center) / scale.position,
            raw.angle / scale.angle,
            raw.cart_velocity / scale.velocity,
            raw.angular_velocity / scale.angular_velocity,
        ];
        Self { raw, normalized }
    }
}

#[derive(Clone, Debug)]
pub enum Policy {
    Network(FeedForward),
    Pid(PidPolicy),
}

impl Policy {
    pub fn random_network<R: Rng + ?Sized>(layout: NetworkLayout, rng: &mut R) -> Self {
        Self::Network(FeedForward::random(layout, rng))
    }

    pub fn network_with(layout: NetworkLayout, parameters: Vec<Tensor>) -> Result<Self> {
        let mut network = FeedForward::zeroed(layout);
        network.set_parameters(parameters)?;
        Ok(Self::Network(network))
    }

    pub fn pid(config: &PidConfig) -> Self {
        Self::Pid(PidPolicy::new(config))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Pid(_) => "pid",
        }
    }

    pub fn parameters(&self) -> &[Tensor] {
        match self {
            Self::Network(network) => network.parameters(),
            Self::Pid(pid) => &pid.parameters,
        }
    }

    pub fn set_parameters(&mut self, parameters: Vec<Tensor>) -> Result<()> {
        match self {
            Self::Network(network) => network.set_parameters(parameters),
            Self::Pid(pid) => pid.set_parameters(parameters),
        }
    }

    pub fn evaluate(&mut self, observation: &Observation, dt: f32) -> f32 {
        match self {
            Self::Network(network) => network
                .forward(&observation.normalized)
                .first()
                .copied()
                .unwrap_or(0.0),
            Self::Pid(pid) => {
                pid.cascade
                    .update(observation.raw.cart_position, observation.raw.angle, dt)
            }
        }
    }

    /// Only meaningful for the PID baseline; returns `false` for other kinds.
    pub fn set_target_position(&mut self, target: f32) -> bool {
        match self {
            Self::Pid(pid) => {
                pid.cascade.set_target_position(target);
                true
            }
            Self::Network(_) => false,
        }
    }
}

/// Cascaded PID exposed as two gain tensors of shape `[3]`: angle loop, then position loop.
#[derive(Clone, Debug)]
pub struct PidPolicy {
    cascade: CascadedPid,
    parameters: Vec<Tensor>,
}

impl PidPolicy {
    pub fn new(config: &PidConfig) -> Self {
        let parameters = [config.angle_gains, config.position_gains]
            .into_iter()
            .map(|gains| Tensor::vector(gains.to_array().to_vec()))
            .collect();
        Self {
            cascade: CascadedPid::new(config),
            parameters,
        }
    }

    pub fn cascade(&self) -> &CascadedPid {
        &self.cascade
    }

    fn set_parameters(&mut self, parameters: Vec<Tensor>) -> Result<()> {
        ensure_same_shapes(&self.parameters, &parameters)?;
        let (Some(angle), Some(position)) = (
            PidGains::from_slice(parameters[0].values()),
            PidGains::from_slice(parameters[1].values()),
        ) else {
            return Err(Error::ShapeMismatch {
                expected: shapes_of(&self.parameters),
                actual: shapes_of(&parameters),
            });
        };
        self.cascade.set_gains(angle, position);
        self.parameters = parameters;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn observation(angle: f32) -> Observation {
        Observation::new(
            RobotState {
                cart_position: 0.0,
                cart_velocity: 0.0,
                angle,
                angular_velocity: 0.0,
            },
            &ObservationScale::default(),
        )
    }

    #[test]
    fn parameters_are_idempotent_between_reads() {
        let mut rng = SmallRng::seed_from_u64(11);
        let policy = Policy::random_network(NetworkLayout::default(), &mut rng);
        let first = policy.parameters().to_vec();
        let second = policy.parameters().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn set_parameters_mismatch_leaves_prior_parameters() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut policy = Policy::random_network(NetworkLayout::default(), &mut rng);
        let before = policy.parameters().to_vec();
        let err = policy
            .set_parameters(vec![Tensor::zeros(vec![4, 16])])
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(policy.parameters(), &before[..]);
    }

    #[test]
    fn network_with_propagates_shape_mismatch() {
        let result = Policy::network_with(NetworkLayout::default(), vec![Tensor::zeros(vec![3])]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn pid_policy_exposes_two_gain_tensors() {
        let config = PidConfig::default();
        let policy = Policy::pid(&config);
        assert_eq!(shapes_of(policy.parameters()), vec![vec![3], vec![3]]);
        assert_eq!(policy.parameters()[0].values(), &config.angle_gains.to_array());
        assert_eq!(policy.parameters()[1].values(), &config.position_gains.to_array());
    }

    #[test]
    fn pid_set_parameters_replaces_gains() {
        let mut policy = Policy::pid(&PidConfig::default());
        policy
            .set_parameters(vec![
                Tensor::new(vec![3], vec![1.0, 0.0, 0.0]).unwrap(),
                Tensor::new(vec![3], vec![0.0, 0.0, 0.0]).unwrap(),
            ])
            .unwrap();
        let out = policy.evaluate(&observation(0.25), 0.02);
        assert!((out - 0.25).abs() < 1e-6);
    }

    #[test]
    fn normalization_uses_fixed_scales() {
        let obs = Observation::new(
            RobotState {
                cart_position: 2.0,
                cart_velocity: -2.5,
                angle: PI / 2.0,
                angular_velocity: 5.0,
            },
            &ObservationScale::default(),
        );
        assert_eq!(obs.normalized, [0.5, 0.5, -0.5, 0.5]);
    }

    #[test]
    fn target_position_only_applies_to_pid() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut network = Policy::random_network(NetworkLayout::default(), &mut rng);
        assert!(!network.set_target_position(1.0));
        let mut pid = Policy::pid(&PidConfig::default());
        assert!(pid.set_target_position(1.0));
    }
}
