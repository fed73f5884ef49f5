use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::{Tensor, ensure_same_shapes};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Tanh,
    Relu,
}

impl Activation {
    fn apply(self, value: f32) -> f32 {
        match self {
            Self::Tanh => value.tanh(),
            Self::Relu => value.max(0.0),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkLayout {
    pub inputs: usize,
    pub hidden: Vec<usize>,
    pub outputs: usize,
    pub activation: Activation,
}

impl Default for NetworkLayout {
    fn default() -> Self {
        Self {
            inputs: 4,
            hidden: vec![16, 8],
            outputs: 1,
            activation: Activation::Tanh,
        }
    }
}

impl NetworkLayout {
    /// `(fan_in, fan_out)` of every dense layer, output layer last.
    fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.hidden.len() + 1);
        let mut fan_in = self.inputs;
        for &units in self.hidden.iter().chain(std::iter::once(&self.outputs)) {
            dims.push((fan_in, units));
            fan_in = units;
        }
        dims
    }

    pub fn parameter_count(&self) -> usize {
        self.layer_dims()
            .iter()
            .map(|(fan_in, fan_out)| fan_in * fan_out + fan_out)
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct FeedForward {
    layout: NetworkLayout,
    parameters: Vec<Tensor>,
}

impl FeedForward {
    /// Glorot-uniform kernels and zero biases.
    pub fn random<R: Rng + ?Sized>(layout: NetworkLayout, rng: &mut R) -> Self {
        let mut parameters = Vec::new();
        for (fan_in, fan_out) in layout.layer_dims() {
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            parameters.push(Tensor::from_fn(vec![fan_in, fan_out], || {
                rng.random_range(-limit..limit)
            }));
            parameters.push(Tensor::zeros(vec![fan_out]));
        }
        Self { layout, parameters }
    }

    pub fn zeroed(layout: NetworkLayout) -> Self {
        let parameters = layout
            .layer_dims()
            .into_iter()
            .flat_map(|(fan_in, fan_out)| {
                [
                    Tensor::zeros(vec![fan_in, fan_out]),
                    Tensor::zeros(vec![fan_out]),
                ]
            })
            .collect();
        Self { layout, parameters }
    }

    pub fn layout(&self) -> &NetworkLayout {
        &self.layout
    }

    pub fn parameters(&self) -> &[Tensor] {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: Vec<Tensor>) -> Result<()> {
        ensure_same_shapes(&self.parameters, &parameters)?;
        self.parameters = parameters;
        Ok(())
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let layer_count = self.parameters.len() / 2;
        let mut activations: Vec<f32> = input.to_vec();
        for (layer, pair) in self.parameters.chunks_exact(2).enumerate() {
            let (kernel, bias) = (&pair[0], &pair[1]);
            let fan_out = bias.len();
            let mut next = bias.values().to_vec();
            for (i, &x) in activations.iter().enumerate() {
                let row = &kernel.values()[i * fan_out..(i + 1) * fan_out];
                for (out, &w) in next.iter_mut().zip(row) {
                    *out += x * w;
                }
            }
            let activation = if layer + 1 == layer_count {
                Activation::Tanh
            } else {
                self.layout.activation
            };
            for value in &mut next {
                *value = activation.apply(*value);
            }
            activations = next;
        }
        activations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn default_layout_has_six_tensors() {
        let net = FeedForward::zeroed(NetworkLayout::default());
        assert_eq!(
            crate::tensor::shapes_of(net.parameters()),
            vec![vec![4, 16], vec![16], vec![16, 8], vec![8], vec![8, 1], vec![1]]
        );
        assert_eq!(NetworkLayout::default().parameter_count(), 64 + 16 + 128 + 8 + 8 + 1);
    }

    #[test]
    fn zero_network_outputs_zero() {
        let net = FeedForward::zeroed(NetworkLayout::default());
        assert_eq!(net.forward(&[1.0, -1.0, 0.5, 0.2]), vec![0.0]);
    }

    #[test]
    fn random_init_keeps_biases_zero_and_kernels_within_glorot_limit() {
        let mut rng = SmallRng::seed_from_u64(7);
        let net = FeedForward::random(NetworkLayout::default(), &mut rng);
        let first_limit = (6.0f32 / 20.0).sqrt();
        assert!(net.parameters()[0].values().iter().all(|w| w.abs() <= first_limit));
        assert!(net.parameters()[0].values().iter().any(|w| *w != 0.0));
        assert!(net.parameters()[1].values().iter().all(|b| *b == 0.0));
    }

    #[test]
    fn set_parameters_rejects_wrong_shapes_and_keeps_previous_values() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut net = FeedForward::random(NetworkLayout::default(), &mut rng);
        let before = net.parameters().to_vec();
        let mut wrong = before.clone();
        wrong.pop();
        assert!(net.set_parameters(wrong).is_err());
        assert_eq!(net.parameters(), &before[..]);
    }

    #[test]
    fn single_unit_network_computes_expected_value() {
        let layout = NetworkLayout {
            inputs: 2,
            hidden: vec![],
            outputs: 1,
            activation: Activation::Relu,
        };
        let mut net = FeedForward::zeroed(layout);
        net.set_parameters(vec![
            Tensor::new(vec![2, 1], vec![0.5, -0.25]).unwrap(),
            Tensor::new(vec![1], vec![0.1]).unwrap(),
        ])
        .unwrap();
        let out = net.forward(&[1.0, 2.0]);
        assert!((out[0] - (0.5f32 - 0.5 + 0.1).tanh()).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn output_stays_within_unit_interval(
            seed in any::<u64>(),
            input in proptest::collection::vec(-50.0f32..50.0, 4),
        ) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let net = FeedForward::random(NetworkLayout::default(), &mut rng);
            let out = net.forward(&input);
            prop_assert_eq!(out.len(), 1);
            prop_assert!(out[0].is_finite() && (-1.0..=1.0).contains(&out[0]));
        }
    }
}
