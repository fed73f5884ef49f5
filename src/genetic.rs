use rand::Rng;
use tracing::debug;

use crate::config::EvolutionSettings;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, ensure_same_shapes};

#[derive(Clone, Copy, Debug)]
pub struct Candidate<'a> {
    pub parameters: &'a [Tensor],
    pub fitness: f32,
}

/// Elitism plus uniform crossover of the two fittest parents, then per-scalar mutation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneticAlgorithm {
    pub mutation_rate: f32,
    pub elite_fraction: f32,
    pub mutation_step: f32,
}

impl Default for GeneticAlgorithm {
    fn default() -> Self {
        Self {
            mutation_rate: 0.05,
            elite_fraction: 0.1,
            mutation_step: 0.05,
        }
    }
}

impl GeneticAlgorithm {
    pub fn with_mutation_rate(mutation_rate: f32) -> Self {
        Self {
            mutation_rate,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &EvolutionSettings) -> Self {
        Self {
            mutation_rate: settings.mutation_rate,
            elite_fraction: settings.elite_fraction,
            mutation_step: settings.mutation_step,
        }
    }

    pub fn elite_count(&self, population: usize) -> usize {
        let count = (population as f64 * f64::from(self.elite_fraction)).floor();
        (count.max(0.0) as usize).min(population)
    }

    /// Produces exactly `candidates.len()` parameter sets for the next generation.
    ///
    /// Elites come first, in fitness order. Ties keep their input order.
    pub fn next_generation<R: Rng + ?Sized>(
        &self,
        candidates: &[Candidate<'_>],
        rng: &mut R,
    ) -> Result<Vec<Vec<Tensor>>> {
        let population = candidates.len();
        if population < 2 {
            return Err(Error::PopulationTooSmall(population));
        }
        let reference = candidates[0].parameters;
        for candidate in &candidates[1..] {
            ensure_same_shapes(reference, candidate.parameters)?;
        }

        let mut ranked: Vec<&Candidate<'_>> = candidates.iter().collect();
        ranked.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));

        let elites = self.elite_count(population);
        let mut next: Vec<Vec<Tensor>> = Vec::with_capacity(population);
        next.extend(ranked[..elites].iter().map(|elite| elite.parameters.to_vec()));

        let (mother, father) = (ranked[0].parameters, ranked[1].parameters);
        while next.len() < population {
            let mut child = crossover(mother, father, rng);
            self.mutate(&mut child, rng);
            next.push(child);
        }
        debug!(
            "bred {population} parameter sets: {elites} elites, parents fitness {:.3} and {:.3}",
            ranked[0].fitness, ranked[1].fitness
        );
        Ok(next)
    }

    fn mutate<R: Rng + ?Sized>(&self, child: &mut [Tensor], rng: &mut R) {
        let step = self.mutation_step.abs();
        for tensor in child {
            for value in tensor.values_mut() {
                if rng.random::<f32>() < self.mutation_rate {
                    *value += rng.random_range(-step..=step);
                }
            }
        }
    }
}

fn crossover<R: Rng + ?Sized>(mother: &[Tensor], father: &[Tensor], rng: &mut R) -> Vec<Tensor> {
    mother
        .iter()
        .zip(father)
        .map(|(a, b)| {
            let mut child = a.clone();
            for (value, other) in child.values_mut().iter_mut().zip(b.values()) {
                if rng.random_bool(0.5) {
                    *value = *other;
                }
            }
            child
        })
        .collect()
}
