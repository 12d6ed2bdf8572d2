//! Randomness streams: deterministic, CRN-aligned uniform draws.

use super::{get_hash, RandomnessError};
use crate::component::LifecyclePhase;
use crate::population::{Series, SimIndex};
use crate::simulation::Simulation;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A probability placeholder used in a weight vector to absorb leftover
/// weight so the row sums to one. For example `[0.2, 0.2, RESIDUAL_CHOICE]`
/// behaves as `[0.2, 0.2, 0.6]`.
pub const RESIDUAL_CHOICE: Weight = Weight::Residual;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Weight {
    Fixed(f64),
    Residual,
}

impl From<f64> for Weight {
    fn from(w: f64) -> Self {
        Weight::Fixed(w)
    }
}

/// Choice weights: one vector shared by every row, or one vector per row.
#[derive(Debug, Clone)]
pub enum ChoiceWeights {
    Shared(Vec<Weight>),
    PerSimulant(Vec<Vec<Weight>>),
}

/// A scalar probability applied to every row, or one per row.
#[derive(Debug, Clone)]
pub enum Probabilities {
    Scalar(f64),
    PerSimulant(Vec<f64>),
}

impl From<f64> for Probabilities {
    fn from(p: f64) -> Self {
        Probabilities::Scalar(p)
    }
}

impl From<Vec<f64>> for Probabilities {
    fn from(p: Vec<f64>) -> Self {
        Probabilities::PerSimulant(p)
    }
}

impl From<&Series> for Probabilities {
    fn from(series: &Series) -> Self {
        Probabilities::PerSimulant(series.as_floats().map(<[f64]>::to_vec).unwrap_or_default())
    }
}

impl Probabilities {
    fn get(&self, pos: usize) -> f64 {
        match self {
            Probabilities::Scalar(p) => *p,
            Probabilities::PerSimulant(p) => p[pos],
        }
    }

    fn check_len(&self, rows: usize) -> Result<(), RandomnessError> {
        if let Probabilities::PerSimulant(p) = self {
            if p.len() != rows {
                return Err(RandomnessError::WeightLengthMismatch {
                    expected: rows,
                    found: p.len(),
                });
            }
        }
        Ok(())
    }
}

/// A named source of deterministic uniform draws, handed out by the builder
/// during setup. Streams are cheap handles; all state lives in the
/// randomness manager and the clock.
#[derive(Debug, Clone)]
pub struct RandomnessStream {
    pub(crate) key: String,
    pub(crate) initializes_crn_attributes: bool,
}

impl RandomnessStream {
    pub fn name(&self) -> String {
        format!("randomness_stream_{}", self.key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The seed string for one call site: stream key, clock time, caller
    /// key, and the global seed.
    fn call_key(&self, sim: &Simulation, additional_key: Option<&str>) -> String {
        format!(
            "{}_{}_{}_{}",
            self.key,
            sim.clock.time(),
            additional_key.unwrap_or("none"),
            sim.randomness.seed_str()
        )
    }

    /// Uniform draws on `[0, 1)`, one per row of `index`.
    ///
    /// Repeated calls within one time step and `additional_key` return
    /// identical values. Ordinary streams align draws per simulant through
    /// the identity map; CRN-initialising streams consume the pool in index
    /// order and are only usable while simulants are being created.
    pub fn get_draw(
        &self,
        sim: &Simulation,
        index: &SimIndex,
        additional_key: Option<&str>,
    ) -> Result<Series, RandomnessError> {
        if index.is_empty() {
            return Ok(Series::floats(self.key.clone(), SimIndex::empty(), vec![]));
        }
        if self.initializes_crn_attributes
            && sim.phase() != LifecyclePhase::PopulationCreation
        {
            return Err(RandomnessError::CrnStreamMisuse {
                key: self.key.clone(),
            });
        }

        let positions: Vec<usize> = if self.initializes_crn_attributes {
            (0..index.len()).collect()
        } else {
            index
                .iter()
                .map(|&row| sim.randomness.position(row))
                .collect::<Result<_, _>>()?
        };

        // The pool is conceptually index_map.len() draws; only the prefix up
        // to the largest needed position is materialised.
        let needed = positions.iter().max().copied().unwrap_or(0) + 1;
        let seed = get_hash(&self.call_key(sim, additional_key));
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pool: Vec<f64> = (0..needed).map(|_| rng.random()).collect();

        let draws = positions.into_iter().map(|p| pool[p]).collect();
        Ok(Series::floats(self.key.clone(), index.clone(), draws))
    }

    /// The subset of `index` for whom an event with probability `p`
    /// happened.
    pub fn filter_for_probability(
        &self,
        sim: &Simulation,
        index: &SimIndex,
        probability: impl Into<Probabilities>,
        additional_key: Option<&str>,
    ) -> Result<SimIndex, RandomnessError> {
        let probability = probability.into();
        probability.check_len(index.len())?;
        let draws = self.get_draw(sim, index, additional_key)?;
        let draws = draws.as_floats().expect("draws are always floats");
        Ok(index
            .iter()
            .enumerate()
            .filter(|(pos, _)| draws[*pos] < probability.get(*pos))
            .map(|(_, &row)| row)
            .collect())
    }

    /// The subset of `index` for whom an event with annual rate `rate`
    /// happened this step. The rate is converted to a per-step probability
    /// before filtering.
    pub fn filter_for_rate(
        &self,
        sim: &Simulation,
        index: &SimIndex,
        rate: impl Into<Probabilities>,
        additional_key: Option<&str>,
    ) -> Result<SimIndex, RandomnessError> {
        let years = sim.clock.step_size().to_years();
        let probability = match rate.into() {
            Probabilities::Scalar(r) => Probabilities::Scalar(rate_to_probability(r, years)),
            Probabilities::PerSimulant(rates) => Probabilities::PerSimulant(
                rates
                    .into_iter()
                    .map(|r| rate_to_probability(r, years))
                    .collect(),
            ),
        };
        self.filter_for_probability(sim, index, probability, additional_key)
    }

    /// One decision per row among `options`, by cumulative weight.
    pub fn choice<T: Clone>(
        &self,
        sim: &Simulation,
        index: &SimIndex,
        options: &[T],
        weights: Option<&ChoiceWeights>,
        additional_key: Option<&str>,
    ) -> Result<Vec<T>, RandomnessError> {
        if options.is_empty() {
            return Err(RandomnessError::EmptyOptions);
        }
        let draws = self.get_draw(sim, index, additional_key)?;
        let draws = draws.as_floats().expect("draws are always floats");

        let shared_bins = match weights {
            None => Some(cumulative_bins(&vec![
                Weight::Fixed(1.0);
                options.len()
            ])?),
            Some(ChoiceWeights::Shared(row)) => {
                if row.len() != options.len() {
                    return Err(RandomnessError::WeightLengthMismatch {
                        expected: options.len(),
                        found: row.len(),
                    });
                }
                Some(cumulative_bins(row)?)
            }
            Some(ChoiceWeights::PerSimulant(rows)) => {
                if rows.len() != index.len() {
                    return Err(RandomnessError::WeightLengthMismatch {
                        expected: index.len(),
                        found: rows.len(),
                    });
                }
                None
            }
        };

        let mut out = Vec::with_capacity(index.len());
        let mut row_bins;
        for (pos, &draw) in draws.iter().enumerate() {
            let bins: &[f64] = match (&shared_bins, weights) {
                (Some(bins), _) => bins,
                (None, Some(ChoiceWeights::PerSimulant(rows))) => {
                    if rows[pos].len() != options.len() {
                        return Err(RandomnessError::WeightLengthMismatch {
                            expected: options.len(),
                            found: rows[pos].len(),
                        });
                    }
                    row_bins = cumulative_bins(&rows[pos])?;
                    &row_bins
                }
                _ => unreachable!("weight shape checked above"),
            };
            let choice = bins
                .iter()
                .filter(|&&bin| draw > bin)
                .count()
                .min(options.len() - 1);
            out.push(options[choice].clone());
        }
        Ok(out)
    }

    /// Samples from a distribution given its inverse CDF.
    pub fn sample_from_distribution(
        &self,
        sim: &Simulation,
        index: &SimIndex,
        ppf: impl Fn(f64) -> f64,
        additional_key: Option<&str>,
    ) -> Result<Series, RandomnessError> {
        let draws = self.get_draw(sim, index, additional_key)?;
        let samples = draws
            .as_floats()
            .expect("draws are always floats")
            .iter()
            .map(|&d| ppf(d))
            .collect();
        Ok(Series::floats(self.key.clone(), index.clone(), samples))
    }
}

pub(crate) fn rate_to_probability(rate: f64, step_years: f64) -> f64 {
    1.0 - (-rate * step_years).exp()
}

/// Resolve residual weights and return the row's cumulative bins.
fn cumulative_bins(weights: &[Weight]) -> Result<Vec<f64>, RandomnessError> {
    let residuals = weights
        .iter()
        .filter(|w| matches!(w, Weight::Residual))
        .count();
    if residuals > 1 {
        return Err(RandomnessError::MultipleResiduals);
    }
    let fixed_sum: f64 = weights
        .iter()
        .filter_map(|w| match w {
            Weight::Fixed(value) => Some(*value),
            Weight::Residual => None,
        })
        .sum();

    let resolved: Vec<f64> = if residuals == 1 {
        if fixed_sum > 1.0 + 1e-12 {
            return Err(RandomnessError::WeightsExceedOne { sum: fixed_sum });
        }
        weights
            .iter()
            .map(|w| match w {
                Weight::Fixed(value) => *value,
                Weight::Residual => 1.0 - fixed_sum,
            })
            .collect()
    } else {
        weights
            .iter()
            .map(|w| match w {
                Weight::Fixed(value) => *value,
                Weight::Residual => unreachable!(),
            })
            .collect()
    };

    let total: f64 = resolved.iter().sum();
    let mut cumulative = 0.0;
    Ok(resolved
        .into_iter()
        .map(|w| {
            cumulative += w / total;
            cumulative
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_weight_absorbs_remaining_mass() {
        let bins = cumulative_bins(&[
            Weight::Fixed(0.2),
            Weight::Fixed(0.2),
            Weight::Residual,
        ])
        .unwrap();
        assert!((bins[0] - 0.2).abs() < 1e-12);
        assert!((bins[1] - 0.4).abs() < 1e-12);
        assert!((bins[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sole_residual_takes_all_mass() {
        let bins = cumulative_bins(&[Weight::Residual]).unwrap();
        assert_eq!(vec![1.0], bins);
    }

    #[test]
    fn residual_misuse_is_rejected() {
        assert!(matches!(
            cumulative_bins(&[Weight::Residual, Weight::Residual]),
            Err(RandomnessError::MultipleResiduals)
        ));
        assert!(matches!(
            cumulative_bins(&[Weight::Fixed(0.9), Weight::Fixed(0.3), Weight::Residual]),
            Err(RandomnessError::WeightsExceedOne { .. })
        ));
    }

    #[test]
    fn rates_convert_to_per_step_probabilities() {
        // A one-day step against an annual rate.
        let p = rate_to_probability(0.5, 1.0 / 365.0);
        assert!((p - (1.0 - (-0.5 / 365.0f64).exp())).abs() < 1e-15);
    }
}
