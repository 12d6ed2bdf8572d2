//! The common-random-numbers subsystem.
//!
//! Streams hand out deterministic uniform draws keyed by stream name, clock
//! time, an optional per-call key, and the global seed. The identity map
//! aligns draws per simulant across counterfactual runs.

pub mod index_map;
pub mod stream;

pub use index_map::{IndexMap, KeyAtom, KeyTuple};
pub use stream::{
    ChoiceWeights, Probabilities, RandomnessStream, Weight, RESIDUAL_CHOICE,
};

use crate::clock::SimTime;
use crate::config::{ConfigTree, ConfigurationError};
use crate::population::Frame;
use sha1::{Digest, Sha1};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RandomnessError {
    #[error("key columns must be numeric or timestamps, got a {dtype} column")]
    UnhashableKeyColumn { dtype: String },
    #[error("integer key-column values must be non-negative, got {0}")]
    NegativeIntegerKey(i64),
    #[error("float key-column values must be finite, got {0}")]
    NonFiniteFloatKey(f64),
    #[error("two simulants share an identical key-column tuple")]
    DuplicateKeyTuple,
    #[error("simulant {simulant} is already registered with the randomness system")]
    SimulantAlreadyRegistered { simulant: usize },
    #[error("simulant {simulant} has not been registered with the randomness system")]
    UnregisteredSimulant { simulant: usize },
    #[error("the randomness identity map is full (size {size})")]
    IndexMapFull { size: usize },
    #[error("two separate places are attempting to create the randomness stream '{0}'")]
    DuplicateStream(String),
    #[error("simulants are missing key columns: {missing:?}")]
    MissingKeyColumns { missing: Vec<String> },
    #[error("more than one residual choice supplied for a single set of weights")]
    MultipleResiduals,
    #[error("residual choice supplied with weights that summed to {sum} before the residual")]
    WeightsExceedOne { sum: f64 },
    #[error(
        "stream '{key}' initializes identifying attributes and can only draw while simulants are being created"
    )]
    CrnStreamMisuse { key: String },
    #[error("choice requires at least one option")]
    EmptyOptions,
    #[error("expected {expected} weights/probabilities, got {found}")]
    WeightLengthMismatch { expected: usize, found: usize },
}

/// An integer seed derived from an arbitrary string key.
pub fn get_hash(key: &str) -> u64 {
    let digest = Sha1::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % (1u64 << 32)
}

/// Access point for stream creation and simulant registration.
#[derive(Debug)]
pub struct RandomnessManager {
    seed: String,
    key_columns: Vec<String>,
    index_map: IndexMap,
    streams: indexmap::IndexMap<String, bool>,
}

impl RandomnessManager {
    pub const CONFIGURATION_DEFAULTS: &'static str = "\
randomness:
  map_size: 1000000
  key_columns: []
  random_seed: 0
  additional_seed: null
";

    pub fn from_config(config: &ConfigTree) -> Result<Self, ConfigurationError> {
        let mut seed = config.get("randomness.random_seed")?.to_string();
        if let Some(additional) = config.get_optional_str("randomness.additional_seed")? {
            seed.push_str(&additional);
        }
        let key_columns = config.get_str_list("randomness.key_columns")?;
        let map_size = config.get_int("randomness.map_size")?.max(0) as usize;
        let population_size = config.get_int("population.population_size")?.max(0) as usize;
        let size = map_size.max(10 * population_size);
        let use_crn = !key_columns.is_empty();
        Ok(RandomnessManager {
            seed,
            key_columns,
            index_map: IndexMap::new(use_crn, size),
            streams: indexmap::IndexMap::new(),
        })
    }

    pub fn seed_str(&self) -> &str {
        &self.seed
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn use_crn(&self) -> bool {
        self.index_map.use_crn()
    }

    /// The size of the pool every stream samples from.
    pub fn map_len(&self) -> usize {
        self.index_map.len()
    }

    pub(crate) fn position(&self, simulant: usize) -> Result<usize, RandomnessError> {
        self.index_map.position(simulant)
    }

    pub fn index_map(&self) -> &IndexMap {
        &self.index_map
    }

    /// Create a stream for a decision point. Each decision point may be
    /// created exactly once.
    pub fn get_randomness_stream(
        &mut self,
        decision_point: &str,
        initializes_crn_attributes: bool,
    ) -> Result<RandomnessStream, RandomnessError> {
        if self.streams.contains_key(decision_point) {
            return Err(RandomnessError::DuplicateStream(decision_point.to_string()));
        }
        debug!(decision_point, initializes_crn_attributes, "created randomness stream");
        self.streams
            .insert(decision_point.to_string(), initializes_crn_attributes);
        Ok(RandomnessStream {
            key: decision_point.to_string(),
            initializes_crn_attributes,
        })
    }

    /// Registered streams and whether each initializes CRN attributes, for
    /// wiring the resource graph when setup ends.
    pub(crate) fn registered_streams(&self) -> impl Iterator<Item = (&str, bool)> {
        self.streams
            .iter()
            .map(|(key, initializes)| (key.as_str(), *initializes))
    }

    /// A seed for external randomness tools, linked to the framework seed.
    pub fn get_seed(&self, decision_point: &str, time: SimTime) -> u64 {
        get_hash(&format!("{decision_point}_{time}_{}", self.seed))
    }

    /// Register newly created simulants by their key-column values. Must be
    /// called exactly once per simulant, as soon as the key columns exist.
    pub fn register_simulants(&mut self, simulants: &Frame) -> Result<(), RandomnessError> {
        if !self.use_crn() {
            return Ok(());
        }
        let missing: Vec<String> = self
            .key_columns
            .iter()
            .filter(|column| !simulants.has_column(column))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RandomnessError::MissingKeyColumns { missing });
        }
        let mut keys = Vec::with_capacity(simulants.len());
        for pos in 0..simulants.len() {
            let mut key: KeyTuple = SmallVec::new();
            for column in &self.key_columns {
                let value = simulants
                    .cell(pos, column)
                    .expect("key column presence checked above");
                key.push(KeyAtom::from_value(&value)?);
            }
            keys.push(key);
        }
        self.index_map.register(&simulants.index, keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable_and_bounded() {
        let a = get_hash("mortality_0_none_0");
        let b = get_hash("mortality_0_none_0");
        assert_eq!(a, b);
        assert!(a < (1u64 << 32));
        assert_ne!(a, get_hash("mortality_1_none_0"));
    }

    #[test]
    fn duplicate_decision_points_are_rejected() {
        let mut config = ConfigTree::new();
        config
            .update_yaml_str(RandomnessManager::CONFIGURATION_DEFAULTS, "base", "t")
            .unwrap();
        config
            .update_value("population.population_size", 10i64, "base", "t")
            .unwrap();
        let mut manager = RandomnessManager::from_config(&config).unwrap();
        manager.get_randomness_stream("deaths", false).unwrap();
        assert!(matches!(
            manager.get_randomness_stream("deaths", true),
            Err(RandomnessError::DuplicateStream(_))
        ));
    }

    #[test]
    fn map_size_scales_with_population() {
        let mut config = ConfigTree::new();
        config
            .update_yaml_str(RandomnessManager::CONFIGURATION_DEFAULTS, "base", "t")
            .unwrap();
        config
            .update_value("randomness.map_size", 100i64, "override", "t")
            .unwrap();
        config
            .update_value("population.population_size", 500i64, "override", "t")
            .unwrap();
        let manager = RandomnessManager::from_config(&config).unwrap();
        assert_eq!(5000, manager.map_len());
    }

    #[test]
    fn seed_concatenates_additional_seed() {
        let mut config = ConfigTree::new();
        config
            .update_yaml_str(RandomnessManager::CONFIGURATION_DEFAULTS, "base", "t")
            .unwrap();
        config
            .update_value("population.population_size", 10i64, "base", "t")
            .unwrap();
        config
            .update_value("randomness.random_seed", 123i64, "override", "t")
            .unwrap();
        config
            .update_value("randomness.additional_seed", 7i64, "override", "t")
            .unwrap();
        let manager = RandomnessManager::from_config(&config).unwrap();
        assert_eq!("1237", manager.seed_str());
    }
}
