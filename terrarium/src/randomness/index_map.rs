//! The key-tuple to draw-position mapping at the heart of common random
//! numbers.
//!
//! A simulant's identity is the tuple of its key-column values. Each tuple
//! is hashed to a position in a large pool of uniform draws; a simulant with
//! the same tuple in two different runs lands on the same position, so the
//! two runs see the same randomness for that individual.

use super::RandomnessError;
use crate::population::{SimIndex, Value};
use ordered_float::OrderedFloat;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

const TEN_DIGIT_MODULUS: u64 = 10_000_000_000;
const PRIMES: [u64; 10] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 27];

/// One key-column value, reduced to a hashable atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyAtom {
    Int(i64),
    Float(OrderedFloat<f64>),
    /// Timestamps reduce to whole seconds.
    Time(i64),
}

impl KeyAtom {
    pub fn from_value(value: &Value) -> Result<KeyAtom, RandomnessError> {
        match value {
            Value::Int(i) => Ok(KeyAtom::Int(*i)),
            Value::Float(f) => Ok(KeyAtom::Float(OrderedFloat(*f))),
            Value::Time(t) => Ok(KeyAtom::Time(t.to_key_seconds())),
            other => Err(RandomnessError::UnhashableKeyColumn {
                dtype: other.dtype().to_string(),
            }),
        }
    }

    /// Reduce to a ten-digit integer: timestamps use their second count,
    /// integers are spread multiplicatively so small values differ in many
    /// digits, floats keep their first ten decimals.
    fn to_ten_digits(&self) -> Result<u64, RandomnessError> {
        match self {
            KeyAtom::Int(n) => {
                if *n < 0 {
                    return Err(RandomnessError::NegativeIntegerKey(*n));
                }
                Ok(spread(*n as u64))
            }
            KeyAtom::Float(f) => {
                if !f.0.is_finite() {
                    return Err(RandomnessError::NonFiniteFloatKey(f.0));
                }
                Ok((f.0.rem_euclid(1.0) * TEN_DIGIT_MODULUS as f64).floor() as u64)
            }
            KeyAtom::Time(seconds) => Ok(seconds.rem_euclid(TEN_DIGIT_MODULUS as i64) as u64),
        }
    }
}

/// A simulant's full identity tuple.
pub type KeyTuple = SmallVec<[KeyAtom; 2]>;

fn spread(n: u64) -> u64 {
    ((n as u128 * 111_111) % TEN_DIGIT_MODULUS as u128) as u64
}

fn digit(m: u64, n: usize) -> u64 {
    (m / 10u64.pow(n as u32)) % 10
}

fn pow_wrapping(base: u64, exponent: u64) -> u64 {
    let mut out: u64 = 1;
    for _ in 0..exponent {
        out = out.wrapping_mul(base);
    }
    out
}

/// Hash a tuple to `[0, size)` with a polynomial over the digits of each
/// normalised atom, perturbed by an additive salt.
fn hash_tuple(key: &KeyTuple, salt: u64, size: usize) -> Result<usize, RandomnessError> {
    let salt = spread(salt);
    let mut acc: u64 = 0;
    for atom in key {
        let normalised = atom.to_ten_digits()?;
        let mut term: u64 = 1;
        for (position, prime) in PRIMES.iter().enumerate() {
            term = term.wrapping_mul(pow_wrapping(*prime, digit(normalised, position)));
        }
        acc = acc.wrapping_add(term).wrapping_add(salt);
    }
    Ok((acc % size as u64) as usize)
}

/// The registered mapping from identity tuples to draw positions.
#[derive(Debug)]
pub struct IndexMap {
    use_crn: bool,
    size: usize,
    positions: HashMap<KeyTuple, usize>,
    occupied: HashSet<usize>,
    rows: HashMap<usize, usize>,
}

impl IndexMap {
    pub fn new(use_crn: bool, size: usize) -> Self {
        IndexMap {
            use_crn,
            size,
            positions: HashMap::new(),
            occupied: HashSet::new(),
            rows: HashMap::new(),
        }
    }

    /// The size of the draw pool this map indexes into.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn use_crn(&self) -> bool {
        self.use_crn
    }

    /// Register new simulants with their identity tuples. Each simulant and
    /// each tuple may be registered exactly once; hash collisions between
    /// distinct tuples re-hash with an incremented salt until a free
    /// position is found.
    pub fn register(
        &mut self,
        index: &SimIndex,
        keys: Vec<KeyTuple>,
    ) -> Result<(), RandomnessError> {
        if !self.use_crn || index.is_empty() {
            return Ok(());
        }
        for (&row, key) in index.iter().zip(keys) {
            if self.rows.contains_key(&row) {
                return Err(RandomnessError::SimulantAlreadyRegistered { simulant: row });
            }
            if self.positions.contains_key(&key) {
                return Err(RandomnessError::DuplicateKeyTuple);
            }
            if self.positions.len() >= self.size {
                return Err(RandomnessError::IndexMapFull { size: self.size });
            }
            let mut salt = 0;
            let mut position = hash_tuple(&key, salt, self.size)?;
            while self.occupied.contains(&position) {
                salt += 1;
                position = hash_tuple(&key, salt, self.size)?;
            }
            self.occupied.insert(position);
            self.rows.insert(row, position);
            self.positions.insert(key, position);
        }
        Ok(())
    }

    /// The draw position for a simulant. With CRN disabled, the row id is
    /// its own position.
    pub fn position(&self, simulant: usize) -> Result<usize, RandomnessError> {
        if !self.use_crn {
            return Ok(simulant);
        }
        self.rows
            .get(&simulant)
            .copied()
            .ok_or(RandomnessError::UnregisteredSimulant { simulant })
    }

    /// The position a tuple would map to, independent of which simulant
    /// carries it. Mostly useful for cross-run assertions.
    pub fn position_of_key(&self, key: &KeyTuple) -> Option<usize> {
        self.positions.get(key).copied()
    }
}
