//! Weighted random block selection used to fill overlay positions.

use std::hash::{Hash, Hasher};

use hashbrown::HashMap;
use rand::Rng;
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

use crate::block::BlockState;

/// Maximum difference between two variant probabilities for them to be considered equal.
pub const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Errors returned when constructing a [`Pattern`].
#[derive(Copy, Clone, Debug, PartialEq, Error)]
pub enum PatternError {
    /// No variants were given.
    #[error("A pattern needs at least one block variant")]
    Empty,
    /// A weight was zero, negative, infinite or NaN.
    #[error("Weight {weight} of {variant:?} is not a positive finite number")]
    InvalidWeight {
        /// The variant the weight was given for
        variant: BlockState,
        /// The rejected weight
        weight: f64,
    },
    /// The weights were individually valid but their sum is not representable.
    #[error("The sum of pattern weights is not finite")]
    WeightOverflow,
}

/// An immutable weighted distribution over block variants.
///
/// Built with Vose's alias method: the weights are scaled so they sum to the variant count `N`,
/// then split into `N` equally likely columns holding at most two variants each.
/// Sampling picks a uniform column and a uniform threshold, so it runs in O(1) regardless of `N`.
#[derive(Clone, Debug)]
pub struct Pattern {
    /// Primary variant of each column
    variants: SmallVec<[BlockState; 8]>,
    /// Probability of the primary variant winning within its column
    thresholds: SmallVec<[f64; 8]>,
    /// Column index whose primary variant is used when the threshold check fails
    aliases: SmallVec<[u32; 8]>,
    /// Variant probabilities reconstructed from the table, sorted by variant
    distribution: SmallVec<[(BlockState, f64); 8]>,
}

impl Pattern {
    /// Builds a pattern from (variant, weight) pairs. Weights of repeated variants are added together.
    pub fn new<I: IntoIterator<Item = (BlockState, f64)>>(weights: I) -> Result<Self, PatternError> {
        let mut index: HashMap<BlockState, usize> = HashMap::new();
        let mut merged: SmallVec<[(BlockState, f64); 8]> = SmallVec::new();
        for (variant, weight) in weights {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(PatternError::InvalidWeight { variant, weight });
            }
            match index.get(&variant) {
                Some(&i) => merged[i].1 += weight,
                None => {
                    index.insert(variant, merged.len());
                    merged.push((variant, weight));
                }
            }
        }
        if merged.is_empty() {
            return Err(PatternError::Empty);
        }
        let total: f64 = merged.iter().map(|(_, w)| w).sum();
        if !total.is_finite() {
            return Err(PatternError::WeightOverflow);
        }

        let n = merged.len();
        let mut scaled: SmallVec<[f64; 8]> = merged.iter().map(|(_, w)| w * n as f64 / total).collect();
        let mut thresholds: SmallVec<[f64; 8]> = smallvec![1.0; n];
        let mut aliases: SmallVec<[u32; 8]> = (0..n as u32).collect();
        let (mut small, mut large): (Vec<usize>, Vec<usize>) = (0..n).partition(|&i| scaled[i] < 1.0);
        while let (Some(&less), Some(&more)) = (small.last(), large.last()) {
            small.pop();
            large.pop();
            thresholds[less] = scaled[less];
            aliases[less] = more as u32;
            scaled[more] = (scaled[more] + scaled[less]) - 1.0;
            if scaled[more] < 1.0 {
                small.push(more);
            } else {
                large.push(more);
            }
        }
        // Columns left on either stack keep a threshold of 1.0, any remainder is floating point error.

        let mut mass: SmallVec<[f64; 8]> = smallvec![0.0; n];
        for column in 0..n {
            mass[column] += thresholds[column];
            mass[aliases[column] as usize] += 1.0 - thresholds[column];
        }
        let mut distribution: SmallVec<[(BlockState, f64); 8]> = merged
            .iter()
            .zip(mass.iter())
            .map(|(&(variant, _), &m)| (variant, m / n as f64))
            .collect();
        distribution.sort_by_key(|&(variant, _)| variant);

        Ok(Self {
            variants: merged.iter().map(|&(v, _)| v).collect(),
            thresholds,
            aliases,
            distribution,
        })
    }

    /// A pattern that always yields the given variant.
    pub fn single(variant: BlockState) -> Self {
        Self {
            variants: smallvec![variant],
            thresholds: smallvec![1.0],
            aliases: smallvec![0],
            distribution: smallvec![(variant, 1.0)],
        }
    }

    /// Picks a random variant with probability proportional to its weight.
    #[inline]
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> BlockState {
        let column = rng.gen_range(0..self.variants.len());
        if rng.gen::<f64>() < self.thresholds[column] {
            self.variants[column]
        } else {
            self.variants[self.aliases[column] as usize]
        }
    }

    /// Number of distinct variants in the pattern, always at least 1.
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// The normalized (variant, probability) pairs, sorted by variant.
    pub fn distribution(&self) -> &[(BlockState, f64)] {
        &self.distribution
    }

    /// The probability of sampling the given variant, 0.0 if it's not part of the pattern.
    pub fn probability_of(&self, variant: BlockState) -> f64 {
        self.distribution
            .binary_search_by_key(&variant, |&(v, _)| v)
            .map(|i| self.distribution[i].1)
            .unwrap_or(0.0)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.distribution.len() == other.distribution.len()
            && self
                .distribution
                .iter()
                .zip(other.distribution.iter())
                .all(|(&(va, pa), &(vb, pb))| va == vb && (pa - pb).abs() <= PROBABILITY_TOLERANCE)
    }
}

impl Eq for Pattern {}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Probabilities are compared with a tolerance, so only the variant set takes part in the hash.
        self.distribution.len().hash(state);
        for (variant, _) in &self.distribution {
            variant.hash(state);
        }
    }
}
