//! Client-side PSI roles. Pure protocol steps, no transport.
//!
//! The initiator and joiner never talk to each other; the server relays
//! blinded values. Each role samples a fresh secret exponent per session.

use std::collections::HashSet;

use num_bigint::BigUint;
use rand::Rng;
use thiserror::Error;

use super::group;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("joiner response has {got} elements, need at least {expected}")]
    ShortResponse { got: usize, expected: usize },
}

/// Per-session secret blinding exponent in [1, (p-1)/2 - 1].
/// Deliberately neither `Clone` nor `Debug`.
struct BlindingKey(BigUint);

impl BlindingKey {
    fn generate(rng: &mut impl Rng) -> Self {
        Self(group::random_exponent(rng))
    }

    fn hash_and_blind(&self, item: &str) -> BigUint {
        group::blind(&group::hash_to_group(item.as_bytes()), &self.0)
    }

    fn blind(&self, value: &BigUint) -> BigUint {
        group::blind(value, &self.0)
    }
}

/// Role A. Holds the interest set X and secret exponent a.
pub struct Initiator {
    key: BlindingKey,
    items: Vec<String>,
}

impl Initiator {
    pub fn new(items: Vec<String>, rng: &mut impl Rng) -> Self {
        Self { key: BlindingKey::generate(rng), items }
    }

    /// Rebuild the role from a persisted exponent. The CLI runs step 1 and
    /// step 3 in separate processes and must keep the same secret (and item
    /// order) across them.
    pub fn from_exponent(items: Vec<String>, exponent: BigUint) -> Self {
        Self { key: BlindingKey(exponent), items }
    }

    /// The secret exponent, for client-side persistence between steps.
    /// Never send this anywhere.
    pub fn exponent(&self) -> &BigUint {
        &self.key.0
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Step 1: ordered H(x_i)^a, submitted to the server at init.
    pub fn blinded_items(&self) -> Vec<BigUint> {
        self.items.iter().map(|x| self.key.hash_and_blind(x)).collect()
    }

    /// Step 3, per joiner: the response carries H(y_j)^b for the joiner's n
    /// items followed by H(x_i)^{ab} in our submission order. Blinding the
    /// first part with a gives H(y_j)^{ab}; x_i is shared iff its
    /// double-blinded value appears in that set.
    pub fn intersect(&self, response: &[BigUint]) -> Result<Vec<String>, ProtocolError> {
        let m = self.items.len();
        if response.len() < m {
            return Err(ProtocolError::ShortResponse { got: response.len(), expected: m });
        }
        let n = response.len() - m;

        let their_items_double_blinded: HashSet<BigUint> =
            response[..n].iter().map(|y| self.key.blind(y)).collect();

        Ok(self
            .items
            .iter()
            .zip(&response[n..])
            .filter(|(_, double_blinded_x)| their_items_double_blinded.contains(double_blinded_x))
            .map(|(item, _)| item.clone())
            .collect())
    }
}

/// Role B. Holds the interest set Y and secret exponent b.
pub struct Joiner {
    key: BlindingKey,
    items: Vec<String>,
}

impl Joiner {
    pub fn new(items: Vec<String>, rng: &mut impl Rng) -> Self {
        Self { key: BlindingKey::generate(rng), items }
    }

    /// Step 2: H(y_j)^b for our items, then (H(x_i)^a)^b preserving the
    /// initiator's order.
    pub fn respond(&self, initiator_values: &[BigUint]) -> Vec<BigUint> {
        let mut out: Vec<BigUint> =
            self.items.iter().map(|y| self.key.hash_and_blind(y)).collect();
        out.extend(initiator_values.iter().map(|x| self.key.blind(x)));
        out
    }
}
