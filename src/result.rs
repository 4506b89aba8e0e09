//! Result sets: the scored record collections a scan produces, and the
//! set-algebra combinators that merge partial results.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Operator, RecordId};

/// How a partial result merges into the accumulated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combinator {
    Or,
    And,
    AndNot,
    /// Score-only: adjusts existing members, never changes membership.
    Adjust,
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Combinator::Or => "||",
            Combinator::And => "&&",
            Combinator::AndNot => "&!",
            Combinator::Adjust => "&~",
        };
        f.write_str(s)
    }
}

impl TryFrom<Operator> for Combinator {
    type Error = Error;

    fn try_from(op: Operator) -> Result<Self, Error> {
        match op {
            Operator::Or => Ok(Combinator::Or),
            Operator::And => Ok(Combinator::And),
            Operator::AndNot => Ok(Combinator::AndNot),
            Operator::Adjust => Ok(Combinator::Adjust),
            other => Err(Error::UnknownOperator(other)),
        }
    }
}

/// Per-record bookkeeping inside a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    pub score: i32,
    /// Times the record was matched across merged partials.
    pub n_hits: u32,
}

/// A set of matched records with accumulated scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    entries: FxHashMap<RecordId, RecordInfo>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn score(&self, id: RecordId) -> Option<i32> {
        self.entries.get(&id).map(|e| e.score)
    }

    /// Insert or re-score a record; repeated adds accumulate.
    pub fn add(&mut self, id: RecordId, score: i32) {
        let e = self.entries.entry(id).or_insert(RecordInfo {
            score: 0,
            n_hits: 0,
        });
        e.score = e.score.saturating_add(score);
        e.n_hits += 1;
    }

    pub fn remove(&mut self, id: RecordId) {
        self.entries.remove(&id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record ids in ascending order.
    pub fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &RecordInfo)> {
        self.entries.iter().map(|(id, info)| (*id, info))
    }

    /// Merge `other` into `self` under `op`.
    ///
    /// `Or` unions and adds scores; `And` intersects and adds scores of
    /// survivors; `AndNot` removes `other`'s members; `Adjust` adds scores
    /// of common members without changing membership.
    pub fn merge(&mut self, other: &ResultSet, op: Combinator) {
        match op {
            Combinator::Or => {
                for (&id, info) in &other.entries {
                    self.add(id, info.score);
                }
            }
            Combinator::And => {
                self.entries.retain(|id, _| other.entries.contains_key(id));
                for (id, e) in self.entries.iter_mut() {
                    if let Some(o) = other.entries.get(id) {
                        e.score = e.score.saturating_add(o.score);
                        e.n_hits += o.n_hits;
                    }
                }
            }
            Combinator::AndNot => {
                self.entries.retain(|id, _| !other.entries.contains_key(id));
            }
            Combinator::Adjust => {
                for (id, e) in self.entries.iter_mut() {
                    if let Some(o) = other.entries.get(id) {
                        e.score = e.score.saturating_add(o.score);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[(RecordId, i32)]) -> ResultSet {
        let mut r = ResultSet::new();
        for &(id, score) in ids {
            r.add(id, score);
        }
        r
    }

    #[test]
    fn test_or_unions_and_accumulates() {
        let mut a = set(&[(1, 1), (2, 1)]);
        let b = set(&[(2, 3), (4, 1)]);
        a.merge(&b, Combinator::Or);
        assert_eq!(a.ids(), vec![1, 2, 4]);
        assert_eq!(a.score(2), Some(4));
    }

    #[test]
    fn test_and_intersects() {
        let mut a = set(&[(1, 1), (2, 1), (3, 2)]);
        let b = set(&[(2, 1), (3, 1)]);
        a.merge(&b, Combinator::And);
        assert_eq!(a.ids(), vec![2, 3]);
        assert_eq!(a.score(3), Some(3));
    }

    #[test]
    fn test_and_not_subtracts() {
        let mut a = set(&[(1, 1), (2, 1), (3, 1)]);
        let b = set(&[(2, 5)]);
        a.merge(&b, Combinator::AndNot);
        assert_eq!(a.ids(), vec![1, 3]);
    }

    #[test]
    fn test_adjust_keeps_membership() {
        let mut a = set(&[(1, 1), (2, 1)]);
        let b = set(&[(2, 9), (7, 9)]);
        a.merge(&b, Combinator::Adjust);
        assert_eq!(a.ids(), vec![1, 2]);
        assert_eq!(a.score(2), Some(10));
        assert_eq!(a.score(1), Some(1));
    }

    #[test]
    fn test_combinator_from_operator() {
        assert_eq!(Combinator::try_from(Operator::And).unwrap(), Combinator::And);
        assert!(Combinator::try_from(Operator::Plus).is_err());
    }
}
