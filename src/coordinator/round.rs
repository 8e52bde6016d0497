//! Per-round contribution table.
//!
//! All admission decisions (round check, duplicate check, append) happen on
//! one `&mut RoundTable`, so holding its lock makes check-then-append a single
//! critical section.

use std::collections::{BTreeMap, BTreeSet};

use crate::codec::GradientSet;
use crate::error::FlError;

/// Lifecycle of the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Taking submissions
    Accepting,
    /// Contributions sealed; submissions for this round are closed
    Aggregating,
}

/// Result of admitting a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// First contribution from this client for this round
    Fresh,
    /// Already recorded; nothing changes
    Duplicate,
}

/// Outcome of trying to close the current round.
#[derive(Debug)]
pub enum Seal {
    /// Fewer than the required contributions
    NotReady {
        /// Current round
        round: u64,
        /// Contributions so far
        have: usize,
    },
    /// Contributions taken for aggregation, in client-id order
    Sealed {
        /// Round being aggregated
        round: u64,
        /// Contributing clients
        client_ids: Vec<String>,
        /// Their gradient sets, aligned with `client_ids`
        updates: Vec<GradientSet>,
    },
}

/// Contributions of the current round plus the participants of the last published one.
#[derive(Debug)]
pub struct RoundTable {
    current: u64,
    phase: Phase,
    contributions: BTreeMap<String, GradientSet>,
    // Contributors of the round being aggregated; empty while accepting.
    aggregating: BTreeSet<String>,
    // Contributors of the last published round.
    sealed: Option<(u64, BTreeSet<String>)>,
}

impl RoundTable {
    /// Start accepting at `round`.
    pub fn new(round: u64) -> Self {
        Self {
            current: round,
            phase: Phase::Accepting,
            contributions: BTreeMap::new(),
            aggregating: BTreeSet::new(),
            sealed: None,
        }
    }

    /// Round currently accepting (or aggregating).
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Contributions recorded for the current round.
    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    /// Whether the current round has no contributions.
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Decide whether `client_id` may contribute to `round`.
    ///
    /// A client resubmitting to the round being aggregated, or to the last
    /// closed round it took part in, gets [`Admission::Duplicate`].
    pub fn check(&self, client_id: &str, round: u64) -> Result<Admission, FlError> {
        if let Some((sealed_round, ids)) = &self.sealed {
            if *sealed_round == round && ids.contains(client_id) {
                return Ok(Admission::Duplicate);
            }
        }
        if round == self.current && self.aggregating.contains(client_id) {
            return Ok(Admission::Duplicate);
        }
        if round < self.current || (round == self.current && self.phase == Phase::Aggregating) {
            return Err(FlError::RoundClosed {
                submitted: round,
                current: self.current,
            });
        }
        if round > self.current {
            return Err(FlError::RoundNotOpen {
                submitted: round,
                current: self.current,
            });
        }
        if self.contributions.contains_key(client_id) {
            return Ok(Admission::Duplicate);
        }
        Ok(Admission::Fresh)
    }

    /// Check and, if fresh, record a contribution.
    pub fn insert(
        &mut self,
        client_id: &str,
        round: u64,
        gradients: GradientSet,
    ) -> Result<Admission, FlError> {
        let admission = self.check(client_id, round)?;
        if admission == Admission::Fresh {
            self.contributions.insert(client_id.to_string(), gradients);
        }
        Ok(admission)
    }

    /// Take the current round's contributions if at least `min_clients` exist.
    pub fn seal(&mut self, min_clients: usize) -> Seal {
        if self.phase == Phase::Aggregating || self.contributions.len() < min_clients {
            return Seal::NotReady {
                round: self.current,
                have: self.contributions.len(),
            };
        }
        let taken = std::mem::take(&mut self.contributions);
        let (client_ids, updates): (Vec<String>, Vec<GradientSet>) = taken.into_iter().unzip();
        self.aggregating = client_ids.iter().cloned().collect();
        self.phase = Phase::Aggregating;
        Seal::Sealed {
            round: self.current,
            client_ids,
            updates,
        }
    }

    /// The sealed round was published; open the next one.
    pub fn finish(&mut self) {
        self.sealed = Some((self.current, std::mem::take(&mut self.aggregating)));
        self.current += 1;
        self.phase = Phase::Accepting;
    }

    /// Aggregation failed; put the contributions back and reopen the round.
    ///
    /// Participants of the previously published round stay recorded.
    pub fn abort(&mut self, client_ids: Vec<String>, updates: Vec<GradientSet>) {
        self.contributions.extend(client_ids.into_iter().zip(updates));
        self.aggregating.clear();
        self.phase = Phase::Accepting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn grads() -> GradientSet {
        vec![ArrayD::zeros(vec![2])]
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut table = RoundTable::new(0);
        assert_eq!(table.insert("a", 0, grads()).unwrap(), Admission::Fresh);
        assert_eq!(table.insert("a", 0, grads()).unwrap(), Admission::Duplicate);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_round_window() {
        let table = RoundTable::new(3);
        assert!(matches!(
            table.check("a", 2),
            Err(FlError::RoundClosed { submitted: 2, current: 3 })
        ));
        assert!(matches!(
            table.check("a", 4),
            Err(FlError::RoundNotOpen { submitted: 4, current: 3 })
        ));
        assert_eq!(table.check("a", 3).unwrap(), Admission::Fresh);
    }

    #[test]
    fn test_seal_requires_cohort() {
        let mut table = RoundTable::new(0);
        table.insert("a", 0, grads()).unwrap();
        assert!(matches!(table.seal(2), Seal::NotReady { round: 0, have: 1 }));
        assert_eq!(table.phase(), Phase::Accepting);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_submission_during_aggregation() {
        let mut table = RoundTable::new(0);
        table.insert("b", 0, grads()).unwrap();
        table.insert("a", 0, grads()).unwrap();
        let Seal::Sealed { client_ids, .. } = table.seal(2) else {
            panic!("expected sealed round");
        };
        assert_eq!(client_ids, vec!["a".to_string(), "b".to_string()]);

        assert!(matches!(table.insert("c", 0, grads()), Err(FlError::RoundClosed { .. })));
        assert_eq!(table.insert("a", 0, grads()).unwrap(), Admission::Duplicate);
        assert!(matches!(table.check("c", 1), Err(FlError::RoundNotOpen { .. })));

        table.finish();
        assert_eq!(table.current(), 1);
        assert_eq!(table.insert("b", 0, grads()).unwrap(), Admission::Duplicate);
        assert!(matches!(table.insert("c", 0, grads()), Err(FlError::RoundClosed { .. })));
        assert_eq!(table.insert("c", 1, grads()).unwrap(), Admission::Fresh);
    }

    #[test]
    fn test_abort_restores_contributions() {
        let mut table = RoundTable::new(5);
        table.insert("a", 5, grads()).unwrap();
        table.insert("b", 5, grads()).unwrap();
        let Seal::Sealed { client_ids, updates, .. } = table.seal(2) else {
            panic!("expected sealed round");
        };
        table.abort(client_ids, updates);
        assert_eq!(table.current(), 5);
        assert_eq!(table.phase(), Phase::Accepting);
        assert_eq!(table.len(), 2);
        assert_eq!(table.insert("a", 5, grads()).unwrap(), Admission::Duplicate);
    }

    #[test]
    fn test_abort_keeps_previous_round_duplicates() {
        let mut table = RoundTable::new(0);
        table.insert("a", 0, grads()).unwrap();
        let Seal::Sealed { .. } = table.seal(1) else {
            panic!("expected sealed round");
        };
        table.finish();

        table.insert("b", 1, grads()).unwrap();
        let Seal::Sealed { client_ids, updates, .. } = table.seal(1) else {
            panic!("expected sealed round");
        };
        table.abort(client_ids, updates);

        assert_eq!(table.insert("a", 0, grads()).unwrap(), Admission::Duplicate);
        assert_eq!(table.insert("b", 1, grads()).unwrap(), Admission::Duplicate);
        assert!(matches!(table.check("c", 0), Err(FlError::RoundClosed { .. })));
    }
}
