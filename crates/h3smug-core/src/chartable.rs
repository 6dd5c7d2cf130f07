//! Laplace-smoothed Bayesian success scoring for char-table entries.
//!
//! Each entry is modeled as a Bernoulli trial with a Beta-distributed success
//! probability (`successes + α) / (trials + β)`), normalized across the
//! table. `ACCEPTED` outcomes drop the offending entry outright; `MODIFIED`
//! counts as a success; `REJECTED`/`TIMEOUT` count as a failure.

use rand::Rng;

use crate::model::{CharEntry, CharTable, IllegalIn, Outcome, Slot};

const DEFAULT_LAPLACE_ALPHA: f64 = 0.1;
const DEFAULT_LAPLACE_BETA: f64 = 0.1;
const DEFAULT_SUCCESS_BOOST: f64 = 1.0;

fn score(alpha: f64, beta: f64, successes: u64, trials: u64) -> f64 {
    (successes as f64 + alpha) / (trials as f64 + beta)
}

impl CharTable {
    /// Build a table from raw (bytes, slot) entries, each starting at
    /// `(successes=0, trials=0)` and hence uniform probability.
    pub fn new(entries: Vec<(bytes::Bytes, Slot)>, illegal_in: Option<IllegalIn>) -> Self {
        let alpha = DEFAULT_LAPLACE_ALPHA;
        let beta = DEFAULT_LAPLACE_BETA;
        let initial_score = score(alpha, beta, 0, 0);
        let n = entries.len();
        let score_sum = initial_score * n as f64;
        let mut table = CharTable {
            entries: entries
                .into_iter()
                .map(|(bytes, slot)| CharEntry {
                    bytes,
                    slot,
                    successes: 0,
                    trials: 0,
                    probability: 0.0,
                })
                .collect(),
            illegal_in,
            laplace_alpha: alpha,
            laplace_beta: beta,
            success_boost: DEFAULT_SUCCESS_BOOST,
            score_sum,
        };
        table.renormalize();
        table
    }

    /// Number of surviving entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every entry has been dropped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only access to an entry by index.
    pub fn entry(&self, index: usize) -> Option<&CharEntry> {
        self.entries.get(index)
    }

    /// Sample one surviving entry, weighted by current probability.
    ///
    /// Returns `None` if the table has been fully drained by `ACCEPTED`
    /// reports.
    pub fn sample(&self, rng: &mut impl Rng) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mut roll: f64 = rng.random();
        for (index, entry) in self.entries.iter().enumerate() {
            roll -= entry.probability;
            if roll <= 0.0 {
                return Some(index);
            }
        }
        Some(self.entries.len() - 1)
    }

    /// Recompute every surviving entry's probability from the current score
    /// sum. Called after any mutation to `successes`/`trials`/`entries`.
    fn renormalize(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        for entry in &mut self.entries {
            let s = score(self.laplace_alpha, self.laplace_beta, entry.successes, entry.trials);
            entry.probability = s / self.score_sum;
        }
    }

    /// Apply an outcome report to the entry at `index`.
    ///
    /// `ACCEPTED` drops the entry; `MODIFIED` counts as a success;
    /// `REJECTED`/`TIMEOUT` count as a failure. Reporting
    /// `RequestNotMalformed` is a caller bug — it is filtered upstream of
    /// this call and is ignored here.
    pub fn report_result(&mut self, index: usize, outcome: Outcome) {
        let Some(entry) = self.entries.get(index) else {
            return;
        };
        let old_score = score(self.laplace_alpha, self.laplace_beta, entry.successes, entry.trials);

        match outcome {
            Outcome::Accepted => {
                self.score_sum -= old_score;
                self.entries.remove(index);
                self.renormalize();
            }
            Outcome::Modified => {
                let entry = &mut self.entries[index];
                entry.successes += 1;
                entry.trials += 1;
                let new_score =
                    score(self.laplace_alpha, self.laplace_beta, entry.successes, entry.trials);
                self.score_sum += new_score - old_score;
                self.renormalize();
            }
            Outcome::Rejected | Outcome::Timeout => {
                let entry = &mut self.entries[index];
                entry.trials += 1;
                let new_score =
                    score(self.laplace_alpha, self.laplace_beta, entry.successes, entry.trials);
                self.score_sum += new_score - old_score;
                self.renormalize();
            }
            Outcome::RequestNotMalformed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn table_of(chars: &[&str]) -> CharTable {
        let entries = chars
            .iter()
            .flat_map(|c| {
                Slot::ALL
                    .into_iter()
                    .map(move |slot| (Bytes::from(c.as_bytes().to_vec()), slot))
            })
            .collect();
        CharTable::new(entries, Some(IllegalIn::HeaderValue))
    }

    #[test]
    fn initial_probabilities_are_uniform() {
        let table = table_of(&["a", "b", "c"]);
        assert_eq!(table.len(), 9);
        let expected = 1.0 / 9.0;
        for index in 0..table.len() {
            let p = table.entry(index).unwrap().probability;
            assert!((p - expected).abs() < 1e-9, "p={p} expected={expected}");
        }
    }

    #[test]
    fn probabilities_sum_to_one_after_reports() {
        let mut table = table_of(&["a", "b", "c"]);
        table.report_result(0, Outcome::Modified);
        table.report_result(1, Outcome::Rejected);
        let sum: f64 = (0..table.len()).map(|i| table.entry(i).unwrap().probability).sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
    }

    #[test]
    fn accepted_drops_entry_and_renormalizes() {
        let mut table = table_of(&["a", "b", "c"]);
        let before = table.len();
        table.report_result(0, Outcome::Accepted);
        assert_eq!(table.len(), before - 1);
        let sum: f64 = (0..table.len()).map(|i| table.entry(i).unwrap().probability).sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
    }

    #[test]
    fn sample_returns_none_when_drained() {
        let mut table = table_of(&["a"]);
        let mut rng = StdRng::seed_from_u64(42);
        while !table.is_empty() {
            table.report_result(0, Outcome::Accepted);
        }
        assert_eq!(table.sample(&mut rng), None);
    }
}
