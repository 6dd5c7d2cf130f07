//! Property-based tests for the probability invariants every `CharTable`
//! and `NonTerminal` must hold after any sequence of outcome reports.

use bytes::Bytes;
use h3smug_core::model::{CharTable, IllegalIn, Outcome, Slot};
use proptest::prelude::*;

fn arb_outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Modified),
        Just(Outcome::Rejected),
        Just(Outcome::Timeout),
        Just(Outcome::Accepted),
    ]
}

fn table_of(n: usize) -> CharTable {
    let entries = (0..n).map(|i| (Bytes::from(vec![b'a' + (i % 26) as u8]), Slot::Infix)).collect();
    CharTable::new(entries, Some(IllegalIn::HeaderValue))
}

proptest! {
    /// Invariant 2 + 3: after any sequence of reports, surviving
    /// probabilities sum to 1 and no entry's successes exceed its trials.
    #[test]
    fn reports_preserve_probability_and_success_invariants(
        reports in prop::collection::vec((0usize..8, arb_outcome()), 0..40)
    ) {
        let mut table = table_of(8);
        for (raw_index, outcome) in reports {
            if table.is_empty() {
                break;
            }
            let index = raw_index % table.len();
            table.report_result(index, outcome);
        }

        if !table.is_empty() {
            let sum: f64 = (0..table.len()).map(|i| table.entry(i).unwrap().probability).sum();
            prop_assert!((sum - 1.0).abs() < 1e-6, "probabilities summed to {sum}");
        }
        for i in 0..table.len() {
            let entry = table.entry(i).unwrap();
            prop_assert!(entry.successes <= entry.trials);
        }
    }
}

#[test]
fn drained_table_has_zero_entries_and_no_panic_on_further_reports() {
    let mut table = table_of(2);
    table.report_result(0, Outcome::Accepted);
    table.report_result(0, Outcome::Accepted);
    assert!(table.is_empty());
    // Reporting against an out-of-range index after draining must be a
    // no-op, not a panic.
    table.report_result(0, Outcome::Modified);
    assert!(table.is_empty());
}
