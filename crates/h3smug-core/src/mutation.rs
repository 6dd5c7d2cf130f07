//! The five byte-string mutation operators: `InsertChar`, `DeleteChar`,
//! `FillUntilMax`, `AddMax`, `ReplaceWithUppercase`.

use std::collections::HashMap;

use bytes::Bytes;
use rand::Rng;

use crate::model::{CharTable, MaliciousLoad, Position, Slot};

const UPPERCASE_RETRY_BUDGET: usize = 1024;

/// A named mutation operator, as declared in the grammar document's
/// `mutations` table.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert `quantity` sampled char-table entries.
    InsertChar {
        /// Char-table to sample entries from.
        table: String,
        /// Where to splice the sampled bytes in.
        position: Position,
        /// How many entries to insert.
        quantity: usize,
    },
    /// Remove `quantity` bytes at sampled offsets.
    DeleteChar {
        /// Where to remove bytes from.
        position: Position,
        /// How many bytes to remove.
        quantity: usize,
    },
    /// Insert enough sampled entries to reach `max_chars + offset` total
    /// length.
    FillUntilMax {
        /// Char-table to sample entries from.
        table: String,
        /// Where to splice the sampled bytes in.
        position: Position,
        /// Added to `max_chars` before subtracting the current length.
        offset: i64,
    },
    /// Insert exactly `max_chars + offset` sampled entries, independent of
    /// the current length.
    AddMax {
        /// Char-table to sample entries from.
        table: String,
        /// Where to splice the sampled bytes in.
        position: Position,
        /// Added to `max_chars` to determine the insertion count.
        offset: i64,
    },
    /// Replace `quantity` lowercase ASCII bytes with their uppercase form.
    ReplaceWithUppercase {
        /// How many bytes to replace.
        quantity: usize,
    },
}

impl Mutation {
    /// Apply this mutation to `input`, returning the mutated bytes and the
    /// malicious-byte provenance it produced (empty for `DeleteChar`).
    ///
    /// `max_chars` is required for `FillUntilMax`/`AddMax` and ignored
    /// otherwise; callers pass `max_name_chars`/`max_value_chars` as
    /// appropriate for the terminal being mutated.
    pub fn apply(
        &self,
        input: Bytes,
        max_chars: Option<usize>,
        tables: &HashMap<String, CharTable>,
        rng: &mut impl Rng,
    ) -> (Bytes, MaliciousLoad) {
        match self {
            Mutation::InsertChar { table, position, quantity } => {
                insert_char(input, table, *position, *quantity, tables, rng)
            }
            Mutation::DeleteChar { position, quantity } => {
                (delete_char(input, *position, *quantity, rng), MaliciousLoad::default())
            }
            Mutation::FillUntilMax { table, position, offset } => {
                let max = max_chars.unwrap_or(0) as i64;
                let quantity = (max + offset - input.len() as i64).max(0) as usize;
                insert_char(input, table, *position, quantity, tables, rng)
            }
            Mutation::AddMax { table, position, offset } => {
                let max = max_chars.unwrap_or(0) as i64;
                let quantity = (max + offset).max(0) as usize;
                insert_char(input, table, *position, quantity, tables, rng)
            }
            Mutation::ReplaceWithUppercase { quantity } => replace_with_uppercase(input, *quantity, rng),
        }
    }
}

fn insert_char(
    input: Bytes,
    table_name: &str,
    position: Position,
    quantity: usize,
    tables: &HashMap<String, CharTable>,
    rng: &mut impl Rng,
) -> (Bytes, MaliciousLoad) {
    let mut buf = input.to_vec();
    let mut load = MaliciousLoad::default();
    let Some(table) = tables.get(table_name) else {
        return (Bytes::from(buf), load);
    };
    if table.is_empty() {
        return (Bytes::from(buf), load);
    }
    for _ in 0..quantity {
        let Some(index) = table.sample(rng) else {
            break;
        };
        let entry = table.entry(index).expect("sampled index is in range");
        let offset = resolve_insert_offset(position, entry.slot, buf.len(), rng);
        buf.splice(offset..offset, entry.bytes.iter().copied());
        if table.illegal_in.is_some() {
            load.push_all(entry.bytes.clone());
            load.push_char(table_name.to_string(), (entry.bytes.clone(), entry.slot));
        }
    }
    (Bytes::from(buf), load)
}

fn delete_char(input: Bytes, position: Position, quantity: usize, rng: &mut impl Rng) -> Bytes {
    let mut buf = input.to_vec();
    for _ in 0..quantity {
        if buf.is_empty() {
            break;
        }
        let offset = match position {
            Position::All => rng.random_range(0..buf.len()),
            Position::Infix => random_interior(buf.len(), rng),
            Position::Prefix => 0,
            Position::Postfix => buf.len() - 1,
        };
        buf.remove(offset);
    }
    Bytes::from(buf)
}

fn replace_with_uppercase(input: Bytes, quantity: usize, rng: &mut impl Rng) -> (Bytes, MaliciousLoad) {
    let mut buf = input.to_vec();
    let mut load = MaliciousLoad::default();
    for _ in 0..quantity {
        let mut found = None;
        for _ in 0..UPPERCASE_RETRY_BUDGET {
            if buf.is_empty() {
                break;
            }
            let index = rng.random_range(0..buf.len());
            if (b'a'..=b'z').contains(&buf[index]) {
                found = Some(index);
                break;
            }
        }
        match found {
            Some(index) => {
                buf[index] -= 32;
                load.push_all(Bytes::copy_from_slice(&buf[index..=index]));
            }
            None => {
                tracing::warn!(
                    retry_budget = UPPERCASE_RETRY_BUDGET,
                    "ReplaceWithUppercase exhausted its retry budget without finding a lowercase byte"
                );
            }
        }
    }
    (Bytes::from(buf), load)
}

fn resolve_insert_offset(position: Position, slot: Slot, len: usize, rng: &mut impl Rng) -> usize {
    match position {
        Position::All => match slot {
            Slot::Postfix => len,
            Slot::Prefix => 0,
            Slot::Infix => random_interior(len, rng),
        },
        Position::Prefix => 0,
        Position::Postfix => len,
        Position::Infix => random_interior(len, rng),
    }
}

/// Mirrors the reference implementation's `integers(1, len-1)`: an interior
/// offset that is never the very first or very last byte, falling back to
/// the midpoint for strings too short to have an interior.
fn random_interior(len: usize, rng: &mut impl Rng) -> usize {
    if len <= 2 {
        return len / 2;
    }
    rng.random_range(1..len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IllegalIn;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn tables_with(name: &str, chars: &[&str]) -> HashMap<String, CharTable> {
        let entries = chars
            .iter()
            .flat_map(|c| {
                Slot::ALL
                    .into_iter()
                    .map(move |slot| (Bytes::from(c.as_bytes().to_vec()), slot))
            })
            .collect();
        let mut map = HashMap::new();
        map.insert(name.to_string(), CharTable::new(entries, Some(IllegalIn::HeaderValue)));
        map
    }

    #[test]
    fn insert_char_grows_input_and_tracks_malicious_load() {
        let tables = tables_with("crlf", &["\r", "\n"]);
        let mutation = Mutation::InsertChar {
            table: "crlf".to_string(),
            position: Position::Prefix,
            quantity: 2,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let (out, load) = mutation.apply(Bytes::from_static(b"value"), None, &tables, &mut rng);
        assert_eq!(out.len(), 7);
        assert_eq!(load.all.len().min(2), load.chars.len().min(2));
        assert!(!load.chars.is_empty());
    }

    #[test]
    fn delete_char_shrinks_input() {
        let mutation = Mutation::DeleteChar { position: Position::All, quantity: 3 };
        let mut rng = StdRng::seed_from_u64(1);
        let (out, load) = mutation.apply(Bytes::from_static(b"abcdef"), None, &HashMap::new(), &mut rng);
        assert_eq!(out.len(), 3);
        assert!(load.all.is_empty());
    }

    #[test]
    fn fill_until_max_reaches_target_length() {
        let tables = tables_with("x", &["x"]);
        let mutation = Mutation::FillUntilMax {
            table: "x".to_string(),
            position: Position::Postfix,
            offset: 0,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let (out, _) = mutation.apply(Bytes::from_static(b"ab"), Some(10), &tables, &mut rng);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn replace_with_uppercase_on_empty_input_does_not_panic() {
        let mutation = Mutation::ReplaceWithUppercase { quantity: 5 };
        let mut rng = StdRng::seed_from_u64(9);
        let (out, load) = mutation.apply(Bytes::new(), None, &HashMap::new(), &mut rng);
        assert!(out.is_empty());
        assert!(load.all.is_empty());
    }
}
