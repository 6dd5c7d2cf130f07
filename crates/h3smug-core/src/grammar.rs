//! Grammar loading, validation, pre-test application, and derivation
//! sampling.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use bytes::Bytes;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{
    ActionKind, CharTable, Data, Derivation, Header, IllegalIn, NonTerminal, Outcome, PreTest,
    PreTestAction, Slot, Symbol, Terminal,
};
use crate::mutation::Mutation;

const TOP_LEVEL_KEYS: &[&str] = &["nonterminals", "headers", "data", "char-tables", "mutations", "pre-tests"];

/// The loaded, validated, and (after pre-tests run) mutable grammar: the
/// single source of truth the request builder and mutation engine read
/// from.
#[derive(Debug, Clone)]
pub struct Grammar {
    symbols: HashMap<String, Symbol>,
    char_tables: HashMap<String, CharTable>,
    mutations: HashMap<String, Mutation>,
    pre_tests: Vec<PreTest>,
}

impl Grammar {
    /// Parse and validate a grammar document from a JSON file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        Self::from_value(&value)
    }

    /// Parse and validate a grammar document from an already-parsed JSON
    /// value.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Config("grammar document root must be a JSON object".into()))?;

        for key in object.keys() {
            if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                return Err(Error::Config(format!("unknown top-level grammar key: {key}")));
            }
        }

        let mut symbols = HashMap::new();
        if let Some(nonterminals) = object.get("nonterminals").and_then(Value::as_object) {
            for (name, body) in nonterminals {
                symbols.insert(name.clone(), Symbol::NonTerminal(parse_nonterminal(name, body)?));
            }
        }
        if let Some(headers) = object.get("headers").and_then(Value::as_object) {
            for (name, body) in headers {
                symbols.insert(name.clone(), Symbol::Header(parse_header(name, body)?));
            }
        }
        if let Some(data) = object.get("data").and_then(Value::as_object) {
            for (name, body) in data {
                symbols.insert(name.clone(), Symbol::Data(parse_data(body)?));
            }
        }

        let mut char_tables = HashMap::new();
        if let Some(tables) = object.get("char-tables").and_then(Value::as_object) {
            for (name, body) in tables {
                char_tables.insert(name.clone(), parse_char_table(name, body)?);
            }
        }

        let mut mutations = HashMap::new();
        if let Some(muts) = object.get("mutations").and_then(Value::as_object) {
            for (name, body) in muts {
                mutations.insert(name.clone(), parse_mutation(name, body)?);
            }
        }

        let mut pre_tests = Vec::new();
        if let Some(tests) = object.get("pre-tests").and_then(Value::as_object) {
            for (name, body) in tests {
                pre_tests.push(parse_pre_test(name, body)?);
            }
        }

        let grammar = Grammar { symbols, char_tables, mutations, pre_tests };
        grammar.validate()?;
        Ok(grammar)
    }

    /// Confirm every cross-reference resolves and every probability
    /// invariant holds. Called once, immediately after loading.
    pub fn validate(&self) -> Result<()> {
        for symbol in self.symbols.values() {
            if let Symbol::NonTerminal(nt) = symbol {
                if nt.derivations.len() != nt.probabilities.len() {
                    return Err(Error::Validation(format!(
                        "{}: {} derivations but {} probabilities",
                        nt.name,
                        nt.derivations.len(),
                        nt.probabilities.len()
                    )));
                }
                let sum: f64 = nt.probabilities.iter().sum();
                if (sum - 1.0).abs() > 1e-6 {
                    return Err(Error::Validation(format!(
                        "{}: probabilities sum to {sum}, expected 1.0",
                        nt.name
                    )));
                }
                for derivation in &nt.derivations {
                    if let Some(symbols) = derivation {
                        for referenced in symbols {
                            if !self.symbols.contains_key(referenced) {
                                return Err(Error::Reference(format!(
                                    "{} references unknown symbol {referenced}",
                                    nt.name
                                )));
                            }
                        }
                    }
                }
            }
            if let Symbol::Header(header) = symbol {
                validate_terminal(&header.name_terminal, &self.mutations, &self.char_tables)?;
                validate_terminal(&header.value_terminal, &self.mutations, &self.char_tables)?;
            }
        }
        for mutation in self.mutations.values() {
            let table_name = match mutation {
                Mutation::InsertChar { table, .. }
                | Mutation::FillUntilMax { table, .. }
                | Mutation::AddMax { table, .. } => Some(table),
                Mutation::DeleteChar { .. } | Mutation::ReplaceWithUppercase { .. } => None,
            };
            if let Some(table_name) = table_name {
                if !self.char_tables.contains_key(table_name) {
                    return Err(Error::Reference(format!("mutation references unknown char-table {table_name}")));
                }
            }
        }
        for pre_test in &self.pre_tests {
            for name in &pre_test.sequence {
                if !self.symbols.contains_key(name) {
                    return Err(Error::Reference(format!(
                        "pre-test {} references unknown symbol {name}",
                        pre_test.name
                    )));
                }
            }
            for actions in pre_test.influence.values().flatten() {
                for action_list in actions.values() {
                    for action in action_list {
                        if !self.symbols.contains_key(&action.nonterminal) {
                            return Err(Error::Reference(format!(
                                "pre-test {} targets unknown non-terminal {}",
                                pre_test.name, action.nonterminal
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up a symbol by its grammar-document name.
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// The declared char-tables, keyed by name.
    pub fn char_tables(&self) -> &HashMap<String, CharTable> {
        &self.char_tables
    }

    /// Mutable access to the declared char-tables, for reporting outcomes.
    pub fn char_tables_mut(&mut self) -> &mut HashMap<String, CharTable> {
        &mut self.char_tables
    }

    /// The declared mutations, keyed by name.
    pub fn mutations(&self) -> &HashMap<String, Mutation> {
        &self.mutations
    }

    /// The declared pre-tests, in grammar-document order.
    pub fn pre_tests(&self) -> &[PreTest] {
        &self.pre_tests
    }

    /// Mutable access to the declared pre-tests, for recording classified
    /// outcomes.
    pub fn pre_tests_mut(&mut self) -> &mut [PreTest] {
        &mut self.pre_tests
    }

    /// Sample one derivation of `name`, weighted by its current
    /// probabilities. Returns `Ok(None)` for an epsilon derivation or an
    /// unknown/non-non-terminal name.
    pub fn sample_derivation(&self, name: &str, rng: &mut impl Rng) -> Result<Option<Vec<String>>> {
        let Some(Symbol::NonTerminal(nt)) = self.symbols.get(name) else {
            return Err(Error::Internal(format!("{name} is not a non-terminal")));
        };
        if nt.derivations.is_empty() {
            return Ok(None);
        }
        let mut roll: f64 = rng.random();
        let mut chosen = nt.derivations.len() - 1;
        for (index, probability) in nt.probabilities.iter().enumerate() {
            roll -= probability;
            if roll <= 0.0 {
                chosen = index;
                break;
            }
        }
        let derivation = nt.derivations[chosen].clone();
        if let Some(mut symbols) = derivation {
            if nt.permutable {
                symbols.shuffle(rng);
            }
            Ok(Some(symbols))
        } else {
            Ok(None)
        }
    }

    /// Whether expanding `name` taints the request (the symbol itself, or
    /// the terminal chosen within it, is marked `illegal`).
    pub fn is_illegal(&self, name: &str) -> bool {
        match self.symbols.get(name) {
            Some(Symbol::NonTerminal(nt)) => nt.illegal,
            Some(Symbol::Header(h)) => h.name_terminal.illegal || h.value_terminal.illegal,
            Some(Symbol::Data(d)) => d.illegal,
            None => false,
        }
    }

    /// Apply every pre-test's classified influence to the grammar, in the
    /// two-pass order the specification requires: all drops, then all
    /// raises and lowers, with a single renormalization pass at the end.
    pub fn apply_pre_test_actions(&mut self) -> Result<()> {
        let drops: Vec<PreTestAction> = self
            .pre_tests
            .iter()
            .filter_map(|pt| pt.result.and_then(|outcome| pt.influence.get(&outcome).cloned().flatten()))
            .filter_map(|actions| actions.get(&ActionKind::Drop).cloned())
            .flatten()
            .collect();
        for action in &drops {
            self.apply_drop(action)?;
        }

        let mut touched: HashMap<String, HashSet<usize>> = HashMap::new();
        let raises: Vec<PreTestAction> = self
            .pre_tests
            .iter()
            .filter_map(|pt| pt.result.and_then(|outcome| pt.influence.get(&outcome).cloned().flatten()))
            .filter_map(|actions| actions.get(&ActionKind::Raise).cloned())
            .flatten()
            .collect();
        for action in &raises {
            self.apply_raise_or_lower(action, true, &mut touched)?;
        }
        let lowers: Vec<PreTestAction> = self
            .pre_tests
            .iter()
            .filter_map(|pt| pt.result.and_then(|outcome| pt.influence.get(&outcome).cloned().flatten()))
            .filter_map(|actions| actions.get(&ActionKind::Lower).cloned())
            .flatten()
            .collect();
        for action in &lowers {
            self.apply_raise_or_lower(action, false, &mut touched)?;
        }

        for (name, ignored) in touched {
            self.renormalize_nonterminal(&name, &ignored)?;
        }
        Ok(())
    }

    fn apply_drop(&mut self, action: &PreTestAction) -> Result<()> {
        if let Some(index) = action.derivative {
            self.drop_derivation(&action.nonterminal, index)?;
        } else {
            let targets = self.derivations_referencing(&action.nonterminal);
            for (owner, index) in targets {
                self.drop_derivation(&owner, index)?;
            }
        }
        Ok(())
    }

    fn drop_derivation(&mut self, owner: &str, index: usize) -> Result<()> {
        let Some(Symbol::NonTerminal(nt)) = self.symbols.get_mut(owner) else {
            return Err(Error::Reference(format!("drop action targets unknown non-terminal {owner}")));
        };
        if index >= nt.derivations.len() {
            return Err(Error::Internal(format!("{owner}: drop index {index} out of range")));
        }
        nt.derivations.remove(index);
        nt.probabilities.remove(index);
        self.renormalize_nonterminal(owner, &HashSet::new())
    }

    fn apply_raise_or_lower(
        &mut self,
        action: &PreTestAction,
        raise: bool,
        touched: &mut HashMap<String, HashSet<usize>>,
    ) -> Result<()> {
        let factor = action
            .factor
            .ok_or_else(|| Error::Validation("raise/lower action missing factor".into()))?;
        let targets: Vec<(String, usize)> = if let Some(index) = action.derivative {
            vec![(action.nonterminal.clone(), index)]
        } else {
            self.derivations_referencing(&action.nonterminal)
        };
        for (owner, index) in targets {
            let Some(Symbol::NonTerminal(nt)) = self.symbols.get_mut(&owner) else {
                continue;
            };
            if let Some(p) = nt.probabilities.get_mut(index) {
                *p = if raise { *p + (1.0 - *p) * factor } else { *p * (1.0 - factor) };
            }
            touched.entry(owner).or_default().insert(index);
        }
        Ok(())
    }

    /// Every `(non-terminal name, derivation index)` whose symbol list
    /// mentions `target`.
    fn derivations_referencing(&self, target: &str) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        for symbol in self.symbols.values() {
            if let Symbol::NonTerminal(nt) = symbol {
                for (index, derivation) in nt.derivations.iter().enumerate() {
                    if let Some(symbols) = derivation {
                        if symbols.iter().any(|s| s == target) {
                            out.push((nt.name.clone(), index));
                        }
                    }
                }
            }
        }
        out
    }

    /// Distribute `1 − Σp` equally across the derivations of `owner` not in
    /// `ignored`, preserving the relative ordering among the ignored
    /// (just-adjusted) derivations.
    fn renormalize_nonterminal(&mut self, owner: &str, ignored: &HashSet<usize>) -> Result<()> {
        let Some(Symbol::NonTerminal(nt)) = self.symbols.get_mut(owner) else {
            return Ok(());
        };
        if nt.probabilities.is_empty() {
            return Ok(());
        }
        let sum: f64 = nt.probabilities.iter().sum();
        let remaining = 1.0 - sum;
        let considered = nt.probabilities.len() - ignored.len().min(nt.probabilities.len());
        if considered == 0 {
            return Ok(());
        }
        let share = remaining / considered as f64;
        for (index, p) in nt.probabilities.iter_mut().enumerate() {
            if !ignored.contains(&index) {
                *p += share;
            }
        }
        Ok(())
    }
}

const LITERAL_PLACEHOLDERS: [&str; 2] = ["authority", "path"];

fn validate_terminal(
    terminal: &Terminal,
    mutations: &HashMap<String, Mutation>,
    _char_tables: &HashMap<String, CharTable>,
) -> Result<()> {
    if terminal.literals.len() != terminal.literal_probabilities.len() {
        return Err(Error::Validation("terminal literal/probability length mismatch".into()));
    }
    for chain in &terminal.mutation_chains {
        for name in chain {
            if !mutations.contains_key(name) {
                return Err(Error::Reference(format!("terminal references unknown mutation {name}")));
            }
        }
    }
    for literal in &terminal.literals {
        for placeholder in extract_placeholders(&String::from_utf8_lossy(literal)) {
            if !LITERAL_PLACEHOLDERS.contains(&placeholder.as_str()) {
                return Err(Error::Validation(format!(
                    "terminal literal embeds unknown placeholder <{placeholder}>, expected one of {LITERAL_PLACEHOLDERS:?}"
                )));
            }
        }
    }
    Ok(())
}

fn extract_placeholders(literal: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = literal.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == '<' {
            let mut name = String::new();
            for (_, c2) in chars.by_ref() {
                if c2 == '>' {
                    break;
                }
                name.push(c2);
            }
            names.push(name);
        }
    }
    names
}

fn parse_nonterminal(name: &str, body: &Value) -> Result<NonTerminal> {
    let derivations_raw = body
        .get("derivations")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Config(format!("{name}: missing derivations array")))?;
    let derivations: Vec<Derivation> = derivations_raw
        .iter()
        .map(|d| match d {
            Value::Null => None,
            Value::String(s) => Some(extract_placeholders(s)),
            Value::Array(items) => {
                Some(items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            }
            _ => None,
        })
        .collect();

    let probabilities = match body.get("probabilities") {
        None | Some(Value::String(_)) => {
            let uniform = 1.0 / derivations.len() as f64;
            vec![uniform; derivations.len()]
        }
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_f64).collect(),
        _ => return Err(Error::Config(format!("{name}: malformed probabilities"))),
    };

    let probabilities = if derivations.len() == 1 { vec![1.0] } else { probabilities };

    Ok(NonTerminal {
        name: name.to_string(),
        derivations,
        probabilities,
        permutable: body.get("permutable").and_then(Value::as_bool).unwrap_or(false),
        illegal: body.get("illegal").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_terminal(name: &str, body: &Value) -> Result<Terminal> {
    let literals_raw = body
        .get("literals")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Config(format!("{name}: missing literals array")))?;
    let literals: Vec<Bytes> = literals_raw
        .iter()
        .filter_map(Value::as_str)
        .map(|s| Bytes::from(s.as_bytes().to_vec()))
        .collect();

    let literal_probabilities = match body.get("probabilities") {
        None | Some(Value::String(_)) => vec![1.0 / literals.len() as f64; literals.len()],
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_f64).collect(),
        _ => return Err(Error::Config(format!("{name}: malformed literal probabilities"))),
    };
    let literal_probabilities = if literals.len() == 1 { vec![1.0] } else { literal_probabilities };

    let mutation_chains: Vec<Vec<String>> = body
        .get("mutations")
        .and_then(Value::as_array)
        .map(|chains| {
            chains
                .iter()
                .map(|chain| {
                    chain
                        .as_array()
                        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    let mutation_chain_probabilities = if mutation_chains.is_empty() {
        None
    } else {
        match body.get("mutation_probabilities") {
            None => Some(vec![1.0 / mutation_chains.len() as f64; mutation_chains.len()]),
            Some(Value::Array(values)) => Some(values.iter().filter_map(Value::as_f64).collect()),
            _ => return Err(Error::Config(format!("{name}: malformed mutation probabilities"))),
        }
    };

    Ok(Terminal {
        literals,
        literal_probabilities,
        mutation_chains,
        mutation_chain_probabilities,
        illegal: body.get("illegal").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_header(name: &str, body: &Value) -> Result<Header> {
    let name_terminal = body
        .get("name")
        .ok_or_else(|| Error::Config(format!("{name}: missing name terminal")))
        .and_then(|v| parse_terminal(&format!("{name}.name"), v))?;
    let value_terminal = body
        .get("value")
        .ok_or_else(|| Error::Config(format!("{name}: missing value terminal")))
        .and_then(|v| parse_terminal(&format!("{name}.value"), v))?;
    Ok(Header { name: name.to_string(), name_terminal, value_terminal })
}

fn parse_data(body: &Value) -> Result<Data> {
    let load = body.get("load").and_then(Value::as_str).unwrap_or_default();
    Ok(Data {
        load: Bytes::from(load.as_bytes().to_vec()),
        illegal: body.get("illegal").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_byte_token(token: &str) -> Bytes {
    if token.len() == 4 && token.starts_with("0x") {
        if let Ok(byte) = u8::from_str_radix(&token[2..], 16) {
            return Bytes::from(vec![byte]);
        }
    }
    Bytes::from(token.as_bytes().to_vec())
}

fn parse_char_table(name: &str, body: &Value) -> Result<CharTable> {
    let chars_raw = body
        .get("chars")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Config(format!("{name}: missing chars array")))?;
    let illegal_in = match body.get("illegal-in").and_then(Value::as_str) {
        None => None,
        Some("header-name") => Some(IllegalIn::HeaderName),
        Some("header-value") => Some(IllegalIn::HeaderValue),
        Some(other) => return Err(Error::Config(format!("{name}: unknown illegal-in value {other}"))),
    };
    let entries: Vec<(Bytes, Slot)> = chars_raw
        .iter()
        .filter_map(Value::as_str)
        .flat_map(|token| {
            let bytes = parse_byte_token(token);
            Slot::ALL.into_iter().map(move |slot| (bytes.clone(), slot))
        })
        .collect();
    Ok(CharTable::new(entries, illegal_in))
}

fn parse_position(s: Option<&str>) -> Result<crate::model::Position> {
    match s {
        Some("all") | None => Ok(crate::model::Position::All),
        Some("prefix") => Ok(crate::model::Position::Prefix),
        Some("infix") => Ok(crate::model::Position::Infix),
        Some("postfix") => Ok(crate::model::Position::Postfix),
        Some(other) => Err(Error::Config(format!("unknown mutation position {other}"))),
    }
}

fn parse_mutation(name: &str, body: &Value) -> Result<Mutation> {
    let kind = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Config(format!("{name}: missing mutation type")))?;
    let position = parse_position(body.get("position").and_then(Value::as_str))?;
    match kind {
        "InsertChar" => Ok(Mutation::InsertChar {
            table: require_str(body, name, "table")?,
            position,
            quantity: body.get("quantity").and_then(Value::as_u64).unwrap_or(1) as usize,
        }),
        "DeleteChar" => Ok(Mutation::DeleteChar {
            position,
            quantity: body.get("quantity").and_then(Value::as_u64).unwrap_or(1) as usize,
        }),
        "FillUntilMax" => Ok(Mutation::FillUntilMax {
            table: require_str(body, name, "table")?,
            position,
            offset: body.get("offset").and_then(Value::as_i64).unwrap_or(0),
        }),
        "AddMax" => Ok(Mutation::AddMax {
            table: require_str(body, name, "table")?,
            position,
            offset: body.get("offset").and_then(Value::as_i64).unwrap_or(0),
        }),
        "ReplaceWithUppercase" => Ok(Mutation::ReplaceWithUppercase {
            quantity: body.get("quantity").and_then(Value::as_u64).unwrap_or(1) as usize,
        }),
        other => Err(Error::Config(format!("{name}: unknown mutation type {other}"))),
    }
}

fn require_str(body: &Value, owner: &str, field: &str) -> Result<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("{owner}: missing required field {field}")))
}

fn parse_action_kind(s: &str) -> Result<ActionKind> {
    match s {
        "drop" => Ok(ActionKind::Drop),
        "raise" => Ok(ActionKind::Raise),
        "lower" => Ok(ActionKind::Lower),
        other => Err(Error::Config(format!("unknown pre-test action kind {other}"))),
    }
}

fn parse_outcome_key(s: &str) -> Result<Outcome> {
    match s {
        "if-accepted" => Ok(Outcome::Accepted),
        "if-modified" => Ok(Outcome::Modified),
        "if-rejected" => Ok(Outcome::Rejected),
        "if-timeout" => Ok(Outcome::Timeout),
        other => Err(Error::Config(format!("unknown pre-test influence key {other}"))),
    }
}

fn parse_pre_test_action(value: &Value, requires_factor: bool) -> Result<PreTestAction> {
    let array = value.as_array().ok_or_else(|| Error::Config("pre-test action must be an array".into()))?;
    let (target, factor) = if requires_factor {
        if array.len() != 2 {
            return Err(Error::Config("raise/lower action must be [target, factor]".into()));
        }
        let factor = array[1].as_f64().ok_or_else(|| Error::Config("raise/lower factor must be numeric".into()))?;
        if !(0.0..=1.0).contains(&factor) {
            return Err(Error::Validation(format!("raise/lower factor {factor} out of [0,1]")));
        }
        (&array[0], Some(factor))
    } else {
        (value, None)
    };
    let target_array = target.as_array().ok_or_else(|| Error::Config("pre-test action target must be an array".into()))?;
    let nonterminal = target_array
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Config("pre-test action target missing non-terminal name".into()))?
        .to_string();
    let derivative = target_array.get(1).and_then(Value::as_u64).map(|v| v as usize);
    Ok(PreTestAction { nonterminal, derivative, factor })
}

fn parse_pre_test(name: &str, body: &Value) -> Result<PreTest> {
    let sequence = body
        .get("sequence")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let mut influence = HashMap::new();
    if let Some(influence_obj) = body.get("influence").and_then(Value::as_object) {
        for (key, actions_value) in influence_obj {
            let outcome = parse_outcome_key(key)?;
            if actions_value.is_null() {
                influence.insert(outcome, None);
                continue;
            }
            let actions_obj = actions_value
                .as_object()
                .ok_or_else(|| Error::Config(format!("pre-test {name}: influence value must be an object or null")))?;
            let mut actions = HashMap::new();
            for (action_key, action_list) in actions_obj {
                let kind = parse_action_kind(action_key)?;
                let requires_factor = kind != ActionKind::Drop;
                let list = action_list
                    .as_array()
                    .ok_or_else(|| Error::Config(format!("pre-test {name}: action list must be an array")))?
                    .iter()
                    .map(|v| parse_pre_test_action(v, requires_factor))
                    .collect::<Result<Vec<_>>>()?;
                actions.insert(kind, list);
            }
            influence.insert(outcome, Some(actions));
        }
    }

    Ok(PreTest { name: name.to_string(), sequence, influence, result: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_placeholders_from_derivation() {
        assert_eq!(extract_placeholders("<a><b>"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(extract_placeholders("plain"), Vec::<String>::new());
    }

    #[test]
    fn single_derivation_nonterminal_forces_probability_one() {
        let body: Value = serde_json::json!({ "derivations": ["<only>"] });
        let nt = parse_nonterminal("n", &body).unwrap();
        assert_eq!(nt.probabilities, vec![1.0]);
    }

    #[test]
    fn hex_escape_parses_to_single_byte() {
        assert_eq!(parse_byte_token("0x20").as_ref(), &[0x20]);
        assert_eq!(parse_byte_token("a").as_ref(), b"a");
    }

    #[test]
    fn minimal_grammar_round_trips() {
        let doc = serde_json::json!({
            "nonterminals": {
                "root": { "derivations": ["<h1>"] }
            },
            "headers": {
                "h1": {
                    "name": { "literals": [":method"] },
                    "value": { "literals": ["GET"] }
                }
            }
        });
        let grammar = Grammar::from_value(&doc).unwrap();
        assert!(grammar.symbol("root").is_some());
        assert!(grammar.symbol("h1").is_some());
    }

    #[test]
    fn terminal_literal_with_authority_and_path_placeholders_validates() {
        let doc = serde_json::json!({
            "nonterminals": { "root": { "derivations": ["<h1>"] } },
            "headers": {
                "h1": {
                    "name": { "literals": [":authority"] },
                    "value": { "literals": ["<authority><path>"] }
                }
            }
        });
        assert!(Grammar::from_value(&doc).is_ok());
    }

    #[test]
    fn terminal_literal_with_unknown_placeholder_is_rejected() {
        let doc = serde_json::json!({
            "nonterminals": { "root": { "derivations": ["<h1>"] } },
            "headers": {
                "h1": {
                    "name": { "literals": [":method"] },
                    "value": { "literals": ["<bogus>"] }
                }
            }
        });
        assert!(matches!(Grammar::from_value(&doc), Err(Error::Validation(_))));
    }
}
