//! Request Builder: derivation expansion, terminal materialization, and
//! malicious-byte provenance tracking.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use rand::Rng;

use crate::error::Result;
use crate::grammar::Grammar;
use crate::model::{MaliciousLoad, Request, Symbol, Terminal};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-wide request identifier, carried in the
/// `smuggling-id` header so the origin can correlate its echo.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

const PSEUDO_HEADER_NAMES: [&str; 4] = [":method", ":authority", ":path", ":scheme"];

/// Caller-supplied context a request is built against: the authority/path
/// placeholders, the negotiated length bounds, and whether mutations should
/// be suppressed (pre-test / length-discovery probes are always static).
#[derive(Debug, Clone)]
pub struct BuildParams<'a> {
    /// Replaces the `<authority>` placeholder in terminal literals.
    pub authority: &'a [u8],
    /// Replaces the `<path>` placeholder in terminal literals.
    pub path: &'a [u8],
    /// `max` parameter passed to `FillUntilMax`/`AddMax` when materializing
    /// a header name.
    pub max_name_chars: usize,
    /// `max` parameter passed to `FillUntilMax`/`AddMax` when materializing
    /// a header value.
    pub max_value_chars: usize,
    /// When set, always choose literal index 0 and never apply mutations.
    pub is_static: bool,
}

/// Expand `start_symbols` and materialize a complete request.
///
/// Returns the built request alongside whether expansion passed through any
/// symbol marked `illegal` — the engine generates once and tags the taint
/// rather than regenerating (see the design notes on the reference
/// implementation's livelock).
pub fn build_request(
    grammar: &Grammar,
    start_symbols: &[String],
    params: &BuildParams,
    rng: &mut impl Rng,
) -> Result<(Request, bool)> {
    let (sequence, illegal) = expand(grammar, start_symbols, rng)?;
    let id = next_request_id();
    let mut request = Request { id, headers: Vec::new(), body: None, malicious: MaliciousLoad::default() };

    for name in &sequence {
        match grammar.symbol(name) {
            Some(Symbol::Header(header)) => {
                let name_bytes =
                    materialize_terminal(&header.name_terminal, params, true, grammar, &mut request.malicious, rng);
                let value_bytes =
                    materialize_terminal(&header.value_terminal, params, false, grammar, &mut request.malicious, rng);
                request.headers.push((name_bytes, value_bytes));
            }
            Some(Symbol::Data(data)) => {
                if data.illegal {
                    request.malicious.push_all(data.load.clone());
                }
                request.body = Some(data.load.clone());
            }
            _ => {}
        }
    }

    request
        .headers
        .push((Bytes::from_static(b"smuggling-id"), Bytes::from(id.to_string().into_bytes())));
    canonicalize_malicious_entries(&mut request.malicious);
    Ok((request, illegal))
}

/// Drive the working sequence down to only `Header`/`Data` symbols by
/// repeatedly expanding the first remaining `NonTerminal`.
fn expand(grammar: &Grammar, start: &[String], rng: &mut impl Rng) -> Result<(Vec<String>, bool)> {
    let mut sequence: Vec<String> = start.to_vec();
    let mut illegal = false;

    loop {
        let position = sequence
            .iter()
            .position(|name| matches!(grammar.symbol(name), Some(Symbol::NonTerminal(_))));
        let Some(position) = position else { break };
        let name = sequence.remove(position);
        if grammar.is_illegal(&name) {
            illegal = true;
        }
        if let Some(expansion) = grammar.sample_derivation(&name, rng)? {
            for (offset, symbol) in expansion.into_iter().enumerate() {
                sequence.insert(position + offset, symbol);
            }
        }
    }

    for name in &sequence {
        if grammar.is_illegal(name) {
            illegal = true;
        }
    }
    Ok((sequence, illegal))
}

fn materialize_terminal(
    terminal: &Terminal,
    params: &BuildParams,
    is_name_field: bool,
    grammar: &Grammar,
    malicious: &mut MaliciousLoad,
    rng: &mut impl Rng,
) -> Bytes {
    let max_chars = if is_name_field { params.max_name_chars } else { params.max_value_chars };
    let literal_index =
        if params.is_static { 0 } else { sample_weighted(&terminal.literal_probabilities, rng) };
    let raw_literal = &terminal.literals[literal_index];
    let substituted = substitute_placeholders(raw_literal, params.authority, params.path);
    let mut bytes = Bytes::from(substituted);

    if terminal.illegal {
        let is_pseudo_header = PSEUDO_HEADER_NAMES.iter().any(|p| p.as_bytes() == raw_literal.as_ref());
        if !is_pseudo_header {
            malicious.push_all(bytes.clone());
        }
    }

    if !params.is_static && !terminal.mutation_chains.is_empty() {
        let chain_index = sample_weighted(terminal.mutation_chain_probabilities.as_deref().unwrap_or(&[]), rng);
        if let Some(chain) = terminal.mutation_chains.get(chain_index) {
            for mutation_name in chain {
                if let Some(mutation) = grammar.mutations().get(mutation_name) {
                    let (mutated, load) = mutation.apply(bytes, Some(max_chars), grammar.char_tables(), rng);
                    bytes = mutated;
                    malicious.merge(load);
                }
            }
        }
        malicious.push_all(bytes.clone());
    }

    bytes
}

fn sample_weighted(probabilities: &[f64], rng: &mut impl Rng) -> usize {
    if probabilities.is_empty() {
        return 0;
    }
    let mut roll: f64 = rng.random();
    for (index, probability) in probabilities.iter().enumerate() {
        roll -= probability;
        if roll <= 0.0 {
            return index;
        }
    }
    probabilities.len() - 1
}

fn substitute_placeholders(literal: &[u8], authority: &[u8], path: &[u8]) -> Vec<u8> {
    replace_all(&replace_all(literal, b"<authority>", authority), b"<path>", path)
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Add the Title-Case form of every header-name-shaped malicious entry, so
/// a proxy that canonicalizes header casing before forwarding is still
/// caught by the classifier's substring search.
fn canonicalize_malicious_entries(load: &mut MaliciousLoad) {
    let mut additions = Vec::new();
    for entry in &load.all {
        if is_header_name_like(entry) {
            let canonical = canonicalize_header_name(entry);
            if !load.all.contains(&canonical) {
                additions.push(canonical);
            }
        }
    }
    for addition in additions {
        load.push_all(addition);
    }
}

fn is_header_name_like(bytes: &Bytes) -> bool {
    if bytes.is_empty() || bytes[0] == b':' || bytes[0] == b'-' {
        return false;
    }
    bytes.iter().all(|&b| b == b'-' || b.is_ascii_alphabetic())
}

fn canonicalize_header_name(bytes: &Bytes) -> Bytes {
    let mut out = Vec::with_capacity(bytes.len());
    let mut capitalize_next = true;
    for &b in bytes.iter() {
        let lower = b.to_ascii_lowercase();
        out.push(if capitalize_next { lower.to_ascii_uppercase() } else { lower });
        capitalize_next = lower == b'-';
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_both_placeholders() {
        let out = substitute_placeholders(b"<authority>/<path>", b"example.com", b"/a");
        assert_eq!(out, b"example.com//a".to_vec());
    }

    #[test]
    fn canonicalization_title_cases_header_names() {
        let mut load = MaliciousLoad::default();
        load.push_all(Bytes::from_static(b"x-forwarded-for"));
        canonicalize_malicious_entries(&mut load);
        assert!(load.all.iter().any(|b| b.as_ref() == b"X-Forwarded-For"));
    }

    #[test]
    fn canonicalization_skips_pseudo_headers_and_non_letters() {
        let mut load = MaliciousLoad::default();
        load.push_all(Bytes::from_static(b":method"));
        load.push_all(Bytes::from_static(b"\r\n"));
        let before = load.all.len();
        canonicalize_malicious_entries(&mut load);
        assert_eq!(load.all.len(), before);
    }

    #[test]
    fn request_ids_increase_monotonically() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
