//! Length-Bound Discovery: binary search for the largest header name/value
//! length a proxy accepts.

use bytes::Bytes;

use crate::builder::{self, BuildParams};
use crate::error::{Error, Result};
use crate::model::Request;

const INITIAL_LOWER: u64 = 8;
const INITIAL_UPPER: u64 = 16;
const UPPER_CAP: u64 = 1u64 << 32;

/// Which header field the search is probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Search for the maximum accepted header *name* length.
    Name,
    /// Search for the maximum accepted header *value* length.
    Value,
}

/// The result of observing one probe's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The proxy returned 200 and forwarded the request.
    Accepted,
    /// A QPACK encoder-stream error or timeout occurred — treated as the
    /// proxy rejecting an oversized field. The caller must open a fresh
    /// connection before the next probe.
    RejectedOrPoisoned,
}

/// What the caller should do after `observe` updates the search state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Send another probe at `current_length()`.
    Continue,
    /// The connection is poisoned; reconnect, then send another probe at
    /// `current_length()`.
    NeedsReconnect,
    /// The search has converged; the accepted value is the carried `u64`.
    Done(u64),
}

/// Binary search state, preserved across phase-sequencer reconnects so a
/// poisoned connection doesn't restart the search.
#[derive(Debug, Clone)]
pub struct LengthBoundSearch {
    field: Field,
    lower: u64,
    upper: u64,
    current: u64,
}

impl LengthBoundSearch {
    /// Start a new search with the reference implementation's initial
    /// bounds (`lower=8`, `upper=16`), or skip straight to a fixed value
    /// when the CLI's `--boundary` override is set.
    pub fn new(field: Field) -> Self {
        LengthBoundSearch { field, lower: INITIAL_LOWER, upper: INITIAL_UPPER, current: INITIAL_UPPER }
    }

    /// Build a search that has already converged to `boundary`, mirroring
    /// the reference implementation's `-b` CLI override.
    pub fn fixed(field: Field, boundary: u64) -> Self {
        LengthBoundSearch { field, lower: boundary, upper: boundary, current: boundary }
    }

    /// The length the next probe must use.
    pub fn current_length(&self) -> u64 {
        self.current
    }

    /// Whether the search has already converged — true immediately for a
    /// [`LengthBoundSearch::fixed`] search, since `lower == current` from
    /// construction. Callers should check this before sending a probe.
    pub fn is_converged(&self) -> bool {
        self.lower == self.current || self.lower + 1 == self.upper
    }

    /// Build the probe request for `current_length()`: the four mandatory
    /// pseudo-headers plus one header whose name or value is `current`
    /// copies of ASCII `x`.
    pub fn build_probe(&self, params: &BuildParams<'_>) -> Request {
        let filler = vec![b'x'; self.current as usize];
        let mut headers = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            (Bytes::from_static(b":authority"), Bytes::copy_from_slice(params.authority)),
            (Bytes::from_static(b":path"), Bytes::copy_from_slice(params.path)),
        ];
        match self.field {
            Field::Name => headers.push((Bytes::from(filler), Bytes::from_static(b"probe"))),
            Field::Value => headers.push((Bytes::from_static(b"x-h3smug-len-probe"), Bytes::from(filler))),
        }
        let id = builder::next_request_id();
        headers.push((Bytes::from_static(b"smuggling-id"), Bytes::from(id.to_string().into_bytes())));
        Request { id, headers, body: None, malicious: Default::default() }
    }

    /// Advance the search given the observed probe result.
    pub fn observe(&mut self, result: ProbeResult) -> Result<ProbeOutcome> {
        match result {
            ProbeResult::Accepted => {
                self.lower = self.current;
                if self.current == self.upper {
                    let doubled = self
                        .upper
                        .checked_mul(2)
                        .ok_or_else(|| Error::Internal("length-bound search overflowed u64".into()))?;
                    if doubled > UPPER_CAP {
                        return Err(Error::Internal(format!(
                            "length-bound search exceeded the 2^32 cap (upper would be {doubled})"
                        )));
                    }
                    self.upper = doubled;
                    self.current = self.upper;
                } else {
                    self.current = self.lower + (self.upper - self.lower) / 2;
                }
                Ok(self.terminal_or(ProbeOutcome::Continue))
            }
            ProbeResult::RejectedOrPoisoned => {
                self.upper = self.current;
                self.current = self.lower + (self.upper - self.lower) / 2;
                Ok(self.terminal_or(ProbeOutcome::NeedsReconnect))
            }
        }
    }

    fn terminal_or(&self, fallback: ProbeOutcome) -> ProbeOutcome {
        if self.lower == self.current || self.lower + 1 == self.upper {
            ProbeOutcome::Done(self.lower)
        } else {
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A proxy that accepts any field up to (and including) 100 bytes.
    fn probe(length: u64) -> ProbeResult {
        if length <= 100 { ProbeResult::Accepted } else { ProbeResult::RejectedOrPoisoned }
    }

    #[test]
    fn converges_on_a_bounded_proxy() {
        let mut search = LengthBoundSearch::new(Field::Name);
        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps < 64, "search failed to converge");
            let result = probe(search.current_length());
            match search.observe(result).unwrap() {
                ProbeOutcome::Done(limit) => {
                    assert_eq!(limit, 100);
                    break;
                }
                ProbeOutcome::Continue | ProbeOutcome::NeedsReconnect => {}
            }
        }
    }

    #[test]
    fn fixed_search_is_immediately_converged() {
        let search = LengthBoundSearch::fixed(Field::Value, 42);
        assert!(search.is_converged());
        assert_eq!(search.current_length(), 42);
    }
}
