//! In-memory representation of the grammar: non-terminals, headers, terminals,
//! data nodes, mutations, pre-tests, and char-tables.

use bytes::Bytes;
use std::collections::HashMap;

/// Where a character-table entry inserts relative to the string it mutates.
///
/// Mirrors the grammar document's `-1`/`0`/`+1` encoding: postfix, prefix, infix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Insert at the start of the string (`0` in the grammar document).
    Prefix,
    /// Insert at a random interior offset (`+1` in the grammar document).
    Infix,
    /// Insert at the end of the string (`-1` in the grammar document).
    Postfix,
}

impl Slot {
    /// All three slots, in the order the grammar document allocates entries.
    pub const ALL: [Slot; 3] = [Slot::Postfix, Slot::Prefix, Slot::Infix];

    pub(crate) fn as_i8(self) -> i8 {
        match self {
            Slot::Postfix => -1,
            Slot::Prefix => 0,
            Slot::Infix => 1,
        }
    }
}

/// Where a mutation is told to operate, distinct from the `Slot` a char-table
/// entry is keyed on: `All` defers to the sampled entry's own slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Honor whichever slot the sampled char-table entry carries.
    All,
    /// Always insert/delete at offset 0.
    Prefix,
    /// Always insert/delete at a random interior offset.
    Infix,
    /// Always insert/delete at the end of the string.
    Postfix,
}

/// Which kind of terminal a char-table's entries are forbidden from appearing
/// in uncorrupted, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalIn {
    /// Entries from this table must never survive in a header name.
    HeaderName,
    /// Entries from this table must never survive in a header value.
    HeaderValue,
}

/// A single (byte-sequence, slot) entry in a char-table, with its running
/// Bayesian success statistics.
#[derive(Debug, Clone)]
pub struct CharEntry {
    /// The bytes this entry inserts.
    pub bytes: Bytes,
    /// The slot this entry is filed under.
    pub slot: Slot,
    /// Count of `MODIFIED` reports (the mutation survived to the origin, but
    /// normalized).
    pub successes: u64,
    /// Count of all reports (`MODIFIED` + `REJECTED` + `TIMEOUT`).
    pub trials: u64,
    /// Current normalized sampling probability.
    pub probability: f64,
}

/// An ordered collection of char-table entries with adaptive sampling
/// probabilities. See [`crate::chartable`] for the statistics model.
#[derive(Debug, Clone)]
pub struct CharTable {
    pub(crate) entries: Vec<CharEntry>,
    /// Which terminal kind this table's entries are illegal in, if any.
    pub illegal_in: Option<IllegalIn>,
    pub(crate) laplace_alpha: f64,
    pub(crate) laplace_beta: f64,
    /// Retained for grammar-document compatibility; the scoring formula does
    /// not currently multiply by it (see `SPEC_FULL.md` open question).
    pub(crate) success_boost: f64,
    pub(crate) score_sum: f64,
}

/// One alternative right-hand side of a non-terminal production: an ordered
/// list of symbol names, or `None` for an epsilon production.
pub type Derivation = Option<Vec<String>>;

/// A production with one or more weighted alternatives.
#[derive(Debug, Clone)]
pub struct NonTerminal {
    /// The grammar-document key this non-terminal was declared under.
    pub name: String,
    /// The alternative right-hand sides.
    pub derivations: Vec<Derivation>,
    /// Sampling probability per derivation; same length as `derivations`.
    pub probabilities: Vec<f64>,
    /// If set, the chosen derivation's symbols are randomly permuted at
    /// expansion time.
    pub permutable: bool,
    /// If set, taints any request whose expansion passes through this
    /// non-terminal.
    pub illegal: bool,
}

/// A terminal production: chooses one literal, substitutes placeholders,
/// optionally applies a mutation chain.
#[derive(Debug, Clone)]
pub struct Terminal {
    /// Candidate byte-string literals.
    pub literals: Vec<Bytes>,
    /// Sampling probability per literal; same length as `literals`.
    pub literal_probabilities: Vec<f64>,
    /// Candidate mutation chains (each an ordered list of mutation names).
    pub mutation_chains: Vec<Vec<String>>,
    /// Sampling probability per chain; `None` when no chains are declared.
    pub mutation_chain_probabilities: Option<Vec<f64>>,
    /// If set, a chosen literal (other than a pseudo-header name) is
    /// malicious by construction.
    pub illegal: bool,
}

/// A terminal production emitting one HTTP header pair.
#[derive(Debug, Clone)]
pub struct Header {
    /// The grammar-document key this header was declared under.
    pub name: String,
    /// Production for the header's name field.
    pub name_terminal: Terminal,
    /// Production for the header's value field.
    pub value_terminal: Terminal,
}

/// A terminal production contributing a request body.
#[derive(Debug, Clone)]
pub struct Data {
    /// The raw body bytes.
    pub load: Bytes,
    /// If set, this body is malicious by construction.
    pub illegal: bool,
}

/// A tagged union over the three kinds of named production in a grammar
/// document. The expander dispatches on this variant rather than on a
/// runtime type check.
#[derive(Debug, Clone)]
pub enum Symbol {
    /// A weighted-alternative production.
    NonTerminal(NonTerminal),
    /// A header-pair production.
    Header(Header),
    /// A body production.
    Data(Data),
}

impl Symbol {
    /// The grammar-document key this symbol was declared under.
    pub fn name(&self) -> &str {
        match self {
            Symbol::NonTerminal(nt) => &nt.name,
            Symbol::Header(h) => &h.name,
            Symbol::Data(_) => "",
        }
    }

    /// Whether this symbol is a [`Symbol::Header`] or [`Symbol::Data`] — the
    /// expander's termination condition.
    pub fn is_header_or_data(&self) -> bool {
        matches!(self, Symbol::Header(_) | Symbol::Data(_))
    }
}

/// The four terminal classifications a sent request can resolve to, plus the
/// filter value `RequestNotMalformed` used upstream of statistics reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The proxy forwarded the malicious bytes to the origin unchanged.
    Accepted,
    /// The proxy forwarded the request, but the malicious bytes were
    /// normalized away.
    Modified,
    /// The proxy responded without forwarding to the origin.
    Rejected,
    /// No response was received within the configured timeout.
    Timeout,
    /// The request carried no malicious load; there is no contract to
    /// evaluate. Never reported to char-table statistics.
    RequestNotMalformed,
}

/// One `drop`/`raise`/`lower` influence action a pre-test can apply to the
/// grammar.
#[derive(Debug, Clone)]
pub struct PreTestAction {
    /// The non-terminal this action targets.
    pub nonterminal: String,
    /// A specific derivation index, or `None` to target every derivation
    /// (in any non-terminal) whose symbol list contains `nonterminal`.
    pub derivative: Option<usize>,
    /// Required for `raise`/`lower`, forbidden for `drop`.
    pub factor: Option<f64>,
}

/// The action kind an influence maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Remove the targeted derivation(s) entirely.
    Drop,
    /// Increase the targeted derivation(s)' probability toward 1.
    Raise,
    /// Decrease the targeted derivation(s)' probability toward 0.
    Lower,
}

/// A deterministic probe whose classified outcome rewrites the grammar
/// before randomized fuzzing starts.
#[derive(Debug, Clone)]
pub struct PreTest {
    /// The grammar-document key this pre-test was declared under.
    pub name: String,
    /// Ordered list of Header/Data symbol names materialized statically.
    pub sequence: Vec<String>,
    /// Per-outcome action table; `None` means "no actions for this outcome".
    pub influence: HashMap<Outcome, Option<HashMap<ActionKind, Vec<PreTestAction>>>>,
    /// The classified outcome, filled in once the probe has run.
    pub result: Option<Outcome>,
}

/// The bytes a request under construction has accumulated that a compliant
/// proxy should reject or normalize; drives classification.
#[derive(Debug, Clone, Default)]
pub struct MaliciousLoad {
    /// Every malicious byte-fragment inserted by illegal terminals or
    /// mutations, in insertion order. Not deduplicated: a mutation that
    /// inserts the same byte fragment twice (e.g. `InsertChar` with
    /// `quantity=2`) must be tracked as two entries here.
    pub all: Vec<Bytes>,
    /// Every (char-table-name, (bytes, slot)) pair a char-table-backed
    /// mutation produced, deduplicated — this is the canonicalized view
    /// `report_result` indexes into.
    pub chars: Vec<(String, (Bytes, Slot))>,
}

impl MaliciousLoad {
    /// Append `bytes` to `all` unconditionally.
    pub fn push_all(&mut self, bytes: Bytes) {
        self.all.push(bytes);
    }

    /// Append `(table, entry)` to `chars` unless an equal entry is already
    /// present.
    pub fn push_char(&mut self, table: String, entry: (Bytes, Slot)) {
        if !self.chars.iter().any(|(t, e)| *t == table && e.0 == entry.0 && e.1 == entry.1) {
            self.chars.push((table, entry));
        }
    }

    /// Merge another load's entries into this one: `all` is concatenated
    /// as-is, `chars` is deduplicated.
    pub fn merge(&mut self, other: MaliciousLoad) {
        self.all.extend(other.all);
        for (table, entry) in other.chars {
            self.push_char(table, entry);
        }
    }
}

/// A request under construction: an ordered list of header pairs, an
/// optional body, and the malicious-byte provenance driving classification.
#[derive(Debug, Clone)]
pub struct Request {
    /// Process-wide monotonically increasing identifier, carried in the
    /// `smuggling-id` header so the origin can correlate its echo.
    pub id: u64,
    /// The ordered header pairs this request will be sent with.
    pub headers: Vec<(Bytes, Bytes)>,
    /// The request body, if a `Data` symbol was expanded.
    pub body: Option<Bytes>,
    /// Malicious byte provenance accumulated while building this request.
    pub malicious: MaliciousLoad,
}
