//! Phase Sequencer: drives the fuzzer through its fixed phase order,
//! reconnecting the transport whenever a phase signals the connection is
//! poisoned.

use std::path::PathBuf;

use async_trait::async_trait;
use rand::Rng;

use crate::builder::{self, BuildParams};
use crate::classifier;
use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::lenbound::{Field, LengthBoundSearch, ProbeOutcome, ProbeResult};
use crate::pretest;
use crate::transport::{ConnectionState, Transport};

/// Builds a fresh transport connection on demand. The shipped
/// `h3smug-transport` adapter implements this over `quinn`/`h3`.
#[async_trait]
pub trait ConnectionFactory {
    /// The concrete transport this factory produces.
    type Transport: Transport + Send;

    /// Establish a new connection, replacing one the sequencer has torn
    /// down.
    async fn connect(&mut self) -> Result<Self::Transport>;
}

/// The fixed phase order the sequencer advances through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Liveness gate: one plain GET must return 200.
    NormalRequest,
    /// Binary search for the maximum accepted header *name* length.
    HeaderNameLength,
    /// Binary search for the maximum accepted header *value* length.
    HeaderValueLength,
    /// Declared pre-tests plus the implicit per-char static sweep.
    Static,
    /// Randomized grammar-driven fuzzing, for a configured request count.
    Fuzzing,
    /// Terminal state.
    Finished,
}

/// Caller-supplied run parameters that don't change across phases.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Authority bytes substituted for the `<authority>` placeholder.
    pub authority: Vec<u8>,
    /// Path bytes substituted for the `<path>` placeholder.
    pub path: Vec<u8>,
    /// `--boundary` CLI override: when set, skips both length-discovery
    /// phases and uses this value for both bounds directly.
    pub boundary_override: Option<u64>,
    /// Number of fuzz requests to send; `None` skips `FUZZING` entirely.
    pub num_fuzzes: Option<u64>,
    /// Grammar entry point(s) the request builder expands from during
    /// fuzzing.
    pub fuzz_start_symbols: Vec<String>,
    /// Path to the origin's echo file.
    pub echo_path: PathBuf,
}

/// Drives `grammar` and a `Transport` produced by `factory` through every
/// phase, to completion or a fatal error.
pub struct PhaseSequencer<F: ConnectionFactory> {
    factory: F,
    config: SequencerConfig,
    phase: Phase,
    name_search: LengthBoundSearch,
    value_search: LengthBoundSearch,
    max_name_chars: u64,
    max_value_chars: u64,
    fuzzes_sent: u64,
}

impl<F: ConnectionFactory> PhaseSequencer<F> {
    /// Construct a sequencer starting at `Phase::NormalRequest`.
    pub fn new(factory: F, config: SequencerConfig) -> Self {
        let (name_search, value_search) = match config.boundary_override {
            Some(boundary) => (LengthBoundSearch::fixed(Field::Name, boundary), LengthBoundSearch::fixed(Field::Value, boundary)),
            None => (LengthBoundSearch::new(Field::Name), LengthBoundSearch::new(Field::Value)),
        };
        PhaseSequencer {
            factory,
            config,
            phase: Phase::NormalRequest,
            name_search,
            value_search,
            max_name_chars: 0,
            max_value_chars: 0,
            fuzzes_sent: 0,
        }
    }

    fn build_params(&self) -> BuildParams<'_> {
        BuildParams {
            authority: &self.config.authority,
            path: &self.config.path,
            max_name_chars: self.max_name_chars as usize,
            max_value_chars: self.max_value_chars as usize,
            is_static: !matches!(self.phase, Phase::Fuzzing),
        }
    }

    /// Run every phase to completion.
    pub async fn run(&mut self, grammar: &mut Grammar, rng: &mut impl Rng) -> Result<()> {
        let mut transport = self.factory.connect().await?;
        loop {
            if self.phase == Phase::Finished {
                return Ok(());
            }
            match self.run_phase(grammar, &mut transport, rng).await {
                Ok(PhaseStep::Advance) => self.advance_phase(),
                Ok(PhaseStep::NeedsNewConnection) => {
                    tracing::warn!(phase = ?self.phase, "transport poisoned, reconnecting");
                    transport = self.factory.connect().await?;
                }
                Err(err) => {
                    tracing::error!(phase = ?self.phase, %err, "phase sequencer hit a fatal error");
                    return Err(err);
                }
            }
        }
    }

    fn advance_phase(&mut self) {
        self.phase = match self.phase {
            Phase::NormalRequest => Phase::HeaderNameLength,
            Phase::HeaderNameLength => Phase::HeaderValueLength,
            Phase::HeaderValueLength => Phase::Static,
            Phase::Static => {
                if self.config.num_fuzzes.is_some() {
                    Phase::Fuzzing
                } else {
                    Phase::Finished
                }
            }
            Phase::Fuzzing => Phase::Finished,
            Phase::Finished => Phase::Finished,
        };
    }

    async fn run_phase(
        &mut self,
        grammar: &mut Grammar,
        transport: &mut F::Transport,
        rng: &mut impl Rng,
    ) -> Result<PhaseStep> {
        match self.phase {
            Phase::NormalRequest => self.run_normal_request(transport).await,
            Phase::HeaderNameLength => self.run_length_search(Field::Name, transport).await,
            Phase::HeaderValueLength => self.run_length_search(Field::Value, transport).await,
            Phase::Static => {
                let params = self.build_params();
                pretest::run(grammar, transport, &params, &self.config.echo_path, rng).await?;
                Ok(PhaseStep::Advance)
            }
            Phase::Fuzzing => self.run_one_fuzz(grammar, transport, rng).await,
            Phase::Finished => Ok(PhaseStep::Advance),
        }
    }

    async fn run_normal_request(&mut self, transport: &mut F::Transport) -> Result<PhaseStep> {
        let params = self.build_params();
        let id = builder::next_request_id();
        let headers = vec![
            (bytes::Bytes::from_static(b":method"), bytes::Bytes::from_static(b"GET")),
            (bytes::Bytes::from_static(b":scheme"), bytes::Bytes::from_static(b"https")),
            (bytes::Bytes::from_static(b":authority"), bytes::Bytes::copy_from_slice(params.authority)),
            (bytes::Bytes::from_static(b":path"), bytes::Bytes::copy_from_slice(params.path)),
            (bytes::Bytes::from_static(b"smuggling-id"), bytes::Bytes::from(id.to_string().into_bytes())),
        ];
        let response = transport.send(headers, None).await?;
        match response.and_then(|r| r.status()) {
            Some(200) => Ok(PhaseStep::Advance),
            other => Err(Error::Config(format!(
                "liveness gate failed: expected 200 OK from a plain GET, got {other:?}"
            ))),
        }
    }

    async fn run_length_search(&mut self, field: Field, transport: &mut F::Transport) -> Result<PhaseStep> {
        loop {
            let search = match field {
                Field::Name => &mut self.name_search,
                Field::Value => &mut self.value_search,
            };
            if search.is_converged() {
                Self::store_bound(field, &mut self.max_name_chars, &mut self.max_value_chars, search.current_length());
                return Ok(PhaseStep::Advance);
            }

            let probe = search.build_probe(&self.build_params());
            let response = transport.send(probe.headers, probe.body).await;
            let result = match response {
                Ok(Some(r)) if r.status() == Some(200) => ProbeResult::Accepted,
                Ok(_) => ProbeResult::RejectedOrPoisoned,
                Err(_) => ProbeResult::RejectedOrPoisoned,
            };
            let transport_closed = transport.connection_state() == ConnectionState::Closed;

            let search = match field {
                Field::Name => &mut self.name_search,
                Field::Value => &mut self.value_search,
            };
            match search.observe(result)? {
                ProbeOutcome::Done(limit) => {
                    Self::store_bound(field, &mut self.max_name_chars, &mut self.max_value_chars, limit);
                    return Ok(PhaseStep::Advance);
                }
                ProbeOutcome::NeedsReconnect => return Ok(PhaseStep::NeedsNewConnection),
                ProbeOutcome::Continue => {
                    if transport_closed {
                        return Ok(PhaseStep::NeedsNewConnection);
                    }
                    // Otherwise loop again immediately with the updated
                    // search state, still on the same connection.
                }
            }
        }
    }

    fn store_bound(field: Field, max_name: &mut u64, max_value: &mut u64, value: u64) {
        match field {
            Field::Name => *max_name = value,
            Field::Value => *max_value = value,
        }
    }

    async fn run_one_fuzz(
        &mut self,
        grammar: &mut Grammar,
        transport: &mut F::Transport,
        rng: &mut impl Rng,
    ) -> Result<PhaseStep> {
        let Some(target) = self.config.num_fuzzes else {
            return Ok(PhaseStep::Advance);
        };
        while self.fuzzes_sent < target {
            let params = self.build_params();
            let (request, illegal) = builder::build_request(grammar, &self.config.fuzz_start_symbols, &params, rng)?;
            if illegal {
                tracing::debug!(request_id = request.id, "generated request carries an illegal-tainted symbol");
            }
            let response = match transport.send(request.headers.clone(), request.body.clone()).await {
                Ok(response) => response,
                Err(_) => return Ok(PhaseStep::NeedsNewConnection),
            };
            let outcome = classifier::classify(grammar, &request, response.as_ref(), &self.config.echo_path).await?;
            tracing::info!(request_id = request.id, ?outcome, "fuzz request classified");
            self.fuzzes_sent += 1;
        }
        Ok(PhaseStep::Advance)
    }
}

enum PhaseStep {
    Advance,
    NeedsNewConnection,
}
