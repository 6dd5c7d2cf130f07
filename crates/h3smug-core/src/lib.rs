//! Grammar-driven request synthesis engine for the h3smug HTTP/3 smuggling
//! fuzzer: grammar loading and validation, the char-table statistics model,
//! the five mutation operators, the request builder, the outcome
//! classifier, the pre-test engine, length-bound discovery, and the phase
//! sequencer that ties them together.
//!
//! The `Transport` this crate drives is an interface only — see
//! `h3smug-transport` for the `quinn`/`h3` adapter that implements it.

pub mod builder;
pub mod chartable;
pub mod classifier;
pub mod error;
pub mod grammar;
pub mod lenbound;
pub mod model;
pub mod mutation;
pub mod pretest;
pub mod sequencer;
pub mod transport;

pub use error::{Error, Result};
pub use grammar::Grammar;
