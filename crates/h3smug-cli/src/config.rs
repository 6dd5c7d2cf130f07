//! On-disk defaults file, layered under the CLI flags parsed in `main`.
//!
//! Precedence matches the workspace convention this crate is modeled on:
//! CLI flags always win over the file, and the file always wins over the
//! built-in defaults below.

use std::path::PathBuf;

use serde::Deserialize;

/// The optional TOML defaults file, every field optional so an empty file
/// (or no file at all) is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Path to the grammar document, if not overridden on the CLI.
    pub grammar: Option<PathBuf>,
    /// Fixed header name/value length boundary, if not overridden.
    pub boundary: Option<u64>,
    /// Number of fuzz requests to send, if not overridden.
    pub fuzz_count: Option<u64>,
    /// Random seed, if not overridden.
    pub seed: Option<u64>,
    /// Per-request timeout in seconds, if not overridden.
    pub timeout_seconds: Option<u64>,
    /// Path to the origin's echo file, if not overridden.
    pub echo_path: Option<PathBuf>,
    /// Path to append TLS session secrets to, if not overridden.
    pub tls_secrets_log: Option<PathBuf>,
    /// Path to a PEM CA bundle to trust, if not overridden.
    pub ca_bundle: Option<PathBuf>,
}

impl FileConfig {
    /// Load and parse a TOML defaults file from disk.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))
    }
}

/// The fully-resolved run configuration, after layering CLI over file over
/// built-in defaults.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Path to the grammar document.
    pub grammar: PathBuf,
    /// Fixed header name/value length boundary (`--boundary`), if set.
    pub boundary: Option<u64>,
    /// Number of fuzz requests to send; `None` skips the fuzzing phase.
    pub fuzz_count: Option<u64>,
    /// Random seed for the grammar's sampling RNG.
    pub seed: u64,
    /// Per-request timeout.
    pub timeout: std::time::Duration,
    /// Path to the origin's echo file.
    pub echo_path: PathBuf,
    /// Path to append TLS session secrets to, if any.
    pub tls_secrets_log: Option<PathBuf>,
    /// Path to a PEM CA bundle to trust, if any.
    pub ca_bundle: Option<PathBuf>,
}

/// Built-in defaults, used when neither the CLI nor the file supplies a
/// value.
const DEFAULT_GRAMMAR_PATH: &str = "./grammar.json";
const DEFAULT_ECHO_PATH: &str = "./servers/request";
const DEFAULT_TIMEOUT_SECONDS: u64 = 5;

impl ResolvedConfig {
    /// Merge CLI-supplied overrides over an optional file config, falling
    /// back to built-in defaults for anything left unset.
    pub fn resolve(cli: &crate::Cli, file: FileConfig) -> Self {
        ResolvedConfig {
            grammar: cli
                .grammar
                .clone()
                .or(file.grammar)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GRAMMAR_PATH)),
            boundary: cli.boundary.or(file.boundary),
            fuzz_count: cli.fuzz_count.or(file.fuzz_count),
            seed: cli.seed.or(file.seed).unwrap_or(0),
            timeout: std::time::Duration::from_secs(
                cli.timeout_seconds.or(file.timeout_seconds).unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            ),
            echo_path: cli
                .echo_path
                .clone()
                .or(file.echo_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ECHO_PATH)),
            tls_secrets_log: cli.tls_secrets_log.clone().or(file.tls_secrets_log),
            ca_bundle: cli.ca_bundle.clone().or(file.ca_bundle),
        }
    }
}
