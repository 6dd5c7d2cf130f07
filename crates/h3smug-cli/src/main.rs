//! Process entry point: parses CLI flags, layers them over an optional
//! TOML defaults file, wires the grammar engine to the `quinn`/`h3`
//! transport, and drives the phase sequencer to completion.

mod config;

use std::path::PathBuf;

use clap::Parser;
use h3smug_core::error::Error;
use h3smug_core::grammar::Grammar;
use h3smug_core::sequencer::{PhaseSequencer, SequencerConfig};
use h3smug_transport::{H3ConnectionFactory, TargetConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{FileConfig, ResolvedConfig};

/// A request-smuggling fuzzer for HTTP/3 over QUIC.
#[derive(Parser, Debug)]
#[command(name = "h3smug", version, about)]
struct Cli {
    /// Target reverse proxy, e.g. `https://proxy.example:443`.
    #[arg(value_parser = parse_https_url)]
    url: url::Url,

    /// Path to the grammar document. Defaults to `./grammar.json`.
    #[arg(short, long)]
    grammar: Option<PathBuf>,

    /// Skip length-discovery and use this value as both the header-name and
    /// header-value length boundary.
    #[arg(short, long)]
    boundary: Option<u64>,

    /// Number of randomized fuzz requests to send after static pre-testing.
    /// Omit to stop after the `STATIC` phase.
    #[arg(short = 'n', long)]
    fuzz_count: Option<u64>,

    /// Seed for the grammar's sampling RNG, for reproducible runs.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Per-request timeout, in seconds.
    #[arg(long = "timeout")]
    timeout_seconds: Option<u64>,

    /// Path to the origin's echo file. Defaults to `./servers/request`.
    #[arg(long)]
    echo_path: Option<PathBuf>,

    /// Append TLS session secrets here in `SSLKEYLOGFILE` format.
    #[arg(long)]
    tls_secrets_log: Option<PathBuf>,

    /// PEM-encoded CA bundle to trust, in addition to the platform roots.
    #[arg(long)]
    ca_bundle: Option<PathBuf>,

    /// Optional TOML defaults file, overridden by any flag above.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit structured JSON logs instead of human-readable text.
    #[arg(long)]
    json_logs: bool,

    /// Enable debug-level logging (shorthand for `RUST_LOG=debug`).
    #[arg(short, long)]
    debug: bool,

    /// Append-only log of every ACCEPTED/MODIFIED request, with full
    /// payload and echoed headers.
    #[arg(long, default_value = "h3smug-requests.log")]
    request_log: PathBuf,
}

fn parse_https_url(raw: &str) -> Result<url::Url, String> {
    let url = url::Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;
    if url.scheme() != "https" {
        return Err(format!("target URL must use https, got scheme {:?}", url.scheme()));
    }
    Ok(url)
}

fn init_logging(cli: &Cli, request_log_path: &std::path::Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if cli.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let directory = request_log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
    let file_name = request_log_path.file_name().ok_or_else(|| anyhow::anyhow!("request log path has no file name"))?;
    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let request_log_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .json()
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() == "h3smug::request_log"));

    let operator_layer = if cli.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let operator_layer = operator_layer.with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
        metadata.target() != "h3smug::request_log"
    }));

    tracing_subscriber::registry().with(env_filter).with(operator_layer).with(request_log_layer).init();
    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let resolved = ResolvedConfig::resolve(&cli, file_config);
    let _log_guard = init_logging(&cli, &cli.request_log)?;

    tracing::info!(url = %cli.url, grammar = %resolved.grammar.display(), "starting h3smug run");

    if let Err(err) = run(cli.url, resolved).await {
        tracing::error!(%err, "h3smug run ended with a fatal error");
        return Err(err);
    }
    tracing::info!("h3smug run completed");
    Ok(())
}

async fn run(url: url::Url, config: ResolvedConfig) -> anyhow::Result<()> {
    let mut grammar = Grammar::load(&config.grammar)
        .map_err(|e: Error| anyhow::anyhow!("failed to load grammar {}: {e}", config.grammar.display()))?;

    let host = url.host_str().ok_or_else(|| anyhow::anyhow!("target URL has no host"))?;
    let port = url.port().unwrap_or(443);
    let authority = format!("{host}:{port}");
    let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };

    let target = TargetConfig {
        authority: authority.clone(),
        ca_bundle: config.ca_bundle.clone(),
        keylog_path: config.tls_secrets_log.clone(),
        request_timeout: config.timeout,
    };
    let factory = H3ConnectionFactory::new(target)?;

    let sequencer_config = SequencerConfig {
        authority: authority.into_bytes(),
        path: path.into_bytes(),
        boundary_override: config.boundary,
        num_fuzzes: config.fuzz_count,
        fuzz_start_symbols: vec!["start".to_string()],
        echo_path: config.echo_path,
    };

    let mut sequencer = PhaseSequencer::new(factory, sequencer_config);
    let mut rng = StdRng::seed_from_u64(config.seed);
    sequencer.run(&mut grammar, &mut rng).await.map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_urls() {
        assert!(parse_https_url("http://example.com").is_err());
        assert!(parse_https_url("https://example.com").is_ok());
    }

    #[test]
    fn resolved_config_applies_cli_over_file_over_defaults() {
        let cli = Cli {
            url: url::Url::parse("https://example.com").unwrap(),
            grammar: None,
            boundary: Some(42),
            fuzz_count: None,
            seed: None,
            timeout_seconds: None,
            echo_path: None,
            tls_secrets_log: None,
            ca_bundle: None,
            config: None,
            json_logs: false,
            debug: false,
            request_log: PathBuf::from("h3smug-requests.log"),
        };
        let file = FileConfig { boundary: Some(7), fuzz_count: Some(100), ..Default::default() };
        let resolved = ResolvedConfig::resolve(&cli, file);
        assert_eq!(resolved.boundary, Some(42), "CLI flag must win over file");
        assert_eq!(resolved.fuzz_count, Some(100), "file value must be used when CLI omits it");
        assert_eq!(resolved.grammar, PathBuf::from("./grammar.json"), "built-in default applies when both are unset");
    }
}
