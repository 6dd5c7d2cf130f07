//! `quinn` + `h3` + `h3-quinn` adapter implementing `h3smug_core::transport::Transport`.
//!
//! HTTP/3's safe client surface (`h3::client`) builds requests from an
//! `http::Request`, which validates header names/values on construction. A
//! handful of the fuzzer's malicious byte sequences (embedded CR/LF, raw
//! control bytes in a header name) are rejected by that validation before a
//! single byte reaches the wire. Those entries are dropped from the outbound
//! header list with a logged warning rather than failing the whole probe —
//! a conformant local stack cannot transmit them regardless of this crate,
//! so the interesting test surface is bytes the local stack *will* send
//! that a downstream proxy mishandles.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h3smug_core::error::{Error, Result};
use h3smug_core::sequencer::ConnectionFactory;
use h3smug_core::transport::{ConnectionState, Response, Transport, TransportError};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors specific to establishing the QUIC/H3 connection, distinct from
/// the per-request [`TransportError`] the sequencer already knows how to
/// handle.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The target URL could not be resolved to a socket address.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// The hostname that failed to resolve.
        host: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// TLS client configuration could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),
    /// The CA bundle file could not be read or parsed.
    #[error("failed to load CA bundle from {path}: {source}")]
    CaBundle {
        /// Path to the CA bundle that failed to load.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `quinn::Endpoint` construction failed.
    #[error("failed to build QUIC endpoint: {0}")]
    Endpoint(String),
    /// The QUIC handshake or the H3 driver handshake failed.
    #[error("connection failed: {0}")]
    Connect(String),
}

impl From<SetupError> for Error {
    fn from(err: SetupError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Everything needed to open a fresh connection to the target, handed to
/// [`H3ConnectionFactory::connect`] on every reconnect.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// The authority (`host[:port]`) to connect to and send as `:authority`.
    pub authority: String,
    /// PEM-encoded CA bundle to trust in addition to the platform roots, if
    /// any. `None` uses `webpki-roots`' bundled Mozilla set.
    pub ca_bundle: Option<PathBuf>,
    /// When set, TLS session secrets are appended to this file in
    /// `SSLKEYLOGFILE` format, for offline decryption with Wireshark.
    pub keylog_path: Option<PathBuf>,
    /// Per-request timeout; `send` returns `Ok(None)` if this elapses
    /// before a response arrives.
    pub request_timeout: Duration,
}

/// Builds a fresh `quinn` + `h3` connection to [`TargetConfig::authority`]
/// on every call, matching the reference implementation's reconnect-on-
/// poisoned-connection behavior.
pub struct H3ConnectionFactory {
    config: TargetConfig,
    client_config: quinn::ClientConfig,
}

impl H3ConnectionFactory {
    /// Build the factory, loading the CA bundle (or the bundled Mozilla
    /// roots) and configuring `h3` as the sole ALPN protocol once up front.
    pub fn new(config: TargetConfig) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        match &config.ca_bundle {
            Some(path) => {
                let pem = std::fs::read(path)
                    .map_err(|source| SetupError::CaBundle { path: path.clone(), source })?;
                let mut reader = std::io::Cursor::new(pem);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|source| SetupError::CaBundle { path: path.clone(), source })?;
                    roots
                        .add(cert)
                        .map_err(|e| SetupError::Tls(format!("invalid CA certificate: {e}")))?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h3".to_vec()];
        if let Some(path) = &config.keylog_path {
            tls_config.key_log = Arc::new(FileKeyLog::new(path.clone()));
        }

        let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| SetupError::Tls(e.to_string()))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_config));

        Ok(Self { config, client_config })
    }

    fn resolve(&self) -> Result<std::net::SocketAddr> {
        let host = host_only(&self.config.authority);
        self.config
            .authority
            .to_socket_addrs()
            .map_err(|source| SetupError::Resolve { host: host.to_string(), source })?
            .next()
            .ok_or_else(|| {
                SetupError::Resolve {
                    host: host.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
                }
                .into()
            })
    }
}

#[async_trait]
impl ConnectionFactory for H3ConnectionFactory {
    type Transport = H3Transport;

    async fn connect(&mut self) -> Result<Self::Transport> {
        let remote = self.resolve()?;
        let host = host_only(&self.config.authority).to_string();

        let mut endpoint = quinn::Endpoint::client("[::]:0".parse().unwrap())
            .map_err(|e| SetupError::Endpoint(e.to_string()))?;
        endpoint.set_default_client_config(self.client_config.clone());

        debug!(%remote, %host, "opening QUIC connection");
        let connection = endpoint
            .connect(remote, &host)
            .map_err(|e| SetupError::Connect(e.to_string()))?
            .await
            .map_err(|e| SetupError::Connect(e.to_string()))?;

        let h3_connection = h3_quinn::Connection::new(connection);
        let (driver, send_request) = h3::client::new(h3_connection)
            .await
            .map_err(|e| SetupError::Connect(e.to_string()))?;

        let driver_handle = tokio::spawn(async move {
            let mut driver = driver;
            if let Err(err) = std::future::poll_fn(|cx| driver.poll_close(cx)).await {
                debug!(%err, "H3 connection driver exited");
            }
        });

        Ok(H3Transport {
            send_request,
            driver_handle: Some(driver_handle),
            state: ConnectionState::Open,
            request_timeout: self.config.request_timeout,
        })
    }
}

fn host_only(authority: &str) -> &str {
    authority.split(':').next().unwrap_or(authority)
}

/// A live HTTP/3 request sender over one QUIC connection.
pub struct H3Transport {
    send_request: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
    driver_handle: Option<tokio::task::JoinHandle<()>>,
    state: ConnectionState,
    request_timeout: Duration,
}

impl Drop for H3Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.driver_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for H3Transport {
    async fn send(
        &mut self,
        headers: Vec<(Bytes, Bytes)>,
        body: Option<Bytes>,
    ) -> std::result::Result<Option<Response>, TransportError> {
        let request = match build_http_request(&headers) {
            Ok(request) => request,
            Err(dropped) => {
                warn!(dropped, "dropped header(s) the local HTTP stack refused to encode");
                build_http_request_lossy(&headers)
            }
        };

        let outcome = tokio::time::timeout(self.request_timeout, self.send_one(request, body)).await;
        match outcome {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(err)) => {
                self.state = ConnectionState::Closed;
                Err(err)
            }
            Err(_elapsed) => Ok(None),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

impl H3Transport {
    async fn send_one(
        &mut self,
        request: http::Request<()>,
        body: Option<Bytes>,
    ) -> std::result::Result<Response, TransportError> {
        let mut stream = self
            .send_request
            .send_request(request)
            .await
            .map_err(|e| classify_h3_error(&e))?;

        if let Some(body) = body {
            stream.send_data(body).await.map_err(|e| classify_h3_error(&e))?;
        }
        stream.finish().await.map_err(|e| classify_h3_error(&e))?;

        let response = stream.recv_response().await.map_err(|e| classify_h3_error(&e))?;
        let mut headers = Vec::with_capacity(response.headers().len() + 1);
        headers.push((
            Bytes::from_static(b":status"),
            Bytes::from(response.status().as_str().to_string()),
        ));
        for (name, value) in response.headers() {
            headers.push((Bytes::copy_from_slice(name.as_str().as_bytes()), Bytes::copy_from_slice(value.as_bytes())));
        }

        while let Some(mut chunk) = stream.recv_data().await.map_err(|e| classify_h3_error(&e))? {
            chunk.copy_to_bytes(chunk.remaining());
        }

        Ok(Response { headers })
    }
}

fn classify_h3_error(err: &h3::Error) -> TransportError {
    let message = err.to_string();
    if message.contains("encoder") || message.contains("qpack") {
        TransportError::EncoderStreamError(message)
    } else if err.is_h3_no_error() || message.contains("closed") || message.contains("reset") {
        TransportError::ConnectionLost(message)
    } else {
        TransportError::Other(message)
    }
}

/// Build an `http::Request` from the ordered (possibly pseudo-) header
/// list. Returns `Err(count)` naming how many trailing entries could not
/// be validated, for the caller to fall back to [`build_http_request_lossy`].
fn build_http_request(headers: &[(Bytes, Bytes)]) -> std::result::Result<http::Request<()>, usize> {
    let mut builder = http::Request::builder();
    let mut method = http::Method::GET;
    let mut authority = String::new();
    let mut path = String::from("/");
    let mut scheme = http::uri::Scheme::HTTPS;
    let mut dropped = 0usize;

    for (name, value) in headers {
        match name.as_ref() {
            b":method" => {
                method = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| http::Method::from_bytes(s.as_bytes()).ok())
                    .unwrap_or_else(|| {
                        dropped += 1;
                        http::Method::GET
                    });
            }
            b":authority" => authority = String::from_utf8_lossy(value).into_owned(),
            b":path" => path = String::from_utf8_lossy(value).into_owned(),
            b":scheme" => {
                scheme = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| http::uri::Scheme::try_from(s).ok())
                    .unwrap_or_else(|| {
                        dropped += 1;
                        http::uri::Scheme::HTTPS
                    });
            }
            other => {
                let parsed = http::HeaderName::from_bytes(other)
                    .ok()
                    .zip(http::HeaderValue::from_bytes(value).ok());
                match parsed {
                    Some((header_name, header_value)) => {
                        builder = builder.header(header_name, header_value);
                    }
                    None => dropped += 1,
                }
            }
        }
    }

    let uri = http::Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|_| dropped + 1)?;
    let request = builder.method(method).uri(uri).body(()).map_err(|_| dropped + 1)?;
    if dropped > 0 { Err(dropped) } else { Ok(request) }
}

/// Best-effort fallback when [`build_http_request`] hit unrecoverable
/// errors in the pseudo-headers themselves: defaults the URI parts and
/// keeps every regular header that validates.
fn build_http_request_lossy(headers: &[(Bytes, Bytes)]) -> http::Request<()> {
    let mut builder = http::Request::builder().method(http::Method::GET).uri("https://localhost/");
    for (name, value) in headers {
        if name.starts_with(b":") {
            continue;
        }
        if let (Ok(header_name), Ok(header_value)) =
            (http::HeaderName::from_bytes(name), http::HeaderValue::from_bytes(value))
        {
            builder = builder.header(header_name, header_value);
        }
    }
    builder.body(()).expect("fallback request with defaulted URI always builds")
}

/// A `rustls::KeyLog` implementation that appends `SSLKEYLOGFILE`-format
/// lines to a fixed path, for the CLI's `--tls-secrets` flag.
#[derive(Debug)]
struct FileKeyLog {
    path: PathBuf,
}

impl FileKeyLog {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        use std::io::Write;
        let line = format!("{label} {} {}\n", hex::encode(client_random), hex::encode(secret));
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_plain_get_request() {
        let headers = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            (Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
            (Bytes::from_static(b"smuggling-id"), Bytes::from_static(b"7")),
        ];
        let request = build_http_request(&headers).expect("well-formed headers always build");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().authority().unwrap().as_str(), "example.com");
        assert_eq!(request.headers().get("smuggling-id").unwrap(), "7");
    }

    #[test]
    fn rejects_embedded_crlf_in_header_value_and_counts_it() {
        let headers = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            (Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
            (Bytes::from_static(b"x-smuggle"), Bytes::from_static(b"a\r\nSet-Cookie: evil")),
        ];
        let result = build_http_request(&headers);
        assert_eq!(result.unwrap_err(), 1);
    }

    #[test]
    fn lossy_fallback_keeps_valid_headers() {
        let headers = vec![
            (Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
            (Bytes::from_static(b"x-ok"), Bytes::from_static(b"fine")),
        ];
        let request = build_http_request_lossy(&headers);
        assert_eq!(request.headers().get("x-ok").unwrap(), "fine");
    }

    #[test]
    fn host_only_strips_port() {
        assert_eq!(host_only("example.com:443"), "example.com");
        assert_eq!(host_only("example.com"), "example.com");
    }
}
