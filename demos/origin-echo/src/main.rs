//! A deliberately minimal HTTP/1 echo origin, provided so the fuzzer can be
//! exercised end-to-end against a local reverse proxy without standing up a
//! real backend. This is not part of the library surface: no connection
//! reuse, no pipelining, no HTTP compliance beyond what the classifier's
//! frame format needs.
//!
//! One connection is served at a time; the next `accept` only happens once
//! the current connection's response has been written.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use origin_echo::{build_frame_bytes, content_length_of, find_subslice, parse_request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const READ_CHUNK: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "origin-echo", about = "Minimal HTTP/1 echo origin for h3smug")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Path to write each request's echo frame to. The fuzzer's
    /// `--echo-path` must point at the same file.
    #[arg(long, default_value = "./servers/request")]
    echo_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if tokio::fs::metadata(&cli.echo_path).await.is_ok() {
        tokio::fs::remove_file(&cli.echo_path).await.context("removing stale echo file")?;
    }

    let listener = TcpListener::bind(&cli.listen).await.with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(addr = %cli.listen, echo_path = %cli.echo_path.display(), "origin-echo listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(err) = serve_one(socket, peer, &cli.echo_path).await {
            tracing::warn!(%peer, %err, "connection ended with an error");
        }
    }
}

async fn serve_one(mut socket: TcpStream, peer: std::net::SocketAddr, echo_path: &std::path::Path) -> anyhow::Result<()> {
    let Some(raw) = receive_full_request(&mut socket).await? else {
        return Ok(());
    };
    let frame = parse_request(&raw);
    tracing::info!(%peer, smuggling_id = %String::from_utf8_lossy(&frame.smuggling_id), "request received");
    write_echo_frame(echo_path, &frame).await?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n",
        raw.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.write_all(&raw).await?;
    socket.shutdown().await?;
    Ok(())
}

/// Read until the header block is complete, then keep reading until
/// `Content-Length` (if any) is satisfied.
async fn receive_full_request(socket: &mut TcpStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut data = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 && data.is_empty() {
            return Ok(None);
        }
        data.extend_from_slice(&buf[..n]);

        if let Some(headers_end) = find_subslice(&data, b"\r\n\r\n") {
            let header_block = &data[..headers_end];
            let content_length = content_length_of(header_block);
            if data.len() - (headers_end + 4) >= content_length {
                return Ok(Some(data));
            }
        }
        if n == 0 {
            return Ok(Some(data));
        }
    }
}

async fn write_echo_frame(path: &std::path::Path, frame: &origin_echo::EchoRequest) -> anyhow::Result<()> {
    let content = build_frame_bytes(frame);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}
