//! Local proxy forwarder
//!
//! A local HTTP proxy that forwards to an authenticated upstream proxy.
//! Chrome's `--proxy-server` flag takes no inline credentials, so each tab
//! that uses an `ip:port:user:pass` proxy gets one of these:
//!
//! 1. Chrome connects to 127.0.0.1:{port} (no auth needed)
//! 2. The forwarder connects upstream with a Proxy-Authorization header
//! 3. Traffic is tunneled transparently in both directions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use base64::Engine;

/// Bound on headers read from a single request
const MAX_HEADERS: usize = 100;
/// Timeout for establishing the upstream connection
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Local proxy forwarder that handles authentication to an upstream proxy.
pub struct LocalProxyForwarder {
    upstream_host: String,
    upstream_port: u16,
    username: String,
    password: String,
    /// OS-assigned local port, set once `start()` has bound the listener
    local_port: u16,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl LocalProxyForwarder {
    /// Create a forwarder for the given upstream proxy. The local port is
    /// assigned by the OS when `start()` binds.
    pub fn new(upstream_host: &str, upstream_port: u16, username: &str, password: &str) -> Self {
        Self {
            upstream_host: upstream_host.to_string(),
            upstream_port,
            username: username.to_string(),
            password: password.to_string(),
            local_port: 0,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
        }
    }

    /// Local proxy URL for Chrome. Only meaningful after `start()`.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    /// The bound local port (0 before `start()`).
    pub fn port(&self) -> u16 {
        self.local_port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Build the Proxy-Authorization header value
    fn auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        format!("Basic {}", encoded)
    }

    /// Bind the local listener and start the accept loop.
    pub async fn start(&mut self) -> Result<(), std::io::Error> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        self.local_port = listener.local_addr()?.port();

        info!(
            "Local proxy forwarder on 127.0.0.1:{} -> {}:{}",
            self.local_port, self.upstream_host, self.upstream_port
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let upstream_host = self.upstream_host.clone();
        let upstream_port = self.upstream_port;
        let auth_header = self.auth_header();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Local proxy forwarder shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                debug!("Accepted proxy connection from {}", addr);
                                let upstream_host = upstream_host.clone();
                                let auth_header = auth_header.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream,
                                        &upstream_host,
                                        upstream_port,
                                        &auth_header,
                                    ).await {
                                        warn!("Proxy connection error: {}", e);
                                    }
                                });
                            }
                            Err(e) => error!("Proxy accept error: {}", e),
                        }
                    }
                }
            }

            running.store(false, Ordering::Relaxed);
        });

        Ok(())
    }

    /// Stop accepting new connections. Established tunnels drain on their own.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for LocalProxyForwarder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Handle one client connection: read the request head, then either tunnel
/// a CONNECT or replay a plain HTTP request with the auth header injected.
async fn handle_connection(
    client: TcpStream,
    upstream_host: &str,
    upstream_port: u16,
    auth_header: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut client = BufReader::new(client);

    let mut request_line = String::new();
    if client.read_line(&mut request_line).await? == 0 {
        return Err("connection closed before request".into());
    }

    let parts: Vec<&str> = request_line.trim().split_whitespace().collect();
    if parts.len() < 2 {
        return Err(format!("invalid HTTP request line: {}", request_line.trim()).into());
    }
    let method = parts[0];
    let target = parts[1];

    // Drain the remaining request headers (bounded)
    let mut headers = Vec::new();
    for _ in 0..MAX_HEADERS {
        let mut line = String::with_capacity(128);
        let n = client.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        headers.push(line);
    }

    let upstream_addr = format!("{}:{}", upstream_host, upstream_port);
    let mut upstream = tokio::time::timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect(&upstream_addr),
    )
    .await
    .map_err(|_| format!("timeout connecting to upstream proxy {}", upstream_addr))??;

    if method == "CONNECT" {
        // HTTPS tunneling: forward the CONNECT with credentials, relay the
        // upstream verdict, then splice the streams.
        debug!("CONNECT {} via {}", target, upstream_addr);

        let connect_request = format!(
            "{}\r\nHost: {}\r\nProxy-Authorization: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
            request_line.trim(),
            target,
            auth_header,
        );
        upstream.write_all(connect_request.as_bytes()).await?;
        upstream.flush().await?;

        let mut upstream_reader = BufReader::new(&mut upstream);
        let mut response_line = String::new();
        upstream_reader.read_line(&mut response_line).await?;
        for _ in 0..MAX_HEADERS {
            let mut line = String::with_capacity(128);
            let n = upstream_reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        let mut client_stream = client.into_inner();
        if !response_line.contains("200") {
            error!("Upstream proxy rejected CONNECT: {}", response_line.trim());
            client_stream.write_all(response_line.as_bytes()).await?;
            client_stream.write_all(b"\r\n").await?;
            client_stream.flush().await?;
            return Err(format!("upstream rejected CONNECT: {}", response_line.trim()).into());
        }

        client_stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        client_stream.flush().await?;

        let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut upstream).await;
        debug!("CONNECT tunnel closed for {}", target);
    } else {
        // Plain HTTP: replay the request with Proxy-Authorization added,
        // then splice whatever remains (body, response) in both directions.
        debug!("HTTP {} {} via {}", method, target, upstream_addr);

        let mut request = String::new();
        request.push_str(&request_line);
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth_header));
        for header in &headers {
            request.push_str(header);
        }
        request.push_str("\r\n");

        upstream.write_all(request.as_bytes()).await?;
        upstream.flush().await?;

        let mut client_stream = client.into_inner();
        let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut upstream).await;
    }

    Ok(())
}
