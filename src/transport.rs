//! Framed request/response over a byte stream, HTTP chunked decoding,
//! proxy CONNECT tunneling, and the stderr progress meter.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};

use crate::config::ProxyConfig;
use crate::error::{GitupError, Result};

const IO_TIMEOUT: Duration = Duration::from_secs(300);
const SOCKET_BUFFER_BYTES: usize = 1 << 20; // 1 MiB send/recv buffers

/// A connected, possibly proxy-tunneled, TLS byte stream to a Git smart-HTTP
/// server, plus the bookkeeping the progress meter needs.
pub struct Connection {
    stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    host: String,
    verbose: bool,
}

impl Connection {
    pub fn connect(host: &str, port: u16, proxy: Option<&ProxyConfig>, verbose: bool) -> Result<Connection> {
        let tcp = match proxy {
            Some(p) => connect_via_proxy(host, port, p)?,
            None => connect_tcp(host, port)?,
        };

        tune_socket(&tcp)?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))
            .map_err(|e| GitupError::TransportFailure(format!("setting read timeout: {e}")))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))
            .map_err(|e| GitupError::TransportFailure(format!("setting write timeout: {e}")))?;

        let tls_conn = tls_connect(host, tcp)?;

        Ok(Connection {
            stream: tls_conn,
            host: host.to_string(),
            verbose,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Writes `request`, reads a full HTTP response, strips the header
    /// block, and returns the body bytes (chunked transfer is decoded
    /// transparently).
    pub fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.stream
            .write_all(request)
            .map_err(|e| GitupError::TransportFailure(format!("writing request: {e}")))?;
        self.stream
            .flush()
            .map_err(|e| GitupError::TransportFailure(format!("flushing request: {e}")))?;

        let mut buf = read_until_header_end(&mut self.stream)?;
        let header_end = find_header_end(&buf).expect("read_until_header_end guarantees this");
        let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();

        let status = parse_status_code(&header_text)?;
        if !(200..300).contains(&status) {
            return Err(GitupError::HttpError(status));
        }

        let body_start = header_end + 4;
        buf.drain(0..body_start);

        let body = if is_chunked(&header_text) {
            self.read_chunked_body(buf)?
        } else if let Some(len) = content_length(&header_text) {
            self.read_fixed_body(buf, len)?
        } else {
            self.read_to_eof(buf)?
        };

        Ok(body)
    }

    fn read_fixed_body(&mut self, mut buf: Vec<u8>, len: usize) -> Result<Vec<u8>> {
        let mut received = buf.len();
        buf.reserve(len.saturating_sub(received));
        let start = Instant::now();
        while received < len {
            let mut chunk = vec![0u8; (1 << 20).min(len - received)];
            let n = self
                .stream
                .read(&mut chunk)
                .map_err(|e| GitupError::TransportFailure(format!("reading response body: {e}")))?;
            if n == 0 {
                return Err(GitupError::TransportFailure(
                    "connection closed before Content-Length bytes were received".into(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
            received += n;
            self.report_progress(received as u64, Some(len as u64), start);
        }
        self.clear_progress();
        Ok(buf)
    }

    fn read_to_eof(&mut self, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut chunk = [0u8; 1 << 16];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    self.report_progress(buf.len() as u64, None, start);
                }
                Err(e) => return Err(GitupError::TransportFailure(format!("reading response body: {e}"))),
            }
        }
        self.clear_progress();
        Ok(buf)
    }

    /// Decodes `Transfer-Encoding: chunked` by splicing each chunk's bytes
    /// over the preceding size marker in place, rather than allocating a
    /// second buffer.
    fn read_chunked_body(&mut self, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        let mut write_cursor = 0usize;
        let mut read_cursor = 0usize;
        let start = Instant::now();
        let mut total_size_hint: Option<u64> = None;

        loop {
            let line_end = loop {
                if let Some(pos) = find_crlf(&buf[read_cursor..]) {
                    break read_cursor + pos;
                }
                self.fill_more(&mut buf)?;
            };

            let size_line = std::str::from_utf8(&buf[read_cursor..line_end])
                .map_err(|_| GitupError::MalformedChunking("chunk size line is not UTF-8".into()))?;
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let chunk_size = usize::from_str_radix(size_str, 16)
                .map_err(|_| GitupError::MalformedChunking(format!("invalid chunk size '{size_str}'")))?;

            read_cursor = line_end + 2;

            if chunk_size == 0 {
                break;
            }

            while buf.len() < read_cursor + chunk_size + 2 {
                self.fill_more(&mut buf)?;
            }

            // Compact: move this chunk's payload down over the size marker
            // and any prior gap, keeping `write_cursor` contiguous.
            buf.copy_within(read_cursor..read_cursor + chunk_size, write_cursor);
            write_cursor += chunk_size;
            read_cursor += chunk_size + 2; // skip the trailing CRLF

            if let Some(total) = total_size_hint.as_mut() {
                *total += chunk_size as u64;
            } else {
                total_size_hint = Some(chunk_size as u64);
            }
            self.report_progress(write_cursor as u64, None, start);
        }

        buf.truncate(write_cursor);
        self.clear_progress();
        Ok(buf)
    }

    fn fill_more(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        let mut chunk = [0u8; 1 << 16];
        let n = self
            .stream
            .read(&mut chunk)
            .map_err(|e| GitupError::TransportFailure(format!("reading chunked body: {e}")))?;
        if n == 0 {
            return Err(GitupError::MalformedChunking(
                "connection closed mid-chunk".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn report_progress(&self, received: u64, total: Option<u64>, start: Instant) {
        if !self.verbose || !is_stderr_tty() {
            return;
        }
        let elapsed = start.elapsed().as_secs_f64().max(0.001);
        let rate = received as f64 / elapsed;
        let line = match total {
            Some(t) => format!(
                "\r{} / {}  {}/s  {:.0}s",
                humanize_bytes(received),
                humanize_bytes(t),
                humanize_bytes(rate as u64),
                elapsed
            ),
            None => format!(
                "\r{}  {}/s  {:.0}s",
                humanize_bytes(received),
                humanize_bytes(rate as u64),
                elapsed
            ),
        };
        eprint!("{line}");
        let _ = std::io::stderr().flush();
    }

    fn clear_progress(&self) {
        if self.verbose && is_stderr_tty() {
            eprint!("\r{}\r", " ".repeat(72));
            let _ = std::io::stderr().flush();
        }
    }
}

fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| GitupError::TransportFailure(format!("resolving {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| GitupError::TransportFailure(format!("no addresses for {host}:{port}")))?;
    TcpStream::connect(addr).map_err(|e| GitupError::TransportFailure(format!("connecting to {host}:{port}: {e}")))
}

fn connect_via_proxy(host: &str, port: u16, proxy: &ProxyConfig) -> Result<TcpStream> {
    let mut tcp = connect_tcp(&proxy.host, proxy.port)?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let (Some(user), pass) = (&proxy.user, proxy.pass.as_deref().unwrap_or("")) {
        let creds = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {creds}\r\n"));
    }
    request.push_str("\r\n");

    tcp.write_all(request.as_bytes())
        .map_err(|e| GitupError::TransportFailure(format!("writing CONNECT request: {e}")))?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tcp
            .read(&mut chunk)
            .map_err(|e| GitupError::TransportFailure(format!("reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(GitupError::TransportFailure("proxy closed connection during CONNECT".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if find_header_end(&buf).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&buf).unwrap();
    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let status = parse_status_code(&header_text)?;
    if !(200..300).contains(&status) {
        return Err(GitupError::HttpError(status));
    }

    Ok(tcp)
}

fn tune_socket(tcp: &TcpStream) -> Result<()> {
    let sock = SockRef::from(tcp);
    sock.set_keepalive(true)
        .map_err(|e| GitupError::TransportFailure(format!("enabling keepalive: {e}")))?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)))
        .map_err(|e| GitupError::TransportFailure(format!("configuring keepalive: {e}")))?;
    sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES)
        .map_err(|e| GitupError::TransportFailure(format!("setting recv buffer: {e}")))?;
    sock.set_send_buffer_size(SOCKET_BUFFER_BYTES)
        .map_err(|e| GitupError::TransportFailure(format!("setting send buffer: {e}")))?;
    Ok(())
}

fn tls_connect(host: &str, tcp: TcpStream) -> Result<rustls::StreamOwned<rustls::ClientConnection, TcpStream>> {
    let mut root_store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    let mut client_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    // Disable session tickets: every run resolves a fresh handshake.
    client_config.resumption = rustls::client::Resumption::disabled();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| GitupError::TransportFailure(format!("invalid TLS server name '{host}': {e}")))?;

    let client = rustls::ClientConnection::new(Arc::new(client_config), server_name)
        .map_err(|e| GitupError::TransportFailure(format!("starting TLS handshake: {e}")))?;

    Ok(rustls::StreamOwned::new(client, tcp))
}

fn read_until_header_end(stream: &mut impl Read) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if find_header_end(&buf).is_some() {
            return Ok(buf);
        }
        let n = stream
            .read(&mut chunk)
            .map_err(|e| GitupError::TransportFailure(format!("reading response headers: {e}")))?;
        if n == 0 {
            return Err(GitupError::TransportFailure("connection closed before headers completed".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_status_code(header_text: &str) -> Result<u16> {
    let first_line = header_text
        .lines()
        .next()
        .ok_or_else(|| GitupError::TransportFailure("empty response".into()))?;
    first_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| GitupError::TransportFailure(format!("malformed status line '{first_line}'")))
}

fn is_chunked(header_text: &str) -> bool {
    header_text
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("transfer-encoding:") && l.to_ascii_lowercase().contains("chunked"))
}

fn content_length(header_text: &str) -> Option<usize> {
    header_text.lines().find_map(|l| {
        let lower = l.to_ascii_lowercase();
        lower
            .strip_prefix("content-length:")
            .and_then(|v| v.trim().parse().ok())
    })
}

fn is_stderr_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stderr().is_terminal()
}

fn humanize_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}
