//! Streaming HTTP transport.
//!
//! Issues a single form-encoded POST per fetch (`Connection: close`, no
//! keep-alive) over a plain or TLS `TcpStream`, follows redirects up to the
//! configured hop limit, and classifies the final status: 2xx passes, 401
//! is an Authentication error, everything else a Communication error
//! carrying the status and its class.
//!
//! Streaming mode hands the response body to the caller as it arrives: a
//! dedicated worker thread performs the request and writes each received
//! chunk into a bounded channel — the producer/consumer byte pipe. The
//! channel holds [`PIPE_CHUNKS`] chunks of up to [`CHUNK_BYTES`] bytes,
//! about one native pipe buffer; a lagging consumer blocks the producer, so
//! there is no unbounded buffering anywhere. The sender is dropped on every
//! worker exit path, which is what gives the reader a deterministic
//! end-of-stream. The worker's terminal state travels through its join
//! handle: consume the stream, then [`Worker::join`] and propagate.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::config::Config;
#[cfg(feature = "tls")]
use crate::config::TrustPolicy;
use crate::errors::{Result, XylemError};

/// Chunks held by the byte pipe before the producer blocks.
pub const PIPE_CHUNKS: usize = 8;
/// Largest chunk the worker writes at once.
pub const CHUNK_BYTES: usize = 8192;

/// Status line and headers of a response, header names lowercased.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseMeta {
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = name.to_ascii_lowercase();
        self.headers.iter().find(|(n, _)| *n == wanted).map(|(_, v)| v.as_str())
    }
}

/// A fully buffered response.
#[derive(Debug)]
pub struct Response {
    pub meta: ResponseMeta,
    pub body: Vec<u8>,
}

/// Read end of the streaming byte pipe. Blocks when no bytes are available
/// and the producer is still running; returns end-of-stream once the
/// producer has dropped its sender.
pub struct ByteStream {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Handle to the fetch worker. Must be joined (or deliberately dropped)
/// after the stream is consumed; joining publishes the worker's terminal
/// state.
pub struct Worker {
    handle: JoinHandle<Result<ResponseMeta>>,
}

impl Worker {
    pub fn join(self) -> Result<ResponseMeta> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(XylemError::comm("transport worker panicked")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Where a request goes; re-resolved from the Location header on redirect.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    path: String,
    tls: bool,
}

impl Target {
    fn from_config(config: &Config, path: &str) -> Target {
        Target {
            host: config.host.clone(),
            port: config.effective_port(),
            path: path.to_string(),
            tls: config.ssl,
        }
    }
}

/// The transport layer: one value per configuration, reusable across
/// fetches. Fetches are independent; nothing is shared between them.
#[derive(Debug)]
pub struct Transport {
    config: Config,
}

impl Transport {
    pub fn new(config: Config) -> Transport {
        Transport { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Perform the request and buffer the whole body.
    pub fn fetch(&self, path: &str, fields: &[(String, String)]) -> Result<Response> {
        let body = form_urlencode(fields);
        let target = Target::from_config(&self.config, path);
        let (meta, mut reader) = execute(&self.config, target, &body)?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| XylemError::comm(format!("reading response body failed: {e}")))?;
        Ok(Response { meta, body: bytes })
    }

    /// Start the request on a worker thread and return the read end of the
    /// byte pipe immediately, before the body has completed. Parsing can
    /// begin on the first chunk.
    pub fn fetch_stream(&self, path: &str, fields: &[(String, String)]) -> Result<(ByteStream, Worker)> {
        let body = form_urlencode(fields);
        let target = Target::from_config(&self.config, path);
        let config = self.config.clone();
        let (tx, rx) = sync_channel::<Vec<u8>>(PIPE_CHUNKS);
        let handle = thread::Builder::new()
            .name("xylem-fetch".to_string())
            .spawn(move || pump(&config, target, &body, tx))?;
        Ok((ByteStream { rx, current: Vec::new(), pos: 0 }, Worker { handle }))
    }
}

/// Worker body: request, then feed chunks into the pipe in network order.
/// The sender is dropped on return — success, error, or abandoned
/// consumer — closing the pipe.
fn pump(
    config: &Config,
    target: Target,
    body: &str,
    tx: SyncSender<Vec<u8>>,
) -> Result<ResponseMeta> {
    let (meta, mut reader) = execute(config, target, body)?;
    let mut buf = [0u8; CHUNK_BYTES];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| XylemError::comm(format!("reading response body failed: {e}")))?;
        if n == 0 {
            break;
        }
        if tx.send(buf[..n].to_vec()).is_err() {
            debug!("stream consumer dropped; ending fetch early");
            break;
        }
    }
    Ok(meta)
}

/// Issue the request, following redirects, and return the classified
/// response with a live body reader.
fn execute(
    config: &Config,
    mut target: Target,
    body: &str,
) -> Result<(ResponseMeta, BodyReader<BufReader<Box<dyn Wire>>>)> {
    let mut hops = 0u32;
    loop {
        debug!(host = %target.host, port = target.port, path = %target.path, "issuing request");
        let mut wire = open_wire(config, &target)?;
        write_request(wire.as_mut(), config, &target, body)?;
        let mut reader = BufReader::new(wire);
        let head = read_head(&mut reader)?;

        if (300..400).contains(&head.status) {
            if let Some(location) = head.header("location") {
                hops += 1;
                if hops >= config.redirect_limit {
                    return Err(XylemError::comm(format!(
                        "redirected too many times reaching {}:{} (limit {})",
                        target.host, target.port, config.redirect_limit
                    )));
                }
                info!(status = head.status, location, "following redirect");
                target = resolve_location(&target, location)?;
                continue;
            }
        }
        classify(&head)?;

        let framing = framing_for(&head)?;
        let meta = ResponseMeta { status: head.status, headers: head.headers };
        return Ok((meta, BodyReader::new(reader, framing)));
    }
}

/// 2xx passes; 401 is authentication, never communication; anything else
/// that survived redirect handling is a communication failure carrying the
/// status and class.
fn classify(head: &ResponseHead) -> Result<()> {
    match head.status {
        200..=299 => Ok(()),
        401 => Err(XylemError::auth(
            "the account name or password is not correct, or the account has no access to the XML interface",
        )),
        404 => Err(XylemError::comm_status(
            404,
            "the server's XML interface is not responding (server returned 404)",
        )),
        status => Err(XylemError::comm_status(
            status,
            format!("unexpected response from server: {status} {}", head.reason),
        )),
    }
}

// ============================================================================
// Wire plumbing
// ============================================================================

trait Wire: Read + Write + Send {}
impl<T: Read + Write + Send> Wire for T {}

fn open_wire(config: &Config, target: &Target) -> Result<Box<dyn Wire>> {
    let (connect_host, connect_port) = match &config.proxy {
        Some(proxy) if !target.tls => (proxy.host.as_str(), proxy.port),
        Some(_) => return Err(XylemError::config("proxy together with tls is not supported")),
        None => (target.host.as_str(), target.port),
    };
    let addr = (connect_host, connect_port)
        .to_socket_addrs()
        .map_err(|e| XylemError::comm(format!("cannot resolve {connect_host}:{connect_port}: {e}")))?
        .next()
        .ok_or_else(|| XylemError::comm(format!("no addresses for {connect_host}:{connect_port}")))?;
    let stream = TcpStream::connect_timeout(&addr, config.timeout).map_err(|e| {
        XylemError::comm(format!("connecting to {connect_host}:{connect_port} failed: {e}"))
    })?;
    stream.set_read_timeout(Some(config.timeout))?;
    stream.set_write_timeout(Some(config.timeout))?;

    if target.tls {
        wrap_tls(config, &target.host, stream)
    } else {
        Ok(Box::new(stream))
    }
}

#[cfg(feature = "tls")]
fn wrap_tls(config: &Config, host: &str, stream: TcpStream) -> Result<Box<dyn Wire>> {
    let trust = config
        .trust
        .as_ref()
        .ok_or_else(|| XylemError::config("tls requested without an explicit trust policy"))?;
    let mut builder = native_tls::TlsConnector::builder();
    match trust {
        TrustPolicy::CaFile(path) => {
            let pem = std::fs::read(path)?;
            let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
                XylemError::config(format!("unreadable root certificate {}: {e}", path.display()))
            })?;
            builder.add_root_certificate(cert);
            builder.disable_built_in_roots(true);
        }
        TrustPolicy::Insecure => {
            warn!("tls certificate verification disabled by configuration");
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
    }
    let connector =
        builder.build().map_err(|e| XylemError::comm(format!("tls setup failed: {e}")))?;
    let tls = connector
        .connect(host, stream)
        .map_err(|e| XylemError::comm(format!("tls handshake with {host} failed: {e}")))?;
    Ok(Box::new(tls))
}

#[cfg(not(feature = "tls"))]
fn wrap_tls(_config: &Config, _host: &str, _stream: TcpStream) -> Result<Box<dyn Wire>> {
    Err(XylemError::config("this build has no tls support (enable the 'tls' feature)"))
}

fn write_request(wire: &mut dyn Wire, config: &Config, target: &Target, body: &str) -> Result<()> {
    // Through a proxy the request line carries the absolute URI.
    let request_path = if config.proxy.is_some() && !target.tls {
        format!("http://{}:{}{}", target.host, target.port, target.path)
    } else {
        target.path.clone()
    };

    let mut head = String::with_capacity(256);
    head.push_str(&format!("POST {request_path} HTTP/1.1\r\n"));
    head.push_str(&format!("Host: {}:{}\r\n", target.host, target.port));
    head.push_str(&format!("User-Agent: xylem/{}\r\n", env!("CARGO_PKG_VERSION")));
    head.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n");
    if let Some(account) = &config.account_name {
        let password = match &config.password {
            Some(source) => source.resolve()?,
            None => String::new(),
        };
        let credentials = base64(format!("{account}:{password}").as_bytes());
        head.push_str(&format!("Authorization: Basic {credentials}\r\n"));
    }
    head.push_str("\r\n");

    wire.write_all(head.as_bytes())
        .and_then(|_| wire.write_all(body.as_bytes()))
        .and_then(|_| wire.flush())
        .map_err(|e| XylemError::comm(format!("sending request failed: {e}")))
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

fn read_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| XylemError::comm(format!("reading response failed: {e}")))?;
    if line.is_empty() {
        return Err(XylemError::comm("server closed the connection without responding"));
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(XylemError::comm(format!("not an http response: '{}'", line.trim_end())));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| XylemError::comm(format!("unreadable status line: '{}'", line.trim_end())))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| XylemError::comm(format!("reading response headers failed: {e}")))?;
        if n == 0 {
            return Err(XylemError::comm("truncated response head"));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    Ok(ResponseHead { status, reason, headers })
}

// ============================================================================
// Body framing
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Framing {
    Sized(u64),
    Chunked,
    /// No length information: body runs to connection close.
    Close,
}

fn framing_for(head: &ResponseHead) -> Result<Framing> {
    if let Some(te) = head.header("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
    }
    match head.header("content-length") {
        Some(len) => {
            let len = len.trim().parse().map_err(|_| {
                XylemError::comm(format!("unreadable content-length '{len}'"))
            })?;
            Ok(Framing::Sized(len))
        }
        None => Ok(Framing::Close),
    }
}

/// Decodes a response body according to its framing.
struct BodyReader<R: BufRead> {
    inner: R,
    framing: Framing,
    chunk_remaining: u64,
    consumed: u64,
    done: bool,
}

impl<R: BufRead> BodyReader<R> {
    fn new(inner: R, framing: Framing) -> Self {
        Self { inner, framing, chunk_remaining: 0, consumed: 0, done: false }
    }

    fn read_chunked(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.chunk_remaining == 0 {
            let mut line = String::new();
            let n = self.inner.read_line(&mut line)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated chunked body",
                ));
            }
            let size_str = line.trim().split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad chunk size '{size_str}'"))
            })?;
            if size == 0 {
                // Trailers run to a blank line.
                loop {
                    line.clear();
                    let n = self.inner.read_line(&mut line)?;
                    if n == 0 || line.trim().is_empty() {
                        break;
                    }
                }
                self.done = true;
                return Ok(0);
            }
            self.chunk_remaining = size;
        }

        let want = buf.len().min(self.chunk_remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk"));
        }
        self.chunk_remaining -= n as u64;
        if self.chunk_remaining == 0 {
            let mut crlf = [0u8; 2];
            self.inner.read_exact(&mut crlf)?;
            if &crlf != b"\r\n" {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "missing chunk delimiter"));
            }
        }
        Ok(n)
    }
}

impl<R: BufRead> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Close => {
                let n = self.inner.read(buf)?;
                if n == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            Framing::Sized(total) => {
                let remaining = total - self.consumed;
                if remaining == 0 {
                    self.done = true;
                    return Ok(0);
                }
                let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
                let n = self.inner.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body shorter than content-length",
                    ));
                }
                self.consumed += n as u64;
                if self.consumed == total {
                    self.done = true;
                }
                Ok(n)
            }
            Framing::Chunked => self.read_chunked(buf),
        }
    }
}

// ============================================================================
// Redirect resolution
// ============================================================================

fn resolve_location(current: &Target, location: &str) -> Result<Target> {
    if let Some(rest) = location.strip_prefix("http://") {
        parse_authority(rest, false)
    } else if let Some(rest) = location.strip_prefix("https://") {
        parse_authority(rest, true)
    } else if location.starts_with('/') {
        Ok(Target { path: location.to_string(), ..current.clone() })
    } else {
        Err(XylemError::comm(format!("unusable redirect location '{location}'")))
    }
}

fn parse_authority(rest: &str, tls: bool) -> Result<Target> {
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                XylemError::comm(format!("bad port in redirect target '{authority}'"))
            })?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), if tls { 443 } else { 80 }),
    };
    if host.is_empty() {
        return Err(XylemError::comm(format!("empty host in redirect target '{authority}'")));
    }
    Ok(Target { host, port, path: path.to_string(), tls })
}

// ============================================================================
// Small wire encoders
// ============================================================================

/// application/x-www-form-urlencoded.
pub(crate) fn form_urlencode(fields: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        push_escaped(&mut out, name);
        out.push('=');
        push_escaped(&mut out, value);
    }
    out
}

fn push_escaped(out: &mut String, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
}

/// Standard base64 with padding, for the basic-auth header.
pub(crate) fn base64(input: &[u8]) -> String {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let bytes = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
        out.push(TABLE[(n >> 18 & 63) as usize] as char);
        out.push(TABLE[(n >> 12 & 63) as usize] as char);
        out.push(if chunk.len() > 1 { TABLE[(n >> 6 & 63) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { TABLE[(n & 63) as usize] as char } else { '=' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn base64_vectors() {
        assert_eq!(base64(b""), "");
        assert_eq!(base64(b"f"), "Zg==");
        assert_eq!(base64(b"fo"), "Zm8=");
        assert_eq!(base64(b"foo"), "Zm9v");
        assert_eq!(base64(b"user:secret"), "dXNlcjpzZWNyZXQ=");
    }

    #[test]
    fn form_encoding() {
        let fields = vec![
            ("-find".to_string(), String::new()),
            ("name".to_string(), "a b&c".to_string()),
            ("note".to_string(), "caf\u{e9}".to_string()),
        ];
        assert_eq!(form_urlencode(&fields), "-find=&name=a+b%26c&note=caf%C3%A9");
    }

    #[test]
    fn status_line_and_headers() {
        let raw = "HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n";
        let head = read_head(&mut Cursor::new(raw)).unwrap();
        assert_eq!(head.status, 302);
        assert_eq!(head.reason, "Found");
        assert_eq!(head.header("location"), Some("/next"));
        assert_eq!(head.header("content-length"), Some("0"));
    }

    #[test]
    fn rejects_non_http_response() {
        assert!(read_head(&mut Cursor::new("garbage\r\n\r\n")).is_err());
    }

    #[test]
    fn sized_body_reads_exactly() {
        let mut reader = BodyReader::new(Cursor::new("hello world extra"), Framing::Sized(11));
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn sized_body_truncation_is_an_error() {
        let mut reader = BodyReader::new(Cursor::new("short"), Framing::Sized(11));
        let mut out = String::new();
        assert!(reader.read_to_string(&mut out).is_err());
    }

    #[test]
    fn chunked_body_decodes() {
        let raw = "4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut reader = BodyReader::new(Cursor::new(raw), Framing::Chunked);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "Wikipedia");
    }

    #[test]
    fn chunked_body_with_extension_and_trailer() {
        let raw = "3;meta=1\r\nabc\r\n0\r\nTrailer: x\r\n\r\n";
        let mut reader = BodyReader::new(Cursor::new(raw), Framing::Chunked);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn chunked_truncation_is_an_error() {
        let raw = "ff\r\nnot enough";
        let mut reader = BodyReader::new(Cursor::new(raw), Framing::Chunked);
        let mut out = String::new();
        assert!(reader.read_to_string(&mut out).is_err());
    }

    #[test]
    fn location_resolution() {
        let here = Target { host: "a".into(), port: 80, path: "/p".into(), tls: false };
        let absolute = resolve_location(&here, "http://b:8080/q").unwrap();
        assert_eq!((absolute.host.as_str(), absolute.port, absolute.path.as_str()), ("b", 8080, "/q"));
        assert!(!absolute.tls);

        let defaulted = resolve_location(&here, "https://secure/q").unwrap();
        assert_eq!(defaulted.port, 443);
        assert!(defaulted.tls);

        let relative = resolve_location(&here, "/elsewhere").unwrap();
        assert_eq!(relative.host, "a");
        assert_eq!(relative.path, "/elsewhere");

        assert!(resolve_location(&here, "ftp://x/").is_err());
    }

    #[test]
    fn byte_stream_delivers_in_order_and_ends() {
        let (tx, rx) = sync_channel::<Vec<u8>>(4);
        tx.send(b"ab".to_vec()).unwrap();
        tx.send(b"cde".to_vec()).unwrap();
        drop(tx);
        let mut stream = ByteStream { rx, current: Vec::new(), pos: 0 };
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcde");
    }
}
