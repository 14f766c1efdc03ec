//! Demo protocols run on read-ready connections.
//!
//! Both read what the client has sent, answer once and close. The loop is
//! single-threaded, so each read is bounded by [`READ_TIMEOUT`] and a whole
//! request head by [`HEAD_DEADLINE`]: a slow client cannot stall everyone
//! else for long.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tcp_server::{ConnectionHandler, Disposition};
use tracing::debug;

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Total time allowed for a request head, however the bytes trickle in.
const HEAD_DEADLINE: Duration = Duration::from_secs(1);

/// Largest request head the HTTP handler reads.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

const ECHO_CHUNK: usize = 4 * 1024;

/// Writes back one chunk of whatever the client sent.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn handle(&mut self, mut conn: TcpStream) -> io::Result<Disposition> {
        conn.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut buf = [0u8; ECHO_CHUNK];
        let n = conn.read(&mut buf)?;
        if let Some(data) = buf.get(..n)
            && !data.is_empty()
        {
            conn.write_all(data)?;
        }
        debug!(bytes = n, "echoed");
        Ok(Disposition::Close)
    }
}

/// Minimal HTTP/1.x responder.
///
/// Every request gets `200 OK`; `GET /shutdown` additionally stops the
/// server. Anything without a parseable request line gets `400`.
#[derive(Debug, Default)]
pub struct HttpHandler;

impl ConnectionHandler for HttpHandler {
    fn handle(&mut self, mut conn: TcpStream) -> io::Result<Disposition> {
        let head = read_request_head(&mut conn, HEAD_DEADLINE)?;
        let (response, disposition) = respond(&head);
        conn.write_all(response.as_bytes())?;
        Ok(disposition)
    }
}

/// Read until the blank line ending the request head, EOF, or the size cap.
///
/// Fails with `TimedOut` once `budget` has passed since the first read.
fn read_request_head(conn: &mut TcpStream, budget: Duration) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + budget;
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while head.len() < MAX_REQUEST_HEAD && !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("request head incomplete after {budget:?}"),
            ));
        }
        conn.set_read_timeout(Some(remaining.min(READ_TIMEOUT)))?;
        let n = conn.read(&mut chunk)?;
        let Some(data) = chunk.get(..n).filter(|d| !d.is_empty()) else {
            break;
        };
        head.extend_from_slice(data);
    }
    Ok(head)
}

fn request_line(head: &[u8]) -> Option<(&str, &str)> {
    let line = head.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
    let mut parts = line.split(' ');
    let method = parts.next().filter(|m| !m.is_empty())?;
    let target = parts.next().filter(|t| !t.is_empty())?;
    let version = parts.next()?;
    version.starts_with("HTTP/1.").then_some((method, target))
}

fn respond(head: &[u8]) -> (String, Disposition) {
    match request_line(head) {
        Some(("GET", "/shutdown")) => (response(200, "OK", "shutting down\n"), Disposition::Shutdown),
        Some((method, target)) => {
            debug!(method, target, "http request");
            (response(200, "OK", "ok\n"), Disposition::Close)
        }
        None => (response(400, "Bad Request", "bad request\n"), Disposition::Close),
    }
}

fn response(status: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        len = body.len(),
    )
}
