//! Minimal HTTP: one request per connection, JSON responses with CORS headers.

use std::collections::HashMap;
use std::io::{self, BufRead, Read};

/// Cap on a request body. A `Content-Length` claiming more is rejected before
/// any allocation happens.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// A parsed one-shot request. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Error parsing a request.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),
    #[error("request body too large ({0} bytes)")]
    BodyTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Read headers until the blank line. Malformed lines are skipped, matching
/// the tolerant parsing the bridge has always done.
pub fn read_headers<R: BufRead>(r: &mut R) -> Result<HashMap<String, String>, HttpError> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

/// Parse a full request given its already-consumed request line.
pub fn read_request<R: BufRead>(request_line: &str, r: &mut R) -> Result<HttpRequest, HttpError> {
    let headers = read_headers(r)?;
    finish_request(request_line, headers, r)
}

/// Assemble a request from a consumed request line and headers, reading the
/// body if a positive Content-Length is present.
pub fn finish_request<R: Read>(
    request_line: &str,
    headers: HashMap<String, String>,
    r: &mut R,
) -> Result<HttpRequest, HttpError> {
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) => (m.to_string(), p.to_string(), v.to_string()),
        _ => return Err(HttpError::BadRequestLine(request_line.to_string())),
    };

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_LEN {
        return Err(HttpError::BodyTooLarge(content_length));
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        r.read_exact(&mut body)?;
    }

    Ok(HttpRequest {
        method,
        path,
        version,
        headers,
        body,
    })
}

/// Canonical reason phrase for the status codes the bridge answers with.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Serialize a JSON response with permissive CORS headers.
pub fn response(status: u16, body: &str) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n",
        status,
        reason_phrase(status),
        body.len()
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Shorthand for an `{"error": ...}` body.
pub fn error_response(status: u16, message: &str) -> Vec<u8> {
    let body = serde_json::json!({ "error": message }).to_string();
    response(status, &body)
}
