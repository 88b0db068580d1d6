//! Upgrade handshake: header validation and accept-key derivation.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing (RFC 6455 §4.2.2).
pub const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Error validating an upgrade request or response.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing or invalid Upgrade header")]
    BadUpgrade,
    #[error("Connection header missing upgrade token")]
    BadConnection,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("server did not switch protocols: {0}")]
    BadStatus(String),
    #[error("server returned wrong accept key")]
    BadAcceptKey,
}

/// Validate an upgrade request's headers (names lowercased by the HTTP
/// parser). Returns the client key on success.
pub fn validate(headers: &HashMap<String, String>) -> Result<&str, HandshakeError> {
    match headers.get("upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::BadUpgrade),
    }
    let connection = headers
        .get("connection")
        .ok_or(HandshakeError::BadConnection)?;
    let has_upgrade_token = connection
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
    if !has_upgrade_token {
        return Err(HandshakeError::BadConnection);
    }
    match headers.get("sec-websocket-key") {
        Some(key) if !key.trim().is_empty() => Ok(key.trim()),
        _ => Err(HandshakeError::MissingKey),
    }
}

/// Accept key: base64(sha1(client key + GUID)). Deterministic and pure.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The fixed 101 response for a validated upgrade.
pub fn accept_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
}

/// Client nonce from 16 random bytes. The caller supplies the randomness.
pub fn nonce_from_bytes(bytes: [u8; 16]) -> String {
    BASE64.encode(bytes)
}

/// Client upgrade request for path `/` on `host`.
pub fn client_request(host: &str, key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// Check the server's handshake response against the key we sent.
pub fn verify_accept(
    key: &str,
    status_line: &str,
    headers: &HashMap<String, String>,
) -> Result<(), HandshakeError> {
    if !status_line.contains(" 101 ") {
        return Err(HandshakeError::BadStatus(status_line.to_string()));
    }
    match headers.get("sec-websocket-accept") {
        Some(got) if got.trim() == accept_key(key) => Ok(()),
        _ => Err(HandshakeError::BadAcceptKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("upgrade".into(), "websocket".into());
        h.insert("connection".into(), "keep-alive, Upgrade".into());
        h.insert("sec-websocket-key".into(), "dGhlIHNhbXBsZSBub25jZQ==".into());
        h
    }

    #[test]
    fn rfc6455_worked_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn validate_accepts_mixed_case_tokens() {
        let mut h = upgrade_headers();
        h.insert("upgrade".into(), "WebSocket".into());
        h.insert("connection".into(), "UPGRADE".into());
        assert_eq!(validate(&h).unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn validate_rejects_missing_headers() {
        let mut h = upgrade_headers();
        h.remove("upgrade");
        assert_eq!(validate(&h), Err(HandshakeError::BadUpgrade));

        let mut h = upgrade_headers();
        h.insert("connection".into(), "keep-alive".into());
        assert_eq!(validate(&h), Err(HandshakeError::BadConnection));

        let mut h = upgrade_headers();
        h.remove("sec-websocket-key");
        assert_eq!(validate(&h), Err(HandshakeError::MissingKey));

        let mut h = upgrade_headers();
        h.insert("sec-websocket-key".into(), "  ".into());
        assert_eq!(validate(&h), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn accept_response_carries_key() {
        let resp = accept_response("dGhlIHNhbXBsZSBub25jZQ==");
        assert!(resp.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(resp.ends_with("\r\n\r\n"));
    }

    #[test]
    fn verify_accept_roundtrip() {
        let key = nonce_from_bytes([7u8; 16]);
        let mut headers = HashMap::new();
        headers.insert("sec-websocket-accept".into(), accept_key(&key));
        assert!(verify_accept(&key, "HTTP/1.1 101 Switching Protocols", &headers).is_ok());

        assert_eq!(
            verify_accept(&key, "HTTP/1.1 400 Bad Request", &headers),
            Err(HandshakeError::BadStatus("HTTP/1.1 400 Bad Request".into()))
        );
        headers.insert("sec-websocket-accept".into(), "bogus".into());
        assert_eq!(
            verify_accept(&key, "HTTP/1.1 101 Switching Protocols", &headers),
            Err(HandshakeError::BadAcceptKey)
        );
    }
}
