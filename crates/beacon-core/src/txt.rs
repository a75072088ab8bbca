//! TXT record payload codec.
//!
//! Every control field Beacon exchanges rides in TXT rdata as a sequence of
//! DNS character-strings, each one `key=value`. Binary values (`peers`) are
//! base64. Unknown keys are ignored so newer nodes can add fields; a
//! malformed entry rejects the whole payload, since a half-understood
//! control message is worse than none.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Decoded TXT control payload. Field presence is meaning: `announce` with
/// the textual port `"0"` tells a tracker to use the observed source port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtPayload {
    pub token: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    /// Packed peer list, already base64-decoded.
    pub peers: Option<Vec<u8>>,
    pub announce: Option<String>,
    pub unannounce: Option<String>,
    pub subscribe: bool,
}

impl TxtPayload {
    /// Encode as TXT character-strings, one `key=value` per string.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let mut strings = Vec::new();
        let mut push = |key: &str, value: &str| {
            strings.push(format!("{key}={value}").into_bytes());
        };
        if let Some(token) = &self.token {
            push("token", token);
        }
        if let Some(host) = &self.host {
            push("host", host);
        }
        if let Some(port) = &self.port {
            push("port", port);
        }
        if let Some(peers) = &self.peers {
            push("peers", &BASE64.encode(peers));
        }
        if let Some(announce) = &self.announce {
            push("announce", announce);
        }
        if let Some(unannounce) = &self.unannounce {
            push("unannounce", unannounce);
        }
        if self.subscribe {
            push("subscribe", "true");
        }
        strings
    }

    /// Decode from TXT character-strings. Returns `None` on any malformed
    /// entry — callers treat that as "drop the record".
    pub fn decode(strings: &[Vec<u8>]) -> Option<Self> {
        let mut payload = TxtPayload::default();
        for string in strings {
            let text = std::str::from_utf8(string).ok()?;
            let (key, value) = match text.split_once('=') {
                Some(parts) => parts,
                None => (text, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "token" => payload.token = Some(value.to_string()),
                "host" => payload.host = Some(value.to_string()),
                "port" => payload.port = Some(value.to_string()),
                "peers" => payload.peers = Some(BASE64.decode(value).ok()?),
                "announce" => payload.announce = Some(value.to_string()),
                "unannounce" => payload.unannounce = Some(value.to_string()),
                // Presence is what counts; the original emitter never sends
                // a falsy value under this key.
                "subscribe" => payload.subscribe = true,
                _ => {}
            }
        }
        Some(payload)
    }
}
