//! Session credential extraction from a raw cookie string.
//!
//! Malformed input never fails: segments that are not exactly `key=value`
//! are skipped, so the worst case is an empty map.

use std::collections::HashMap;

/// Parse `"key=value; key=value"` into a map.
pub fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();

    for segment in raw.split(';') {
        let parts: Vec<&str> = segment.trim().split('=').collect();
        if let [key, value] = parts.as_slice() {
            cookies.insert((*key).to_string(), (*value).to_string());
        }
    }

    cookies
}

/// Credentials presented during the transport handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub session_id: String,
    /// Raw cookie string, forwarded verbatim as the `Cookie` header
    pub cookie_header: String,
}

impl Credentials {
    /// Resolve the session identifier stored under `key`.
    ///
    /// Returns `None` when the key is missing or its value is empty.
    pub fn from_cookie_string(raw: &str, key: &str) -> Option<Self> {
        let session_id = parse_cookies(raw).remove(key).filter(|v| !v.is_empty())?;
        Some(Self {
            session_id,
            cookie_header: raw.to_string(),
        })
    }

    /// Session id prefix that is safe to put in logs
    pub fn redacted(&self) -> String {
        redact(&self.session_id)
    }
}

// Keep secrets out of Debug output.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("session_id", &self.redacted())
            .finish_non_exhaustive()
    }
}

pub(crate) fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(10).collect();
    if prefix.len() < value.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}
