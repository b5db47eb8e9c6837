//! `data:` URLs for images we attach to LLM prompts.

use std::sync::LazyLock;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use regex::Regex;

static DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:(?P<mime_type>[^;,]+);base64,(?P<data>.+)$")
        .expect("failed to compile regex")
});

/// Encode binary data as a Base64 `data:` URL.
///
/// We don't percent-encode the Base64 payload, because Gemini rejects it.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64_STANDARD.encode(data))
}

/// Split a Base64 `data:` URL into a MIME type and the still-encoded payload.
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let caps = DATA_URL_RE.captures(url)?;
    Some((caps.name("mime_type")?.as_str(), caps.name("data")?.as_str()))
}
