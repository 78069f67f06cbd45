//! Shared helpers for backend adapters
//!
//! Error condensation and stream framing used by all three adapters.

/// Maximum length of a provider error body carried into an error message
const ERROR_BODY_CAP: usize = 300;

/// Number of characters to show at start/end of a masked key
const KEY_MASK_VISIBLE_CHARS: usize = 4;

/// Truncate a string at a char boundary, never splitting a code point.
#[must_use]
pub fn truncate_safe(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Condense an HTTP failure into a single descriptive line.
///
/// Collapses whitespace in the provider body and caps its length so raw
/// transport errors never propagate unchanged.
#[must_use]
pub fn condense_http_error(status: u16, body: &str) -> String {
    let condensed: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let capped = truncate_safe(&condensed, ERROR_BODY_CAP);
    if capped.len() < condensed.len() {
        format!("HTTP {status}: {capped}...(truncated)")
    } else {
        format!("HTTP {status}: {capped}")
    }
}

/// Mask an API key for safe display in logs.
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    if key.len() <= KEY_MASK_VISIBLE_CHARS * 2 {
        return "****".to_string();
    }
    format!(
        "{}...{}",
        &key[..KEY_MASK_VISIBLE_CHARS],
        &key[key.len() - KEY_MASK_VISIBLE_CHARS..]
    )
}

/// Incremental framer for `text/event-stream` responses.
///
/// Feed raw chunks in, get complete `data:` payloads out. Event-name lines
/// and comments are dropped; the payload JSON carries its own type tag on
/// every protocol we consume.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: String,
}

impl SseFramer {
    /// Create an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns any complete data payloads.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    out.push(data.to_string());
                }
            }
        }
        out
    }
}

/// Incremental framer for line-delimited JSON streams.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: String,
}

impl LineFramer {
    /// Create an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns any complete non-empty lines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                out.push(line.to_string());
            }
        }
        out
    }

    /// Drain whatever is left in the buffer (for streams without a trailing newline).
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buf.trim();
        if rest.is_empty() {
            None
        } else {
            let out = rest.to_string();
            self.buf.clear();
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_safe_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_safe(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
    }

    #[test]
    fn condense_caps_long_bodies() {
        let body = "x".repeat(1000);
        let msg = condense_http_error(500, &body);
        assert!(msg.starts_with("HTTP 500:"));
        assert!(msg.ends_with("...(truncated)"));
        assert!(msg.len() < 350);
    }

    #[test]
    fn condense_collapses_whitespace() {
        let msg = condense_http_error(400, "bad\n\n  request\tbody");
        assert_eq!(msg, "HTTP 400: bad request body");
    }

    #[test]
    fn sse_framer_handles_split_chunks() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: {\"a\":").is_empty());
        let out = framer.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn sse_framer_drops_event_lines() {
        let mut framer = SseFramer::new();
        let out = framer.push(b"event: message_start\ndata: {\"t\":1}\n");
        assert_eq!(out, vec!["{\"t\":1}".to_string()]);
    }

    #[test]
    fn line_framer_yields_complete_lines() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"done\":fal").is_empty());
        let out = framer.push(b"se}\n{\"done\":true}");
        assert_eq!(out, vec!["{\"done\":false}".to_string()]);
        assert_eq!(framer.finish(), Some("{\"done\":true}".to_string()));
    }

    #[test]
    fn mask_api_key_short_and_long() {
        assert_eq!(mask_api_key("short"), "****");
        let masked = mask_api_key("sk-1234567890abcdef");
        assert_eq!(masked, "sk-1...cdef");
    }
}
