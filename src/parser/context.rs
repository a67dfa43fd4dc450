//! Extraction of the `Context=` field.

const MARKER: &str = ",Context='";

/// Pulls the multi-line Context value out of `s`: the text between
/// `,Context='` and the last unescaped single quote of the record. A record
/// truncated before the closing quote yields whatever is there.
pub(crate) fn extract_context(s: &str) -> String {
    let Some(idx) = s.find(MARKER) else {
        return String::new();
    };
    let ctx = &s[idx + MARKER.len()..];
    match last_unescaped_quote(ctx) {
        Some(end) => ctx[..end].to_string(),
        None => ctx.to_string(),
    }
}

fn last_unescaped_quote(s: &str) -> Option<usize> {
    let mut last = None;
    let mut in_escape = false;
    for (idx, &byte) in s.as_bytes().iter().enumerate() {
        if byte == b'\'' && !in_escape {
            last = Some(idx);
        }
        in_escape = byte == b'\\' && !in_escape;
    }
    last
}
