//! Escape-aware extraction of the `Sql=` field.

use regex::Regex;
use std::sync::LazyLock;

/// Timestamps the platform injects into statement text; they are not part of
/// the SQL and are scrubbed before the row is shipped.
static EMBEDDED_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").expect("embedded timestamp regex")
});

/// Scans `s` up to the first unescaped `quote` byte. A backslash escapes the
/// following byte and is dropped from the output, so `\'` yields `'`.
///
/// Returns the scrubbed SQL text and the remainder of `s` after the closing
/// quote; when no closing quote exists the whole input is consumed.
pub(crate) fn extract_sql(s: &str, quote: u8) -> (String, &str) {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_escape = false;

    for (idx, &byte) in bytes.iter().enumerate() {
        if byte == quote && !in_escape {
            return (scrub(&out), &s[idx + 1..]);
        }
        if byte == b'\\' && !in_escape {
            in_escape = true;
        } else {
            in_escape = false;
            out.push(byte);
        }
    }

    (scrub(&out), "")
}

fn scrub(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    EMBEDDED_TIMESTAMP.replace_all(&text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_unescaped_quote() {
        let (sql, after) = extract_sql("SELECT 1',Context='C'", b'\'');
        assert_eq!(sql, "SELECT 1");
        assert_eq!(after, ",Context='C'");
    }

    #[test]
    fn escaped_quotes_stay_inside_the_statement() {
        let (sql, after) = extract_sql(r"WHERE name = \'x\'' tail", b'\'');
        assert_eq!(sql, "WHERE name = 'x'");
        assert_eq!(after, " tail");
    }

    #[test]
    fn escaped_backslash_does_not_escape_the_quote() {
        let (sql, after) = extract_sql(r"path \\' tail", b'\'');
        assert_eq!(sql, r"path \");
        assert_eq!(after, " tail");
    }

    #[test]
    fn unterminated_sql_consumes_everything() {
        let (sql, after) = extract_sql("SELECT * FROM t", b'\'');
        assert_eq!(sql, "SELECT * FROM t");
        assert_eq!(after, "");
    }

    #[test]
    fn embedded_timestamps_are_scrubbed() {
        let (sql, _) = extract_sql("SELECT x 2024-12-31 23:59:59 FROM t'", b'\'');
        assert!(!sql.contains("2024-12-31"));
        assert!(sql.starts_with("SELECT x"));
        assert!(sql.ends_with("FROM t"));
    }

    #[test]
    fn multi_line_statement_is_one_string() {
        let (sql, _) = extract_sql("SELECT a,\n  b\nFROM t'", b'\'');
        assert_eq!(sql, "SELECT a,\n  b\nFROM t");
    }
}
