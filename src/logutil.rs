//! Helpers that keep log lines single-line and bounded.
//! Message text and device log records arrive from the mesh, so they are escaped before logging.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// UTF-8 safe truncation for previews. Never slices inside a multi-byte char;
/// the result is escaped and ends with `...` when cut.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// First `max` bytes of a buffer as lowercase hex, for trace output.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out: String = data[..shown].iter().map(|b| format!("{:02x}", b)).collect();
    if data.len() > shown {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_controls() {
        assert_eq!(escape_log("Line1\nLine2\r\tEnd"), "Line1\\nLine2\\r\\tEnd");
        assert_eq!(escape_log("bell\u{7}"), "bell\\x07");
    }

    #[test]
    fn truncate_does_not_split_multibyte() {
        let s = "ab€cd";
        // "€" occupies bytes 2..5; a 6-byte budget leaves 3 bytes of content.
        assert_eq!(truncate_for_log(s, 6), "ab...");
        assert_eq!(truncate_for_log("short", 10), "short");
    }

    #[test]
    fn hex_snippet_marks_truncation() {
        assert_eq!(hex_snippet(&[0x0a, 0xff], 8), "0aff");
        assert_eq!(hex_snippet(&[1, 2, 3], 2), "0102…");
    }
}
