//! Logging helpers for peer-supplied text and raw frame payloads.
//! Labels and command values come straight off the wire, so they are escaped to keep
//! each log record on one line.

const MAX_PREVIEW: usize = 120;

/// Escape a peer-supplied string for single-line logging.
///
/// Newlines, tabs, backslashes and other control characters are escaped; anything past
/// [`MAX_PREVIEW`] characters is replaced by an ellipsis.
pub fn escape_log(s: &str) -> String {
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

/// Short hex rendering of a payload for trace logs, e.g. `[5] 00 01 02 03 04`.
pub fn hex_preview(bytes: &[u8]) -> String {
    use std::fmt::Write;
    const MAX_BYTES: usize = 16;
    let mut out = format!("[{}]", bytes.len());
    for b in bytes.iter().take(MAX_BYTES) {
        let _ = write!(&mut out, " {:02X}", b);
    }
    if bytes.len() > MAX_BYTES {
        out.push_str(" …");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_with_control_characters_stay_on_one_line() {
        assert_eq!(escape_log("desk\nwork\t\x07"), "desk\\nwork\\t\\x07");
        let long = "a".repeat(MAX_PREVIEW + 10);
        assert!(escape_log(&long).ends_with('…'));
    }

    #[test]
    fn hex_preview_caps_output() {
        assert_eq!(hex_preview(&[0, 0xAB]), "[2] 00 AB");
        let long = vec![0xFFu8; 40];
        let preview = hex_preview(&long);
        assert!(preview.starts_with("[40] FF"));
        assert!(preview.ends_with('…'));
    }
}
