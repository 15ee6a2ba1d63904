//! Logging helpers for raw modem traffic.
//!
//! GSM modules answer with `\r\n`-framed lines and the message terminator is a
//! bare Ctrl-Z byte, so anything read from or written to the serial line is
//! escaped before it reaches the log to keep every record on one line.

use std::fmt::Write;

const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters (including the 0x1A terminator) => `\\xNN`
///
/// Strings longer than 300 characters are cut with an ellipsis.
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
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Hex preview of at most `max` bytes, for trace-level wire dumps.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    data.iter()
        .take(max.min(data.len()))
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

/// Mask all but the last four digits of a phone number.
pub fn mask_number(number: &str) -> String {
    let digits = number.chars().filter(|c| c.is_ascii_digit()).count();
    if digits <= 4 {
        return number.to_string();
    }
    let mut seen = 0usize;
    number
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen <= digits - 4 {
                    return '*';
                }
            }
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_modem_framing_and_terminator() {
        let s = "AT+CMGF=1\r\nOK\r\n\u{1a}";
        assert_eq!(escape_log(s), "AT+CMGF=1\\r\\nOK\\r\\n\\x1A");
    }

    #[test]
    fn truncates_long_payloads() {
        let long = "x".repeat(400);
        let esc = escape_log(&long);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
    }

    #[test]
    fn hex_snippet_caps_length() {
        assert_eq!(hex_snippet(&[0x41, 0x54, 0x0d, 0x1a], 3), "41540d");
    }

    #[test]
    fn masks_phone_numbers() {
        assert_eq!(mask_number("+237699999999"), "+********9999");
        assert_eq!(mask_number("1234"), "1234");
    }
}
