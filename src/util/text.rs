use std::borrow::Cow;

/// Returns true for bytes that must never reach an IRC line verbatim.
///
/// CR and LF would terminate the line early, NUL is forbidden by the
/// protocol, and the remaining C0 controls plus DEL would otherwise be
/// interpreted as mIRC formatting codes.
fn is_control(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

/// Makes feed-provided text safe to embed in a single IRC message.
///
/// Line breaks and tabs (`\r`, `\n`, `\t`) become single spaces, with runs
/// collapsed so that a `\r\n` pair yields one space. Every other control
/// character is dropped. Returns a borrowed string when nothing changes.
///
/// # Examples
///
/// ```
/// use ircboard::util::sanitize_irc_text;
///
/// assert_eq!(sanitize_irc_text("Hello"), "Hello");
/// assert_eq!(sanitize_irc_text("a\r\nb"), "a b");
/// assert_eq!(sanitize_irc_text("bold\x02text"), "boldtext");
/// ```
pub fn sanitize_irc_text(s: &str) -> Cow<'_, str> {
    if !s.bytes().any(is_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut last_was_break = false;

    for c in s.chars() {
        match c {
            '\r' | '\n' | '\t' => {
                if !last_was_break {
                    out.push(' ');
                }
                last_was_break = true;
            }
            c if c.is_ascii() && is_control(c as u8) => {}
            c => {
                out.push(c);
                last_was_break = false;
            }
        }
    }

    Cow::Owned(out)
}

/// Truncates a string to at most `max_bytes` bytes on a char boundary.
///
/// IRC limits lines to 512 bytes including the command and CRLF, so message
/// bodies are capped by byte length rather than by characters.
pub fn truncate_to_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_returns_borrowed() {
        let input = "New post: Hello, world!";
        let result = sanitize_irc_text(input);
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, input);
    }

    #[test]
    fn test_crlf_becomes_single_space() {
        assert_eq!(sanitize_irc_text("line1\r\nline2"), "line1 line2");
    }

    #[test]
    fn test_tab_becomes_space() {
        assert_eq!(sanitize_irc_text("a\tb"), "a b");
    }

    #[test]
    fn test_injected_command_is_flattened() {
        let input = "Title\r\nQUIT :bye";
        let result = sanitize_irc_text(input);
        assert!(!result.contains('\r'));
        assert!(!result.contains('\n'));
        assert_eq!(result, "Title QUIT :bye");
    }

    #[test]
    fn test_formatting_codes_removed() {
        // Bold, color, reset, NUL and DEL
        let input = "\x02bold\x02 \x034red\x0f\x00x\x7f";
        assert_eq!(sanitize_irc_text(input), "bold 4redx");
    }

    #[test]
    fn test_unicode_preserved() {
        let input = "Grüße aus Köln\n日本語";
        assert_eq!(sanitize_irc_text(input), "Grüße aus Köln 日本語");
    }

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate_to_bytes("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_exact_length() {
        assert_eq!(truncate_to_bytes("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_to_bytes("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        // 'ü' is two bytes; cutting at 2 would split it
        assert_eq!(truncate_to_bytes("aü", 2), "a");
        assert_eq!(truncate_to_bytes("aü", 3), "aü");
    }

    #[test]
    fn test_truncate_to_zero() {
        assert_eq!(truncate_to_bytes("abc", 0), "");
    }
}
