//! Logging helpers: keep user-controlled strings on one log line and tag
//! connections consistently.

use std::fmt::Write;
use std::net::IpAddr;

/// Log a security-relevant event (bans, kicks, unauthorized actions) under the
/// `security` target so it can be routed to the dedicated security log file.
macro_rules! sec_log {
    ($($arg:tt)*) => { log::warn!(target: "security", $($arg)*); };
}
pub(crate) use sec_log;

const MAX_PREVIEW: usize = 200;

/// Escape a chat payload for single-line logging.
///
/// Backslash, newline, carriage return and tab get their usual escapes, other control
/// characters become `\xNN`. Anything past 200 characters is cut with an ellipsis since
/// chat lines are user controlled and can be up to the message cap.
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

/// Compact `channel:user@addr` tag used as a prefix by connection-level log lines.
pub fn conn_tag(channel: &str, user_id: &str, addr: IpAddr) -> String {
    format!("{}:{}@{}", escape_log(channel), user_id, addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        let esc = escape_log("Line1\nLine2\r\tEnd\u{7}");
        assert_eq!(esc, "Line1\\nLine2\\r\\tEnd\\x07");
    }

    #[test]
    fn truncates_long_payloads() {
        let long = "a".repeat(500);
        let esc = escape_log(&long);
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
        assert!(esc.ends_with('…'));
    }

    #[test]
    fn conn_tag_escapes_channel() {
        let tag = conn_tag("evil\nroom", "abcd", "10.0.0.1".parse().unwrap());
        assert_eq!(tag, "evil\\nroom:abcd@10.0.0.1");
    }
}
