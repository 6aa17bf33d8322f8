//! Input sanitization for everything a client controls: room names, chat text, cookies.

use percent_encoding::percent_decode_str;

/// Longest accepted room name, in characters.
pub const MAX_CHANNEL_NAME: usize = 64;

/// Longest `id` accepted in a `move` message.
pub const MAX_MOVE_ID: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelNameError {
    #[error("Channel name is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("Channel name is not valid UTF-8 once decoded")]
    InvalidEncoding,

    #[error("Channel name contains control characters")]
    ControlCharacters,
}

/// Zero-width and direction-control code points that render as nothing.
fn is_invisible(c: char) -> bool {
    matches!(c as u32,
        0x200B..=0x200F | 0x2028..=0x202F | 0x2060..=0x206F | 0xFEFF)
}

/// Extract the requested room from a request path.
///
/// The room is the second path segment (`/socket/<room>/...`) or the only one (`/<room>`),
/// lowercased. An empty name yields `default`.
pub fn parse_channel_name(path: &str, default: &str) -> Result<String, ChannelNameError> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let mut parts = path.splitn(3, '/');
    let _leading = parts.next();
    let first = parts.next().unwrap_or("");
    let raw = match parts.next() {
        Some(rest) => rest.split('/').next().unwrap_or(""),
        None => first,
    };
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ChannelNameError::InvalidEncoding)?;
    let name = decoded.trim().to_lowercase();
    if name.chars().any(|c| c.is_control()) {
        return Err(ChannelNameError::ControlCharacters);
    }
    if name.chars().count() > MAX_CHANNEL_NAME {
        return Err(ChannelNameError::TooLong {
            max: MAX_CHANNEL_NAME,
        });
    }
    if name.is_empty() {
        return Ok(default.to_string());
    }
    Ok(name)
}

/// Prepare a chat line for rendering: drop invisible characters and cap the length.
pub fn sanitize_message(text: &str, max_chars: usize) -> String {
    text.chars()
        .filter(|c| !is_invisible(*c))
        .take(max_chars)
        .collect()
}

/// Escape the five HTML-significant characters.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Find the `id` cookie in a `Cookie` request header.
pub fn cookie_token(header: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "id")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty() && value.len() <= 128)
}
