//! Charset and length rules for identity attributes.
//!
//! The same rules apply to local clients and to peer bursts, only the
//! consequence differs: a local client gets a numeric, a peer introduction
//! gets KILLed back toward the link that sent it.
use std::fmt;

/// Default maximum nickname length (NICKLEN ISUPPORT token).
pub const DEFAULT_NICKLEN: usize = 30;
/// Maximum username length, including a leading `~`.
pub const USERLEN: usize = 10;
/// Maximum hostname length.
pub const HOSTLEN: usize = 63;
/// Maximum gecos (real name) length. Longer values are truncated, not rejected.
pub const REALLEN: usize = 50;

/// Which attribute failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Nickname,
    Username,
    Hostname,
    StableId,
    ServerId,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nickname => "nickname",
            Self::Username => "username",
            Self::Hostname => "hostname",
            Self::StableId => "stable id",
            Self::ServerId => "server id",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("empty {0}")]
    Empty(Field),
    #[error("{field} {value:?} contains invalid characters")]
    InvalidCharset { field: Field, value: String },
    #[error("{field} {value:?} is longer than {max}")]
    TooLong {
        field: Field,
        value: String,
        max: usize,
    },
}

impl ValidationError {
    pub fn field(&self) -> Field {
        match self {
            Self::Empty(field)
            | Self::InvalidCharset { field, .. }
            | Self::TooLong { field, .. } => *field,
        }
    }
}

/// RFC 2812 "special" characters allowed anywhere in a nick.
fn is_nick_special(c: char) -> bool {
    matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
}

fn check_len(field: Field, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            value: value.to_owned(),
            max,
        });
    }
    Ok(())
}

fn charset_error(field: Field, value: &str) -> ValidationError {
    ValidationError::InvalidCharset {
        field,
        value: value.to_owned(),
    }
}

/// Validate a nickname: letter or special first, then letters, digits,
/// specials and `-`.
pub fn validate_nick(nick: &str, max_len: usize) -> Result<(), ValidationError> {
    check_len(Field::Nickname, nick, max_len)?;
    let mut chars = nick.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || is_nick_special(c));
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || is_nick_special(c) || c == '-');
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(charset_error(Field::Nickname, nick))
    }
}

/// Validate a username: optional leading `~`, then an alphanumeric, then
/// alphanumerics and `-_.`.
pub fn validate_username(user: &str) -> Result<(), ValidationError> {
    check_len(Field::Username, user, USERLEN)?;
    let body = user.strip_prefix('~').unwrap_or(user);
    let mut chars = body.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(charset_error(Field::Username, user))
    }
}

/// Validate a hostname: alphanumerics and `.-:/`, not starting with `:` or `.`.
///
/// `:` admits IPv6 literals, `/` admits cloaked hosts.
pub fn validate_hostname(host: &str) -> Result<(), ValidationError> {
    check_len(Field::Hostname, host, HOSTLEN)?;
    let bad_start = host.starts_with(':') || host.starts_with('.');
    let charset_ok = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '/'));
    if !bad_start && charset_ok {
        Ok(())
    } else {
        Err(charset_error(Field::Hostname, host))
    }
}

/// Truncate a free-text field to `max` bytes on a char boundary.
///
/// Returns the (possibly shortened) text and whether anything was cut.
pub fn truncate_text(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_owned(), false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_owned(), true)
}

/// Derive a client username from a `USER` parameter: `~` prefixed (no ident),
/// stripped of any `~` the client sent, cut to [`USERLEN`].
pub fn client_username(raw: &str) -> String {
    let body = raw.trim_start_matches('~');
    let (body, _) = truncate_text(body, USERLEN - 1);
    format!("~{body}")
}
