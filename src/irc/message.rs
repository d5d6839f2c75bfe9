/// IRC message parsing and serialization.
///
/// Implements RFC 2812 message format:
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Both client lines (`NICK`, `USER`, `PASS`) and server-to-server lines
/// (`UID`, `KILL`, `SID`, ...) share this shape. Parsing operates on the
/// content without the `\r\n` terminator.
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name, SID, stable id, or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `UID`, `433`, `NICK`).
    pub command: String,
    /// Parameters. The last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// A prefix-less message.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// A message carrying a source prefix.
    pub fn with_prefix(
        prefix: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// A numeric reply from `server` to `target` (`*` before registration).
    pub fn numeric(server: &str, code: &str, target: &str, rest: &[&str]) -> Self {
        let mut params = Vec::with_capacity(rest.len() + 1);
        params.push(target.to_owned());
        params.extend(rest.iter().map(|p| (*p).to_owned()));
        Self::with_prefix(server, code, params)
    }

    /// The command, uppercased for dispatch.
    pub fn verb(&self) -> String {
        self.command.to_ascii_uppercase()
    }

    /// The nick (or id, or server) part of the prefix, everything before `!`.
    pub fn source(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split_once('!').map_or(p, |(nick, _)| nick))
            .filter(|s| !s.is_empty())
    }

    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches("\r\n");

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            // Prefix runs until the first space.
            match stripped.find(' ') {
                Some(idx) => (Some(stripped[..idx].to_owned()), &stripped[idx + 1..]),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        // Tolerate extra spaces between prefix and command.
        let rest = rest.trim_start_matches(' ');

        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if let Some(trailing) = remaining.strip_prefix(':') {
                    // Trailing parameter: everything after the colon, including spaces.
                    params.push(trailing.to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        if idx > 0 {
                            params.push(remaining[..idx].to_owned());
                        }
                        remaining = &remaining[idx + 1..];
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            // Always prefix the last parameter with `:`, valid per RFC 2812
            // and keeps gecos/reason text with spaces intact.
            out.push_str(" :");
            out.push_str(last);
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
