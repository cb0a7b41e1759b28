//! P2W text protocol parser and response generator.
//!
//! One request per connection, one response back, then the server closes:
//! - Sessions: `CONNECT:<user>`, `DISCONNECT:<user>`, `HEARTBEAT:<user>`
//! - Scoring: `P2W_PING:<user>|<latency_ms>`
//! - Queries: `GET_STATS`, `GET_LEADERBOARD`
//!
//! Responses carry no terminator; the closed connection ends them.

use bytes::Bytes;
use std::str;
use std::time::Duration;

/// Parsed client request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open (or refresh) a session
    Connect { username: String },

    /// Close a session
    Disconnect { username: String },

    /// Keep a session alive
    Heartbeat { username: String },

    /// Try to register a win
    Ping { username: String, latency_ms: f64 },

    /// Server counters as JSON
    Stats,

    /// Top of the ledger as JSON
    Leaderboard,
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Nothing was sent
    Empty,
    /// Verb not recognised
    UnknownCommand(String),
    /// Verb needs a `:<argument>` part
    MissingArgument(&'static str),
    /// Latency is not a finite, non-negative number
    InvalidLatency(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Empty request"),
            ParseError::UnknownCommand(cmd) => write!(f, "Unknown command: {}", cmd),
            ParseError::MissingArgument(verb) => write!(f, "Missing argument for {}", verb),
            ParseError::InvalidLatency(raw) => write!(f, "Invalid latency: {}", raw),
        }
    }
}

impl std::error::Error for ParseError {}

/// Command parser
pub struct Parser;

impl Parser {
    /// Extract the verb of a request without looking at its arguments.
    pub fn verb(request: &[u8]) -> &[u8] {
        let line = first_line(request);
        match line.iter().position(|&b| b == b':') {
            Some(pos) => &line[..pos],
            None => line,
        }
    }

    /// Parse a single request. Only the first line is considered and
    /// surrounding whitespace is ignored.
    pub fn parse(request: &[u8]) -> Result<Command, ParseError> {
        let line = str::from_utf8(first_line(request))
            .map_err(|_| ParseError::UnknownCommand("<non-utf8>".to_string()))?
            .trim();

        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (verb, argument) = match line.split_once(':') {
            Some((verb, argument)) => (verb, Some(argument.trim())),
            None => (line, None),
        };

        match verb {
            "GET_STATS" if argument.is_none() => Ok(Command::Stats),
            "GET_LEADERBOARD" if argument.is_none() => Ok(Command::Leaderboard),
            "CONNECT" => Ok(Command::Connect {
                username: require(argument, "CONNECT")?.to_string(),
            }),
            "DISCONNECT" => Ok(Command::Disconnect {
                username: require(argument, "DISCONNECT")?.to_string(),
            }),
            "HEARTBEAT" => Ok(Command::Heartbeat {
                username: require(argument, "HEARTBEAT")?.to_string(),
            }),
            "P2W_PING" => Self::parse_ping(require(argument, "P2W_PING")?),
            _ => Err(ParseError::UnknownCommand(line.to_string())),
        }
    }

    /// Parse `<user>|<latency_ms>`; a missing latency counts as zero.
    fn parse_ping(argument: &str) -> Result<Command, ParseError> {
        let (username, latency) = match argument.split_once('|') {
            Some((username, latency)) => (username.trim(), latency.trim()),
            None => (argument, ""),
        };

        let latency_ms = if latency.is_empty() {
            0.0
        } else {
            match latency.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 => v,
                _ => return Err(ParseError::InvalidLatency(latency.to_string())),
            }
        };

        Ok(Command::Ping {
            username: username.to_string(),
            latency_ms,
        })
    }
}

fn require<'a>(argument: Option<&'a str>, verb: &'static str) -> Result<&'a str, ParseError> {
    argument.ok_or(ParseError::MissingArgument(verb))
}

/// Slice up to the first line break
fn first_line(buffer: &[u8]) -> &[u8] {
    match buffer.iter().position(|&b| b == b'\n') {
        Some(pos) => &buffer[..pos],
        None => buffer,
    }
}

/// Response generators
pub struct Response;

impl Response {
    pub fn connected() -> &'static [u8] {
        b"CONNECTED"
    }

    pub fn disconnected() -> &'static [u8] {
        b"DISCONNECTED"
    }

    pub fn ok() -> &'static [u8] {
        b"OK"
    }

    pub fn already_won() -> &'static [u8] {
        b"ALREADY_WON"
    }

    pub fn invalid_username() -> &'static [u8] {
        b"INVALID_USERNAME"
    }

    pub fn blacklisted() -> &'static [u8] {
        b"BLACKLISTED"
    }

    pub fn invalid_request() -> &'static [u8] {
        b"INVALID_REQUEST"
    }

    pub fn server_error() -> &'static [u8] {
        b"SERVER_ERROR"
    }

    /// Generate a WIN response
    pub fn win(rank: u64) -> Bytes {
        Bytes::from(format!("WIN:{}", rank))
    }

    /// Generate a RATE_LIMITED response with the wait in seconds
    pub fn rate_limited(remaining: Duration) -> Bytes {
        Bytes::from(format!("RATE_LIMITED:{:.1}", remaining.as_secs_f64()))
    }

    /// Serialize a JSON body
    pub fn json<T: serde::Serialize>(body: &T) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(body).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        assert_eq!(
            Parser::parse(b"CONNECT:alice"),
            Ok(Command::Connect {
                username: "alice".to_string()
            })
        );
    }

    #[test]
    fn test_parse_tolerates_line_ending() {
        assert_eq!(
            Parser::parse(b"HEARTBEAT:alice\r\n"),
            Ok(Command::Heartbeat {
                username: "alice".to_string()
            })
        );
        assert_eq!(Parser::parse(b"GET_STATS\n"), Ok(Command::Stats));
    }

    #[test]
    fn test_parse_disconnect() {
        assert_eq!(
            Parser::parse(b"DISCONNECT:bob"),
            Ok(Command::Disconnect {
                username: "bob".to_string()
            })
        );
    }

    #[test]
    fn test_parse_ping_with_latency() {
        assert_eq!(
            Parser::parse(b"P2W_PING:alice|23.75"),
            Ok(Command::Ping {
                username: "alice".to_string(),
                latency_ms: 23.75
            })
        );
    }

    #[test]
    fn test_parse_ping_without_latency() {
        assert_eq!(
            Parser::parse(b"P2W_PING:alice"),
            Ok(Command::Ping {
                username: "alice".to_string(),
                latency_ms: 0.0
            })
        );
    }

    #[test]
    fn test_parse_ping_bad_latency() {
        assert!(matches!(
            Parser::parse(b"P2W_PING:alice|fast"),
            Err(ParseError::InvalidLatency(_))
        ));
        assert!(matches!(
            Parser::parse(b"P2W_PING:alice|-1"),
            Err(ParseError::InvalidLatency(_))
        ));
        assert!(matches!(
            Parser::parse(b"P2W_PING:alice|NaN"),
            Err(ParseError::InvalidLatency(_))
        ));
    }

    #[test]
    fn test_parse_queries() {
        assert_eq!(Parser::parse(b"GET_STATS"), Ok(Command::Stats));
        assert_eq!(Parser::parse(b"GET_LEADERBOARD"), Ok(Command::Leaderboard));
    }

    #[test]
    fn test_parse_empty_username_is_still_a_command() {
        // Username rules are enforced by the dispatcher, not the parser
        assert_eq!(
            Parser::parse(b"CONNECT:"),
            Ok(Command::Connect {
                username: String::new()
            })
        );
    }

    #[test]
    fn test_parse_missing_argument() {
        assert_eq!(
            Parser::parse(b"CONNECT"),
            Err(ParseError::MissingArgument("CONNECT"))
        );
    }

    #[test]
    fn test_parse_unknown_command() {
        assert!(matches!(
            Parser::parse(b"HELLO"),
            Err(ParseError::UnknownCommand(_))
        ));
        assert!(matches!(
            Parser::parse(b"get_stats"),
            Err(ParseError::UnknownCommand(_))
        ));
        assert!(matches!(
            Parser::parse(b"GET_STATS:extra"),
            Err(ParseError::UnknownCommand(_))
        ));
        assert_eq!(Parser::parse(b""), Err(ParseError::Empty));
        assert_eq!(Parser::parse(b"  \r\n"), Err(ParseError::Empty));
    }

    #[test]
    fn test_verb() {
        assert_eq!(Parser::verb(b"P2W_PING:alice|1"), b"P2W_PING");
        assert_eq!(Parser::verb(b"GET_STATS\n"), b"GET_STATS");
        assert_eq!(Parser::verb(b"CONNECT:bob"), b"CONNECT");
    }

    #[test]
    fn test_response_formats() {
        assert_eq!(&Response::win(3)[..], b"WIN:3");
        assert_eq!(
            &Response::rate_limited(Duration::from_millis(7300))[..],
            b"RATE_LIMITED:7.3"
        );
    }
}
