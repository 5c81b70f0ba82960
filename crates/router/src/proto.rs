//! Proto — the SAM v3 command subset spoken between nodes and their router.
//!
//! Every command and reply is a single `\n`-terminated line of the form
//! `VERB [SUBVERB] KEY=VALUE ...`. Values containing spaces are double-quoted.
//! After a successful `STREAM CONNECT` / `STREAM ACCEPT` the socket stops
//! carrying lines and becomes a raw byte pipe to the peer.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Result, RouterError};

/// Lowest protocol version a client will accept.
pub const MIN_VERSION: &str = "3.0";
/// Version spoken by the embedded router and requested by the client.
pub const VERSION: &str = "3.1";

/// Upper bound for a single protocol line, peer destination lines included.
pub const MAX_LINE: usize = 4096;

/// Router result codes (`RESULT=` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    NoVersion,
    DuplicatedId,
    InvalidId,
    CantReachPeer,
    Timeout,
    I2pError,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::NoVersion => "NOVERSION",
            ResultCode::DuplicatedId => "DUPLICATED_ID",
            ResultCode::InvalidId => "INVALID_ID",
            ResultCode::CantReachPeer => "CANT_REACH_PEER",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::I2pError => "I2P_ERROR",
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ResultCode::Ok
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultCode {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "OK" => ResultCode::Ok,
            "NOVERSION" => ResultCode::NoVersion,
            "DUPLICATED_ID" => ResultCode::DuplicatedId,
            "INVALID_ID" => ResultCode::InvalidId,
            "CANT_REACH_PEER" => ResultCode::CantReachPeer,
            "TIMEOUT" => ResultCode::Timeout,
            "I2P_ERROR" => ResultCode::I2pError,
            other => return Err(RouterError::Protocol(format!("unknown result code '{}'", other))),
        })
    }
}

/// Client → router commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello { min: String, max: String },
    SessionCreate { id: String },
    StreamConnect { id: String, destination: String },
    StreamAccept { id: String },
    Ping(String),
}

/// Router → client replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Hello { result: ResultCode, version: Option<String> },
    SessionStatus { result: ResultCode, destination: Option<String>, message: Option<String> },
    StreamStatus { result: ResultCode, message: Option<String> },
    Pong(String),
}

impl Request {
    pub fn hello() -> Self {
        Request::Hello {
            min: MIN_VERSION.to_string(),
            max: VERSION.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Request::Hello { min, max } => format!("HELLO VERSION MIN={} MAX={}\n", min, max),
            Request::SessionCreate { id } => {
                format!("SESSION CREATE STYLE=STREAM ID={} DESTINATION=TRANSIENT\n", id)
            }
            Request::StreamConnect { id, destination } => {
                format!("STREAM CONNECT ID={} DESTINATION={}\n", id, destination)
            }
            Request::StreamAccept { id } => format!("STREAM ACCEPT ID={}\n", id),
            Request::Ping(text) if text.is_empty() => "PING\n".to_string(),
            Request::Ping(text) => format!("PING {}\n", text),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let tokens = tokenize(line);
        let verb: Vec<&str> = tokens.iter().take(2).map(String::as_str).collect();
        match verb.as_slice() {
            ["PING", ..] => Ok(Request::Ping(tokens[1..].join(" "))),
            ["HELLO", "VERSION"] => {
                let opts = options(&tokens[2..]);
                Ok(Request::Hello {
                    min: opts.get("MIN").cloned().unwrap_or_else(|| MIN_VERSION.to_string()),
                    max: opts.get("MAX").cloned().unwrap_or_else(|| VERSION.to_string()),
                })
            }
            ["SESSION", "CREATE"] => {
                let opts = options(&tokens[2..]);
                Ok(Request::SessionCreate { id: required(&opts, "ID", line)? })
            }
            ["STREAM", "CONNECT"] => {
                let opts = options(&tokens[2..]);
                Ok(Request::StreamConnect {
                    id: required(&opts, "ID", line)?,
                    destination: required(&opts, "DESTINATION", line)?,
                })
            }
            ["STREAM", "ACCEPT"] => {
                let opts = options(&tokens[2..]);
                Ok(Request::StreamAccept { id: required(&opts, "ID", line)? })
            }
            _ => Err(RouterError::Protocol(format!("unknown command '{}'", line.trim()))),
        }
    }
}

impl Reply {
    pub fn result(&self) -> ResultCode {
        match self {
            Reply::Hello { result, .. }
            | Reply::SessionStatus { result, .. }
            | Reply::StreamStatus { result, .. } => *result,
            Reply::Pong(_) => ResultCode::Ok,
        }
    }

    pub fn stream_ok() -> Self {
        Reply::StreamStatus { result: ResultCode::Ok, message: None }
    }

    pub fn stream_err(result: ResultCode, message: impl Into<String>) -> Self {
        Reply::StreamStatus { result, message: Some(message.into()) }
    }

    pub fn encode(&self) -> String {
        let mut out = match self {
            Reply::Hello { result, version } => {
                let mut s = format!("HELLO REPLY RESULT={}", result);
                if let Some(v) = version {
                    s.push_str(&format!(" VERSION={}", v));
                }
                s
            }
            Reply::SessionStatus { result, destination, message } => {
                let mut s = format!("SESSION STATUS RESULT={}", result);
                if let Some(d) = destination {
                    s.push_str(&format!(" DESTINATION={}", d));
                }
                if let Some(m) = message {
                    s.push_str(&format!(" MESSAGE=\"{}\"", m.replace('"', "'")));
                }
                s
            }
            Reply::StreamStatus { result, message } => {
                let mut s = format!("STREAM STATUS RESULT={}", result);
                if let Some(m) = message {
                    s.push_str(&format!(" MESSAGE=\"{}\"", m.replace('"', "'")));
                }
                s
            }
            Reply::Pong(text) if text.is_empty() => "PONG".to_string(),
            Reply::Pong(text) => format!("PONG {}", text),
        };
        out.push('\n');
        out
    }

    pub fn parse(line: &str) -> Result<Self> {
        let tokens = tokenize(line);
        let verb: Vec<&str> = tokens.iter().take(2).map(String::as_str).collect();
        match verb.as_slice() {
            ["PONG", ..] => Ok(Reply::Pong(tokens[1..].join(" "))),
            ["HELLO", "REPLY"] => {
                let opts = options(&tokens[2..]);
                Ok(Reply::Hello {
                    result: required(&opts, "RESULT", line)?.parse()?,
                    version: opts.get("VERSION").cloned(),
                })
            }
            ["SESSION", "STATUS"] => {
                let opts = options(&tokens[2..]);
                Ok(Reply::SessionStatus {
                    result: required(&opts, "RESULT", line)?.parse()?,
                    destination: opts.get("DESTINATION").cloned(),
                    message: opts.get("MESSAGE").cloned(),
                })
            }
            ["STREAM", "STATUS"] => {
                let opts = options(&tokens[2..]);
                Ok(Reply::StreamStatus {
                    result: required(&opts, "RESULT", line)?.parse()?,
                    message: opts.get("MESSAGE").cloned(),
                })
            }
            _ => Err(RouterError::Protocol(format!("unexpected reply '{}'", line.trim()))),
        }
    }
}

/// Read one protocol line, without its terminator. `None` on clean EOF.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(MAX_LINE as u64).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n >= MAX_LINE {
            return Err(RouterError::Protocol(format!("line exceeds {} bytes", MAX_LINE)));
        }
        // EOF in the middle of a line
        return Ok(None);
    }
    Ok(Some(line.trim_end().to_string()))
}

/// Pick the version both sides speak, if any.
pub fn negotiate(min: &str, max: &str) -> Option<&'static str> {
    let supported = parse_version(VERSION)?;
    let lo = parse_version(min)?;
    let hi = parse_version(max)?;
    (lo <= supported && supported <= hi).then_some(VERSION)
}

fn parse_version(v: &str) -> Option<(u32, u32)> {
    let (major, minor) = v.split_once('.').unwrap_or((v, "0"));
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Split on whitespace, keeping double-quoted runs together (quotes dropped).
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn options(tokens: &[String]) -> HashMap<String, String> {
    tokens
        .iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
        .collect()
}

fn required(opts: &HashMap<String, String>, key: &str, line: &str) -> Result<String> {
    opts.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| RouterError::Protocol(format!("missing {} in '{}'", key, line.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_encode_parse() {
        let line = Request::hello().encode();
        assert_eq!(line, "HELLO VERSION MIN=3.0 MAX=3.1\n");
        assert_eq!(Request::parse(&line).unwrap(), Request::hello());
    }

    #[test]
    fn test_session_create_parse() {
        let req = Request::parse("SESSION CREATE STYLE=STREAM ID=node-a.blob DESTINATION=TRANSIENT").unwrap();
        assert_eq!(req, Request::SessionCreate { id: "node-a.blob".to_string() });
    }

    #[test]
    fn test_stream_connect_requires_destination() {
        let err = Request::parse("STREAM CONNECT ID=node-a").unwrap_err();
        assert!(err.to_string().contains("DESTINATION"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Request::parse("NAMING LOOKUP NAME=ME").is_err());
        assert!(Request::parse("").is_err());
    }

    #[test]
    fn test_ping_keeps_payload() {
        assert_eq!(Request::parse("PING 42 abc").unwrap(), Request::Ping("42 abc".to_string()));
        assert_eq!(Request::Ping(String::new()).encode(), "PING\n");
        assert_eq!(Reply::parse("PONG 42 abc").unwrap(), Reply::Pong("42 abc".to_string()));
    }

    #[test]
    fn test_stream_status_with_quoted_message() {
        let reply = Reply::stream_err(ResultCode::CantReachPeer, "no session named x");
        let line = reply.encode();
        assert_eq!(line, "STREAM STATUS RESULT=CANT_REACH_PEER MESSAGE=\"no session named x\"\n");
        assert_eq!(Reply::parse(&line).unwrap(), reply);
    }

    #[test]
    fn test_session_status_carries_destination() {
        let reply = Reply::parse("SESSION STATUS RESULT=OK DESTINATION=node-a").unwrap();
        assert_eq!(reply.result(), ResultCode::Ok);
        match reply {
            Reply::SessionStatus { destination, .. } => assert_eq!(destination.as_deref(), Some("node-a")),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_result_code_is_protocol_error() {
        let err = Reply::parse("HELLO REPLY RESULT=MAYBE").unwrap_err();
        assert!(matches!(err, RouterError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_line_strips_terminator_and_stops_at_eof() {
        let mut reader = tokio::io::BufReader::new(&b"PING 1\r\nPONG"[..]);
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("PING 1"));
        // trailing bytes without a newline are a truncated line
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_rejects_oversized_line() {
        let long = "A".repeat(MAX_LINE + 10);
        let mut reader = tokio::io::BufReader::new(long.as_bytes());
        assert!(matches!(read_line(&mut reader).await, Err(RouterError::Protocol(_))));
    }

    #[test]
    fn test_negotiate_version_window() {
        assert_eq!(negotiate("3.0", "3.1"), Some("3.1"));
        assert_eq!(negotiate("3.0", "3.3"), Some("3.1"));
        assert_eq!(negotiate("3.2", "3.3"), None);
        assert_eq!(negotiate("2.0", "3.0"), None);
        assert_eq!(negotiate("x", "3.1"), None);
    }
}
