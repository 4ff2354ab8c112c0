//! Line protocol
//!
//! One command per line, whitespace-separated, verbs case-insensitive:
//!
//! ```text
//! TENANT <id>                      select the session tenant
//! GET <key>                        -> VALUE HIT|STALE "<json string>" | NIL
//! SET <key> <value> <ttl> [tags]   ttl in seconds, 0 = no expiry; tags comma-separated
//! DEL <key>                        -> :1 | :0
//! PURGE TAG <tag>                  -> :<purged>
//! FLUSH                            -> :<purged>   (whole session tenant)
//! STATS                            -> JSON {...}
//! SUBSCRIBE                        -> +SUBSCRIBED, then EVENT {...} lines
//! PING                             -> +PONG
//! QUIT                             -> +BYE
//! ```
//!
//! Errors are `-ERR <message>`. `SET` values are single tokens; payloads in
//! `VALUE` replies are JSON string literals so rendered pages with
//! whitespace survive the line framing.

use crate::error::CacheError;

/// Longest accepted command line
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Tenant(String),
    Get(String),
    Set {
        key: String,
        value: String,
        ttl_secs: u64,
        tags: Vec<String>,
    },
    Del(String),
    PurgeTag(String),
    Flush,
    Stats,
    Subscribe,
    Ping,
    Quit,
}

fn protocol_error(msg: impl Into<String>) -> CacheError {
    CacheError::Protocol(msg.into())
}

impl Command {
    /// Parse one command line
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Protocol`] for unknown verbs or wrong arity.
    pub fn parse(line: &str) -> Result<Self, CacheError> {
        if line.len() > MAX_LINE_LEN {
            return Err(protocol_error("line too long"));
        }
        let mut parts = line.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| protocol_error("empty command"))?
            .to_ascii_uppercase();
        let args: Vec<&str> = parts.collect();

        let command = match (verb.as_str(), args.as_slice()) {
            ("TENANT", [id]) => Self::Tenant((*id).to_string()),
            ("GET", [key]) => Self::Get((*key).to_string()),
            ("SET", [key, value, ttl, rest @ ..]) if rest.len() <= 1 => Self::Set {
                key: (*key).to_string(),
                value: (*value).to_string(),
                ttl_secs: ttl
                    .parse()
                    .map_err(|_| protocol_error(format!("invalid ttl `{ttl}`")))?,
                tags: rest
                    .first()
                    .map(|tags| {
                        tags.split(',')
                            .filter(|tag| !tag.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            ("DEL", [key]) => Self::Del((*key).to_string()),
            ("PURGE", [kind, tag]) if kind.eq_ignore_ascii_case("TAG") => {
                Self::PurgeTag((*tag).to_string())
            }
            ("FLUSH", []) => Self::Flush,
            ("STATS", []) => Self::Stats,
            ("SUBSCRIBE", []) => Self::Subscribe,
            ("PING", []) => Self::Ping,
            ("QUIT", []) => Self::Quit,
            ("TENANT" | "GET" | "SET" | "DEL" | "PURGE" | "FLUSH" | "STATS" | "SUBSCRIBE" | "PING"
            | "QUIT", _) => {
                return Err(protocol_error(format!("wrong number of arguments for {verb}")));
            }
            _ => return Err(protocol_error(format!("unknown command `{verb}`"))),
        };
        Ok(command)
    }

    /// Wire form of the command
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Tenant(id) => format!("TENANT {id}"),
            Self::Get(key) => format!("GET {key}"),
            Self::Set {
                key,
                value,
                ttl_secs,
                tags,
            } if tags.is_empty() => format!("SET {key} {value} {ttl_secs}"),
            Self::Set {
                key,
                value,
                ttl_secs,
                tags,
            } => format!("SET {key} {value} {ttl_secs} {}", tags.join(",")),
            Self::Del(key) => format!("DEL {key}"),
            Self::PurgeTag(tag) => format!("PURGE TAG {tag}"),
            Self::Flush => "FLUSH".to_string(),
            Self::Stats => "STATS".to_string(),
            Self::Subscribe => "SUBSCRIBE".to_string(),
            Self::Ping => "PING".to_string(),
            Self::Quit => "QUIT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Pong,
    Bye,
    Subscribed,
    Value { stale: bool, payload: String },
    Nil,
    Integer(u64),
    Json(String),
    Event(String),
    Error(String),
}

impl Reply {
    /// Error reply from any cache error
    #[must_use]
    pub fn error(err: &CacheError) -> Self {
        Self::Error(err.to_string())
    }

    /// Wire form of the reply, without the trailing newline
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Ok => "+OK".to_string(),
            Self::Pong => "+PONG".to_string(),
            Self::Bye => "+BYE".to_string(),
            Self::Subscribed => "+SUBSCRIBED".to_string(),
            Self::Value { stale, payload } => {
                let quoted =
                    serde_json::to_string(payload).unwrap_or_else(|_| "\"\"".to_string());
                let state = if *stale { "STALE" } else { "HIT" };
                format!("VALUE {state} {quoted}")
            }
            Self::Nil => "NIL".to_string(),
            Self::Integer(n) => format!(":{n}"),
            Self::Json(doc) => format!("JSON {doc}"),
            Self::Event(doc) => format!("EVENT {doc}"),
            // Messages must stay on one line
            Self::Error(msg) => format!("-ERR {}", msg.replace(['\r', '\n'], " ")),
        }
    }

    /// Parse a reply line, as the admin client does
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Protocol`] for malformed replies.
    pub fn parse(line: &str) -> Result<Self, CacheError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let reply = match line {
            "+OK" => Self::Ok,
            "+PONG" => Self::Pong,
            "+BYE" => Self::Bye,
            "+SUBSCRIBED" => Self::Subscribed,
            "NIL" => Self::Nil,
            _ => {
                if let Some(msg) = line.strip_prefix("-ERR ") {
                    Self::Error(msg.to_string())
                } else if let Some(n) = line.strip_prefix(':') {
                    Self::Integer(
                        n.parse()
                            .map_err(|_| protocol_error(format!("bad integer reply `{n}`")))?,
                    )
                } else if let Some(doc) = line.strip_prefix("JSON ") {
                    Self::Json(doc.to_string())
                } else if let Some(doc) = line.strip_prefix("EVENT ") {
                    Self::Event(doc.to_string())
                } else if let Some(rest) = line.strip_prefix("VALUE ") {
                    let (state, quoted) = rest
                        .split_once(' ')
                        .ok_or_else(|| protocol_error("truncated VALUE reply"))?;
                    let payload: String = serde_json::from_str(quoted)
                        .map_err(|e| protocol_error(format!("bad VALUE payload: {e}")))?;
                    Self::Value {
                        stale: state == "STALE",
                        payload,
                    }
                } else {
                    return Err(protocol_error(format!("unrecognized reply `{line}`")));
                }
            }
        };
        Ok(reply)
    }
}
