//! Parser for `conntrack` text output
//!
//! Handles both event lines (`conntrack -E -o id`) and table dump lines
//! (`conntrack -L -o id`). The two differ only in the leading `[TYPE]` tag:
//!
//! ```text
//! [NEW] tcp      6 120 SYN_SENT src=192.168.25.44 dst=1.1.1.1 sport=5000 dport=443 [UNREPLIED] src=1.1.1.1 dst=203.0.113.7 sport=443 dport=40000 id=3520584864
//! tcp      6 431999 ESTABLISHED src=192.168.25.44 dst=1.1.1.1 sport=5000 dport=443 src=1.1.1.1 dst=203.0.113.7 sport=443 dport=40000 [ASSURED] mark=0 use=1 id=3520584864
//! ```
//!
//! The first `src/dst/sport/dport` group is the original direction, the
//! second the reply direction. Flags and unrecognised `key=value` pairs are
//! skipped so that newer conntrack builds with extra fields still parse.

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Empty line")]
    Empty,

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Event tag at the start of an event line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Update,
    Destroy,
    /// Entry from a table dump, which carries no tag
    Listed,
}

/// One direction of a conntrack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
}

/// A single parsed conntrack line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackEvent {
    pub kind: EventKind,
    /// Layer-4 protocol name as printed by conntrack (e.g. "tcp")
    pub protocol: String,
    pub timeout: Option<Duration>,
    /// TCP state name (e.g. "ESTABLISHED"); absent on destroy events
    pub tcp_state: Option<String>,
    pub original: Tuple,
    pub reply: Tuple,
    pub id: Option<u32>,
}

#[derive(Default)]
struct PartialTuple {
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    sport: Option<u16>,
    dport: Option<u16>,
}

impl PartialTuple {
    fn finish(self, src_field: &'static str, dst_field: &'static str) -> Result<Tuple, ParseError> {
        Ok(Tuple {
            src: self.src.ok_or(ParseError::MissingField(src_field))?,
            dst: self.dst.ok_or(ParseError::MissingField(dst_field))?,
            sport: self.sport,
            dport: self.dport,
        })
    }
}

/// Parse one line of conntrack output
pub fn parse_line(line: &str) -> Result<ConntrackEvent, ParseError> {
    let mut tokens = line.split_whitespace().peekable();

    let first = *tokens.peek().ok_or(ParseError::Empty)?;
    let kind = if let Some(tag) = first.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        tokens.next();
        match tag {
            "NEW" => EventKind::New,
            "UPDATE" => EventKind::Update,
            "DESTROY" => EventKind::Destroy,
            other => return Err(ParseError::UnknownEventType(other.to_string())),
        }
    } else {
        EventKind::Listed
    };

    // `-o extended` prefixes the layer-3 protocol name and number
    if matches!(tokens.peek(), Some(&"ipv4") | Some(&"ipv6")) {
        tokens.next();
        tokens.next();
    }

    let protocol = tokens
        .next()
        .ok_or(ParseError::MissingField("protocol"))?
        .to_ascii_lowercase();
    let protonum = tokens.next().ok_or(ParseError::MissingField("protonum"))?;
    protonum
        .parse::<u8>()
        .map_err(|_| ParseError::InvalidValue {
            field: "protonum",
            value: protonum.to_string(),
        })?;

    let mut timeout = None;
    let mut tcp_state = None;
    let mut seen_pairs = false;
    let mut original = PartialTuple::default();
    let mut reply = PartialTuple::default();
    let mut id = None;

    for token in tokens {
        if token.starts_with('[') {
            continue;
        }

        let Some((key, value)) = token.split_once('=') else {
            // Bare tokens before the first tuple are the timeout and state
            if seen_pairs {
                continue;
            }
            if timeout.is_none() && tcp_state.is_none() {
                if let Ok(secs) = token.parse::<u64>() {
                    timeout = Some(Duration::from_secs(secs));
                    continue;
                }
            }
            if tcp_state.is_none() && token.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                tcp_state = Some(token.to_string());
            }
            continue;
        };
        seen_pairs = true;

        match key {
            "src" => {
                let addr = parse_addr("src", value)?;
                if original.src.is_none() {
                    original.src = Some(addr);
                } else {
                    reply.src = Some(addr);
                }
            }
            "dst" => {
                let addr = parse_addr("dst", value)?;
                if original.dst.is_none() {
                    original.dst = Some(addr);
                } else {
                    reply.dst = Some(addr);
                }
            }
            "sport" => {
                let port = parse_port("sport", value)?;
                if original.sport.is_none() {
                    original.sport = Some(port);
                } else {
                    reply.sport = Some(port);
                }
            }
            "dport" => {
                let port = parse_port("dport", value)?;
                if original.dport.is_none() {
                    original.dport = Some(port);
                } else {
                    reply.dport = Some(port);
                }
            }
            "id" => {
                // The entry id is printed last; for ICMP an earlier id= is the echo id
                id = value.parse::<u32>().ok();
            }
            _ => {}
        }
    }

    Ok(ConntrackEvent {
        kind,
        protocol,
        timeout,
        tcp_state,
        original: original.finish("original src", "original dst")?,
        reply: reply.finish("reply src", "reply dst")?,
        id,
    })
}

fn parse_addr(field: &'static str, value: &str) -> Result<IpAddr, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
