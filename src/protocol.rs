/// Text protocol spoken between a space thread and its space
///
/// Requests are `"<command> <seqno> <params>"`, responses `"<seqno> <uuid|ERROR>"`.
/// Each message travels as one datagram on the control channel.
use crate::types::{LxceError, Result};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

pub const CMD_CREATE: &str = "create";
pub const CMD_RUN: &str = "run";
pub const CMD_STATUS: &str = "status";

pub const RESP_ERROR: &str = "ERROR";

/// Largest datagram exchanged on the control channel
pub const MAX_PACKET_SIZE: usize = 1024;

/// Receive timeout of the space-side server loop
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Last sequence number handed out before wrapping to 0
pub const SEQNO_WRAP: i32 = i32::MAX - 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Create {
        name: String,
        tag: String,
        path: PathBuf,
    },
    Run {
        uuid: Uuid,
    },
    Status {
        uuid: Uuid,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => CMD_CREATE,
            Command::Run { .. } => CMD_RUN,
            Command::Status { .. } => CMD_STATUS,
        }
    }

    pub fn params(&self) -> String {
        match self {
            Command::Create { name, tag, path } => {
                format!("{}:{}:{}", name, tag, path.display())
            }
            Command::Run { uuid } | Command::Status { uuid } => uuid.to_string(),
        }
    }

    fn parse(command: &str, params: &str) -> Result<Self> {
        match command {
            CMD_CREATE => {
                let mut parts = params.splitn(3, ':');
                let name = parts.next().unwrap_or_default();
                let tag = parts.next().unwrap_or_default();
                let path = parts.next().unwrap_or_default();
                if name.is_empty() || tag.is_empty() || path.is_empty() {
                    return Err(LxceError::Protocol(format!(
                        "Invalid create params: {}",
                        params
                    )));
                }
                Ok(Command::Create {
                    name: name.to_string(),
                    tag: tag.to_string(),
                    path: PathBuf::from(path),
                })
            }
            CMD_RUN => Ok(Command::Run {
                uuid: parse_uuid(params)?,
            }),
            CMD_STATUS => Ok(Command::Status {
                uuid: parse_uuid(params)?,
            }),
            other => Err(LxceError::Protocol(format!("Unknown command: {}", other))),
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| LxceError::Protocol(format!("Invalid uuid {}: {}", s, e)))
}

fn is_known_command(command: &str) -> bool {
    matches!(command, CMD_CREATE | CMD_RUN | CMD_STATUS)
}

/// Request header: known command and its sequence number
///
/// Lets the server answer `ERROR` to a request whose params do not parse.
pub fn peek_header(raw: &str) -> Option<(&str, i32)> {
    let mut fields = raw.split_whitespace();
    let command = fields.next()?;
    let seqno = fields.next()?.parse::<i32>().ok()?;
    fields.next()?;
    if is_known_command(command) && seqno >= 0 {
        Some((command, seqno))
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub seqno: i32,
    pub command: Command,
}

impl Request {
    pub fn new(seqno: i32, command: Command) -> Self {
        Self { seqno, command }
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}", self.command.name(), self.seqno, self.command.params())
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut fields = raw.split_whitespace();
        let (command, seqno, params) = match (fields.next(), fields.next(), fields.next()) {
            (Some(c), Some(s), Some(p)) => (c, s, p),
            _ => return Err(LxceError::Protocol(format!("Malformed request: {:?}", raw))),
        };
        let seqno = seqno
            .parse::<i32>()
            .map_err(|e| LxceError::Protocol(format!("Invalid seqno {}: {}", seqno, e)))?;
        if seqno < 0 {
            return Err(LxceError::Protocol(format!("Negative seqno: {}", seqno)));
        }

        Ok(Self {
            seqno,
            command: Command::parse(command, params)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Uuid(Uuid),
    Error,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Uuid(uuid) => write!(f, "{}", uuid),
            Reply::Error => write!(f, "{}", RESP_ERROR),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub seqno: i32,
    pub reply: Reply,
}

impl Response {
    pub fn uuid(seqno: i32, uuid: Uuid) -> Self {
        Self {
            seqno,
            reply: Reply::Uuid(uuid),
        }
    }

    pub fn error(seqno: i32) -> Self {
        Self {
            seqno,
            reply: Reply::Error,
        }
    }

    pub fn encode(&self) -> String {
        format!("{} {}", self.seqno, self.reply)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut fields = raw.split_whitespace();
        let (seqno, body) = match (fields.next(), fields.next()) {
            (Some(s), Some(b)) => (s, b),
            _ => return Err(LxceError::Protocol(format!("Malformed response: {:?}", raw))),
        };
        let seqno = seqno
            .parse::<i32>()
            .map_err(|e| LxceError::Protocol(format!("Invalid seqno {}: {}", seqno, e)))?;
        let reply = if body == RESP_ERROR {
            Reply::Error
        } else {
            Reply::Uuid(parse_uuid(body)?)
        };
        Ok(Self { seqno, reply })
    }
}

/// Sequence numbers for one space thread
///
/// Starts at 1 and wraps to 0 after `SEQNO_WRAP`.
#[derive(Debug)]
pub struct SeqAllocator {
    next: i32,
}

impl SeqAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(next: i32) -> Self {
        Self {
            next: next.clamp(0, SEQNO_WRAP),
        }
    }

    pub fn next_seqno(&mut self) -> i32 {
        let seqno = self.next;
        self.next = if seqno >= SEQNO_WRAP { 0 } else { seqno + 1 };
        seqno
    }
}

impl Default for SeqAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_encoding() {
        let request = Request::new(
            1,
            Command::Create {
                name: "myapp".to_string(),
                tag: "v1".to_string(),
                path: PathBuf::from("/pkgs/myapp"),
            },
        );
        assert_eq!(request.encode(), "create 1 myapp:v1:/pkgs/myapp");
        assert_eq!(Request::decode("create 1 myapp:v1:/pkgs/myapp").unwrap(), request);
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Request::decode("bogus 7 x").is_err());
        assert!(peek_header("bogus 7 x").is_none());
    }

    #[test]
    fn test_bad_params_keep_header() {
        assert!(Request::decode("create 3 onlyname").is_err());
        assert_eq!(peek_header("create 3 onlyname"), Some((CMD_CREATE, 3)));
        assert!(Request::decode("run 4 not-a-uuid").is_err());
        assert!(peek_header("create 3").is_none());
    }

    #[test]
    fn test_malformed_requests() {
        assert!(Request::decode("").is_err());
        assert!(Request::decode("create").is_err());
        assert!(Request::decode("create x a:b:c").is_err());
        assert!(Request::decode("create -1 a:b:c").is_err());
    }

    #[test]
    fn test_response_encoding() {
        let uuid = Uuid::new_v4();
        assert_eq!(Response::uuid(5, uuid).encode(), format!("5 {}", uuid));
        assert_eq!(Response::error(6).encode(), "6 ERROR");
        assert_eq!(Response::decode("6 ERROR").unwrap(), Response::error(6));
        assert_eq!(
            Response::decode(&format!("5 {}", uuid)).unwrap(),
            Response::uuid(5, uuid)
        );
        assert!(Response::decode("5 garbage").is_err());
    }

    #[test]
    fn test_seqno_wraps_to_zero() {
        let mut seq = SeqAllocator::starting_at(SEQNO_WRAP - 1);
        assert_eq!(seq.next_seqno(), SEQNO_WRAP - 1);
        assert_eq!(seq.next_seqno(), SEQNO_WRAP);
        assert_eq!(seq.next_seqno(), 0);
        assert_eq!(seq.next_seqno(), 1);
    }

    #[test]
    fn test_seqno_starts_at_one() {
        assert_eq!(SeqAllocator::new().next_seqno(), 1);
    }
}
