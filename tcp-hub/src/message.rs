use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::id::{Identity, join_ids, parse_decimal, parse_id_list};

/// Longest header line accepted, newline included.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Default upper bound for a relay body.
pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

const IDENTITY: &str = "identity";
const LIST: &str = "list";
const RELAY: &str = "relay";
const UNKNOWN_MESSAGE: &str = "Unknown message";

// Upfront allocation cap for a body; the rest grows as bytes actually arrive.
const BODY_PREALLOC: usize = 64 * 1024;

/// Commands a client sends to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientToServer {
    Identity,
    List,
    Relay {
        receivers: Vec<Identity>,
        body: Vec<u8>,
    },
    /// Any header whose first token is not a known command.
    Unknown { kind: String },
}

/// Replies and deliveries the hub sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerToClient {
    Identity { id: Identity },
    List { ids: Vec<Identity> },
    Relay { sender: Identity, body: Vec<u8> },
    Unknown,
}

/// Ways a stream can stop making sense.
///
/// Every variant except [`FrameError::Io`] means the byte boundaries on the
/// stream can no longer be trusted, so callers close the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended in the middle of a header line")]
    IncompleteHeader,

    #[error("header line exceeds {limit} bytes")]
    HeaderTooLong { limit: usize },

    #[error("malformed relay header: {0:?}")]
    MalformedRelay(String),

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid body length: {0:?}")]
    InvalidLength(String),

    #[error("body length {declared} exceeds limit of {limit} bytes")]
    BodyTooLarge { declared: usize, limit: usize },

    #[error("stream ended after {read} of {expected} body bytes")]
    ShortBody { expected: usize, read: usize },

    #[error("unexpected reply from hub: {0:?}")]
    UnexpectedReply(String),
}

/// Wire encoding shared by both directions of the protocol.
pub trait Encode {
    fn encode(&self) -> Vec<u8>;
}

impl Encode for ClientToServer {
    fn encode(&self) -> Vec<u8> {
        match self {
            ClientToServer::Identity => format!("{IDENTITY}\n").into_bytes(),
            ClientToServer::List => format!("{LIST}\n").into_bytes(),
            ClientToServer::Relay { receivers, body } => with_body(
                format!("{RELAY} {} {}\n", join_ids(receivers, ","), body.len()),
                body,
            ),
            ClientToServer::Unknown { kind } => format!("{kind}\n").into_bytes(),
        }
    }
}

impl Encode for ServerToClient {
    fn encode(&self) -> Vec<u8> {
        match self {
            ServerToClient::Identity { id } => format!("{IDENTITY} {id}\n").into_bytes(),
            ServerToClient::List { ids } => {
                format!("{LIST} {}\n", join_ids(ids, ",")).into_bytes()
            }
            ServerToClient::Relay { sender, body } => {
                with_body(format!("{RELAY} {sender} {}\n", body.len()), body)
            }
            ServerToClient::Unknown => format!("{UNKNOWN_MESSAGE}\n").into_bytes(),
        }
    }
}

fn with_body(header: String, body: &[u8]) -> Vec<u8> {
    let mut frame = header.into_bytes();
    frame.extend_from_slice(body);
    frame
}

/// Reads the next command from a client.
///
/// Returns `Ok(None)` when the stream ends cleanly between commands. Unknown
/// command kinds decode successfully as [`ClientToServer::Unknown`]; every
/// error is fatal for the stream.
pub async fn read_command<R>(
    reader: &mut R,
    max_body_len: usize,
) -> Result<Option<ClientToServer>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_header(reader).await? else {
        return Ok(None);
    };

    let mut tokens = line.split_whitespace();
    let command = match tokens.next() {
        Some(IDENTITY) => ClientToServer::Identity,
        Some(LIST) => ClientToServer::List,
        Some(RELAY) => {
            let (receivers, len) = parse_relay_args(&line, tokens, max_body_len)?;
            let body = read_body(reader, len).await?;
            ClientToServer::Relay { receivers, body }
        }
        other => ClientToServer::Unknown {
            kind: other.unwrap_or_default().to_string(),
        },
    };

    Ok(Some(command))
}

/// Reads the next reply or relay delivery sent by the hub.
pub async fn read_reply<R>(
    reader: &mut R,
    max_body_len: usize,
) -> Result<Option<ServerToClient>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_header(reader).await? else {
        return Ok(None);
    };

    if line == UNKNOWN_MESSAGE {
        return Ok(Some(ServerToClient::Unknown));
    }

    let unexpected = || FrameError::UnexpectedReply(line.clone());
    let (kind, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
    let reply = match kind {
        IDENTITY => {
            let id = parse_decimal(rest.trim()).ok_or_else(unexpected)?;
            ServerToClient::Identity { id }
        }
        LIST => {
            let rest = rest.trim();
            let ids = if rest.is_empty() {
                Vec::new()
            } else {
                parse_id_list(rest)?
            };
            ServerToClient::List { ids }
        }
        RELAY => {
            let mut args = rest.split_whitespace();
            let (Some(sender), Some(len), None) = (args.next(), args.next(), args.next()) else {
                return Err(unexpected());
            };
            let sender = parse_decimal(sender).ok_or_else(unexpected)?;
            let len = parse_length(len, max_body_len)?;
            let body = read_body(reader, len).await?;
            ServerToClient::Relay { sender, body }
        }
        _ => return Err(unexpected()),
    };

    Ok(Some(reply))
}

/// Writes one encoded frame and flushes it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Encode,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await
}

async fn read_header<R>(reader: &mut R) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes = (&mut *reader)
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }

    if line.last() != Some(&b'\n') {
        if bytes >= MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLong {
                limit: MAX_HEADER_LEN,
            });
        }
        return Err(FrameError::IncompleteHeader);
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

fn parse_relay_args<'a>(
    line: &str,
    mut args: impl Iterator<Item = &'a str>,
    max_body_len: usize,
) -> Result<(Vec<Identity>, usize), FrameError> {
    let (Some(receivers), Some(len), None) = (args.next(), args.next(), args.next()) else {
        return Err(FrameError::MalformedRelay(line.to_string()));
    };

    let receivers = parse_id_list(receivers)?;
    let len = parse_length(len, max_body_len)?;
    Ok((receivers, len))
}

fn parse_length(token: &str, max_body_len: usize) -> Result<usize, FrameError> {
    let declared: usize =
        parse_decimal(token).ok_or_else(|| FrameError::InvalidLength(token.to_string()))?;
    if declared > max_body_len {
        return Err(FrameError::BodyTooLarge {
            declared,
            limit: max_body_len,
        });
    }
    Ok(declared)
}

async fn read_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::with_capacity(len.min(BODY_PREALLOC));
    let read = (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut body)
        .await?;
    if read < len {
        return Err(FrameError::ShortBody {
            expected: len,
            read,
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    async fn commands_from(bytes: &[u8]) -> Vec<ClientToServer> {
        let mut reader = bytes;
        let mut commands = Vec::new();
        while let Some(command) = read_command(&mut reader, DEFAULT_MAX_BODY_LEN)
            .await
            .expect("valid command stream")
        {
            commands.push(command);
        }
        commands
    }

    async fn command_error(bytes: &[u8]) -> FrameError {
        let mut reader = bytes;
        loop {
            match read_command(&mut reader, DEFAULT_MAX_BODY_LEN).await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream ended without an error"),
                Err(err) => return err,
            }
        }
    }

    #[tokio::test]
    async fn decodes_simple_commands() {
        let commands = commands_from(b"identity\nlist\n").await;
        assert_eq!(commands, vec![ClientToServer::Identity, ClientToServer::List]);
    }

    #[tokio::test]
    async fn strips_carriage_returns_and_ignores_trailing_tokens() {
        let commands = commands_from(b"identity\r\nlist extra\n").await;
        assert_eq!(commands, vec![ClientToServer::Identity, ClientToServer::List]);
    }

    #[tokio::test]
    async fn unknown_and_empty_headers_are_not_fatal() {
        let commands = commands_from(b"hello there\n\nidentity\n").await;
        assert_eq!(
            commands,
            vec![
                ClientToServer::Unknown {
                    kind: "hello".into()
                },
                ClientToServer::Unknown { kind: "".into() },
                ClientToServer::Identity,
            ]
        );
    }

    #[tokio::test]
    async fn relay_body_may_contain_newlines() {
        let commands = commands_from(b"relay 2,3 11\nhello\nworldlist\n").await;
        assert_eq!(
            commands,
            vec![
                ClientToServer::Relay {
                    receivers: vec![2, 3],
                    body: b"hello\nworld".to_vec(),
                },
                ClientToServer::List,
            ]
        );
    }

    #[tokio::test]
    async fn relay_accepts_duplicates_and_empty_bodies() {
        let commands = commands_from(b"relay 4,4 0\nidentity\n").await;
        assert_eq!(
            commands,
            vec![
                ClientToServer::Relay {
                    receivers: vec![4, 4],
                    body: Vec::new(),
                },
                ClientToServer::Identity,
            ]
        );
    }

    #[tokio::test]
    async fn malformed_relay_headers_are_fatal() {
        assert!(matches!(
            command_error(b"relay abc 5\nhello").await,
            FrameError::InvalidIdentity(token) if token == "abc"
        ));
        assert!(matches!(
            command_error(b"relay 1,2\n").await,
            FrameError::MalformedRelay(_)
        ));
        assert!(matches!(
            command_error(b"relay\n").await,
            FrameError::MalformedRelay(_)
        ));
        assert!(matches!(
            command_error(b"relay 1 5 6\nhello").await,
            FrameError::MalformedRelay(_)
        ));
        assert!(matches!(
            command_error(b"relay 1 five\nhello").await,
            FrameError::InvalidLength(token) if token == "five"
        ));
        assert!(matches!(
            command_error(b"relay 1,,2 5\nhello").await,
            FrameError::InvalidIdentity(_)
        ));
        assert!(matches!(
            command_error(b"relay 2 +3\nabc").await,
            FrameError::InvalidLength(token) if token == "+3"
        ));
        assert!(matches!(
            command_error(b"relay +2 3\nabc").await,
            FrameError::InvalidIdentity(token) if token == "+2"
        ));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_reading() {
        let mut reader: &[u8] = b"relay 1 1000\n";
        let err = read_command(&mut reader, 10).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::BodyTooLarge {
                declared: 1000,
                limit: 10
            }
        ));
    }

    #[tokio::test]
    async fn short_body_is_fatal() {
        assert!(matches!(
            command_error(b"relay 1 10\nhello").await,
            FrameError::ShortBody {
                expected: 10,
                read: 5
            }
        ));
    }

    #[tokio::test]
    async fn header_without_newline_is_fatal() {
        assert!(matches!(
            command_error(b"identity\nlis").await,
            FrameError::IncompleteHeader
        ));
    }

    #[tokio::test]
    async fn overlong_header_is_fatal() {
        let mut bytes = vec![b'a'; MAX_HEADER_LEN + 16];
        bytes.push(b'\n');
        assert!(matches!(
            command_error(&bytes).await,
            FrameError::HeaderTooLong { .. }
        ));
    }

    #[test]
    fn encodes_replies() {
        assert_eq!(ServerToClient::Identity { id: 7 }.encode(), b"identity 7\n");
        assert_eq!(
            ServerToClient::List { ids: vec![1, 3] }.encode(),
            b"list 1,3\n"
        );
        assert_eq!(ServerToClient::List { ids: vec![] }.encode(), b"list \n");
        assert_eq!(
            ServerToClient::Relay {
                sender: 1,
                body: b"hello".to_vec()
            }
            .encode(),
            b"relay 1 5\nhello"
        );
        assert_eq!(ServerToClient::Unknown.encode(), b"Unknown message\n");
    }

    #[test]
    fn encodes_commands() {
        assert_eq!(ClientToServer::Identity.encode(), b"identity\n");
        assert_eq!(ClientToServer::List.encode(), b"list\n");
        assert_eq!(
            ClientToServer::Relay {
                receivers: vec![2, 3],
                body: b"hi\n".to_vec()
            }
            .encode(),
            b"relay 2,3 3\nhi\n"
        );
    }

    #[tokio::test]
    async fn decodes_replies_over_a_duplex_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        let sent = vec![
            ServerToClient::Identity { id: 2 },
            ServerToClient::List { ids: vec![] },
            ServerToClient::List { ids: vec![1, 3] },
            ServerToClient::Relay {
                sender: 3,
                body: b"a\nb".to_vec(),
            },
            ServerToClient::Unknown,
        ];
        for message in &sent {
            write_message(&mut writer, message)
                .await
                .expect("write reply");
        }
        drop(writer);

        let mut received = Vec::new();
        while let Some(reply) = read_reply(&mut reader, DEFAULT_MAX_BODY_LEN)
            .await
            .expect("read reply")
        {
            received.push(reply);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn rejects_unexpected_replies() {
        let mut reader: &[u8] = b"welcome 1\n";
        let err = read_reply(&mut reader, DEFAULT_MAX_BODY_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedReply(line) if line == "welcome 1"));

        let mut reader: &[u8] = b"identity x\n";
        assert!(read_reply(&mut reader, DEFAULT_MAX_BODY_LEN).await.is_err());

        let mut reader: &[u8] = b"relay +1 2\nhi";
        assert!(read_reply(&mut reader, DEFAULT_MAX_BODY_LEN).await.is_err());
    }
}
