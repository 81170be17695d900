use std::{collections::VecDeque, net::SocketAddr};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, info};

use crate::{
    cli::{ClientArgs, Request},
    id::{Identity, join_ids},
    message::{ClientToServer, DEFAULT_MAX_BODY_LEN, ServerToClient, read_reply, write_message},
};

/// A payload another client relayed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub sender: Identity,
    pub body: Vec<u8>,
}

/// One connection to a hub.
///
/// Relay deliveries can arrive at any time, including while a reply to
/// `identity` or `list` is outstanding. Those are queued and handed out by
/// [`HubClient::recv_relay`] in arrival order.
pub struct HubClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    id: Option<Identity>,
    pending: VecDeque<IncomingMessage>,
    max_body_len: usize,
}

impl HubClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        debug!(%addr, "connected to hub");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            id: None,
            pending: VecDeque::new(),
            max_body_len: DEFAULT_MAX_BODY_LEN,
        })
    }

    /// Identity learned from the last `identity` round trip, if any.
    pub fn cached_identity(&self) -> Option<Identity> {
        self.id
    }

    pub async fn identity(&mut self) -> Result<Identity> {
        write_message(&mut self.writer, &ClientToServer::Identity).await?;
        match self.next_reply().await? {
            ServerToClient::Identity { id } => {
                self.id = Some(id);
                Ok(id)
            }
            other => bail!("unexpected reply to identity: {other:?}"),
        }
    }

    /// Other clients connected to the hub, ascending.
    pub async fn list(&mut self) -> Result<Vec<Identity>> {
        write_message(&mut self.writer, &ClientToServer::List).await?;
        match self.next_reply().await? {
            ServerToClient::List { ids } => Ok(ids),
            other => bail!("unexpected reply to list: {other:?}"),
        }
    }

    /// Sends `body` to each receiver. The hub never acknowledges relays.
    pub async fn relay(&mut self, receivers: &[Identity], body: &[u8]) -> Result<()> {
        write_message(
            &mut self.writer,
            &ClientToServer::Relay {
                receivers: receivers.to_vec(),
                body: body.to_vec(),
            },
        )
        .await
        .context("failed to send relay")
    }

    /// Waits for the next relayed payload. `None` means the hub closed the connection.
    pub async fn recv_relay(&mut self) -> Result<Option<IncomingMessage>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        match read_reply(&mut self.reader, self.max_body_len).await? {
            Some(ServerToClient::Relay { sender, body }) => {
                Ok(Some(IncomingMessage { sender, body }))
            }
            Some(other) => bail!("unsolicited reply from hub: {other:?}"),
            None => Ok(None),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .context("failed to shut down connection")
    }

    async fn next_reply(&mut self) -> Result<ServerToClient> {
        loop {
            match read_reply(&mut self.reader, self.max_body_len).await? {
                Some(ServerToClient::Relay { sender, body }) => {
                    self.pending.push_back(IncomingMessage { sender, body });
                }
                Some(ServerToClient::Unknown) => bail!("hub did not recognise the command"),
                Some(reply) => return Ok(reply),
                None => bail!("hub closed the connection before replying"),
            }
        }
    }
}

/// Runs one request from the command line and prints the outcome.
pub async fn run(args: ClientArgs) -> Result<()> {
    let addr = args.server_addr();
    let mut client = HubClient::connect(addr).await?;
    info!("connected to {addr}");

    match args.request {
        Request::Identity => {
            let id = client.identity().await?;
            write_stdout(&format!("client id: {id}")).await?;
        }
        Request::List => {
            let ids = client.list().await?;
            if ids.is_empty() {
                write_stdout("no other clients connected").await?;
            } else {
                write_stdout(&format!("other clients: {}", join_ids(&ids, ", "))).await?;
            }
        }
        Request::Relay(relay) => {
            client.relay(&relay.to, relay.message.as_bytes()).await?;
            write_stdout(&format!(
                "relayed {} bytes to {}",
                relay.message.len(),
                join_ids(&relay.to, ",")
            ))
            .await?;
        }
    }

    client.close().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
