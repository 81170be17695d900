use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tokio::{
    io::{AsyncBufRead, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    id::{IdSequence, Identity},
    message::{
        ClientToServer, DEFAULT_MAX_BODY_LEN, Encode, FrameError, ServerToClient, read_command,
    },
    registry::{Registry, Transport},
};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen: SocketAddr,
    /// Largest relay body a client may declare.
    pub max_body_len: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000)),
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

/// A running hub: the accept loop plus one task per connected client.
///
/// Dropping the handle without calling [`HubServer::stop`] also ends the
/// accept loop and every handler, but nothing waits for them.
pub struct HubServer {
    local_addr: SocketAddr,
    state: Arc<HubState>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl HubServer {
    /// Binds the listener and starts accepting in the background.
    pub async fn start(config: HubConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Self::from_listener(listener, config.max_body_len)
    }

    pub fn from_listener(listener: TcpListener, max_body_len: usize) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let state = Arc::new(HubState::new(max_body_len));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));

        info!(%local_addr, "hub accepting connections");
        Ok(Self {
            local_addr,
            state,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identities currently registered, ascending.
    pub async fn connected(&self) -> Vec<Identity> {
        self.state.registry.list_identities(None).await
    }

    /// Stops accepting, closes every connection, and waits for all
    /// connection handlers to exit.
    pub async fn stop(self) {
        info!("hub shutting down");
        self.shutdown.send_replace(true);

        let closed = self.state.registry.close_all().await;
        if let Err(err) = self.accept_task.await {
            error!(error = ?err, "accept loop panicked");
        }
        info!(closed, "hub stopped");
    }

    /// Serves until `shutdown` resolves, then stops gracefully.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        shutdown.await;
        self.stop().await;
    }
}

struct HubState {
    registry: Registry,
    ids: IdSequence,
    max_body_len: usize,
}

impl HubState {
    fn new(max_body_len: usize) -> Self {
        Self {
            registry: Registry::new(),
            ids: IdSequence::new(),
            max_body_len,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<HubState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let handler_shutdown = shutdown.clone();
    let mut handlers = JoinSet::new();

    loop {
        select! {
            _ = stopped(&mut shutdown) => break,
            accept_result = listener.accept() => {
                let keep_accepting =
                    handle_accept_result(accept_result, &state, &handler_shutdown, &mut handlers)
                        .await;
                if !keep_accepting {
                    break;
                }
            }
        }

        while let Some(finished) = handlers.try_join_next() {
            reap_handler(finished);
        }
    }

    drop(listener);
    debug!(active = handlers.len(), "listener closed; draining connection handlers");
    while let Some(finished) = handlers.join_next().await {
        reap_handler(finished);
    }
}

async fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<HubState>,
    shutdown: &watch::Receiver<bool>,
    handlers: &mut JoinSet<()>,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            spawn_connection_handler(stream, peer, state, shutdown, handlers).await;
            true
        }
        Err(err) => {
            warn!(error = ?err, "failed to accept connection; no longer accepting");
            false
        }
    }
}

async fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<HubState>,
    shutdown: &watch::Receiver<bool>,
    handlers: &mut JoinSet<()>,
) {
    let id = state.ids.next();
    let (reader, writer) = stream.into_split();
    let transport = Arc::new(Transport::new(writer));

    if let Err(err) = state.registry.register(id, Arc::clone(&transport)).await {
        error!(id, %peer, error = %err, "dropping connection");
        transport.close().await;
        return;
    }
    info!(id, %peer, "client connected");

    let state = Arc::clone(state);
    let mut shutdown = shutdown.clone();
    handlers.spawn(async move {
        let mut reader = BufReader::new(reader);
        let result = serve_connection(id, &mut reader, &transport, &state, &mut shutdown).await;
        if let Err(err) = result {
            warn!(id, %peer, error = %err, "connection closed with error");
        }
        state.registry.unregister(id).await;
        info!(id, %peer, "client disconnected");
    });
}

/// Resolves once shutdown has been requested or the hub handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn reap_handler(result: Result<(), JoinError>) {
    if let Err(err) = result {
        error!(error = ?err, "connection handler panicked");
    }
}

/// Reads and dispatches commands until the peer leaves, the stream breaks, or
/// the hub shuts down.
async fn serve_connection<R>(
    id: Identity,
    reader: &mut R,
    transport: &Transport,
    state: &HubState,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), FrameError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        // Losing a half-read command here is fine: shutdown ends the stream anyway.
        let command = select! {
            _ = stopped(shutdown) => {
                debug!(id, "shutdown observed");
                return Ok(());
            }
            command = read_command(reader, state.max_body_len) => command?,
        };

        match command {
            Some(command) => handle_command(id, command, transport, state).await?,
            None => return Ok(()),
        }
    }
}

async fn handle_command(
    id: Identity,
    command: ClientToServer,
    transport: &Transport,
    state: &HubState,
) -> Result<(), FrameError> {
    match command {
        ClientToServer::Identity => {
            transport.send(&ServerToClient::Identity { id }).await?;
        }
        ClientToServer::List => {
            let ids = state.registry.list_identities(Some(id)).await;
            transport.send(&ServerToClient::List { ids }).await?;
        }
        ClientToServer::Relay { receivers, body } => {
            debug!(id, ?receivers, len = body.len(), "relay");
            relay(state, id, &receivers, body).await;
        }
        ClientToServer::Unknown { kind } => {
            debug!(id, %kind, "unknown command");
            transport.send(&ServerToClient::Unknown).await?;
        }
    }
    Ok(())
}

/// Best-effort delivery: unknown receivers and the sender itself are skipped.
/// A receiver whose write fails is unregistered, since its stream may now end
/// in a partial frame; the sender is unaffected.
async fn relay(state: &HubState, sender: Identity, receivers: &[Identity], body: Vec<u8>) {
    let frame = ServerToClient::Relay { sender, body }.encode();

    for &receiver in receivers {
        if receiver == sender {
            continue;
        }
        let Some(transport) = state.registry.lookup(receiver).await else {
            debug!(sender, receiver, "receiver not connected; dropping relay");
            continue;
        };
        if let Err(err) = transport.send_frame(&frame).await {
            warn!(sender, receiver, error = %err, "failed to deliver relay; dropping receiver");
            state.registry.unregister(receiver).await;
        }
    }
}
