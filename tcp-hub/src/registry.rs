use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, RwLock},
    time::timeout,
};
use tracing::debug;

use crate::{id::Identity, message::Encode};

/// Longest a single frame write may take before the transport is considered stuck.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a client connection.
///
/// Both the owning connection handler and relaying handlers write through the
/// same `Transport`, one whole frame at a time. Once closed it stays closed.
pub struct Transport {
    writer: Mutex<Option<BoxedWriter>>,
}

impl Transport {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
        }
    }

    pub async fn send<T: Encode>(&self, message: &T) -> io::Result<()> {
        self.send_frame(&message.encode()).await
    }

    /// Writes an already encoded frame and flushes it.
    ///
    /// A failed or timed out write may leave part of the frame on the wire,
    /// so the writer is dropped and the transport is closed from then on.
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;

        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        let result = match timeout(WRITE_TIMEOUT, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out writing frame",
            )),
        };
        if result.is_err() {
            guard.take();
        }
        result
    }

    /// Shuts the writer down and drops it. Idempotent.
    pub async fn close(&self) {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        match timeout(WRITE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(?error, "transport shutdown was not clean"),
            Err(_) => debug!("transport shutdown timed out"),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("identity {0} is already registered")]
pub struct DuplicateIdentity(pub Identity);

/// Live connections, keyed by identity.
///
/// Lookups and listings share the lock; registration and removal take it
/// exclusively. An identity is present exactly while its transport is open
/// and able to receive relays.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<BTreeMap<Identity, Arc<Transport>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        id: Identity,
        transport: Arc<Transport>,
    ) -> Result<(), DuplicateIdentity> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(DuplicateIdentity(id));
        }
        connections.insert(id, transport);
        Ok(())
    }

    /// Removes `id` and closes its transport. Returns whether it was present.
    pub async fn unregister(&self, id: Identity) -> bool {
        // Close after releasing the lock so a slow peer cannot stall the registry.
        let removed = self.connections.write().await.remove(&id);
        match removed {
            Some(transport) => {
                transport.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn lookup(&self, id: Identity) -> Option<Arc<Transport>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Snapshot of registered identities in ascending order.
    pub async fn list_identities(&self, excluding: Option<Identity>) -> Vec<Identity> {
        self.connections
            .read()
            .await
            .keys()
            .copied()
            .filter(|id| Some(*id) != excluding)
            .collect()
    }

    /// Removes and closes every connection, returning how many were open.
    pub async fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.connections.write().await);
        let count = drained.len();
        for transport in drained.into_values() {
            transport.close().await;
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
