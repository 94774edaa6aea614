use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap as HashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use crate::{
    DisconnectReason, Payload, Result,
    connection::Connection,
    id_alloc::{ClientId, ClientIdAllocator},
    metrics::METRICS,
    packet::UpdatePacket,
    scheduler::{ConnectionHooks, SchedulerEvent, SchedulerOpts},
    transport::Transport,
    utils::spawn_with_cancel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Connected(ClientId),
    Received(ClientId, UpdatePacket),
    Disconnected(ClientId, DisconnectReason),
}

/// Owns the connections of a host, keyed by allocated client id.
pub struct ConnectionManager {
    opts: SchedulerOpts,
    ids: Mutex<ClientIdAllocator>,
    connections: RwLock<HashMap<ClientId, Arc<Connection>>>,
    events: UnboundedSender<ManagerEvent>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// `opts` is used for every connection's scheduler.
    pub fn new(opts: SchedulerOpts) -> (Arc<Self>, UnboundedReceiver<ManagerEvent>) {
        let (tx, rx) = unbounded_channel();
        let cancel = opts.cancellation_token.child_token();
        let this = Arc::new(Self {
            opts: SchedulerOpts {
                cancellation_token: cancel.clone(),
                ..opts
            },
            ids: Mutex::new(ClientIdAllocator::new()),
            connections: RwLock::new(HashMap::default()),
            events: tx,
            cancel,
        });
        (this, rx)
    }

    /// Starts a connection over `transport` and returns its id.
    pub fn add(
        self: &Arc<Self>,
        transport: Transport,
        incoming: UnboundedReceiver<Payload>,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<ClientId> {
        let id = self.ids.lock().allocate()?;
        let (connection, events) =
            match Connection::start(transport, incoming, self.opts.clone(), hooks) {
                Ok(c) => c,
                Err(e) => {
                    self.ids.lock().release(id);
                    return Err(e);
                }
            };
        debug!(id, ?connection, "connection added");
        self.connections.write().insert(id, Arc::new(connection));
        METRICS.connections.increment(1.);

        spawn_with_cancel(
            debug_span!("connection_events", id),
            self.cancel.clone(),
            forward_events(Arc::downgrade(self), id, events),
        );
        let _ = self.events.send(ManagerEvent::Connected(id));
        Ok(id)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.connections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears the connection down and frees its id. Returns false if there was none.
    pub async fn remove(&self, id: ClientId, reason: DisconnectReason) -> bool {
        let Some(connection) = self.connections.write().remove(&id) else {
            return false;
        };
        connection.disconnect().await;
        self.ids.lock().release(id);
        METRICS.connections.decrement(1.);
        debug!(id, ?reason, "connection removed");
        let _ = self.events.send(ManagerEvent::Disconnected(id, reason));
        true
    }

    /// Sends `payload` reliably to every connection.
    pub fn broadcast_reliable(&self, payload: &[u8]) {
        for connection in self.connections.read().values() {
            connection.scheduler().push_reliable(payload.to_vec());
        }
    }

    /// Removes every connection.
    pub async fn shutdown(&self) {
        for id in self.ids() {
            self.remove(id, DisconnectReason::Unknown).await;
        }
        self.cancel.cancel();
    }
}

async fn forward_events(
    manager: Weak<ConnectionManager>,
    id: ClientId,
    mut events: UnboundedReceiver<SchedulerEvent>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        let Some(m) = manager.upgrade() else {
            return Ok(());
        };
        match event {
            SchedulerEvent::Received(packet) => {
                let _ = m.events.send(ManagerEvent::Received(id, packet));
            }
            SchedulerEvent::TimedOut => {
                debug!(id, "connection timed out, removing");
                // Its own task: removal ends this one.
                tokio::spawn(async move {
                    m.remove(id, DisconnectReason::TimedOut).await;
                });
                return Ok(());
            }
        }
    }
    trace!("scheduler gone");
    Ok(())
}
