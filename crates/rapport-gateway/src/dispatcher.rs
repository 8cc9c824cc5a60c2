use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::trace;
use uuid::Uuid;

use rapport_types::events::GatewayEvent;

use crate::signaling::SignalBus;

/// Routes gateway events to connected users and owns the signaling bus.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// user_id -> (conn_id -> sender). A user may hold several sockets.
    user_channels: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>>,

    signals: SignalBus,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(SignalBus::default())
    }
}

impl Dispatcher {
    pub fn new(signals: SignalBus) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                user_channels: RwLock::new(HashMap::new()),
                signals,
            }),
        }
    }

    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    /// Register a per-connection channel. Returns the connection id used to
    /// unregister it later.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        self.inner
            .user_channels
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some(conns) = channels.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                channels.remove(&user_id);
            }
        }
    }

    /// Send to every connection of one user. Returns how many sockets took it.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> usize {
        let channels = self.inner.user_channels.read().await;
        let Some(conns) = channels.get(&user_id) else {
            return 0;
        };
        conns
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    /// Fan an event out to a set of users, typically a conversation's active
    /// participants.
    pub async fn send_to_users(&self, user_ids: &[Uuid], event: GatewayEvent) -> usize {
        let channels = self.inner.user_channels.read().await;
        let mut delivered = 0;
        for user_id in user_ids {
            if let Some(conns) = channels.get(user_id) {
                delivered += conns
                    .values()
                    .filter(|tx| tx.send(event.clone()).is_ok())
                    .count();
            }
        }
        trace!("fanned out event to {} sockets", delivered);
        delivered
    }
}
