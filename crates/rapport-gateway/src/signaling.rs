//! Peer-to-peer call negotiation relay.
//!
//! Every session maps to one broadcast channel named `session:<id>`. Peers
//! publish offers, answers and ICE candidates into it; routing to a single
//! peer happens on the receiving side, where each subscription drops its own
//! echoes and anything addressed to someone else. Delivery is best-effort:
//! a message published before the counterpart subscribes is gone, and the
//! higher layer recovers by re-sending.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, trace, warn};

use rapport_types::signal::{SignalKind, SignalMessage, SignalValidationError, session_channel};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("not joined to the session")]
    NotJoined,
    #[error("already joined to the session")]
    AlreadyJoined,
    #[error("peer has left the session")]
    Closed,
    #[error("presence messages are sent on join and leave only")]
    PresenceReserved,
    #[error(transparent)]
    Invalid(#[from] SignalValidationError),
}

/// In-process pub/sub keyed by channel name.
#[derive(Clone)]
pub struct SignalBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<SignalMessage>>>>,
    capacity: usize,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// The returned receiver sees every message published after this call.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<SignalMessage> {
        let mut channels = self.channels.write().await;
        channels.retain(|name, tx| name == channel || tx.receiver_count() > 0);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers the message reached. Zero when nobody is
    /// listening; the message is not retained.
    pub async fn publish(&self, channel: &str, message: SignalMessage) -> usize {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the channel if nobody listens any more.
    pub async fn prune(&self, channel: &str) {
        let mut channels = self.channels.write().await;
        if channels.get(channel).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(channel);
            trace!("pruned signal channel {}", channel);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unjoined,
    Joined,
    Left,
}

/// One participant's handle on a session.
pub struct SignalPeer {
    bus: SignalBus,
    session_id: String,
    peer_id: String,
    state: PeerState,
    leave_tx: Option<watch::Sender<bool>>,
}

impl SignalPeer {
    pub fn new(bus: SignalBus, session_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
            peer_id: peer_id.into(),
            state: PeerState::Unjoined,
            leave_tx: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    fn channel(&self) -> String {
        session_channel(&self.session_id)
    }

    /// Subscribe to the session channel, then announce ourselves with a
    /// `user-joined` carrying `intro`. The subscription is in place before the
    /// announcement goes out, so replies to it are never missed.
    pub async fn connect(&mut self, intro: Option<Value>) -> Result<SignalSubscription, SignalError> {
        match self.state {
            PeerState::Joined => return Err(SignalError::AlreadyJoined),
            PeerState::Left => return Err(SignalError::Closed),
            PeerState::Unjoined => {}
        }

        let joined = SignalMessage::new(
            SignalKind::UserJoined,
            self.session_id.clone(),
            self.peer_id.clone(),
            None,
            intro,
        );
        joined.validate()?;

        let channel = self.channel();
        let rx = self.bus.subscribe(&channel).await;
        let (leave_tx, leave_rx) = watch::channel(false);
        self.leave_tx = Some(leave_tx);
        self.state = PeerState::Joined;

        let reached = self.bus.publish(&channel, joined).await;
        debug!(
            "{} joined {} ({} subscribers)",
            self.peer_id, self.session_id, reached
        );

        Ok(SignalSubscription {
            rx,
            leave_rx,
            peer_id: self.peer_id.clone(),
            roster: BTreeSet::new(),
        })
    }

    /// Publish a negotiation message. `to: None` reaches every peer in the
    /// session. Returns whether anyone was subscribed at publish time; that
    /// says nothing about whether the addressee was among them.
    pub async fn send(
        &self,
        kind: SignalKind,
        to: Option<String>,
        data: Option<Value>,
    ) -> Result<bool, SignalError> {
        match self.state {
            PeerState::Unjoined => return Err(SignalError::NotJoined),
            PeerState::Left => return Err(SignalError::Closed),
            PeerState::Joined => {}
        }
        if kind.is_presence() {
            return Err(SignalError::PresenceReserved);
        }

        let message = SignalMessage::new(kind, self.session_id.clone(), self.peer_id.clone(), to, data);
        message.validate()?;

        Ok(self.bus.publish(&self.channel(), message).await > 0)
    }

    /// Announce `user-left` and stop the subscription. Safe to call twice;
    /// only the first call publishes.
    pub async fn disconnect(&mut self) -> bool {
        if self.state != PeerState::Joined {
            self.state = PeerState::Left;
            return false;
        }

        let left = SignalMessage::new(
            SignalKind::UserLeft,
            self.session_id.clone(),
            self.peer_id.clone(),
            None,
            None,
        );
        let channel = self.channel();
        let reached = self.bus.publish(&channel, left).await;

        if let Some(tx) = self.leave_tx.take() {
            let _ = tx.send(true);
        }
        self.state = PeerState::Left;
        self.bus.prune(&channel).await;

        debug!("{} left {}", self.peer_id, self.session_id);
        reached > 0
    }
}

/// Receiving half of a joined peer.
pub struct SignalSubscription {
    rx: broadcast::Receiver<SignalMessage>,
    leave_rx: watch::Receiver<bool>,
    peer_id: String,
    roster: BTreeSet<String>,
}

impl SignalSubscription {
    /// Next message meant for this peer. Returns `None` once the owning peer
    /// disconnects or is dropped.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            if *self.leave_rx.borrow() {
                return None;
            }

            tokio::select! {
                _ = self.leave_rx.changed() => return None,
                result = self.rx.recv() => match result {
                    Ok(message) => {
                        if message.from == self.peer_id {
                            continue;
                        }
                        match message.kind {
                            SignalKind::UserJoined => {
                                self.roster.insert(message.from.clone());
                            }
                            SignalKind::UserLeft => {
                                self.roster.remove(&message.from);
                            }
                            _ => {}
                        }
                        if !message.is_addressed_to(&self.peer_id) {
                            trace!("{} skipping {:?} for {:?}", self.peer_id, message.kind, message.to);
                            continue;
                        }
                        return Some(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("signal subscriber {} lagged by {} messages", self.peer_id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Peers announced since this subscription started and not yet departed.
    pub fn peers(&self) -> &BTreeSet<String> {
        &self.roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_types::signal::should_initiate;
    use serde_json::json;
    use std::time::Duration;

    async fn next(sub: &mut SignalSubscription) -> SignalMessage {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("subscription closed")
    }

    async fn nothing_pending(sub: &mut SignalSubscription) -> bool {
        tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err()
    }

    fn offer() -> Option<Value> {
        Some(json!({ "sdp": "v=0" }))
    }

    #[tokio::test]
    async fn offer_answer_between_two_peers() {
        let bus = SignalBus::default();
        let mut a = SignalPeer::new(bus.clone(), "s1", "a");
        let mut b = SignalPeer::new(bus.clone(), "s1", "b");

        let mut a_sub = a.connect(None).await.unwrap();
        let mut b_sub = b.connect(Some(json!({ "name": "Bob" }))).await.unwrap();

        let joined = next(&mut a_sub).await;
        assert_eq!(joined.kind, SignalKind::UserJoined);
        assert_eq!(joined.from, "b");
        assert_eq!(joined.data.unwrap()["name"], "Bob");
        assert!(a_sub.peers().contains("b"));

        assert!(should_initiate("a", "b"));
        assert!(a.send(SignalKind::Offer, Some("b".into()), offer()).await.unwrap());
        let got = next(&mut b_sub).await;
        assert_eq!(got.kind, SignalKind::Offer);
        assert_eq!(got.from, "a");

        b.send(SignalKind::Answer, Some("a".into()), Some(json!({ "sdp": "v=0 answer" })))
            .await
            .unwrap();
        assert_eq!(next(&mut a_sub).await.kind, SignalKind::Answer);

        // Own echoes never come back.
        assert!(nothing_pending(&mut b_sub).await);
    }

    #[tokio::test]
    async fn targeted_messages_skip_other_peers() {
        let bus = SignalBus::default();
        let mut a = SignalPeer::new(bus.clone(), "s1", "a");
        let mut b = SignalPeer::new(bus.clone(), "s1", "b");
        let mut c = SignalPeer::new(bus.clone(), "s1", "c");
        let _a_sub = a.connect(None).await.unwrap();
        let mut b_sub = b.connect(None).await.unwrap();
        let mut c_sub = c.connect(None).await.unwrap();

        assert_eq!(next(&mut b_sub).await.from, "c");

        a.send(
            SignalKind::IceCandidate,
            Some("c".into()),
            Some(json!({ "candidate": "candidate:1" })),
        )
        .await
        .unwrap();

        assert_eq!(next(&mut c_sub).await.kind, SignalKind::IceCandidate);
        assert!(nothing_pending(&mut b_sub).await);
    }

    #[tokio::test]
    async fn lost_offer_is_recovered_by_resending() {
        let bus = SignalBus::default();
        let mut a = SignalPeer::new(bus.clone(), "s1", "a");
        let _a_sub = a.connect(None).await.unwrap();

        // Only the sender is listening; the offer reaches nobody else.
        a.send(SignalKind::Offer, Some("b".into()), offer()).await.unwrap();

        let mut b = SignalPeer::new(bus.clone(), "s1", "b");
        let mut b_sub = b.connect(None).await.unwrap();
        assert!(nothing_pending(&mut b_sub).await);

        a.send(SignalKind::Offer, Some("b".into()), offer()).await.unwrap();
        assert_eq!(next(&mut b_sub).await.kind, SignalKind::Offer);
    }

    #[tokio::test]
    async fn invalid_messages_are_not_published() {
        let bus = SignalBus::default();
        let mut a = SignalPeer::new(bus.clone(), "s1", "a");
        let mut b = SignalPeer::new(bus.clone(), "s1", "b");
        let _a_sub = a.connect(None).await.unwrap();
        let mut b_sub = b.connect(None).await.unwrap();

        let err = a.send(SignalKind::Offer, None, Some(json!({}))).await.unwrap_err();
        assert!(matches!(err, SignalError::Invalid(_)));
        let err = a.send(SignalKind::UserLeft, None, None).await.unwrap_err();
        assert!(matches!(err, SignalError::PresenceReserved));
        assert!(nothing_pending(&mut b_sub).await);
    }

    #[tokio::test]
    async fn send_requires_join() {
        let bus = SignalBus::default();
        let mut a = SignalPeer::new(bus, "s1", "a");
        assert!(matches!(
            a.send(SignalKind::Offer, None, offer()).await,
            Err(SignalError::NotJoined)
        ));

        let _sub = a.connect(None).await.unwrap();
        assert!(matches!(a.connect(None).await, Err(SignalError::AlreadyJoined)));
        a.disconnect().await;
        assert!(matches!(
            a.send(SignalKind::Offer, None, offer()).await,
            Err(SignalError::Closed)
        ));
    }

    #[tokio::test]
    async fn disconnect_announces_and_ends_subscription() {
        let bus = SignalBus::default();
        let mut a = SignalPeer::new(bus.clone(), "s1", "a");
        let mut b = SignalPeer::new(bus.clone(), "s1", "b");
        let mut a_sub = a.connect(None).await.unwrap();
        let mut b_sub = b.connect(None).await.unwrap();
        next(&mut a_sub).await;

        assert!(b.disconnect().await);
        assert!(!b.disconnect().await);
        assert_eq!(b.state(), PeerState::Left);

        let left = next(&mut a_sub).await;
        assert_eq!(left.kind, SignalKind::UserLeft);
        assert!(a_sub.peers().is_empty());
        assert!(b_sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_channels_are_pruned() {
        let bus = SignalBus::default();
        let channel = session_channel("s1");
        let mut a = SignalPeer::new(bus.clone(), "s1", "a");
        let sub = a.connect(None).await.unwrap();
        assert!(bus.channels.read().await.contains_key(&channel));

        drop(sub);
        a.disconnect().await;
        assert!(!bus.channels.read().await.contains_key(&channel));
        assert_eq!(bus.publish(&channel, SignalMessage::new(
            SignalKind::UserLeft, "s1", "x", None, None,
        )).await, 0);
    }
}
