//! Transport seam between the protocol commands and the network
//!
//! The node talks to peers only through [`NetworkTransport`]. The UDP
//! implementation lives in `network.rs`; [`MemoryNetwork`] routes messages
//! between in-process nodes and can be scripted per peer.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dkg_common::{Message, MessageType};
use log::{debug, trace};
use tokio::sync::{Mutex, RwLock};

use crate::{
    error::{NodeError, Phase, Result},
    operation::OperationId,
    types::PeerId,
};

/// Receiver-side entry point for inbound protocol messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Returns the reply, if any.
    async fn handle(&self, message: Message) -> Option<Message>;
}

#[async_trait]
pub trait NetworkTransport: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    /// Sends one request and waits for the matching response.
    #[allow(clippy::too_many_arguments)]
    async fn send_message(
        &self,
        protocol: &str,
        peer: &PeerId,
        message_type: MessageType,
        operation_id: OperationId,
        session_id: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message>;

    async fn remove_cached_session(
        &self,
        operation_id: OperationId,
        session_id: &str,
        peer: &PeerId,
    );

    /// Number of sessions currently cached.
    async fn cached_sessions(&self) -> usize;
}

/// Phase a request type belongs to, for timeout reporting.
#[must_use]
pub const fn phase_of(message_type: MessageType) -> Phase {
    match message_type {
        MessageType::ProtocolInit => Phase::Init,
        _ => Phase::Request,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub operation_id: OperationId,
    pub session_id: String,
    pub peer: PeerId,
}

impl SessionKey {
    pub fn new(operation_id: OperationId, session_id: &str, peer: &PeerId) -> Self {
        Self {
            operation_id,
            session_id: session_id.to_owned(),
            peer: peer.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Ack,
    Nack,
    Busy,
    Timeout,
    Unknown,
}

impl ExchangeOutcome {
    #[must_use]
    pub fn of(message: &Message) -> Self {
        match message.message_type() {
            Ok(MessageType::Ack) => Self::Ack,
            Ok(MessageType::Nack) => Self::Nack,
            Ok(MessageType::Busy) => Self::Busy,
            _ => Self::Unknown,
        }
    }
}

/// One request/response exchange with a peer.
#[derive(Debug, Clone)]
pub struct ProtocolExchange {
    pub message_type: MessageType,
    pub request: Vec<u8>,
    pub response: Option<Vec<u8>>,
    pub deadline: Instant,
    pub outcome: Option<ExchangeOutcome>,
}

/// Exchanges kept until the protocol command releases them.
#[derive(Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<SessionKey, ProtocolExchange>>,
}

impl SessionCache {
    pub async fn open(
        &self,
        key: SessionKey,
        message_type: MessageType,
        request: &[u8],
        timeout: Duration,
    ) {
        self.sessions.lock().await.insert(
            key,
            ProtocolExchange {
                message_type,
                request: request.to_vec(),
                response: None,
                deadline: Instant::now() + timeout,
                outcome: None,
            },
        );
    }

    pub async fn resolve(
        &self,
        key: &SessionKey,
        outcome: ExchangeOutcome,
        response: Option<&[u8]>,
    ) {
        if let Some(exchange) = self.sessions.lock().await.get_mut(key) {
            exchange.outcome = Some(outcome);
            exchange.response = response.map(<[u8]>::to_vec);
        }
    }

    pub async fn remove(&self, key: &SessionKey) -> Option<ProtocolExchange> {
        self.sessions.lock().await.remove(key)
    }

    pub async fn get(&self, key: &SessionKey) -> Option<ProtocolExchange> {
        self.sessions.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Canned reply for a scripted peer; `None` never answers.
pub type Responder = Arc<dyn Fn(&Message) -> Option<(u32, Vec<u8>)> + Send + Sync>;

/// In-process broker routing messages between registered nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<PeerId, Arc<dyn InboundHandler>>>,
    scripts: RwLock<HashMap<PeerId, Responder>>,
    sent: Mutex<HashMap<PeerId, Vec<Message>>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, peer: PeerId, handler: Arc<dyn InboundHandler>) {
        self.nodes.write().await.insert(peer, handler);
    }

    /// Answers every message to `peer` with `responder` instead of a real handler.
    pub async fn script<F>(&self, peer: PeerId, responder: F)
    where
        F: Fn(&Message) -> Option<(u32, Vec<u8>)> + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(responder);
        self.scripts.write().await.insert(peer, responder);
    }

    /// Scripts `peer` to answer every request with `message_type` and an empty body.
    pub async fn always(&self, peer: PeerId, message_type: MessageType) {
        self.script(peer, move |_| Some((message_type.into(), b"{}".to_vec())))
            .await;
    }

    /// Messages delivered to `peer` so far.
    pub async fn sent_to(&self, peer: &PeerId) -> Vec<Message> {
        self.sent.lock().await.get(peer).cloned().unwrap_or_default()
    }

    async fn deliver(&self, peer: &PeerId, message: Message) -> Result<Message> {
        self.sent
            .lock()
            .await
            .entry(peer.clone())
            .or_default()
            .push(message.clone());

        let script = self.scripts.read().await.get(peer).cloned();
        if let Some(responder) = script {
            return match responder(&message) {
                Some((raw_type, data)) => {
                    let mut reply = message.reply(MessageType::Ack, peer.as_str(), data);
                    reply.header.message_type = raw_type;
                    Ok(reply)
                }
                None => std::future::pending().await,
            };
        }

        let handler = self
            .nodes
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| NodeError::network_msg(format!("peer {peer} is not reachable")))?;
        match handler.handle(message).await {
            Some(reply) => Ok(reply),
            None => std::future::pending().await,
        }
    }
}

pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
    sessions: SessionCache,
}

impl MemoryTransport {
    #[must_use]
    pub fn new(local: PeerId, network: Arc<MemoryNetwork>) -> Self {
        Self {
            local,
            network,
            sessions: SessionCache::default(),
        }
    }

    #[must_use]
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl NetworkTransport for MemoryTransport {
    fn peer_id(&self) -> &PeerId {
        &self.local
    }

    async fn send_message(
        &self,
        protocol: &str,
        peer: &PeerId,
        message_type: MessageType,
        operation_id: OperationId,
        session_id: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        let key = SessionKey::new(operation_id, session_id, peer);
        self.sessions
            .open(key.clone(), message_type, &payload, timeout)
            .await;
        let message = Message::new(
            operation_id.to_string(),
            session_id,
            message_type,
            protocol,
            self.local.as_str(),
            payload,
        );
        trace!("{} -> {peer}: {message_type} on {protocol}", self.local);

        match tokio::time::timeout(timeout, self.network.deliver(peer, message)).await {
            Ok(Ok(reply)) => {
                self.sessions
                    .resolve(&key, ExchangeOutcome::of(&reply), Some(&reply.data))
                    .await;
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("{message_type} to {peer} timed out after {timeout:?}");
                self.sessions
                    .resolve(&key, ExchangeOutcome::Timeout, None)
                    .await;
                Err(NodeError::timeout(
                    phase_of(message_type),
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    async fn remove_cached_session(
        &self,
        operation_id: OperationId,
        session_id: &str,
        peer: &PeerId,
    ) {
        self.sessions
            .remove(&SessionKey::new(operation_id, session_id, peer))
            .await;
    }

    async fn cached_sessions(&self) -> usize {
        self.sessions.len().await
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    struct Echo;

    #[async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, message: Message) -> Option<Message> {
            Some(message.reply(MessageType::Ack, "echo", message.data.clone()))
        }
    }

    #[tokio::test]
    async fn test_memory_transport_routes_and_caches_session() {
        let network = MemoryNetwork::new();
        network.register("echo".into(), Arc::new(Echo)).await;
        let transport = MemoryTransport::new("me".into(), Arc::clone(&network));
        let op = Uuid::new_v4();

        let reply = transport
            .send_message(
                "/get/1.0.0",
                &"echo".into(),
                MessageType::ProtocolInit,
                op,
                "s1",
                b"hello".to_vec(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Ok(MessageType::Ack));
        assert_eq!(reply.data, b"hello");
        assert_eq!(transport.cached_sessions().await, 1);

        transport
            .remove_cached_session(op, "s1", &"echo".into())
            .await;
        assert_eq!(transport.cached_sessions().await, 0);
        assert_eq!(network.sent_to(&"echo".into()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let network = MemoryNetwork::new();
        network.script("mute".into(), |_| None).await;
        let transport = MemoryTransport::new("me".into(), Arc::clone(&network));

        let result = transport
            .send_message(
                "/store/1.0.0",
                &"mute".into(),
                MessageType::ProtocolRequest,
                Uuid::new_v4(),
                "s",
                Vec::new(),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(
            result,
            Err(NodeError::Timeout {
                phase: Phase::Request,
                duration_ms: 20
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_a_network_error() {
        let transport = MemoryTransport::new("me".into(), MemoryNetwork::new());
        let result = transport
            .send_message(
                "/store/1.0.0",
                &"nobody".into(),
                MessageType::ProtocolInit,
                Uuid::new_v4(),
                "s",
                Vec::new(),
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(NodeError::Network { .. })));
    }
}
