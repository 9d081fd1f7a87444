//! Receiver side of the peer protocol
//!
//! Answers inbound INIT and REQUEST messages for every operation kind:
//! - INIT opens a session, or answers BUSY once too many are open
//! - REQUEST closes the session and performs the store, get or search
//! - anything we cannot serve is answered with a NACK carrying the reason

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dkg_common::{Message, MessageType};
use log::{debug, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    config::NodeConfig,
    protocol::{InitPayload, RequestPayload, ResponsePayload, DEFAULT_SEARCH_LIMIT},
    sharding::ShardingTableService,
    store::TripleStore,
    transport::{InboundHandler, SessionKey},
    types::{dataset_root, BlockchainId, OperationKind, PeerId},
};

pub struct RequestHandler {
    local: PeerId,
    blockchains: BTreeSet<BlockchainId>,
    store: Arc<dyn TripleStore>,
    /// Inbound requests count as sightings of the sender
    sharding: Arc<dyn ShardingTableService>,
    sessions: Mutex<HashMap<SessionKey, Instant>>,
    max_open_sessions: usize,
    session_ttl: Duration,
}

impl RequestHandler {
    #[must_use]
    pub fn new(
        config: &NodeConfig,
        store: Arc<dyn TripleStore>,
        sharding: Arc<dyn ShardingTableService>,
    ) -> Self {
        Self {
            local: config.peer_id.clone(),
            blockchains: config.blockchains.iter().cloned().collect(),
            store,
            sharding,
            sessions: Mutex::new(HashMap::new()),
            max_open_sessions: config.server.max_open_sessions,
            session_ttl: Duration::from_millis(config.server.session_ttl_ms),
        }
    }

    pub async fn open_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, opened| opened.elapsed() < self.session_ttl);
        sessions.len()
    }

    fn respond(
        &self,
        request: &Message,
        message_type: MessageType,
        body: &ResponsePayload,
    ) -> Message {
        let data = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
        request.reply(message_type, self.local.as_str(), data)
    }

    fn nack(&self, request: &Message, reason: impl Into<String>) -> Message {
        let reason = reason.into();
        debug!(
            "NACK to {} for operation {}: {reason}",
            request.header.sender, request.header.operation_id
        );
        self.respond(request, MessageType::Nack, &ResponsePayload::nack(reason))
    }

    fn ack(&self, request: &Message, body: &ResponsePayload) -> Message {
        self.respond(request, MessageType::Ack, body)
    }

    async fn handle_init(
        &self,
        message: &Message,
        kind: OperationKind,
        session: SessionKey,
    ) -> Message {
        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, opened| opened.elapsed() < self.session_ttl);
            if sessions.len() >= self.max_open_sessions && !sessions.contains_key(&session) {
                debug!(
                    "{} open sessions, answering BUSY to {}",
                    sessions.len(),
                    message.header.sender
                );
                return self.respond(message, MessageType::Busy, &ResponsePayload::default());
            }
        }

        let Ok(payload) = serde_json::from_slice::<InitPayload>(&message.data) else {
            return self.nack(message, "Invalid init payload");
        };
        if !self.blockchains.contains(&payload.blockchain) {
            return self.nack(
                message,
                format!("Blockchain {} is not supported by this node", payload.blockchain),
            );
        }
        if kind == OperationKind::Get {
            match self.store.assertion_exists(&payload.blockchain, &payload.key).await {
                Ok(true) => {}
                Ok(false) => {
                    return self.nack(message, format!("Assertion {} not found", payload.key));
                }
                Err(e) => return self.nack(message, e.to_string()),
            }
        }

        self.sessions.lock().await.insert(session, Instant::now());
        self.ack(message, &ResponsePayload::default())
    }

    async fn handle_request(
        &self,
        message: &Message,
        kind: OperationKind,
        session: SessionKey,
    ) -> Message {
        self.sessions.lock().await.remove(&session);

        let Ok(payload) = serde_json::from_slice::<RequestPayload>(&message.data) else {
            return self.nack(message, "Invalid request payload");
        };
        let Some(blockchain) = payload.blockchain.as_ref() else {
            return self.nack(message, "Request carries no blockchain");
        };
        if !self.blockchains.contains(blockchain) {
            return self.nack(
                message,
                format!("Blockchain {blockchain} is not supported by this node"),
            );
        }

        match kind {
            OperationKind::Publish | OperationKind::Update => {
                let Some(assertion) = payload.assertion.as_ref().filter(|a| !a.is_empty()) else {
                    return self.nack(message, "Request carries no assertion");
                };
                if dataset_root(assertion) != payload.key {
                    return self.nack(message, format!("Invalid dataset root {}", payload.key));
                }
                match self
                    .store
                    .insert_assertion(blockchain, &payload.key, assertion)
                    .await
                {
                    Ok(()) => self.ack(message, &ResponsePayload::default()),
                    Err(e) => self.nack(message, format!("Unable to store assertion: {e}")),
                }
            }
            OperationKind::Get => match self.store.get_assertion(blockchain, &payload.key).await {
                Ok(Some(assertion)) => self.ack(
                    message,
                    &ResponsePayload {
                        assertion: Some(assertion),
                        ..ResponsePayload::default()
                    },
                ),
                Ok(None) => self.nack(message, format!("Assertion {} not found", payload.key)),
                Err(e) => self.nack(message, e.to_string()),
            },
            OperationKind::Search => {
                let limit = payload.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
                match self.store.search(blockchain, &payload.key, limit).await {
                    Ok(results) => self.ack(
                        message,
                        &ResponsePayload {
                            results,
                            ..ResponsePayload::default()
                        },
                    ),
                    Err(e) => self.nack(message, e.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl InboundHandler for RequestHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        if !message.is_valid() {
            warn!("Dropping message with bad magic from {}", message.header.sender);
            return None;
        }
        let Ok(message_type) = message.message_type() else {
            warn!(
                "Invalid message type from {}: {}",
                message.header.sender, message.header.message_type
            );
            return None;
        };
        if !message_type.is_request() {
            debug!("Unexpected {message_type} from {}", message.header.sender);
            return None;
        }
        let sender = PeerId::new(message.header.sender.clone());
        self.sharding.record_seen(&sender).await;

        let Some(kind) = OperationKind::from_protocol(&message.header.protocol) else {
            return Some(self.nack(
                &message,
                format!("Unsupported protocol {}", message.header.protocol),
            ));
        };
        let Ok(operation_id) = Uuid::parse_str(&message.header.operation_id) else {
            return Some(self.nack(&message, "Invalid operation id"));
        };
        let session = SessionKey::new(operation_id, &message.header.session_id, &sender);

        let reply = match message_type {
            MessageType::ProtocolInit => self.handle_init(&message, kind, session).await,
            _ => self.handle_request(&message, kind, session).await,
        };
        Some(reply)
    }
}
