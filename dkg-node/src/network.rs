//! UDP transport
//!
//! Each datagram carries one rkyv-encoded [`Message`]. Outbound requests
//! park a oneshot keyed by `(operation, session, peer)`; the receive loop
//! completes it when the matching response arrives and hands inbound
//! requests to the [`InboundHandler`].

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use dkg_common::{constants::MAX_DATAGRAM_SIZE, Message, MessageType};
use log::{debug, info, trace, warn};
use tokio::{
    net::UdpSocket,
    sync::{oneshot, Mutex},
};
use uuid::Uuid;

use crate::{
    error::{NodeError, Result},
    operation::OperationId,
    routing::AddressBook,
    transport::{
        phase_of, ExchangeOutcome, InboundHandler, NetworkTransport, SessionCache, SessionKey,
    },
    types::PeerId,
};

pub fn create_socket(bind_addr: SocketAddr) -> Result<UdpSocket> {
    use socket2::{Domain, Socket, Type};
    let sock = Socket::new(
        if bind_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        },
        Type::DGRAM,
        None,
    )?;
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&bind_addr.into())?;
    Ok(UdpSocket::from_std(sock.into())?)
}

pub struct UdpTransport {
    local: PeerId,
    socket: UdpSocket,
    address_book: Arc<AddressBook>,
    handler: Arc<dyn InboundHandler>,
    pending: Mutex<HashMap<SessionKey, oneshot::Sender<Message>>>,
    sessions: SessionCache,
}

impl UdpTransport {
    pub fn bind(
        local: PeerId,
        bind_addr: SocketAddr,
        address_book: Arc<AddressBook>,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<Self>> {
        let socket = create_socket(bind_addr)?;
        info!("{local} listening on {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            local,
            socket,
            address_book,
            handler,
            pending: Mutex::new(HashMap::new()),
            sessions: SessionCache::default(),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn send_to(&self, message: &Message, address: SocketAddr) -> Result<()> {
        let bytes = message
            .encode()
            .map_err(|e| NodeError::serialization("message envelope", e))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NodeError::network_msg(format!(
                "message of {} bytes exceeds the datagram limit",
                bytes.len()
            )));
        }
        self.socket
            .send_to(&bytes, address)
            .await
            .map_err(|e| NodeError::network(format!("failed to send to {address}"), e))?;
        Ok(())
    }

    /// Hands a response to whoever is waiting for it.
    async fn complete(&self, message: Message) {
        let Ok(operation_id) = Uuid::parse_str(&message.header.operation_id) else {
            debug!("Response with invalid operation id from {}", message.header.sender);
            return;
        };
        let key = SessionKey::new(
            operation_id,
            &message.header.session_id,
            &PeerId::new(message.header.sender.clone()),
        );
        match self.pending.lock().await.remove(&key) {
            // the waiter may have timed out in the meantime
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!(
                "Late response from {} for operation {operation_id}",
                message.header.sender
            ),
        }
    }

    /// Receive loop. Runs until the socket fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; 65_536].into_boxed_slice();
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Receive failed: {e}");
                    continue;
                }
            };
            let message = match Message::decode(&buf[..n]) {
                Ok(message) if message.is_valid() => message,
                Ok(_) => {
                    debug!("Dropping datagram with bad magic from {from}");
                    continue;
                }
                Err(e) => {
                    debug!("Dropping undecodable datagram from {from}: {e}");
                    continue;
                }
            };
            trace!(
                "{from} -> {}: {} for operation {}",
                self.local,
                message.header.message_type,
                message.header.operation_id
            );

            match message.message_type() {
                Ok(message_type) if message_type.is_request() => {
                    let transport = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Some(reply) = transport.handler.handle(message).await {
                            if let Err(e) = transport.send_to(&reply, from).await {
                                warn!("Failed to answer {from}: {e}");
                            }
                        }
                    });
                }
                // unknown types go to the waiter, which rejects them
                _ => self.complete(message).await,
            }
        }
    }
}

#[async_trait]
impl NetworkTransport for UdpTransport {
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
        let address = self
            .address_book
            .get(peer)
            .await
            .ok_or_else(|| NodeError::network_msg(format!("no address known for peer {peer}")))?
            .address;
        let key = SessionKey::new(operation_id, session_id, peer);
        let message = Message::new(
            operation_id.to_string(),
            session_id,
            message_type,
            protocol,
            self.local.as_str(),
            payload,
        );

        let (waiter, response) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), waiter);
        self.sessions
            .open(key.clone(), message_type, &message.data, timeout)
            .await;
        if let Err(e) = self.send_to(&message, address).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(reply)) => {
                self.sessions
                    .resolve(&key, ExchangeOutcome::of(&reply), Some(&reply.data))
                    .await;
                Ok(reply)
            }
            Ok(Err(_)) => Err(NodeError::network_msg(format!(
                "response channel for {peer} closed"
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                self.sessions
                    .resolve(&key, ExchangeOutcome::Timeout, None)
                    .await;
                debug!("{message_type} to {peer} timed out after {timeout:?}");
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
        let key = SessionKey::new(operation_id, session_id, peer);
        self.pending.lock().await.remove(&key);
        self.sessions.remove(&key).await;
    }

    async fn cached_sessions(&self) -> usize {
        self.sessions.len().await
    }
}
