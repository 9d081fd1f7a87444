//! Per-peer protocol state machine
//!
//! One [`ProtocolMessageCommand`] drives a single exchange with a single peer:
//! prepare the payload, send it, then act on the declared response type.
//! ACK hands over to the phase, BUSY asks the executor to retry the same
//! command, NACK or an unknown type records a failed response. The phase
//! (INIT or REQUEST, per operation kind) is supplied as a strategy.

use std::marker::PhantomData;

use async_trait::async_trait;
use dkg_common::{constants::DEFAULT_HASH_FUNCTION_ID, Message, MessageType};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    command::{Command, CommandData, CommandHandler, CommandRegistry, Outcome, Sequence},
    config::PhaseConfig,
    context::Context,
    error::{NodeError, Result},
    network_protocol::command_names,
    operation::{Decision, OperationPhase, OperationStatus, PeerResponse, ResponseStatus},
    types::{dataset_root, Assertion, BlockchainId, OperationKind},
};

/// Default number of search results requested from each peer.
pub const DEFAULT_SEARCH_LIMIT: usize = 64;

/// Body of a `PROTOCOL_INIT` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub blockchain: BlockchainId,
    pub key: String,
    pub keyword: String,
    pub hash_function_id: u8,
}

/// Body of a `PROTOCOL_REQUEST` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestPayload {
    pub blockchain: Option<BlockchainId>,
    pub key: String,
    pub assertion: Option<Assertion>,
    pub limit: Option<usize>,
}

/// Body of every response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsePayload {
    pub error_message: Option<String>,
    pub assertion: Option<Assertion>,
    pub results: Vec<String>,
}

impl ResponsePayload {
    pub fn nack(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Lenient decode: an unreadable body is treated as empty.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        serde_json::from_slice(&message.data).unwrap_or_default()
    }
}

/// What the phase made of an ACK.
#[derive(Debug)]
pub enum AckOutcome {
    Accepted(Outcome),
    /// The ACK's content was unusable; recorded as a failed response.
    Rejected(String),
}

/// Phase-specific half of the state machine.
#[async_trait]
pub trait ProtocolPhase: Send + Sync + 'static {
    const MESSAGE_TYPE: MessageType;
    const START: OperationPhase;
    const END: OperationPhase;

    fn config(ctx: &Context) -> PhaseConfig;

    fn command_name(kind: OperationKind) -> &'static str;

    async fn prepare_message(ctx: &Context, data: &CommandData) -> Result<Vec<u8>>;

    /// Acts on an ACK.
    async fn handle_ack(
        ctx: &Context,
        command: &Command,
        registry: &CommandRegistry,
        response: ResponsePayload,
    ) -> Result<AckOutcome>;
}

/// First handshake: asks the peer whether it will take the operation.
pub struct InitPhase;

#[async_trait]
impl ProtocolPhase for InitPhase {
    const MESSAGE_TYPE: MessageType = MessageType::ProtocolInit;
    const START: OperationPhase = OperationPhase::InitStart;
    const END: OperationPhase = OperationPhase::InitEnd;

    fn config(ctx: &Context) -> PhaseConfig {
        ctx.config.protocol.init
    }

    fn command_name(kind: OperationKind) -> &'static str {
        command_names(kind).init
    }

    async fn prepare_message(_ctx: &Context, data: &CommandData) -> Result<Vec<u8>> {
        let key = data.key()?.to_owned();
        Ok(serde_json::to_vec(&InitPayload {
            blockchain: data.blockchain()?.clone(),
            keyword: key.clone(),
            key,
            hash_function_id: DEFAULT_HASH_FUNCTION_ID,
        })?)
    }

    async fn handle_ack(
        _ctx: &Context,
        command: &Command,
        registry: &CommandRegistry,
        _response: ResponsePayload,
    ) -> Result<AckOutcome> {
        Ok(AckOutcome::Accepted(
            registry.continue_sequence(command.data.clone(), &command.sequence)?,
        ))
    }
}

/// Second handshake: carries the payload and yields the peer's answer.
pub struct RequestPhase;

#[async_trait]
impl ProtocolPhase for RequestPhase {
    const MESSAGE_TYPE: MessageType = MessageType::ProtocolRequest;
    const START: OperationPhase = OperationPhase::RequestStart;
    const END: OperationPhase = OperationPhase::RequestEnd;

    fn config(ctx: &Context) -> PhaseConfig {
        ctx.config.protocol.request
    }

    fn command_name(kind: OperationKind) -> &'static str {
        command_names(kind).request
    }

    async fn prepare_message(ctx: &Context, data: &CommandData) -> Result<Vec<u8>> {
        let operation_id = data.operation_id()?;
        let mut payload = RequestPayload {
            blockchain: Some(data.blockchain()?.clone()),
            key: data.key()?.to_owned(),
            ..RequestPayload::default()
        };
        match data.kind()? {
            OperationKind::Publish | OperationKind::Update => {
                let assertion = ctx.operations.cached_data(operation_id).await.ok_or_else(|| {
                    NodeError::invalid_state(format!(
                        "no cached assertion for operation {operation_id}"
                    ))
                })?;
                payload.assertion = Some(assertion);
            }
            OperationKind::Get => {}
            OperationKind::Search => {
                payload.limit = Some(data.limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
            }
        }
        Ok(serde_json::to_vec(&payload)?)
    }

    async fn handle_ack(
        ctx: &Context,
        command: &Command,
        registry: &CommandRegistry,
        response: ResponsePayload,
    ) -> Result<AckOutcome> {
        let data = &command.data;
        if data.kind()? == OperationKind::Get {
            match &response.assertion {
                Some(assertion) if dataset_root(assertion) == data.key()? => {}
                _ => {
                    return Ok(AckOutcome::Rejected(
                        "Received invalid assertion from node".to_string(),
                    ))
                }
            }
        }
        let decision = ctx
            .operations
            .process_response(
                data,
                ResponseStatus::Completed,
                PeerResponse {
                    error_message: None,
                    assertion: response.assertion,
                    results: response.results,
                },
            )
            .await?;
        Ok(AckOutcome::Accepted(outcome_for(registry, data, decision)?))
    }
}

/// Turns an aggregation decision into the chain's outcome.
pub fn outcome_for(
    registry: &CommandRegistry,
    data: &CommandData,
    decision: Decision,
) -> Result<Outcome> {
    if decision != Decision::NextBatch {
        return Ok(Outcome::Empty);
    }
    let schedule = command_names(data.kind()?).schedule;
    debug!(
        "Operation {}: scheduling next batch from {} leftover nodes",
        data.operation_id()?,
        data.leftover_nodes.len()
    );
    Ok(Outcome::Continue(vec![registry.instantiate(
        schedule,
        data.clone(),
        Sequence::default(),
    )?]))
}

pub struct ProtocolMessageCommand<P> {
    kind: OperationKind,
    ctx: Context,
    _phase: PhantomData<P>,
}

pub type ProtocolInitCommand = ProtocolMessageCommand<InitPhase>;
pub type ProtocolRequestCommand = ProtocolMessageCommand<RequestPhase>;

impl<P: ProtocolPhase> ProtocolMessageCommand<P> {
    #[must_use]
    pub fn new(kind: OperationKind, ctx: Context) -> Self {
        Self {
            kind,
            ctx,
            _phase: PhantomData,
        }
    }

    /// Skip peers once the operation has already been decided.
    async fn should_send_message(&self, data: &CommandData) -> Result<bool> {
        Ok(!self.ctx.operations.is_finalized(data.operation_id()?).await)
    }

    async fn purge_session(&self, data: &CommandData) -> Result<()> {
        let node = data.node()?;
        self.ctx
            .transport
            .remove_cached_session(data.operation_id()?, &data.session_id()?, &node.id)
            .await;
        Ok(())
    }

    /// Records a failed response for this peer and lets the operation rule decide.
    async fn mark_response_failed(
        &self,
        registry: &CommandRegistry,
        data: &CommandData,
        message: String,
    ) -> Result<Outcome> {
        warn!(
            "Operation {}: {message} (peer {})",
            data.operation_id()?,
            data.node()?.id
        );
        let decision = self
            .ctx
            .operations
            .process_response(
                data,
                ResponseStatus::Failed,
                PeerResponse {
                    error_message: Some(message),
                    ..PeerResponse::default()
                },
            )
            .await?;
        outcome_for(registry, data, decision)
    }

    async fn send_protocol_message(
        &self,
        command: &Command,
        registry: &CommandRegistry,
    ) -> Result<Outcome> {
        let data = &command.data;
        let operation_id = data.operation_id()?;
        let node = data.node()?.clone();
        let session_id = data.session_id()?;
        let name = self.name();

        let payload = P::prepare_message(&self.ctx, data).await?;
        let response = self
            .ctx
            .transport
            .send_message(
                &node.protocol,
                &node.id,
                P::MESSAGE_TYPE,
                operation_id,
                &session_id,
                payload,
                P::config(&self.ctx).timeout(),
            )
            .await;
        self.ctx
            .transport
            .remove_cached_session(operation_id, &session_id, &node.id)
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.ctx.sharding.record_dial_failure(&node.id).await;
                return Err(e);
            }
        };
        self.ctx.sharding.record_seen(&node.id).await;

        let body = ResponsePayload::from_message(&response);
        match response.message_type() {
            Ok(MessageType::Ack) => {
                self.ctx
                    .operations
                    .update_status(operation_id, OperationStatus::Phase(self.kind, P::END))
                    .await;
                match P::handle_ack(&self.ctx, command, registry, body).await? {
                    AckOutcome::Accepted(outcome) => Ok(outcome),
                    AckOutcome::Rejected(message) => {
                        self.mark_response_failed(
                            registry,
                            data,
                            format!("{message} during {name}"),
                        )
                        .await
                    }
                }
            }
            Ok(MessageType::Busy) => {
                debug!("Peer {} busy during {name}, retrying later", node.id);
                Ok(Outcome::Retry)
            }
            Ok(MessageType::Nack) => {
                let reason = body
                    .error_message
                    .map(|m| format!(". Error message: {m}"))
                    .unwrap_or_default();
                let error = NodeError::protocol(
                    format!("Received NACK response from node during {name}{reason}"),
                    Some(node.id.clone()),
                );
                self.mark_response_failed(registry, data, error.to_string())
                    .await
            }
            _ => {
                let error = NodeError::protocol(
                    format!(
                        "Received unknown message type from node during {name}: {}",
                        response.header.message_type
                    ),
                    Some(node.id.clone()),
                );
                warn!("Peer {} broke the {name} exchange: {error}", node.id);
                self.mark_response_failed(registry, data, error.to_string())
                    .await
            }
        }
    }
}

#[async_trait]
impl<P: ProtocolPhase> CommandHandler for ProtocolMessageCommand<P> {
    fn name(&self) -> &'static str {
        P::command_name(self.kind)
    }

    fn default_command(&self) -> Command {
        let policy = P::config(&self.ctx);
        Command::new(self.name())
            .with_retries(policy.retries)
            .with_period(policy.period_ms)
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        if !self.should_send_message(&command.data).await? {
            debug!("Skipping {} for {}: operation already finalized", self.name(), command.id);
            return Ok(Outcome::Empty);
        }
        self.ctx
            .operations
            .update_status(
                command.data.operation_id()?,
                OperationStatus::Phase(self.kind, P::START),
            )
            .await;
        self.send_protocol_message(command, registry).await
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.purge_session(&command.data).await?;
        if !self.should_send_message(&command.data).await? {
            return Ok(Vec::new());
        }
        let outcome = self
            .mark_response_failed(registry, &command.data, error.to_string())
            .await?;
        Ok(into_commands(outcome))
    }

    async fn retry_finished(
        &self,
        command: &Command,
        registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.purge_session(&command.data).await?;
        let message = format!("Max number of retries for protocol message {} reached", self.name());
        let outcome = self
            .mark_response_failed(registry, &command.data, message)
            .await?;
        Ok(into_commands(outcome))
    }
}

fn into_commands(outcome: Outcome) -> Vec<Command> {
    match outcome {
        Outcome::Continue(commands) => commands,
        Outcome::Retry | Outcome::Repeat | Outcome::Empty => Vec::new(),
    }
}
