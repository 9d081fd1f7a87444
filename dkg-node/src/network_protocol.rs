//! Planning steps between shard selection and the per-peer chains.

use async_trait::async_trait;
use log::{debug, info};

use crate::{
    command::{Command, CommandData, CommandHandler, CommandRegistry, Outcome, Sequence},
    config::NodeConfig,
    context::Context,
    error::{NodeError, Result},
    operation::{OperationPhase, OperationStatus},
    protocol::outcome_for,
    types::{ErrorStage, OperationKind},
};

/// Command names making up one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandNames {
    pub entry: &'static [&'static str],
    pub local: Option<&'static str>,
    pub network: &'static str,
    pub schedule: &'static str,
    pub init: &'static str,
    pub request: &'static str,
}

pub const VALIDATE_ASSERTION_COMMAND: &str = "validateAssertionCommand";
pub const FIND_SHARD_COMMAND: &str = "findShardCommand";

#[must_use]
pub const fn command_names(kind: OperationKind) -> CommandNames {
    match kind {
        OperationKind::Publish => CommandNames {
            entry: &[VALIDATE_ASSERTION_COMMAND, FIND_SHARD_COMMAND],
            local: Some("localStoreCommand"),
            network: "networkPublishCommand",
            schedule: "publishScheduleMessagesCommand",
            init: "publishInitCommand",
            request: "publishRequestCommand",
        },
        OperationKind::Update => CommandNames {
            entry: &[VALIDATE_ASSERTION_COMMAND, FIND_SHARD_COMMAND],
            local: Some("localUpdateCommand"),
            network: "networkUpdateCommand",
            schedule: "updateScheduleMessagesCommand",
            init: "updateInitCommand",
            request: "updateRequestCommand",
        },
        OperationKind::Get => CommandNames {
            entry: &[FIND_SHARD_COMMAND],
            local: Some("localGetCommand"),
            network: "networkGetCommand",
            schedule: "getScheduleMessagesCommand",
            init: "getInitCommand",
            request: "getRequestCommand",
        },
        OperationKind::Search => CommandNames {
            entry: &[FIND_SHARD_COMMAND],
            local: None,
            network: "networkSearchCommand",
            schedule: "searchScheduleMessagesCommand",
            init: "searchInitCommand",
            request: "searchRequestCommand",
        },
    }
}

/// Caller override, else the per-kind default.
#[must_use]
pub fn min_ack_responses(
    kind: OperationKind,
    config: &NodeConfig,
    requested: Option<usize>,
) -> usize {
    requested.unwrap_or(match kind {
        OperationKind::Publish | OperationKind::Update => config.replication.min_ack_responses,
        OperationKind::Get | OperationKind::Search => 1,
    })
}

impl CommandNames {
    /// Every name an operation of this kind can put in a sequence.
    pub fn all(&self) -> impl Iterator<Item = &'static str> {
        self.entry
            .iter()
            .copied()
            .chain(self.local)
            .chain([self.network, self.schedule, self.init, self.request])
    }
}

/// Computes batch size and ack threshold, then hands over to scheduling.
pub struct NetworkProtocolCommand {
    kind: OperationKind,
    ctx: Context,
}

impl NetworkProtocolCommand {
    #[must_use]
    pub fn new(kind: OperationKind, ctx: Context) -> Self {
        Self { kind, ctx }
    }

    fn batch_size(&self) -> usize {
        self.ctx.config.replication.batch_size
    }
}

#[async_trait]
impl CommandHandler for NetworkProtocolCommand {
    fn name(&self) -> &'static str {
        command_names(self.kind).network
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        let operation_id = command.data.operation_id()?;
        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(self.kind, OperationPhase::NetworkStart),
            )
            .await;

        let data = CommandData {
            min_ack_responses: Some(min_ack_responses(
                self.kind,
                &self.ctx.config,
                command.data.min_ack_responses,
            )),
            batch_size: Some(self.batch_size()),
            error_type: Some(self.kind.error_type(ErrorStage::Start)),
            ..command.data.clone()
        };
        info!(
            "Operation {operation_id}: {} over {} nodes, batch size {}, min acks {}",
            self.kind,
            data.leftover_nodes.len(),
            self.batch_size(),
            data.min_ack_responses.unwrap_or_default()
        );
        let schedule = registry.instantiate(
            command_names(self.kind).schedule,
            data,
            Sequence::default(),
        )?;
        Ok(Outcome::Continue(vec![schedule]))
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.ctx
            .fail_operation(&command.data, ErrorStage::Start, error.to_string())
            .await?;
        Ok(Vec::new())
    }
}

/// Fans out one protocol chain per node of the next batch.
pub struct ScheduleMessagesCommand {
    kind: OperationKind,
    ctx: Context,
}

impl ScheduleMessagesCommand {
    #[must_use]
    pub fn new(kind: OperationKind, ctx: Context) -> Self {
        Self { kind, ctx }
    }
}

#[async_trait]
impl CommandHandler for ScheduleMessagesCommand {
    fn name(&self) -> &'static str {
        command_names(self.kind).schedule
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        let data = &command.data;
        let operation_id = data.operation_id()?;
        if self.ctx.operations.is_finalized(operation_id).await {
            return Ok(Outcome::Empty);
        }

        let batch_size = data
            .batch_size
            .unwrap_or(self.ctx.config.replication.batch_size)
            .max(1);
        let split = batch_size.min(data.leftover_nodes.len());
        let (batch, rest) = data.leftover_nodes.split_at(split);

        if batch.is_empty() {
            debug!("Operation {operation_id}: no nodes left to contact");
            let decision = self.ctx.operations.evaluate(data).await?;
            return outcome_for(registry, data, decision);
        }

        self.ctx
            .operations
            .responses()
            .expect(operation_id, data.key()?, batch.len())
            .await;

        let names = command_names(self.kind);
        let chains = batch
            .iter()
            .map(|node| {
                let child = CommandData {
                    node: Some(node.clone()),
                    leftover_nodes: rest.to_vec(),
                    ..data.clone()
                };
                registry.instantiate(names.init, child, Sequence::new([names.request]))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Operation {operation_id}: contacting {} nodes, {} left over",
            chains.len(),
            rest.len()
        );
        Ok(Outcome::Continue(chains))
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.ctx
            .fail_operation(&command.data, ErrorStage::Start, error.to_string())
            .await?;
        Ok(Vec::new())
    }
}
