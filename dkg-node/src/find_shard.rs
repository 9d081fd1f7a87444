//! Shard selection for keyed operations.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::task::JoinSet;

use crate::{
    command::{Command, CommandData, CommandHandler, CommandRegistry, Outcome},
    context::Context,
    error::{NodeError, Result},
    network_protocol::{command_names, min_ack_responses, FIND_SHARD_COMMAND},
    operation::OperationStatus,
    sharding::{PeerAddress, ShardingTableService},
    types::{ErrorStage, OperationKind, PeerId, ShardNode},
};

/// A shard split into the local node and the remote members to contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSelection {
    pub local_included: bool,
    /// Closest first
    pub nodes: Vec<ShardNode>,
}

impl ShardSelection {
    #[must_use]
    pub fn found(&self) -> usize {
        self.nodes.len() + usize::from(self.local_included)
    }
}

/// Queries the sharding table and keeps the members reachable on `kind`'s protocol.
pub async fn select_shard(
    sharding: &Arc<dyn ShardingTableService>,
    local: &PeerId,
    data: &CommandData,
) -> Result<ShardSelection> {
    let kind = data.kind()?;
    let shard = sharding
        .find_shard(data.blockchain()?, data.key()?, true)
        .await?;
    let local_included = shard.contains(local);

    let mut lookups = JoinSet::new();
    for (index, peer) in shard.into_iter().filter(|p| p != local).enumerate() {
        let sharding = Arc::clone(sharding);
        lookups.spawn(async move {
            let address = sharding.find_peer_address_and_protocols(&peer).await;
            (index, peer, address)
        });
    }

    let mut resolved: Vec<(usize, PeerAddress)> = Vec::with_capacity(lookups.len());
    while let Some(joined) = lookups.join_next().await {
        let (index, peer, address) =
            joined.map_err(|e| NodeError::internal(format!("address lookup task failed: {e}")))?;
        match address? {
            Some(address) if address.protocols.iter().any(|p| p == kind.network_protocol()) => {
                resolved.push((index, address));
            }
            Some(_) => debug!("Peer {peer} does not support {}", kind.network_protocol()),
            None => debug!("No address known for peer {peer}"),
        }
    }
    // lookups finish in any order
    resolved.sort_unstable_by_key(|(index, _)| *index);

    Ok(ShardSelection {
        local_included,
        nodes: resolved
            .into_iter()
            .map(|(_, address)| ShardNode {
                id: address.id,
                protocol: kind.network_protocol().to_owned(),
            })
            .collect(),
    })
}

pub struct FindShardCommand {
    ctx: Context,
}

impl FindShardCommand {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Commands that follow shard selection for `kind`.
    fn operation_sequence(kind: OperationKind, local_included: bool) -> Vec<&'static str> {
        let names = command_names(kind);
        names
            .local
            .filter(|_| local_included)
            .into_iter()
            .chain([names.network])
            .collect()
    }
}

#[async_trait]
impl CommandHandler for FindShardCommand {
    fn name(&self) -> &'static str {
        FIND_SHARD_COMMAND
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        let data = &command.data;
        let operation_id = data.operation_id()?;
        let kind = data.kind()?;
        let min_acks = min_ack_responses(kind, &self.ctx.config, data.min_ack_responses);

        self.ctx
            .operations
            .update_status(operation_id, OperationStatus::FindNodesStart)
            .await;

        let selection = select_shard(&self.ctx.sharding, self.ctx.peer_id(), data).await?;
        info!(
            "Operation {operation_id}: found {} shard nodes for {} on {}, local included: {}",
            selection.nodes.len(),
            data.key()?,
            data.blockchain()?,
            selection.local_included
        );

        if selection.found() < min_acks {
            let error = NodeError::InsufficientShard {
                operation_id: operation_id.to_string(),
                required: min_acks,
                found: selection.found(),
            };
            self.ctx
                .fail_operation(data, ErrorStage::FindShard, error.to_string())
                .await?;
            return Ok(Outcome::Empty);
        }

        let sequence = command
            .sequence
            .append(Self::operation_sequence(kind, selection.local_included));
        let next = CommandData {
            min_ack_responses: Some(min_acks),
            number_of_found_nodes: selection.found(),
            leftover_nodes: selection.nodes,
            ..data.clone()
        };
        self.ctx
            .operations
            .update_status(operation_id, OperationStatus::FindNodesEnd)
            .await;
        registry.continue_sequence(next, &sequence)
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.ctx
            .fail_operation(&command.data, ErrorStage::FindShard, error.to_string())
            .await?;
        Ok(Vec::new())
    }
}
