//! Shared node context handed to every command handler.

use std::sync::Arc;

use crate::{
    command::CommandData,
    config::NodeConfig,
    error::Result,
    operation::OperationIdService,
    sharding::ShardingTableService,
    store::TripleStore,
    transport::NetworkTransport,
    types::{ErrorStage, PeerId},
};

#[derive(Clone)]
pub struct Context {
    pub config: Arc<NodeConfig>,
    pub transport: Arc<dyn NetworkTransport>,
    pub sharding: Arc<dyn ShardingTableService>,
    pub operations: Arc<OperationIdService>,
    pub store: Arc<dyn TripleStore>,
}

impl Context {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.transport.peer_id()
    }

    /// Fails the whole operation `data` belongs to.
    pub async fn fail_operation(
        &self,
        data: &CommandData,
        stage: ErrorStage,
        message: impl Into<String>,
    ) -> Result<()> {
        let error_type = data.kind()?.error_type(stage);
        self.operations
            .mark_failed(data.operation_id()?, error_type, message)
            .await;
        Ok(())
    }
}
