//! Steps an operation runs against the local node only.

use async_trait::async_trait;
use log::{debug, info};

use crate::{
    command::{Command, CommandHandler, CommandRegistry, Outcome},
    context::Context,
    error::{NodeError, Result},
    network_protocol::{command_names, VALIDATE_ASSERTION_COMMAND},
    operation::{OperationPhase, OperationResult, OperationStatus},
    types::{dataset_root, Assertion, ErrorStage, OperationKind},
};

async fn cached_assertion(ctx: &Context, command: &Command) -> Result<Assertion> {
    let operation_id = command.data.operation_id()?;
    ctx.operations
        .cached_data(operation_id)
        .await
        .ok_or_else(|| {
            NodeError::invalid_state(format!("no cached assertion for operation {operation_id}"))
        })
}

/// Checks that the cached assertion hashes to the key it was submitted under.
pub struct ValidateAssertionCommand {
    ctx: Context,
}

impl ValidateAssertionCommand {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for ValidateAssertionCommand {
    fn name(&self) -> &'static str {
        VALIDATE_ASSERTION_COMMAND
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        let data = &command.data;
        let operation_id = data.operation_id()?;
        let kind = data.kind()?;
        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(kind, OperationPhase::ValidateAssertionStart),
            )
            .await;

        let assertion = self
            .ctx
            .operations
            .cached_data(operation_id)
            .await
            .unwrap_or_default();
        let key = data.key()?;
        let problem = if assertion.is_empty() {
            Some("Assertion is empty".to_string())
        } else {
            let root = dataset_root(&assertion);
            (root != key).then(|| format!("Invalid dataset root {key}, assertion hashes to {root}"))
        };
        if let Some(message) = problem {
            self.ctx
                .fail_operation(data, ErrorStage::Validate, message)
                .await?;
            return Ok(Outcome::Empty);
        }

        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(kind, OperationPhase::ValidateAssertionEnd),
            )
            .await;
        registry.continue_sequence(data.clone(), &command.sequence)
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.ctx
            .fail_operation(&command.data, ErrorStage::Validate, error.to_string())
            .await?;
        Ok(Vec::new())
    }
}

/// Stores the assertion locally and counts it as one ACK.
pub struct LocalStoreCommand {
    kind: OperationKind,
    ctx: Context,
}

impl LocalStoreCommand {
    #[must_use]
    pub fn new(kind: OperationKind, ctx: Context) -> Self {
        Self { kind, ctx }
    }
}

#[async_trait]
impl CommandHandler for LocalStoreCommand {
    fn name(&self) -> &'static str {
        command_names(self.kind).local.unwrap_or("localStoreCommand")
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        let data = &command.data;
        let operation_id = data.operation_id()?;
        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(self.kind, OperationPhase::LocalStoreStart),
            )
            .await;

        let assertion = cached_assertion(&self.ctx, command).await?;
        self.ctx
            .store
            .insert_assertion(data.blockchain()?, data.key()?, &assertion)
            .await?;
        let counts = self.ctx.operations.record_local_response(data).await?;
        debug!(
            "Operation {operation_id}: stored {} triples locally, {}/{} responses",
            assertion.len(),
            counts.completed,
            counts.expected
        );

        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(self.kind, OperationPhase::LocalStoreEnd),
            )
            .await;
        registry.continue_sequence(data.clone(), &command.sequence)
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.ctx
            .fail_operation(&command.data, ErrorStage::Local, error.to_string())
            .await?;
        Ok(Vec::new())
    }
}

/// Answers a get from the local store when possible.
pub struct LocalGetCommand {
    ctx: Context,
}

impl LocalGetCommand {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for LocalGetCommand {
    fn name(&self) -> &'static str {
        command_names(OperationKind::Get).local.unwrap_or("localGetCommand")
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
        let data = &command.data;
        let operation_id = data.operation_id()?;
        let key = data.key()?;
        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(OperationKind::Get, OperationPhase::LocalStart),
            )
            .await;

        if let Some(assertion) = self.ctx.store.get_assertion(data.blockchain()?, key).await? {
            info!("Operation {operation_id}: {key} found locally");
            self.ctx
                .operations
                .mark_completed(
                    operation_id,
                    OperationResult::Assertion {
                        key: key.to_owned(),
                        assertion,
                    },
                )
                .await;
            return Ok(Outcome::Empty);
        }

        self.ctx
            .operations
            .update_status(
                operation_id,
                OperationStatus::Phase(OperationKind::Get, OperationPhase::LocalEnd),
            )
            .await;
        registry.continue_sequence(data.clone(), &command.sequence)
    }

    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        self.ctx
            .fail_operation(&command.data, ErrorStage::Local, error.to_string())
            .await?;
        Ok(Vec::new())
    }
}
