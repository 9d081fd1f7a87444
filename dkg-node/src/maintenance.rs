//! Permanent housekeeping commands, restarted on every boot.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::{
    command::{Command, CommandHandler, CommandRegistry, Outcome},
    error::Result,
    operation::OperationIdService,
    repository::CommandRepository,
    types::now_ms,
};

pub const COMMANDS_CLEANER_COMMAND: &str = "commandsCleanerCommand";
pub const OPERATION_ID_CLEANER_COMMAND: &str = "operationIdCleanerCommand";

/// Deletes finalized commands older than `max_age_ms`.
pub struct CommandsCleanerCommand {
    repository: Arc<dyn CommandRepository>,
    max_age_ms: u64,
}

impl CommandsCleanerCommand {
    #[must_use]
    pub fn new(repository: Arc<dyn CommandRepository>, max_age_ms: u64) -> Self {
        Self {
            repository,
            max_age_ms,
        }
    }
}

#[async_trait]
impl CommandHandler for CommandsCleanerCommand {
    fn name(&self) -> &'static str {
        COMMANDS_CLEANER_COMMAND
    }

    fn permanent(&self) -> bool {
        true
    }

    fn default_command(&self) -> Command {
        Command::new(self.name()).with_period(self.max_age_ms)
    }

    async fn execute(&self, _command: &Command, _registry: &CommandRegistry) -> Result<Outcome> {
        let removed = self
            .repository
            .remove_finalized_before(now_ms().saturating_sub(self.max_age_ms))
            .await?;
        if removed > 0 {
            info!("Removed {removed} finalized commands");
        }
        Ok(Outcome::Repeat)
    }
}

/// Drops terminal operation records and their cached data.
pub struct OperationIdCleanerCommand {
    operations: Arc<OperationIdService>,
    max_age_ms: u64,
}

impl OperationIdCleanerCommand {
    #[must_use]
    pub fn new(operations: Arc<OperationIdService>, max_age_ms: u64) -> Self {
        Self {
            operations,
            max_age_ms,
        }
    }
}

#[async_trait]
impl CommandHandler for OperationIdCleanerCommand {
    fn name(&self) -> &'static str {
        OPERATION_ID_CLEANER_COMMAND
    }

    fn permanent(&self) -> bool {
        true
    }

    fn default_command(&self) -> Command {
        Command::new(self.name()).with_period(self.max_age_ms)
    }

    async fn execute(&self, _command: &Command, _registry: &CommandRegistry) -> Result<Outcome> {
        let removed = self
            .operations
            .remove_finished_before(now_ms().saturating_sub(self.max_age_ms))
            .await;
        debug!("Removed {removed} finished operations");
        Ok(Outcome::Repeat)
    }
}
