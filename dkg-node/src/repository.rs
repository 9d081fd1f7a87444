//! Durable storage for commands so pending work survives a restart.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    command::Command,
    error::Result,
    journal::{Change, Journal},
};

const JOURNAL_FILE: &str = "commands.log";

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum RepositoryOp {
    Insert(Command),
    Update(Command),
}

#[async_trait]
pub trait CommandRepository: Send + Sync {
    /// Applies every operation or none of them.
    async fn apply(&self, batch: Vec<RepositoryOp>) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Command>>;

    /// Commands that were not finalized, oldest first.
    async fn pending(&self) -> Result<Vec<Command>>;

    /// Deletes finalized commands last touched before `timestamp`.
    async fn remove_finalized_before(&self, timestamp: u64) -> Result<usize>;

    /// Deletes every command with this name regardless of status.
    async fn remove_by_name(&self, name: &str) -> Result<usize>;

    async fn insert(&self, command: &Command) -> Result<()> {
        self.apply(vec![RepositoryOp::Insert(command.clone())]).await
    }

    async fn update(&self, command: &Command) -> Result<()> {
        self.apply(vec![RepositoryOp::Update(command.clone())]).await
    }
}

fn apply_ops(commands: &mut HashMap<Uuid, Command>, batch: Vec<RepositoryOp>) {
    for op in batch {
        match op {
            RepositoryOp::Insert(command) | RepositoryOp::Update(command) => {
                commands.insert(command.id, command);
            }
        }
    }
}

fn pending_of(commands: &HashMap<Uuid, Command>) -> Vec<Command> {
    let mut pending: Vec<Command> = commands
        .values()
        .filter(|c| c.status.is_replayable())
        .cloned()
        .collect();
    pending.sort_by_key(|c| (c.created_at, c.id));
    pending
}

fn retain_counted(
    commands: &mut HashMap<Uuid, Command>,
    keep: impl Fn(&Command) -> bool,
) -> usize {
    let before = commands.len();
    commands.retain(|_, c| keep(c));
    before - commands.len()
}

#[derive(Default)]
pub struct MemoryRepository {
    commands: Mutex<HashMap<Uuid, Command>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.commands.lock().await.len()
    }
}

#[async_trait]
impl CommandRepository for MemoryRepository {
    async fn apply(&self, batch: Vec<RepositoryOp>) -> Result<()> {
        apply_ops(&mut *self.commands.lock().await, batch);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Command>> {
        Ok(self.commands.lock().await.get(&id).cloned())
    }

    async fn pending(&self) -> Result<Vec<Command>> {
        Ok(pending_of(&*self.commands.lock().await))
    }

    async fn remove_finalized_before(&self, timestamp: u64) -> Result<usize> {
        let mut commands = self.commands.lock().await;
        Ok(retain_counted(&mut commands, |c| {
            !(c.status.is_finalized() && c.updated_at < timestamp)
        }))
    }

    async fn remove_by_name(&self, name: &str) -> Result<usize> {
        let mut commands = self.commands.lock().await;
        Ok(retain_counted(&mut commands, |c| c.name != name))
    }
}

/// Commands journaled under a data directory.
///
/// A batch is one appended line, so a transactional update and its
/// children reach the disk together or not at all.
pub struct FileRepository {
    journal: Journal<Uuid, Command>,
}

impl FileRepository {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let journal = Journal::open(data_dir.as_ref().join(JOURNAL_FILE)).await?;
        debug!(
            "Opened command repository in {} with {} commands",
            data_dir.as_ref().display(),
            journal.read(HashMap::len).await
        );
        Ok(Self { journal })
    }
}

#[async_trait]
impl CommandRepository for FileRepository {
    async fn apply(&self, batch: Vec<RepositoryOp>) -> Result<()> {
        let changes = batch
            .into_iter()
            .map(|op| match op {
                RepositoryOp::Insert(command) | RepositoryOp::Update(command) => Change::Put {
                    key: command.id,
                    value: command,
                },
            })
            .collect();
        self.journal.apply(changes).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Command>> {
        Ok(self.journal.get(&id).await)
    }

    async fn pending(&self) -> Result<Vec<Command>> {
        Ok(self.journal.read(pending_of).await)
    }

    async fn remove_finalized_before(&self, timestamp: u64) -> Result<usize> {
        self.journal
            .retain(|c| !(c.status.is_finalized() && c.updated_at < timestamp))
            .await
    }

    async fn remove_by_name(&self, name: &str) -> Result<usize> {
        self.journal.retain(|c| c.name != name).await
    }
}
