//! Command executor
//!
//! Every command runs on its own task: it sleeps until `ready_at`, takes one
//! of `parallelism` permits and executes. A chain only advances when a
//! command returns `Outcome::Continue`, so commands of one chain never overlap
//! while independent chains run concurrently.

use std::{sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};
use tokio::{
    sync::{mpsc, Mutex, Semaphore},
    task::JoinSet,
};
use uuid::Uuid;

use crate::{
    command::{Command, CommandRegistry, CommandStatus, Outcome, MAX_COMMAND_DELAY_MS},
    config::ExecutorConfig,
    error::{NodeError, Result},
    repository::{CommandRepository, RepositoryOp},
    types::now_ms,
};

pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    repository: Arc<dyn CommandRepository>,
    queue: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    permits: Arc<Semaphore>,
    verbose: bool,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<CommandRegistry>,
        repository: Arc<dyn CommandRepository>,
        config: &ExecutorConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            registry,
            repository,
            queue,
            receiver: Mutex::new(Some(receiver)),
            permits: Arc::new(Semaphore::new(config.parallelism.max(1))),
            verbose: config.verbose_logging,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn repository(&self) -> &Arc<dyn CommandRepository> {
        &self.repository
    }

    /// Persists and enqueues a new command.
    pub async fn add(&self, mut command: Command) -> Result<Uuid> {
        self.registry.validate(
            std::iter::once(command.name.as_str()).chain(command.sequence.iter()),
        )?;
        command.ready_at = now_ms().saturating_add(command.delay_ms);
        command.set_status(CommandStatus::Pending, None);
        self.repository.insert(&command).await?;
        let id = command.id;
        self.enqueue(command)?;
        Ok(id)
    }

    /// Restarts every permanent command, dropping instances left from a previous run.
    pub async fn init(&self) -> Result<()> {
        let permanent: Vec<Command> = self
            .registry
            .handlers()
            .filter(|h| h.permanent())
            .map(|h| h.default_command())
            .collect();
        for command in permanent {
            let removed = self.repository.remove_by_name(&command.name).await?;
            if removed > 0 {
                debug!("Removed {removed} stale {} commands", command.name);
            }
            self.add(command).await?;
        }
        Ok(())
    }

    /// Re-enqueues commands that were not finalized before the last shutdown.
    pub async fn replay(&self) -> Result<usize> {
        let mut replayed = 0;
        for mut command in self.repository.pending().await? {
            match self.registry.get(&command.name) {
                Some(handler) if handler.permanent() => {}
                Some(_) => {
                    self.enqueue(command)?;
                    replayed += 1;
                }
                None => {
                    warn!("Dropping replayed command with unknown name {command}");
                    command.set_status(
                        CommandStatus::Failed,
                        Some(format!("Unknown command: {}", command.name)),
                    );
                    self.repository.update(&command).await?;
                }
            }
        }
        info!("Replayed {replayed} pending commands");
        Ok(replayed)
    }

    /// Receives queued commands until the executor is dropped. Aborting this
    /// future aborts every command task it spawned.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| NodeError::invalid_state("command executor is already running"))?;
        info!(
            "Command executor started with parallelism {}",
            self.permits.available_permits()
        );

        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                received = receiver.recv() => {
                    let Some(command) = received else { break };
                    let executor = Arc::clone(&self);
                    running.spawn(async move { executor.schedule(command).await });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("Command task ended abnormally: {e}");
                    }
                }
            }
        }
        while running.join_next().await.is_some() {}
        Ok(())
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        self.queue
            .send(command)
            .map_err(|_| NodeError::invalid_state("command executor stopped"))
    }

    async fn schedule(self: Arc<Self>, command: Command) {
        let now = now_ms();
        if command.ready_at > now {
            let wait = (command.ready_at - now).min(MAX_COMMAND_DELAY_MS);
            tokio::time::sleep(Duration::from_millis(wait)).await;
            if command.ready_at > now_ms() {
                if let Err(e) = self.enqueue(command) {
                    error!("Failed to re-arm delayed command: {e}");
                }
                return;
            }
        }

        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let label = command.to_string();
        if let Err(e) = self.process(command).await {
            error!("Command executor failed on {label}: {e}");
        }
    }

    async fn process(&self, mut command: Command) -> Result<()> {
        let Some(handler) = self.registry.get(&command.name).cloned() else {
            command.set_status(
                CommandStatus::Failed,
                Some(format!("Unknown command: {}", command.name)),
            );
            self.repository.update(&command).await?;
            return Err(NodeError::unknown_command(command.name));
        };

        if command.deadline_at.is_some_and(|deadline| deadline <= now_ms()) {
            command.set_status(CommandStatus::Expired, None);
            self.repository.update(&command).await?;
            return handler.expired(&command).await;
        }

        if command.status != CommandStatus::Repeating {
            command.set_status(CommandStatus::Started, None);
            self.repository.update(&command).await?;
        }
        if self.verbose {
            trace!("Command {command} started");
        }

        let outcome = handler
            .execute(&command, &self.registry)
            .await
            .and_then(|outcome| self.checked(outcome));

        match outcome {
            Ok(Outcome::Continue(children)) => {
                command.set_status(CommandStatus::Completed, None);
                self.finish(&command, children).await?;
            }
            Ok(Outcome::Empty) => {
                command.set_status(CommandStatus::Completed, None);
                self.finish(&command, Vec::new()).await?;
            }
            Ok(Outcome::Repeat) => {
                command.set_status(CommandStatus::Repeating, None);
                command.ready_at = now_ms().saturating_add(command.period_ms);
                self.repository.update(&command).await?;
                self.enqueue(command)?;
                return Ok(());
            }
            Ok(Outcome::Retry) if command.retries > 0 => {
                command.retries -= 1;
                command.set_status(CommandStatus::Pending, None);
                command.ready_at = now_ms()
                    .saturating_add(command.period_ms)
                    .saturating_add(command.delay_ms);
                debug!(
                    "Retrying command {command}, {} retries left",
                    command.retries
                );
                self.repository.update(&command).await?;
                self.enqueue(command)?;
                return Ok(());
            }
            Ok(Outcome::Retry) => {
                let followups = handler
                    .retry_finished(&command, &self.registry)
                    .await
                    .unwrap_or_else(|e| {
                        error!("retry_finished hook of {command} failed: {e}");
                        Vec::new()
                    });
                command.set_status(
                    CommandStatus::Failed,
                    Some("Max number of retries reached".to_string()),
                );
                self.finish(&command, followups).await?;
            }
            Err(e) => {
                command.set_status(CommandStatus::Failed, Some(e.to_string()));
                let recovered = match handler.recover(&command, &e, &self.registry).await {
                    Ok(recovered) => recovered,
                    Err(recover_err) => {
                        error!("Recovery of {command} failed: {recover_err}");
                        Vec::new()
                    }
                };
                self.finish(&command, recovered).await?;
            }
        }

        if self.verbose {
            trace!("Command {command} finished with status {:?}", command.status);
        }
        Ok(())
    }

    fn checked(&self, outcome: Outcome) -> Result<Outcome> {
        if let Outcome::Continue(children) = &outcome {
            self.registry.validate(
                children
                    .iter()
                    .flat_map(|c| std::iter::once(c.name.as_str()).chain(c.sequence.iter())),
            )?;
        }
        Ok(outcome)
    }

    /// Persists the parent's final status alongside its children, then enqueues them.
    async fn finish(&self, parent: &Command, children: Vec<Command>) -> Result<()> {
        let now = now_ms();
        let children: Vec<Command> = children
            .into_iter()
            .map(|mut child| {
                child.parent_id = Some(parent.id);
                child.ready_at = now.saturating_add(child.delay_ms);
                child.status = CommandStatus::Pending;
                child
            })
            .collect();

        if parent.transactional {
            let mut batch = Vec::with_capacity(children.len() + 1);
            batch.push(RepositoryOp::Update(parent.clone()));
            batch.extend(children.iter().cloned().map(RepositoryOp::Insert));
            self.repository.apply(batch).await?;
        } else {
            self.repository.update(parent).await?;
            for child in &children {
                self.repository.insert(child).await?;
            }
        }

        for child in children {
            self.enqueue(child)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        command::{CommandHandler, Sequence},
        repository::MemoryRepository,
    };

    struct Counting {
        name: &'static str,
        runs: AtomicUsize,
        behaviour: fn(usize) -> Option<Outcome>,
        retries: u32,
    }

    #[async_trait]
    impl CommandHandler for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        fn default_command(&self) -> Command {
            Command::new(self.name)
                .with_retries(self.retries)
                .with_period(5)
        }

        async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            match (self.behaviour)(run) {
                Some(outcome) => Ok(outcome),
                None => registry.continue_sequence(command.data.clone(), &command.sequence),
            }
        }
    }

    fn counting(
        name: &'static str,
        retries: u32,
        behaviour: fn(usize) -> Option<Outcome>,
    ) -> Arc<Counting> {
        Arc::new(Counting {
            name,
            runs: AtomicUsize::new(0),
            behaviour,
            retries,
        })
    }

    async fn start(handlers: Vec<Arc<Counting>>) -> (Arc<CommandExecutor>, Arc<MemoryRepository>) {
        let mut registry = CommandRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        let repository = Arc::new(MemoryRepository::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::new(registry),
            repository.clone(),
            &ExecutorConfig::default(),
        ));
        tokio::spawn(Arc::clone(&executor).run());
        (executor, repository)
    }

    async fn wait_for_status(repo: &MemoryRepository, id: Uuid, status: CommandStatus) -> Command {
        for _ in 0..200 {
            if let Some(command) = repo.get(id).await.unwrap() {
                if command.status == status {
                    return command;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("command {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let a = counting("a", 0, |_| None);
        let b = counting("b", 0, |_| None);
        let (executor, repo) = start(vec![a.clone(), b.clone()]).await;

        let id = executor
            .add(Command::new("a").with_sequence(Sequence::new(["b"])))
            .await
            .unwrap();
        wait_for_status(&repo, id, CommandStatus::Completed).await;
        for _ in 0..100 {
            if b.runs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.runs.load(Ordering::SeqCst), 1);
        assert_eq!(b.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_consumes_retries_then_fails() {
        let flaky = counting("flaky", 2, |_| Some(Outcome::Retry));
        let (executor, repo) = start(vec![flaky.clone()]).await;

        let id = executor.add(Command::new("flaky").with_retries(2).with_period(5)).await.unwrap();
        let command = wait_for_status(&repo, id, CommandStatus::Failed).await;
        assert_eq!(flaky.runs.load(Ordering::SeqCst), 3);
        assert_eq!(command.retries, 0);
    }

    #[tokio::test]
    async fn test_unknown_names_are_rejected_on_add() {
        let (executor, _repo) = start(vec![counting("a", 0, |_| None)]).await;
        let result = executor
            .add(Command::new("a").with_sequence(Sequence::new(["nope"])))
            .await;
        assert!(matches!(result, Err(NodeError::UnknownCommand { .. })));
    }

    #[tokio::test]
    async fn test_expired_command_is_not_executed() {
        let a = counting("a", 0, |_| None);
        let (executor, repo) = start(vec![a.clone()]).await;
        let id = executor
            .add(Command::new("a").with_delay(20).with_deadline(now_ms()))
            .await
            .unwrap();
        wait_for_status(&repo, id, CommandStatus::Expired).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeat_reschedules_until_empty() {
        let ticker = counting("ticker", 0, |run| {
            Some(if run < 2 { Outcome::Repeat } else { Outcome::Empty })
        });
        let (executor, repo) = start(vec![ticker.clone()]).await;
        let id = executor.add(Command::new("ticker").with_period(5)).await.unwrap();
        wait_for_status(&repo, id, CommandStatus::Completed).await;
        assert_eq!(ticker.runs.load(Ordering::SeqCst), 3);
    }
}
