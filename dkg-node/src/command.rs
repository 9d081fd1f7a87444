//! Scheduled units of work and the handler interface.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{NodeError, Result},
    types::{now_ms, BlockchainId, ErrorType, OperationKind, ShardNode},
};

/// Interval used by repeating commands that don't set their own period.
pub const DEFAULT_COMMAND_REPEAT_INTERVAL_MS: u64 = 5_000;

/// Longest single wait the executor will schedule; longer delays are re-armed.
pub const MAX_COMMAND_DELAY_MS: u64 = 10 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Started,
    Repeating,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    /// Whether the command still has work to do after a restart.
    #[must_use]
    pub const fn is_replayable(self) -> bool {
        matches!(self, Self::Pending | Self::Started | Self::Repeating)
    }

    #[must_use]
    pub const fn is_finalized(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// Names of the commands still to run, front first.
///
/// Never mutated in place: every step yields a fresh value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(Vec<String>);

impl Sequence {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Splits off the next command name.
    #[must_use]
    pub fn pop_front(&self) -> Option<(&str, Self)> {
        self.0
            .split_first()
            .map(|(head, tail)| (head.as_str(), Self(tail.to_vec())))
    }

    /// New sequence with `names` run after the current entries.
    #[must_use]
    pub fn append<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = self.0.clone();
        out.extend(names.into_iter().map(Into::into));
        Self(out)
    }
}

/// Typed payload carried along a command chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandData {
    pub operation_id: Option<Uuid>,
    pub kind: Option<OperationKind>,
    pub blockchain: Option<BlockchainId>,
    /// Dataset root for publish/update/get, the keyword for search
    pub key: Option<String>,
    pub min_ack_responses: Option<usize>,
    pub batch_size: Option<usize>,
    /// Peer the protocol chain talks to
    pub node: Option<ShardNode>,
    pub leftover_nodes: Vec<ShardNode>,
    pub number_of_found_nodes: usize,
    pub error_type: Option<ErrorType>,
    /// Result limit for search
    pub limit: Option<usize>,
}

impl CommandData {
    pub fn operation_id(&self) -> Result<Uuid> {
        self.operation_id
            .ok_or_else(|| NodeError::invalid_state("command data carries no operation id"))
    }

    pub fn kind(&self) -> Result<OperationKind> {
        self.kind
            .ok_or_else(|| NodeError::invalid_state("command data carries no operation kind"))
    }

    pub fn blockchain(&self) -> Result<&BlockchainId> {
        self.blockchain
            .as_ref()
            .ok_or_else(|| NodeError::invalid_state("command data carries no blockchain"))
    }

    pub fn key(&self) -> Result<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| NodeError::invalid_state("command data carries no key"))
    }

    pub fn node(&self) -> Result<&ShardNode> {
        self.node
            .as_ref()
            .ok_or_else(|| NodeError::invalid_state("command data carries no target node"))
    }

    /// Deterministic session id shared by every attempt against the same peer.
    pub fn session_id(&self) -> Result<String> {
        Ok(format!("{}:{}", self.operation_id()?, self.key()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub name: String,
    pub data: CommandData,
    pub sequence: Sequence,
    pub delay_ms: u64,
    pub period_ms: u64,
    pub retries: u32,
    pub transactional: bool,
    /// Earliest execution time, unix ms
    pub ready_at: u64,
    /// Commands still queued past this instant expire instead of running
    pub deadline_at: Option<u64>,
    pub status: CommandStatus,
    pub message: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data: CommandData::default(),
            sequence: Sequence::default(),
            delay_ms: 0,
            period_ms: DEFAULT_COMMAND_REPEAT_INTERVAL_MS,
            retries: 0,
            transactional: false,
            ready_at: now,
            deadline_at: None,
            status: CommandStatus::Pending,
            message: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: CommandData) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub const fn with_period(mut self, period_ms: u64) -> Self {
        self.period_ms = period_ms;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_deadline(mut self, deadline_at: u64) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    #[must_use]
    pub const fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub(crate) fn set_status(&mut self, status: CommandStatus, message: Option<String>) {
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        self.updated_at = now_ms();
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Result of one execution attempt.
#[derive(Debug)]
pub enum Outcome {
    /// Enqueue these commands; the current one is complete.
    Continue(Vec<Command>),
    /// Run the same command again after its period, consuming one retry.
    Retry,
    /// Run the same command again after its period, indefinitely.
    Repeat,
    /// Done; any remaining sequence is dropped.
    Empty,
}

/// Behaviour behind one command name.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Permanent commands are restarted by `CommandExecutor::init` and never replayed.
    fn permanent(&self) -> bool {
        false
    }

    /// Policy a freshly sequenced command of this kind starts with.
    fn default_command(&self) -> Command {
        Command::new(self.name())
    }

    async fn execute(&self, command: &Command, registry: &CommandRegistry) -> Result<Outcome>;

    /// Called after `execute` returned an error. Returned commands are enqueued.
    async fn recover(
        &self,
        command: &Command,
        error: &NodeError,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        log::warn!("Command {command} failed: {error}");
        Ok(Vec::new())
    }

    /// Called once `Retry` was returned with no retries left. Returned commands are enqueued.
    async fn retry_finished(
        &self,
        command: &Command,
        _registry: &CommandRegistry,
    ) -> Result<Vec<Command>> {
        log::warn!("Max retries reached for command {command}");
        Ok(Vec::new())
    }

    async fn expired(&self, command: &Command) -> Result<()> {
        log::warn!("Command {command} expired before it could run");
        Ok(())
    }
}

/// Name to handler table, built once at node construction.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(name)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn CommandHandler>> {
        self.handlers.values()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Fails on the first name with no registered handler.
    pub fn validate<'a, I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .find(|name| !self.contains(name))
            .map_or(Ok(()), |name| Err(NodeError::unknown_command(name)))
    }

    /// Builds a command of kind `name` from its handler's defaults.
    pub fn instantiate(
        &self,
        name: &str,
        data: CommandData,
        sequence: Sequence,
    ) -> Result<Command> {
        let handler = self
            .get(name)
            .ok_or_else(|| NodeError::unknown_command(name))?;
        Ok(handler
            .default_command()
            .with_data(data)
            .with_sequence(sequence))
    }

    /// Outcome that hands `data` to the next command in `sequence`.
    pub fn continue_sequence(&self, data: CommandData, sequence: &Sequence) -> Result<Outcome> {
        let Some((name, rest)) = sequence.pop_front() else {
            return Ok(Outcome::Empty);
        };
        Ok(Outcome::Continue(vec![self.instantiate(name, data, rest)?]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str, u32);

    #[async_trait]
    impl CommandHandler for Noop {
        fn name(&self) -> &'static str {
            self.0
        }

        fn default_command(&self) -> Command {
            Command::new(self.0).with_retries(self.1).with_period(50)
        }

        async fn execute(&self, _: &Command, _: &CommandRegistry) -> Result<Outcome> {
            Ok(Outcome::Empty)
        }
    }

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(Noop("first", 0)));
        registry.register(Arc::new(Noop("second", 3)));
        registry
    }

    #[test]
    fn test_sequence_next_leaves_original_untouched() {
        let seq = Sequence::new(["a", "b", "c"]);
        let (head, rest) = seq.pop_front().unwrap();
        assert_eq!(head, "a");
        assert_eq!(rest, Sequence::new(["b", "c"]));
        assert_eq!(seq.len(), 3);
        assert!(Sequence::default().pop_front().is_none());
        assert_eq!(rest.append(["x"]), Sequence::new(["b", "c", "x"]));
    }

    #[test]
    fn test_continue_sequence_uses_handler_defaults() {
        let registry = registry();
        let data = CommandData {
            key: Some("root".into()),
            ..CommandData::default()
        };
        let outcome = registry
            .continue_sequence(data, &Sequence::new(["second", "first"]))
            .unwrap();
        let Outcome::Continue(commands) = outcome else {
            panic!("expected continuation");
        };
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "second");
        assert_eq!(commands[0].retries, 3);
        assert_eq!(commands[0].period_ms, 50);
        assert_eq!(commands[0].sequence, Sequence::new(["first"]));
        assert_eq!(commands[0].data.key.as_deref(), Some("root"));

        assert!(matches!(
            registry.continue_sequence(CommandData::default(), &Sequence::default()),
            Ok(Outcome::Empty)
        ));
    }

    #[test]
    fn test_validate_reports_unknown_names() {
        let registry = registry();
        assert!(registry.validate(["first", "second"]).is_ok());
        match registry.validate(["first", "missing"]) {
            Err(NodeError::UnknownCommand { name }) => assert_eq!(name, "missing"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_session_id_is_deterministic() {
        let id = Uuid::new_v4();
        let data = CommandData {
            operation_id: Some(id),
            key: Some("abc".into()),
            ..CommandData::default()
        };
        assert_eq!(data.session_id().unwrap(), format!("{id}:abc"));
        assert!(CommandData::default().session_id().is_err());
    }
}
