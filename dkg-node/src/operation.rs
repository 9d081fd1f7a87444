//! Operation records, response aggregation and completion rules
//!
//! Every user-facing operation gets a record that advances through phase
//! statuses until it is `COMPLETED` or `FAILED`; after that it never changes.
//! Peer chains report their terminal outcome here and the per-kind rule
//! decides whether the operation completes, fails or needs another batch.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::{
    command::CommandData,
    error::{NodeError, Result},
    journal::Journal,
    types::{now_ms, Assertion, ErrorStage, ErrorType, OperationKind},
};

pub type OperationId = Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const RECORDS_FILE: &str = "operations.log";
const RESPONSES_FILE: &str = "responses.log";
const CACHE_DIR: &str = "operation-cache";

/// Named step inside an operation, rendered as `<KIND>_<PHASE>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Start,
    ValidateAssertionStart,
    ValidateAssertionEnd,
    LocalStoreStart,
    LocalStoreEnd,
    LocalStart,
    LocalEnd,
    NetworkStart,
    InitStart,
    InitEnd,
    RequestStart,
    RequestEnd,
    NetworkEnd,
    End,
}

impl OperationPhase {
    pub const ALL: [Self; 14] = [
        Self::Start,
        Self::ValidateAssertionStart,
        Self::ValidateAssertionEnd,
        Self::LocalStoreStart,
        Self::LocalStoreEnd,
        Self::LocalStart,
        Self::LocalEnd,
        Self::NetworkStart,
        Self::InitStart,
        Self::InitEnd,
        Self::RequestStart,
        Self::RequestEnd,
        Self::NetworkEnd,
        Self::End,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::ValidateAssertionStart => "VALIDATE_ASSERTION_START",
            Self::ValidateAssertionEnd => "VALIDATE_ASSERTION_END",
            Self::LocalStoreStart => "LOCAL_STORE_START",
            Self::LocalStoreEnd => "LOCAL_STORE_END",
            Self::LocalStart => "LOCAL_START",
            Self::LocalEnd => "LOCAL_END",
            Self::NetworkStart => "NETWORK_START",
            Self::InitStart => "INIT_START",
            Self::InitEnd => "INIT_END",
            Self::RequestStart => "REQUEST_START",
            Self::RequestEnd => "REQUEST_END",
            Self::NetworkEnd => "NETWORK_END",
            Self::End => "END",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    FindNodesStart,
    FindNodesEnd,
    Phase(OperationKind, OperationPhase),
    Completed,
    Failed,
}

impl OperationStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::FindNodesStart => f.write_str("FIND_NODES_START"),
            Self::FindNodesEnd => f.write_str("FIND_NODES_END"),
            Self::Phase(kind, phase) => write!(f, "{}_{}", kind.status_prefix(), phase.as_str()),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

impl FromStr for OperationStatus {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "FIND_NODES_START" => Ok(Self::FindNodesStart),
            "FIND_NODES_END" => Ok(Self::FindNodesEnd),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => OperationKind::ALL
                .into_iter()
                .find_map(|kind| {
                    let phase = s.strip_prefix(kind.status_prefix())?.strip_prefix('_')?;
                    OperationPhase::ALL
                        .into_iter()
                        .find(|p| p.as_str() == phase)
                        .map(|p| Self::Phase(kind, p))
                })
                .ok_or_else(|| NodeError::invalid_state(format!("unknown operation status {s}"))),
        }
    }
}

impl Serialize for OperationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OperationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let status = String::deserialize(deserializer)?;
        status.parse().map_err(serde::de::Error::custom)
    }
}

/// What a completed operation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationResult {
    Replicated { key: String },
    Assertion { key: String, assertion: Assertion },
    Search { results: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub min_acks_reached: bool,
    pub result: Option<OperationResult>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Change notification published on every status transition.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Completed,
    Failed,
}

/// Per-(operation, key) response counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCounts {
    pub expected: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ResponseCounts {
    /// Every expected response of the current batch has arrived.
    #[must_use]
    pub const fn batch_exhausted(&self) -> bool {
        self.completed + self.failed >= self.expected
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ResponseEntry {
    counts: ResponseCounts,
    results: BTreeSet<String>,
    last_error: Option<String>,
}

/// Snapshot returned under the same lock that applied the update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub counts: ResponseCounts,
    pub results: Vec<String>,
    /// Reason given by the most recent failed response
    pub last_error: Option<String>,
}

type ResponseKey = (OperationId, String);

/// Aggregates concurrently completing peer chains.
#[derive(Default)]
pub struct ResponseTracker {
    entries: Mutex<HashMap<ResponseKey, ResponseEntry>>,
    journal: Option<Journal<ResponseKey, ResponseEntry>>,
}

impl ResponseTracker {
    async fn open(path: PathBuf) -> Result<Self> {
        let journal = Journal::open(path).await?;
        let entries = journal.read(Clone::clone).await;
        Ok(Self {
            entries: Mutex::new(entries),
            journal: Some(journal),
        })
    }

    /// Applies `f` to one entry and journals the result while still holding the lock.
    async fn update(
        &self,
        operation_id: OperationId,
        key: &str,
        f: impl FnOnce(&mut ResponseEntry),
    ) -> ResponseSnapshot {
        let mut entries = self.entries.lock().await;
        let entry_key = (operation_id, key.to_owned());
        let entry = entries.entry(entry_key.clone()).or_default();
        f(entry);
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.put(entry_key, entry.clone()).await {
                error!("Failed to persist responses of operation {operation_id}: {e}");
            }
        }
        snapshot(entry)
    }

    pub async fn expect(
        &self,
        operation_id: OperationId,
        key: &str,
        count: usize,
    ) -> ResponseSnapshot {
        self.update(operation_id, key, |entry| entry.counts.expected += count)
            .await
    }

    pub async fn record(
        &self,
        operation_id: OperationId,
        key: &str,
        status: ResponseStatus,
        response: &PeerResponse,
    ) -> ResponseSnapshot {
        self.update(operation_id, key, |entry| match status {
            ResponseStatus::Completed => {
                entry.counts.completed += 1;
                entry.results.extend(response.results.iter().cloned());
            }
            ResponseStatus::Failed => {
                entry.counts.failed += 1;
                if response.error_message.is_some() {
                    entry.last_error.clone_from(&response.error_message);
                }
            }
        })
        .await
    }

    pub async fn snapshot(&self, operation_id: OperationId, key: &str) -> ResponseSnapshot {
        self.entries
            .lock()
            .await
            .get(&(operation_id, key.to_owned()))
            .map(snapshot)
            .unwrap_or_default()
    }

    async fn forget(&self, operation_ids: &[OperationId]) {
        let mut entries = self.entries.lock().await;
        let doomed: Vec<ResponseKey> = entries
            .keys()
            .filter(|(id, _)| operation_ids.contains(id))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.delete(doomed).await {
                error!("Failed to drop persisted responses: {e}");
            }
        }
    }
}

fn snapshot(entry: &ResponseEntry) -> ResponseSnapshot {
    ResponseSnapshot {
        counts: entry.counts,
        results: entry.results.iter().cloned().collect(),
        last_error: entry.last_error.clone(),
    }
}

/// One peer's terminal answer.
#[derive(Debug, Clone, Default)]
pub struct PeerResponse {
    pub error_message: Option<String>,
    pub assertion: Option<Assertion>,
    pub results: Vec<String>,
}

/// What the caller should do after a response was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// More responses of this batch are outstanding.
    Pending,
    Completed,
    Failed,
    /// Schedule the next batch from the leftover nodes.
    NextBatch,
    /// The operation was already finalized.
    Ignored,
}

/// Assertion kept for an operation until it is cleaned up.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedData {
    cached_at: u64,
    assertion: Assertion,
}

/// Operation state under a data directory.
struct Persistence {
    records: Journal<OperationId, OperationRecord>,
    cache_dir: PathBuf,
}

impl Persistence {
    fn cache_path(&self, id: OperationId) -> PathBuf {
        self.cache_dir.join(format!("{id}.json"))
    }

    async fn write_cache(&self, id: OperationId, data: &CachedData) -> Result<()> {
        let path = self.cache_path(id);
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(data)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_cache(dir: &Path) -> Result<HashMap<OperationId, CachedData>> {
        let mut cache = HashMap::new();
        let mut files = tokio::fs::read_dir(dir).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                warn!("Ignoring stray file {} in operation cache", path.display());
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CachedData>(&bytes) {
                Ok(data) => {
                    cache.insert(id, data);
                }
                Err(e) => warn!("Ignoring unreadable cache file {}: {e}", path.display()),
            }
        }
        Ok(cache)
    }
}

pub struct OperationIdService {
    records: RwLock<HashMap<OperationId, OperationRecord>>,
    cache: RwLock<HashMap<OperationId, CachedData>>,
    responses: ResponseTracker,
    events: broadcast::Sender<OperationEvent>,
    persistence: Option<Persistence>,
}

impl Default for OperationIdService {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationIdService {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            responses: ResponseTracker::default(),
            events,
            persistence: None,
        }
    }

    /// Restores records, cached assertions and response counts kept under `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let cache_dir = data_dir.join(CACHE_DIR);
        tokio::fs::create_dir_all(&cache_dir).await?;

        let records: Journal<OperationId, OperationRecord> = Journal::open(data_dir.join(RECORDS_FILE)).await?;
        let restored = records.read(Clone::clone).await;
        let cache = Persistence::load_cache(&cache_dir).await?;
        let responses = ResponseTracker::open(data_dir.join(RESPONSES_FILE)).await?;
        let unfinished = restored
            .values()
            .filter(|r| !r.status.is_terminal())
            .count();
        info!(
            "Restored {} operations ({unfinished} unfinished) from {}",
            restored.len(),
            data_dir.display()
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            records: RwLock::new(restored),
            cache: RwLock::new(cache),
            responses,
            events,
            persistence: Some(Persistence { records, cache_dir }),
        })
    }

    async fn persist_record(&self, record: &OperationRecord) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.records.put(record.id, record.clone()).await {
                error!("Failed to persist operation {}: {e}", record.id);
            }
        }
    }

    pub async fn generate_operation_id(&self, kind: OperationKind) -> OperationId {
        let id = Uuid::new_v4();
        let now = now_ms();
        let record = OperationRecord {
            id,
            kind,
            status: OperationStatus::Pending,
            error_type: None,
            error_message: None,
            min_acks_reached: false,
            result: None,
            created_at: now,
            updated_at: now,
        };
        {
            let mut records = self.records.write().await;
            self.persist_record(&record).await;
            records.insert(id, record.clone());
        }
        self.emit(&record);
        debug!("Generated {kind} operation {id}");
        id
    }

    pub async fn get(&self, id: OperationId) -> Option<OperationRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn is_finalized(&self, id: OperationId) -> bool {
        self.records
            .read()
            .await
            .get(&id)
            .is_some_and(|r| r.status.is_terminal())
    }

    #[must_use]
    pub fn responses(&self) -> &ResponseTracker {
        &self.responses
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Applies `f` unless the record is missing or already terminal.
    async fn transition(&self, id: OperationId, f: impl FnOnce(&mut OperationRecord)) -> bool {
        let record = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&id) else {
                warn!("Status update for unknown operation {id}");
                return false;
            };
            if record.status.is_terminal() {
                debug!(
                    "Operation {id} already {}, ignoring further updates",
                    record.status
                );
                return false;
            }
            f(record);
            record.updated_at = now_ms();
            let record = record.clone();
            self.persist_record(&record).await;
            record
        };
        self.emit(&record);
        true
    }

    fn emit(&self, record: &OperationRecord) {
        // no subscribers is fine
        let _ = self.events.send(OperationEvent {
            operation_id: record.id,
            status: record.status,
            error_type: record.error_type,
            error_message: record.error_message.clone(),
            timestamp: record.updated_at,
        });
    }

    pub async fn update_status(&self, id: OperationId, status: OperationStatus) -> bool {
        self.transition(id, |r| r.status = status).await
    }

    pub async fn mark_failed(
        &self,
        id: OperationId,
        error_type: ErrorType,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        warn!("Operation {id} failed with {error_type}: {message}");
        self.transition(id, |r| {
            r.status = OperationStatus::Failed;
            r.error_type = Some(error_type);
            r.error_message = Some(message);
        })
        .await
    }

    pub async fn mark_completed(&self, id: OperationId, result: OperationResult) -> bool {
        let done = self
            .transition(id, |r| {
                r.status = OperationStatus::Completed;
                r.result = Some(result);
            })
            .await;
        if done {
            info!("Operation {id} completed");
        }
        done
    }

    pub async fn cache_data(&self, id: OperationId, assertion: Assertion) -> Result<()> {
        let data = CachedData {
            cached_at: now_ms(),
            assertion,
        };
        if let Some(persistence) = &self.persistence {
            persistence.write_cache(id, &data).await?;
        }
        self.cache.write().await.insert(id, data);
        Ok(())
    }

    pub async fn cached_data(&self, id: OperationId) -> Option<Assertion> {
        self.cache.read().await.get(&id).map(|c| c.assertion.clone())
    }

    /// Drops terminal records and cached data last touched before `timestamp`.
    pub async fn remove_finished_before(&self, timestamp: u64) -> usize {
        let expired: Vec<OperationId> = {
            let mut records = self.records.write().await;
            let ids: Vec<OperationId> = records
                .values()
                .filter(|r| r.status.is_terminal() && r.updated_at < timestamp)
                .map(|r| r.id)
                .collect();
            for id in &ids {
                records.remove(id);
            }
            ids
        };
        let uncached: Vec<OperationId> = {
            let mut cache = self.cache.write().await;
            let doomed: Vec<OperationId> = cache
                .iter()
                .filter(|(id, c)| expired.contains(id) || c.cached_at < timestamp)
                .map(|(id, _)| *id)
                .collect();
            for id in &doomed {
                cache.remove(id);
            }
            doomed
        };
        self.responses.forget(&expired).await;

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.records.delete(expired.iter().copied()).await {
                error!("Failed to drop persisted operations: {e}");
            }
            for id in uncached {
                let path = persistence.cache_path(id);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!("Could not remove {}: {e}", path.display());
                }
            }
        }
        expired.len()
    }

    /// Waits until the operation is terminal.
    pub async fn wait_for(&self, id: OperationId, timeout: Duration) -> Result<OperationRecord> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                let record = self
                    .get(id)
                    .await
                    .ok_or_else(|| NodeError::invalid_state(format!("unknown operation {id}")))?;
                if record.status.is_terminal() {
                    return Ok(record);
                }
                loop {
                    match events.recv().await {
                        Ok(event) if event.operation_id == id => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(NodeError::invalid_state("operation events closed"));
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            NodeError::invalid_state(format!("operation {id} not finished after {timeout:?}"))
        })?
    }

    /// Counts the local node as one completed response without deciding anything.
    pub async fn record_local_response(&self, data: &CommandData) -> Result<ResponseCounts> {
        let id = data.operation_id()?;
        let key = data.key()?;
        self.responses.expect(id, key, 1).await;
        Ok(self
            .responses
            .record(id, key, ResponseStatus::Completed, &PeerResponse::default())
            .await
            .counts)
    }

    /// Records one peer response and applies the completion rule of the operation kind.
    pub async fn process_response(
        &self,
        data: &CommandData,
        status: ResponseStatus,
        response: PeerResponse,
    ) -> Result<Decision> {
        let id = data.operation_id()?;
        let key = data.key()?;
        let snapshot = self.responses.record(id, key, status, &response).await;
        if let (ResponseStatus::Failed, Some(message)) = (status, &response.error_message) {
            debug!("Operation {id}: peer response failed: {message}");
        }
        self.decide(data, &snapshot, status, response).await
    }

    /// Applies the completion rule to the current counts, without a new response.
    pub async fn evaluate(&self, data: &CommandData) -> Result<Decision> {
        let id = data.operation_id()?;
        let snapshot = self.responses.snapshot(id, data.key()?).await;
        self.decide(data, &snapshot, ResponseStatus::Failed, PeerResponse::default())
            .await
    }

    async fn decide(
        &self,
        data: &CommandData,
        snapshot: &ResponseSnapshot,
        status: ResponseStatus,
        response: PeerResponse,
    ) -> Result<Decision> {
        let id = data.operation_id()?;
        let kind = data.kind()?;
        let key = data.key()?.to_owned();
        if self.is_finalized(id).await {
            return Ok(Decision::Ignored);
        }

        let counts = snapshot.counts;
        let min_ack = data.min_ack_responses.unwrap_or(1);
        let leftover = data.leftover_nodes.len();
        let error_type = kind.error_type(ErrorStage::Operation);

        let decision = match kind {
            OperationKind::Publish | OperationKind::Update => {
                if counts.completed >= min_ack {
                    if kind == OperationKind::Update {
                        self.transition(id, |r| r.min_acks_reached = true).await;
                    }
                    self.finish_completed(id, kind, OperationResult::Replicated { key })
                        .await;
                    Decision::Completed
                } else if !counts.batch_exhausted() {
                    Decision::Pending
                } else if leftover > 0 && counts.completed + leftover >= min_ack {
                    Decision::NextBatch
                } else {
                    let message = failure_message("Not replicated to enough nodes!", snapshot);
                    self.finish_failed(id, kind, error_type, message).await;
                    Decision::Failed
                }
            }
            OperationKind::Get => match (status, response.assertion) {
                (ResponseStatus::Completed, Some(assertion)) => {
                    let result = OperationResult::Assertion { key, assertion };
                    self.finish_completed(id, kind, result).await;
                    Decision::Completed
                }
                _ if !counts.batch_exhausted() => Decision::Pending,
                _ if leftover > 0 => Decision::NextBatch,
                _ => {
                    let message =
                        failure_message("Unable to find assertion on the network!", snapshot);
                    self.finish_failed(id, kind, error_type, message).await;
                    Decision::Failed
                }
            },
            OperationKind::Search => {
                if !counts.batch_exhausted() {
                    Decision::Pending
                } else if counts.completed >= min_ack {
                    let result = OperationResult::Search {
                        results: snapshot.results.clone(),
                    };
                    self.finish_completed(id, kind, result).await;
                    Decision::Completed
                } else if leftover > 0 {
                    Decision::NextBatch
                } else {
                    let message =
                        failure_message("Unable to find results on the network!", snapshot);
                    self.finish_failed(id, kind, error_type, message).await;
                    Decision::Failed
                }
            }
        };
        Ok(decision)
    }

    async fn finish_completed(
        &self,
        id: OperationId,
        kind: OperationKind,
        result: OperationResult,
    ) {
        self.update_status(id, OperationStatus::Phase(kind, OperationPhase::NetworkEnd))
            .await;
        self.mark_completed(id, result).await;
    }

    async fn finish_failed(
        &self,
        id: OperationId,
        kind: OperationKind,
        error_type: ErrorType,
        message: String,
    ) {
        self.update_status(id, OperationStatus::Phase(kind, OperationPhase::NetworkEnd))
            .await;
        self.mark_failed(id, error_type, message).await;
    }
}

fn failure_message(base: &str, snapshot: &ResponseSnapshot) -> String {
    match &snapshot.last_error {
        Some(error) => format!("{base} Last error: {error}"),
        None => base.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::ShardNode;

    fn data(id: OperationId, kind: OperationKind, min_ack: usize, leftover: usize) -> CommandData {
        CommandData {
            operation_id: Some(id),
            kind: Some(kind),
            key: Some("root".into()),
            min_ack_responses: Some(min_ack),
            leftover_nodes: (0..leftover)
                .map(|i| ShardNode {
                    id: format!("spare-{i}").as_str().into(),
                    protocol: kind.network_protocol().into(),
                })
                .collect(),
            ..CommandData::default()
        }
    }

    #[test]
    fn test_status_rendering() {
        assert_eq!(OperationStatus::Pending.to_string(), "PENDING");
        assert_eq!(
            OperationStatus::Phase(OperationKind::Publish, OperationPhase::LocalStoreStart)
                .to_string(),
            "PUBLISH_LOCAL_STORE_START"
        );
        assert_eq!(
            OperationStatus::Phase(OperationKind::Get, OperationPhase::NetworkEnd).to_string(),
            "GET_NETWORK_END"
        );
        assert_eq!(
            serde_json::to_string(&OperationStatus::FindNodesEnd).unwrap(),
            "\"FIND_NODES_END\""
        );
    }

    #[test]
    fn test_status_parses_every_rendering() {
        for kind in OperationKind::ALL {
            for phase in OperationPhase::ALL {
                let status = OperationStatus::Phase(kind, phase);
                assert_eq!(status.to_string().parse::<OperationStatus>().unwrap(), status);
            }
        }
        let failed: OperationStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(failed, OperationStatus::Failed);
        assert!("PUBLISH_NOWHERE".parse::<OperationStatus>().is_err());
        assert!("PUBLISHLOCAL_END".parse::<OperationStatus>().is_err());
    }

    #[tokio::test]
    async fn test_network_end_precedes_terminal_status() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Publish).await;
        let mut events = service.subscribe();
        let d = data(id, OperationKind::Publish, 1, 0);
        service.responses().expect(id, "root", 1).await;
        service
            .process_response(&d, ResponseStatus::Completed, PeerResponse::default())
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(
            first.status,
            OperationStatus::Phase(OperationKind::Publish, OperationPhase::NetworkEnd)
        );
        assert_eq!(events.recv().await.unwrap().status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_message_carries_last_peer_error() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Get).await;
        let d = data(id, OperationKind::Get, 1, 0);
        service.responses().expect(id, "root", 1).await;
        service
            .process_response(
                &d,
                ResponseStatus::Failed,
                PeerResponse {
                    error_message: Some("peer said no".into()),
                    ..PeerResponse::default()
                },
            )
            .await
            .unwrap();

        let record = service.get(id).await.unwrap();
        assert_eq!(
            record.error_message.as_deref(),
            Some("Unable to find assertion on the network! Last error: peer said no")
        );
    }

    #[tokio::test]
    async fn test_reopen_restores_records_cache_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let service = OperationIdService::open(dir.path()).await.unwrap();
            let id = service.generate_operation_id(OperationKind::Publish).await;
            service
                .update_status(
                    id,
                    OperationStatus::Phase(OperationKind::Publish, OperationPhase::InitStart),
                )
                .await;
            service.cache_data(id, vec!["<a> <b> <c> .".into()]).await.unwrap();
            let d = data(id, OperationKind::Publish, 3, 0);
            service.record_local_response(&d).await.unwrap();
            service.responses().expect(id, "root", 2).await;
            id
        };

        let service = OperationIdService::open(dir.path()).await.unwrap();
        let record = service.get(id).await.unwrap();
        assert_eq!(
            record.status,
            OperationStatus::Phase(OperationKind::Publish, OperationPhase::InitStart)
        );
        assert_eq!(
            service.cached_data(id).await,
            Some(vec!["<a> <b> <c> .".to_string()])
        );
        let counts = service.responses().snapshot(id, "root").await.counts;
        assert_eq!(
            counts,
            ResponseCounts {
                expected: 3,
                completed: 1,
                failed: 0
            }
        );

        service.mark_failed(id, ErrorType::PublishError, "gave up").await;
        assert_eq!(service.remove_finished_before(now_ms() + 1).await, 1);
        drop(service);
        let service = OperationIdService::open(dir.path()).await.unwrap();
        assert!(service.get(id).await.is_none());
        assert!(service.cached_data(id).await.is_none());
        assert_eq!(service.responses().snapshot(id, "root").await, ResponseSnapshot::default());
    }

    #[tokio::test]
    async fn test_record_is_immutable_once_terminal() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Publish).await;
        assert!(service.update_status(id, OperationStatus::FindNodesStart).await);
        assert!(service
            .mark_failed(id, ErrorType::FindShardError, "no peers")
            .await);
        assert!(!service.update_status(id, OperationStatus::FindNodesEnd).await);
        assert!(!service
            .mark_completed(id, OperationResult::Replicated { key: "k".into() })
            .await);

        let record = service.get(id).await.unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert_eq!(record.error_type, Some(ErrorType::FindShardError));
    }

    #[tokio::test]
    async fn test_publish_quorum_counts_local_response() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Publish).await;
        let d = data(id, OperationKind::Publish, 2, 0);

        service.record_local_response(&d).await.unwrap();
        service.responses().expect(id, "root", 2).await;
        let first = service
            .process_response(&d, ResponseStatus::Failed, PeerResponse::default())
            .await
            .unwrap();
        assert_eq!(first, Decision::Pending);
        let second = service
            .process_response(&d, ResponseStatus::Completed, PeerResponse::default())
            .await
            .unwrap();
        assert_eq!(second, Decision::Completed);
        assert_eq!(service.get(id).await.unwrap().status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_publish_schedules_next_batch_only_when_reachable() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Publish).await;
        service.responses().expect(id, "root", 1).await;
        let decision = service
            .process_response(
                &data(id, OperationKind::Publish, 2, 2),
                ResponseStatus::Failed,
                PeerResponse::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::NextBatch);

        service.responses().expect(id, "root", 1).await;
        let decision = service
            .process_response(
                &data(id, OperationKind::Publish, 2, 1),
                ResponseStatus::Failed,
                PeerResponse::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Failed);
        let record = service.get(id).await.unwrap();
        assert_eq!(record.error_message.as_deref(), Some("Not replicated to enough nodes!"));
        assert_eq!(record.error_type, Some(ErrorType::PublishError));
    }

    #[tokio::test]
    async fn test_get_first_assertion_wins() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Get).await;
        let d = data(id, OperationKind::Get, 1, 0);
        service.responses().expect(id, "root", 2).await;

        let won = service
            .process_response(
                &d,
                ResponseStatus::Completed,
                PeerResponse {
                    assertion: Some(vec!["<a> <b> <c> .".into()]),
                    ..PeerResponse::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(won, Decision::Completed);
        let late = service
            .process_response(&d, ResponseStatus::Failed, PeerResponse::default())
            .await
            .unwrap();
        assert_eq!(late, Decision::Ignored);
        assert!(matches!(
            service.get(id).await.unwrap().result,
            Some(OperationResult::Assertion { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_merges_results() {
        let service = OperationIdService::new();
        let id = service.generate_operation_id(OperationKind::Search).await;
        let d = data(id, OperationKind::Search, 2, 0);
        service.responses().expect(id, "root", 2).await;
        for results in [vec!["b".to_string(), "a".to_string()], vec!["a".to_string()]] {
            service
                .process_response(
                    &d,
                    ResponseStatus::Completed,
                    PeerResponse {
                        results,
                        ..PeerResponse::default()
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(
            service.get(id).await.unwrap().result,
            Some(OperationResult::Search {
                results: vec!["a".into(), "b".into()]
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_responses_are_counted_once_each() {
        let tracker = Arc::new(ResponseTracker::default());
        let id = Uuid::new_v4();
        tracker.expect(id, "k", 64).await;
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..64 {
            let tracker = Arc::clone(&tracker);
            let status = if i % 4 == 0 {
                ResponseStatus::Failed
            } else {
                ResponseStatus::Completed
            };
            tasks.spawn(async move {
                tracker
                    .record(id, "k", status, &PeerResponse::default())
                    .await
            });
        }
        while tasks.join_next().await.is_some() {}
        let counts = tracker.snapshot(id, "k").await.counts;
        assert_eq!(counts.completed, 48);
        assert_eq!(counts.failed, 16);
        assert!(counts.batch_exhausted());
    }

    #[tokio::test]
    async fn test_wait_for_and_cleanup() {
        let service = Arc::new(OperationIdService::new());
        let id = service.generate_operation_id(OperationKind::Get).await;
        service.cache_data(id, vec!["t".into()]).await.unwrap();

        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.wait_for(id, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        service
            .mark_failed(id, ErrorType::GetError, "nothing")
            .await;
        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Failed);

        assert_eq!(service.remove_finished_before(now_ms() + 1).await, 1);
        assert!(service.get(id).await.is_none());
        assert!(service.cached_data(id).await.is_none());
    }
}
