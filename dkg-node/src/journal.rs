//! Append-only journal of keyed JSON values
//!
//! Every batch of changes is one JSON line, appended and synced before it is
//! applied in memory. Opening a journal replays it and rewrites it as a
//! compact snapshot; the same happens once the log has grown well past the
//! number of live entries. A torn final line left by a crash is discarded.

use std::{
    collections::HashMap,
    hash::Hash,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::error::{NodeError, Result};

const COMPACT_MIN_LINES: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change<K, V> {
    Put { key: K, value: V },
    Delete { key: K },
}

struct State<K, V> {
    entries: HashMap<K, V>,
    file: File,
    lines: usize,
}

pub struct Journal<K, V> {
    path: PathBuf,
    state: Mutex<State<K, V>>,
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> NodeError {
    NodeError::repository(format!("failed to {action} {}: {e}", path.display()))
}

fn apply_changes<K: Eq + Hash, V>(entries: &mut HashMap<K, V>, changes: Vec<Change<K, V>>) {
    for change in changes {
        match change {
            Change::Put { key, value } => {
                entries.insert(key, value);
            }
            Change::Delete { key } => {
                entries.remove(&key);
            }
        }
    }
}

/// Replays a journal file. Only the last line may fail to decode.
fn replay<K, V>(path: &Path, content: &str) -> Result<HashMap<K, V>>
where
    K: Eq + Hash + DeserializeOwned,
    V: DeserializeOwned,
{
    let mut entries = HashMap::new();
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<Vec<Change<K, V>>>(line) {
            Ok(changes) => apply_changes(&mut entries, changes),
            Err(e) if index + 1 == lines.len() => {
                warn!("Discarding torn last entry of {}: {e}", path.display());
            }
            Err(e) => return Err(NodeError::serialization(format!("{}", path.display()), e)),
        }
    }
    Ok(entries)
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error("open", path, e))
}

impl<K, V> Journal<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync,
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => replay(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(io_error("read", &path, e)),
        };
        let file = compact(&path, &entries).await?;
        debug!("Opened journal {} with {} entries", path.display(), entries.len());

        let lines = entries.len();
        Ok(Self {
            path,
            state: Mutex::new(State {
                entries,
                file,
                lines,
            }),
        })
    }

    /// Appends `changes` as one atomic line, then applies them.
    pub async fn apply(&self, changes: Vec<Change<K, V>>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut line = serde_json::to_vec(&changes)?;
        line.push(b'\n');

        let mut state = self.state.lock().await;
        state
            .file
            .write_all(&line)
            .await
            .map_err(|e| io_error("append to", &self.path, e))?;
        state
            .file
            .sync_data()
            .await
            .map_err(|e| io_error("sync", &self.path, e))?;
        apply_changes(&mut state.entries, changes);
        state.lines += 1;

        if state.lines >= COMPACT_MIN_LINES && state.lines >= 4 * state.entries.len() {
            state.file = compact(&self.path, &state.entries).await?;
            state.lines = state.entries.len();
        }
        Ok(())
    }

    pub async fn put(&self, key: K, value: V) -> Result<()> {
        self.apply(vec![Change::Put { key, value }]).await
    }

    pub async fn delete(&self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        self.apply(keys.into_iter().map(|key| Change::Delete { key }).collect())
            .await
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.state.lock().await.entries.get(key).cloned()
    }

    pub async fn read<T>(&self, f: impl FnOnce(&HashMap<K, V>) -> T) -> T {
        f(&self.state.lock().await.entries)
    }

    /// Deletes every entry `keep` rejects. Returns how many went.
    pub async fn retain(&self, keep: impl Fn(&V) -> bool) -> Result<usize> {
        let doomed: Vec<K> = self.read(|entries| {
            entries
                .iter()
                .filter(|(_, v)| !keep(v))
                .map(|(k, _)| k.clone())
                .collect()
        })
        .await;
        let removed = doomed.len();
        self.delete(doomed).await?;
        Ok(removed)
    }
}

/// Rewrites the journal as one `Put` per live entry and reopens it for appends.
async fn compact<K, V>(path: &Path, entries: &HashMap<K, V>) -> Result<File>
where
    K: Serialize,
    V: Serialize,
{
    let tmp = path.with_extension("compact");
    let mut out = Vec::new();
    for (key, value) in entries {
        serde_json::to_writer(&mut out, &[Change::Put { key, value }])?;
        out.push(b'\n');
    }

    let mut file = File::create(&tmp)
        .await
        .map_err(|e| io_error("create", &tmp, e))?;
    file.write_all(&out)
        .await
        .map_err(|e| io_error("write", &tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| io_error("sync", &tmp, e))?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error("replace", path, e))?;
    open_append(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn journal(dir: &Path) -> Journal<String, u32> {
        Journal::open(dir.join("test.log")).await.unwrap()
    }

    #[tokio::test]
    async fn test_journal_replays_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = journal(dir.path()).await;
            journal.put("a".into(), 1).await.unwrap();
            journal.put("b".into(), 2).await.unwrap();
            journal
                .apply(vec![
                    Change::Put {
                        key: "a".into(),
                        value: 3,
                    },
                    Change::Delete { key: "b".into() },
                ])
                .await
                .unwrap();
        }

        let reopened = journal(dir.path()).await;
        assert_eq!(reopened.get(&"a".into()).await, Some(3));
        assert_eq!(reopened.get(&"b".into()).await, None);
        assert_eq!(reopened.read(HashMap::len).await, 1);
    }

    #[tokio::test]
    async fn test_torn_last_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        tokio::fs::write(
            &path,
            "[{\"op\":\"put\",\"key\":\"a\",\"value\":1}]\n[{\"op\":\"put\",\"key\":\"b\",",
        )
        .await
        .unwrap();

        let journal = journal(dir.path()).await;
        assert_eq!(journal.get(&"a".into()).await, Some(1));
        assert_eq!(journal.get(&"b".into()).await, None);
        // reopening compacted the file, so new appends start on a clean line
        journal.put("c".into(), 3).await.unwrap();
        drop(journal);
        assert_eq!(self::journal(dir.path()).await.read(HashMap::len).await, 2);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        tokio::fs::write(&path, "garbage\n[{\"op\":\"delete\",\"key\":\"a\"}]\n")
            .await
            .unwrap();
        let opened: Result<Journal<String, u32>> = Journal::open(path).await;
        assert!(opened.is_err());
    }

    #[tokio::test]
    async fn test_retain_removes_rejected_entries() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path()).await;
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            journal.put(key.into(), value).await.unwrap();
        }
        assert_eq!(journal.retain(|v| *v != 2).await.unwrap(), 1);
        drop(journal);

        let reopened = self::journal(dir.path()).await;
        assert_eq!(reopened.get(&"b".into()).await, None);
        assert_eq!(reopened.get(&"c".into()).await, Some(3));
    }
}
