//! Triple-store seam. Backends live outside this crate; the in-memory store
//! backs tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::Result,
    types::{Assertion, BlockchainId},
};

#[async_trait]
pub trait TripleStore: Send + Sync {
    /// Stores `assertion` under `key`, replacing any previous version.
    async fn insert_assertion(
        &self,
        blockchain: &BlockchainId,
        key: &str,
        assertion: &Assertion,
    ) -> Result<()>;

    async fn get_assertion(
        &self,
        blockchain: &BlockchainId,
        key: &str,
    ) -> Result<Option<Assertion>>;

    async fn assertion_exists(&self, blockchain: &BlockchainId, key: &str) -> Result<bool> {
        Ok(self.get_assertion(blockchain, key).await?.is_some())
    }

    /// Keys of assertions with a triple mentioning `keyword`, sorted.
    async fn search(
        &self,
        blockchain: &BlockchainId,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct MemoryTripleStore {
    assertions: RwLock<HashMap<(BlockchainId, String), Assertion>>,
}

impl MemoryTripleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.assertions.read().await.len()
    }
}

#[async_trait]
impl TripleStore for MemoryTripleStore {
    async fn insert_assertion(
        &self,
        blockchain: &BlockchainId,
        key: &str,
        assertion: &Assertion,
    ) -> Result<()> {
        self.assertions
            .write()
            .await
            .insert((blockchain.clone(), key.to_owned()), assertion.clone());
        Ok(())
    }

    async fn get_assertion(
        &self,
        blockchain: &BlockchainId,
        key: &str,
    ) -> Result<Option<Assertion>> {
        Ok(self
            .assertions
            .read()
            .await
            .get(&(blockchain.clone(), key.to_owned()))
            .cloned())
    }

    async fn search(
        &self,
        blockchain: &BlockchainId,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let needle = keyword.to_lowercase();
        let mut keys: Vec<String> = self
            .assertions
            .read()
            .await
            .iter()
            .filter(|((chain, _), triples)| {
                chain == blockchain && triples.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .map(|((_, key), _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys.truncate(limit);
        Ok(keys)
    }
}
