//! Identifiers and small value types shared by every module.

use std::{
    fmt::{self, Write as _},
    time::{SystemTime, UNIX_EPOCH},
};

use dkg_common::constants::{GET_PROTOCOL, SEARCH_PROTOCOL, STORE_PROTOCOL, UPDATE_PROTOCOL};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a peer on the network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Logical network a peer participates in, e.g. `otp:2043`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockchainId(String);

impl BlockchainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockchainId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Wall-clock time in unix milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A set of n-quad triples.
pub type Assertion = Vec<String>;

/// Hex SHA-256 over the sorted, newline-joined triples.
#[must_use]
pub fn dataset_root(assertion: &[String]) -> String {
    let mut sorted: Vec<&str> = assertion.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    to_hex(&Sha256::digest(sorted.join("\n").as_bytes()))
}

#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// A remote shard member together with the protocol it will be contacted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardNode {
    pub id: PeerId,
    pub protocol: String,
}

/// User-facing operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Publish,
    Update,
    Get,
    Search,
}

impl OperationKind {
    pub const ALL: [Self; 4] = [Self::Publish, Self::Update, Self::Get, Self::Search];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Update => "update",
            Self::Get => "get",
            Self::Search => "search",
        }
    }

    /// Prefix used when rendering phase statuses, e.g. `PUBLISH_INIT_START`.
    #[must_use]
    pub const fn status_prefix(self) -> &'static str {
        match self {
            Self::Publish => "PUBLISH",
            Self::Update => "UPDATE",
            Self::Get => "GET",
            Self::Search => "SEARCH",
        }
    }

    #[must_use]
    pub const fn network_protocol(self) -> &'static str {
        match self {
            Self::Publish => STORE_PROTOCOL,
            Self::Update => UPDATE_PROTOCOL,
            Self::Get => GET_PROTOCOL,
            Self::Search => SEARCH_PROTOCOL,
        }
    }

    #[must_use]
    pub fn from_protocol(protocol: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.network_protocol() == protocol)
    }

    /// Whether the operation carries an assertion that must be validated and stored.
    #[must_use]
    pub const fn replicates(self) -> bool {
        matches!(self, Self::Publish | Self::Update)
    }

    #[must_use]
    pub const fn error_type(self, stage: ErrorStage) -> ErrorType {
        use ErrorStage as S;
        use ErrorType as E;
        match (self, stage) {
            (_, S::FindShard) => E::FindShardError,
            (Self::Publish, S::Validate) => E::PublishValidateAssertionError,
            (Self::Publish, S::Local) => E::PublishLocalStoreError,
            (Self::Publish, S::Start) => E::PublishStartError,
            (Self::Publish, S::Init) => E::PublishStoreInitError,
            (Self::Publish, S::Request) => E::PublishStoreRequestError,
            (Self::Publish, S::Operation) => E::PublishError,
            (Self::Update, S::Validate) => E::UpdateValidateAssertionError,
            (Self::Update, S::Local) => E::UpdateLocalStoreError,
            (Self::Update, S::Start) => E::UpdateStartError,
            (Self::Update, S::Init) => E::UpdateInitError,
            (Self::Update, S::Request) => E::UpdateRequestError,
            (Self::Update, S::Operation) => E::UpdateError,
            (Self::Get, S::Validate | S::Local) => E::GetLocalError,
            (Self::Get, S::Start) => E::GetStartError,
            (Self::Get, S::Init) => E::GetInitError,
            (Self::Get, S::Request) => E::GetRequestError,
            (Self::Get, S::Operation) => E::GetError,
            (Self::Search, S::Validate | S::Local | S::Start) => E::SearchStartError,
            (Self::Search, S::Init) => E::SearchInitError,
            (Self::Search, S::Request) => E::SearchRequestError,
            (Self::Search, S::Operation) => E::SearchError,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where in an operation an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    FindShard,
    Validate,
    Local,
    Start,
    Init,
    Request,
    Operation,
}

/// Machine-readable error tag surfaced on failed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    FindShardError,
    PublishValidateAssertionError,
    PublishLocalStoreError,
    PublishStartError,
    PublishStoreInitError,
    PublishStoreRequestError,
    PublishError,
    UpdateValidateAssertionError,
    UpdateLocalStoreError,
    UpdateStartError,
    UpdateInitError,
    UpdateRequestError,
    UpdateError,
    GetLocalError,
    GetStartError,
    GetInitError,
    GetRequestError,
    GetError,
    SearchStartError,
    SearchInitError,
    SearchRequestError,
    SearchError,
    CommandExecutorError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_root_is_order_independent() {
        let a = vec!["<s> <p> <o1> .".to_string(), "<s> <p> <o2> .".to_string()];
        let b = vec![a[1].clone(), a[0].clone()];
        assert_eq!(dataset_root(&a), dataset_root(&b));
        assert_eq!(dataset_root(&a).len(), 64);
        assert_ne!(dataset_root(&a), dataset_root(&a[..1]));
    }

    #[test]
    fn test_protocol_lookup() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_protocol(kind.network_protocol()), Some(kind));
        }
        assert_eq!(OperationKind::from_protocol("/store/0.9.0"), None);
    }

    #[test]
    fn test_error_type_tags() {
        assert_eq!(
            OperationKind::Get.error_type(ErrorStage::Request).to_string(),
            "GetRequestError"
        );
        assert_eq!(
            OperationKind::Update.error_type(ErrorStage::FindShard),
            ErrorType::FindShardError
        );
    }
}
