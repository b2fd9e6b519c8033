use crate::dynamodb_store::DynamoDbBigSegmentStore;
use crate::patch::Patch;
use crate::redis_store::RedisBigSegmentStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wall-clock milliseconds since the Unix epoch.
pub type UnixMillis = u64;

/// Result type alias for store operations
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors surfaced by big segment store backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("dynamodb error: {0}")]
    DynamoDb(String),

    #[error("malformed stored value: {0}")]
    MalformedValue(String),
}

/// Per-environment external storage for big segment membership.
///
/// One instance serves one environment; namespacing across environments is
/// handled by the configured key prefix, never by sharing an instance.
/// Within a process the synchronizer is the sole writer, but other relay
/// processes may share the same database, which is why [`apply_patch`]
/// carries an optimistic-concurrency check instead of any locking protocol.
///
/// [`apply_patch`]: BigSegmentStore::apply_patch
#[async_trait]
pub trait BigSegmentStore: Send + Sync {
    /// Atomically applies one membership patch.
    ///
    /// Returns `Ok(false)` when the stored cursor does not equal the patch's
    /// `previous_version` (an empty stored cursor matches an empty
    /// `previous_version`). That is the normal stale/out-of-order outcome,
    /// not an error; the caller responds by resynchronizing from the stored
    /// cursor. On `Ok(true)` the membership mutations and the cursor advance
    /// to `patch.version` have been committed together.
    async fn apply_patch(&self, patch: &Patch) -> Result<bool>;

    /// Returns the current cursor, or `""` if none has been recorded.
    async fn get_cursor(&self) -> Result<String>;

    /// Records when the store was last known to be in sync with upstream.
    /// Independent of the cursor: patch application never touches this
    /// value, and vice versa.
    async fn set_synchronized_on(&self, timestamp: UnixMillis) -> Result<()>;

    /// Returns the last synchronized timestamp, or `None` if it has never
    /// been written.
    async fn get_synchronized_on(&self) -> Result<Option<UnixMillis>>;

    /// Releases underlying connections. Safe to call once at environment
    /// teardown.
    async fn close(&self) -> Result<()>;
}

/// Selects which backend (if any) holds big segment data for an environment.
///
/// Deserialized from the relay configuration file; the variant tag is the
/// `backend` field.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Redis(RedisStoreConfig),
    Dynamodb(DynamoDbStoreConfig),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Optional environment-specific key prefix.
    #[serde(default)]
    pub prefix: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DynamoDbStoreConfig {
    /// Table name. The table must use partition key `namespace` and sort
    /// key `key`, both strings.
    pub table: String,
    /// Optional environment-specific key prefix.
    #[serde(default)]
    pub prefix: String,
    /// Overrides the endpoint resolved from the AWS environment; used for
    /// local DynamoDB instances.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Maps resolved configuration to a store backend: no configuration means
/// big segments are disabled for the environment.
pub async fn create_store(
    config: Option<&StoreConfig>,
) -> Result<Option<Arc<dyn BigSegmentStore>>> {
    match config {
        None => Ok(None),
        Some(StoreConfig::Redis(config)) => {
            let store = RedisBigSegmentStore::new(config).await?;
            Ok(Some(Arc::new(store)))
        }
        Some(StoreConfig::Dynamodb(config)) => {
            let store = DynamoDbBigSegmentStore::new(config).await?;
            Ok(Some(Arc::new(store)))
        }
    }
}

/// Namespaces a storage key with the configured prefix.
pub(crate) fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

pub fn now_unix_millis() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as UnixMillis)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{MembershipChanges, Patch, SegmentChanges};
    use crate::testutils::MemoryBigSegmentStore;

    fn include_patch(version: &str, previous: &str, segment: &str, add: &[&str]) -> Patch {
        Patch {
            environment_id: "env-1".into(),
            segment_id: segment.into(),
            version: version.into(),
            previous_version: previous.into(),
            changes: SegmentChanges {
                included: MembershipChanges {
                    add: add.iter().map(|user| user.to_string()).collect(),
                    remove: Vec::new(),
                },
                excluded: MembershipChanges::default(),
            },
        }
    }

    #[tokio::test]
    async fn applies_patch_to_empty_store() {
        let store = MemoryBigSegmentStore::new();
        assert_eq!(store.get_cursor().await.unwrap(), "");

        let applied = store
            .apply_patch(&include_patch("1", "", "seg.g1", &["u1"]))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(store.get_cursor().await.unwrap(), "1");
        assert_eq!(store.included_segments("u1"), vec!["seg.g1"]);
    }

    #[tokio::test]
    async fn removal_patch_advances_cursor() {
        let store = MemoryBigSegmentStore::new();
        store
            .apply_patch(&include_patch("1", "", "seg.g1", &["u1"]))
            .await
            .unwrap();

        let mut removal = include_patch("2", "1", "seg.g1", &[]);
        removal.changes.included.remove = vec!["u1".into()];
        assert!(store.apply_patch(&removal).await.unwrap());

        assert_eq!(store.get_cursor().await.unwrap(), "2");
        assert!(store.included_segments("u1").is_empty());
    }

    #[tokio::test]
    async fn stale_patch_is_rejected_without_mutation() {
        let store = MemoryBigSegmentStore::new();
        store
            .apply_patch(&include_patch("1", "", "seg.g1", &["u1"]))
            .await
            .unwrap();

        // Claims a prior cursor that is not the stored one.
        let stale = include_patch("9", "7", "seg.g1", &["u2"]);
        assert!(!store.apply_patch(&stale).await.unwrap());

        assert_eq!(store.get_cursor().await.unwrap(), "1");
        assert!(store.included_segments("u2").is_empty());
    }

    #[tokio::test]
    async fn replayed_patch_is_rejected_after_cursor_advance() {
        let store = MemoryBigSegmentStore::new();
        let first = include_patch("1", "", "seg.g1", &["u1"]);
        store.apply_patch(&first).await.unwrap();

        let mut removal = include_patch("2", "1", "seg.g1", &[]);
        removal.changes.included.remove = vec!["u1".into()];
        store.apply_patch(&removal).await.unwrap();

        // Replaying the original patch must be an idempotent rejection.
        assert!(!store.apply_patch(&first).await.unwrap());
        assert_eq!(store.get_cursor().await.unwrap(), "2");
        assert!(store.included_segments("u1").is_empty());
    }

    #[tokio::test]
    async fn large_patch_applies_every_membership_with_cursor() {
        let store = MemoryBigSegmentStore::new();
        let users: Vec<String> = (0..50).map(|i| format!("user-{i}")).collect();
        let user_refs: Vec<&str> = users.iter().map(String::as_str).collect();

        let applied = store
            .apply_patch(&include_patch("1", "", "seg.g1", &user_refs))
            .await
            .unwrap();
        assert!(applied);

        assert_eq!(store.get_cursor().await.unwrap(), "1");
        for user in &users {
            assert_eq!(store.included_segments(user), vec!["seg.g1"]);
        }
    }

    #[tokio::test]
    async fn excluded_membership_updates() {
        let store = MemoryBigSegmentStore::new();
        let mut patch = include_patch("1", "", "seg.g1", &[]);
        patch.changes.excluded.add = vec!["u9".into()];
        assert!(store.apply_patch(&patch).await.unwrap());

        assert_eq!(store.excluded_segments("u9"), vec!["seg.g1"]);
        assert!(store.included_segments("u9").is_empty());
    }

    #[tokio::test]
    async fn synchronized_timestamp_is_independent_of_patches() {
        let store = MemoryBigSegmentStore::new();
        assert_eq!(store.get_synchronized_on().await.unwrap(), None);

        store.set_synchronized_on(1_000).await.unwrap();
        store
            .apply_patch(&include_patch("1", "", "seg.g1", &["u1"]))
            .await
            .unwrap();

        assert_eq!(store.get_synchronized_on().await.unwrap(), Some(1_000));
    }

    #[test]
    fn prefixed_key_namespacing() {
        assert_eq!(prefixed_key("", "big_segments_cursor"), "big_segments_cursor");
        assert_eq!(
            prefixed_key("env-a", "big_segments_cursor"),
            "env-a:big_segments_cursor"
        );
    }

    #[test]
    fn store_config_deserializes_from_yaml() {
        let redis: StoreConfig = serde_yaml::from_str(
            "backend: redis\nurl: redis://localhost:6379\nprefix: prod",
        )
        .unwrap();
        assert_eq!(
            redis,
            StoreConfig::Redis(RedisStoreConfig {
                url: "redis://localhost:6379".into(),
                prefix: "prod".into(),
            })
        );

        let dynamo: StoreConfig =
            serde_yaml::from_str("backend: dynamodb\ntable: big-segments").unwrap();
        assert_eq!(
            dynamo,
            StoreConfig::Dynamodb(DynamoDbStoreConfig {
                table: "big-segments".into(),
                prefix: String::new(),
                endpoint: None,
            })
        );
    }
}
