// CacheGate - short-circuits resolution when an artifact already exists

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::errors::{ResolveError, ResolveResult};
use super::identifier::Identifier;
use super::models::CachedAsset;
use super::storage::{KeyScheme, ObjectStore};

/// Bound for one HEAD when none is configured
const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(15);

pub struct CacheGate {
    store: Arc<dyn ObjectStore>,
    keys: KeyScheme,
    head_timeout: Duration,
}

impl CacheGate {
    pub fn new(store: Arc<dyn ObjectStore>, keys: KeyScheme) -> Self {
        Self {
            store,
            keys,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    pub fn with_head_timeout(mut self, head_timeout: Duration) -> Self {
        self.head_timeout = head_timeout;
        self
    }

    /// HEAD `<prefix>/<id>.<ext>` for each extension in order; first hit wins
    pub async fn lookup<S: AsRef<str>>(
        &self,
        id: &Identifier,
        candidate_extensions: &[S],
    ) -> ResolveResult<Option<CachedAsset>> {
        for extension in candidate_extensions {
            let key = self.keys.key_for(id, extension.as_ref());
            let head = timeout(self.head_timeout, self.store.head(&key))
                .await
                .map_err(|_| {
                    ResolveError::StorageUnavailable(format!(
                        "lookup of {} timed out after {}ms",
                        key,
                        self.head_timeout.as_millis()
                    ))
                })?
                .map_err(|err| match err {
                    ResolveError::StorageUnavailable(detail) => ResolveError::StorageUnavailable(detail),
                    other => ResolveError::StorageUnavailable(format!("lookup of {} failed: {}", key, other)),
                })?;

            if let Some(head) = head {
                tracing::info!(identifier = %id, %key, store = self.store.name(), "cache hit");
                return Ok(Some(CachedAsset {
                    url: self.store.object_url(&key),
                    key,
                    etag: head.etag,
                    size_bytes: head.size_bytes,
                    metadata: head.metadata,
                }));
            }
            tracing::debug!(identifier = %id, %key, "cache miss");
        }
        Ok(None)
    }
}
