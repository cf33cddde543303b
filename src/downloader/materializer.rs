// Materializer - copies the selected stream into the object store
//
// Handles:
// - Direct fetch under the transfer timeout, through the egress that resolved it
// - Files already written by the delegate, or a delegate download when the
//   direct URL is refused
// - One PUT per artifact with descriptive metadata (no partial objects)
// - Removal of temporary files once the upload succeeded

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::timeout;

use super::config::ResolverConfig;
use super::errors::{ResolveError, ResolveResult};
use super::extractors::YtDlpDelegate;
use super::format_selector::SelectionPolicy;
use super::identifier::Identifier;
use super::identity::NetworkIdentity;
use super::models::{content_type_for, storable_extension, CachedAsset, ExtractionAttempt, ResolutionResult, StreamVariant, VariantReference};
use super::storage::{KeyScheme, ObjectStore};
use super::utils::{build_client, fetch_bytes};

/// What the materializer records next to the bytes
#[derive(Debug, Clone)]
pub struct MaterializeContext<'a> {
    pub policy: &'a SelectionPolicy,
    pub provenance: &'a [ExtractionAttempt],
    pub extracted_at: OffsetDateTime,
}

impl<'a> MaterializeContext<'a> {
    pub fn new(result: &'a ResolutionResult, policy: &'a SelectionPolicy) -> Self {
        Self {
            policy,
            provenance: result.provenance(),
            extracted_at: result.extracted_at(),
        }
    }

    /// Egress of the attempt that produced the variant; stream URLs are bound to it
    fn egress(&self) -> Option<String> {
        self.provenance
            .iter()
            .rev()
            .find(|attempt| attempt.is_success())
            .and_then(|attempt| attempt.egress_address.clone())
    }

    fn provenance_summary(&self) -> String {
        self.provenance
            .iter()
            .map(|attempt| {
                let outcome = attempt.error_kind.map(|k| k.as_str()).unwrap_or("ok");
                format!("{}:{}", attempt.strategy_name, outcome)
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub struct Materializer {
    store: Arc<dyn ObjectStore>,
    keys: KeyScheme,
    transfer_timeout: Duration,
    delegate: Option<Arc<YtDlpDelegate>>,
    work_dir: PathBuf,
}

impl Materializer {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ResolverConfig) -> Self {
        Self {
            store,
            keys: KeyScheme::new(&config.storage.key_prefix),
            transfer_timeout: config.transfer_timeout(),
            delegate: None,
            work_dir: config.delegate.work_dir(),
        }
    }

    /// Delegate used when the direct URL is refused
    pub fn with_delegate(mut self, delegate: Arc<YtDlpDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_transfer_timeout(mut self, transfer_timeout: Duration) -> Self {
        self.transfer_timeout = transfer_timeout;
        self
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    pub async fn materialize(
        &self,
        id: &Identifier,
        variant: &StreamVariant,
        ctx: &MaterializeContext<'_>,
    ) -> ResolveResult<CachedAsset> {
        timeout(self.transfer_timeout, self.transfer(id, variant, ctx))
            .await
            .map_err(|_| {
                ResolveError::Timeout(format!(
                    "transfer of {} exceeded {}s",
                    id,
                    self.transfer_timeout.as_secs()
                ))
            })?
    }

    async fn transfer(
        &self,
        id: &Identifier,
        variant: &StreamVariant,
        ctx: &MaterializeContext<'_>,
    ) -> ResolveResult<CachedAsset> {
        let (body, temp_file) = self.obtain(id, variant, ctx).await?;

        let extension = storable_extension(
            &temp_file
                .as_deref()
                .and_then(file_extension)
                .unwrap_or_else(|| variant.extension()),
        );
        let key = self.keys.key_for(id, &extension);
        let content_type = content_type_for(&extension, variant.is_audio_only);
        let metadata = self.metadata_for(id, variant, ctx);
        let size_bytes = body.len() as u64;

        tracing::info!(identifier = %id, %key, size_bytes, store = self.store.name(), "uploading artifact");
        let etag = self
            .store
            .put(&key, body, content_type, &metadata)
            .await
            .map_err(|err| match err {
                ResolveError::StorageUnavailable(detail) => ResolveError::StorageUnavailable(detail),
                other => ResolveError::StorageUnavailable(format!("upload of {} failed: {}", key, other)),
            })?;

        if let Some(path) = temp_file {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove temporary file");
            }
        }

        Ok(CachedAsset {
            url: self.store.object_url(&key),
            key,
            etag,
            size_bytes,
            metadata,
        })
    }

    /// Bytes of the variant plus the temporary file they came from, if any
    async fn obtain(
        &self,
        id: &Identifier,
        variant: &StreamVariant,
        ctx: &MaterializeContext<'_>,
    ) -> ResolveResult<(Bytes, Option<PathBuf>)> {
        match &variant.reference {
            VariantReference::LocalFile(path) => {
                let body = tokio::fs::read(path).await?;
                Ok((Bytes::from(body), Some(path.clone())))
            }
            VariantReference::Direct(url) => {
                let mut identity = NetworkIdentity::direct();
                identity.egress = ctx.egress();
                let client = build_client(&identity, self.transfer_timeout)?;
                match fetch_bytes(&client, url).await {
                    Ok(body) => Ok((body, None)),
                    Err(ResolveError::UpstreamBlocked(detail)) => match &self.delegate {
                        Some(delegate) => {
                            tracing::warn!(identifier = %id, %detail, "direct fetch refused, downloading through delegate");
                            let path = delegate
                                .download_format(id, &variant.format_id, &identity, &self.work_dir)
                                .await?;
                            let body = tokio::fs::read(&path).await?;
                            Ok((Bytes::from(body), Some(path)))
                        }
                        None => Err(ResolveError::UpstreamBlocked(detail)),
                    },
                    Err(err) => Err(err),
                }
            }
            VariantReference::Cipher(_) => Err(ResolveError::CipherDecodeFailed(format!(
                "variant {} still carries an undecoded cipher",
                variant.format_id
            ))),
        }
    }

    fn metadata_for(
        &self,
        id: &Identifier,
        variant: &StreamVariant,
        ctx: &MaterializeContext<'_>,
    ) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("identifier".to_string(), id.to_string());
        metadata.insert("format-id".to_string(), variant.format_id.clone());
        metadata.insert("container".to_string(), variant.container.clone());
        metadata.insert("audio-only".to_string(), variant.is_audio_only.to_string());
        metadata.insert("selection-policy".to_string(), ctx.policy.describe());
        metadata.insert("provenance".to_string(), ctx.provenance_summary());
        if !variant.codec_hint.is_empty() {
            metadata.insert("codec".to_string(), variant.codec_hint.clone());
        }
        if let Some(bitrate) = variant.bitrate_hint {
            metadata.insert("bitrate".to_string(), bitrate.to_string());
        }
        if !variant.quality_label.is_empty() {
            metadata.insert("quality".to_string(), variant.quality_label.clone());
        }
        if let Ok(extracted_at) = ctx.extracted_at.format(&Rfc3339) {
            metadata.insert("extracted-at".to_string(), extracted_at);
        }
        metadata
    }
}

fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::errors::ErrorKind;
    use crate::downloader::models::VariantOrigin;
    use crate::downloader::storage::ObjectHead;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, usize, String, BTreeMap<String, String>)>>,
        reject: bool,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn head(&self, _key: &str) -> ResolveResult<Option<ObjectHead>> {
            Ok(None)
        }

        async fn put(
            &self,
            key: &str,
            body: Bytes,
            content_type: &str,
            metadata: &BTreeMap<String, String>,
        ) -> ResolveResult<Option<String>> {
            if self.reject {
                return Err(ResolveError::Http("HTTP 500".to_string()));
            }
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), body.len(), content_type.to_string(), metadata.clone()));
            Ok(Some("etag-1".to_string()))
        }

        fn object_url(&self, key: &str) -> String {
            format!("https://store.example/{}", key)
        }
    }

    fn local_variant(path: PathBuf) -> StreamVariant {
        StreamVariant {
            reference: VariantReference::LocalFile(path),
            container: "mp4".to_string(),
            is_audio_only: true,
            codec_hint: "mp4a.40.2".to_string(),
            bitrate_hint: Some(129_000),
            size_hint: None,
            quality_label: "AUDIO_QUALITY_MEDIUM".to_string(),
            format_id: "140".to_string(),
            origin: VariantOrigin::Delegate,
        }
    }

    fn provenance() -> Vec<ExtractionAttempt> {
        vec![
            ExtractionAttempt::failure("watch-page", ErrorKind::UpstreamBlocked, "captcha", 10, None),
            ExtractionAttempt::success("subprocess-delegate", 900, None),
        ]
    }

    #[tokio::test]
    async fn uploads_local_file_with_metadata_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dQw4w9WgXcQ.m4a");
        std::fs::write(&path, b"audio-bytes").unwrap();

        let store = Arc::new(RecordingStore::default());
        let materializer = Materializer::new(store.clone(), &ResolverConfig::default());
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let policy = SelectionPolicy::transcription();
        let attempts = provenance();
        let ctx = MaterializeContext {
            policy: &policy,
            provenance: &attempts,
            extracted_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };

        let asset = materializer.materialize(&id, &local_variant(path.clone()), &ctx).await.unwrap();
        assert_eq!(asset.key, "media/dQw4w9WgXcQ.m4a");
        assert_eq!(asset.url, "https://store.example/media/dQw4w9WgXcQ.m4a");
        assert_eq!(asset.size_bytes, 11);
        assert_eq!(asset.etag.as_deref(), Some("etag-1"));
        assert!(!path.exists());

        let puts = store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        let (_, _, content_type, metadata) = &puts[0];
        assert_eq!(content_type, "audio/mp4");
        assert_eq!(metadata["format-id"], "140");
        assert_eq!(metadata["bitrate"], "129000");
        assert_eq!(metadata["identifier"], "dQw4w9WgXcQ");
        assert_eq!(metadata["provenance"], "watch-page:upstream_blocked,subprocess-delegate:ok");
        assert_eq!(metadata["selection-policy"], "audio-only,min-size");
        assert_eq!(metadata["extracted-at"], "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn rejected_upload_is_storage_unavailable_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dQw4w9WgXcQ.webm");
        std::fs::write(&path, b"x").unwrap();

        let store = Arc::new(RecordingStore {
            reject: true,
            ..RecordingStore::default()
        });
        let materializer = Materializer::new(store, &ResolverConfig::default());
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let policy = SelectionPolicy::default();
        let ctx = MaterializeContext {
            policy: &policy,
            provenance: &[],
            extracted_at: OffsetDateTime::now_utc(),
        };
        let err = materializer.materialize(&id, &local_variant(path.clone()), &ctx).await.unwrap_err();
        assert!(matches!(err, ResolveError::StorageUnavailable(_)));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn cipher_reference_is_rejected() {
        let materializer = Materializer::new(Arc::new(RecordingStore::default()), &ResolverConfig::default());
        let mut variant = local_variant(PathBuf::from("/unused"));
        variant.reference = VariantReference::Cipher("s=a&url=b".to_string());
        let policy = SelectionPolicy::default();
        let ctx = MaterializeContext {
            policy: &policy,
            provenance: &[],
            extracted_at: OffsetDateTime::now_utc(),
        };
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let err = materializer.materialize(&id, &variant, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CipherDecodeFailed);
    }

    #[test]
    fn egress_comes_from_successful_attempt() {
        let attempts = vec![
            ExtractionAttempt::failure("a", ErrorKind::UpstreamBlocked, "x", 1, Some("http://p1:1".to_string())),
            ExtractionAttempt::success("b", 1, Some("http://p2:1".to_string())),
        ];
        let policy = SelectionPolicy::default();
        let ctx = MaterializeContext {
            policy: &policy,
            provenance: &attempts,
            extracted_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(ctx.egress().as_deref(), Some("http://p2:1"));
    }
}
