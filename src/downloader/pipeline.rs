// Pipeline - parse, gate, resolve, materialize
//
// The cache lookup always happens before any strategy runs, and the upload
// finishes before a resolved outcome is returned.

use std::sync::Arc;

use super::cache::CacheGate;
use super::config::ResolverConfig;
use super::errors::ResolveResult;
use super::extractors::YtDlpDelegate;
use super::identifier::{self, Identifier};
use super::identity::egress_from_config;
use super::materializer::{MaterializeContext, Materializer};
use super::models::{CachedAsset, ResolutionResult};
use super::orchestrator::Resolver;
use super::storage::{KeyScheme, ObjectStore, S3ObjectStore};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Artifact already stored; no strategy ran
    Cached {
        resolution: ResolutionResult,
        asset: CachedAsset,
    },
    /// Freshly resolved; `asset` is set when storage is configured
    Resolved {
        resolution: ResolutionResult,
        asset: Option<CachedAsset>,
    },
}

impl PipelineOutcome {
    pub fn resolution(&self) -> &ResolutionResult {
        match self {
            Self::Cached { resolution, .. } | Self::Resolved { resolution, .. } => resolution,
        }
    }

    pub fn asset(&self) -> Option<&CachedAsset> {
        match self {
            Self::Cached { asset, .. } => Some(asset),
            Self::Resolved { asset, .. } => asset.as_ref(),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

struct StorageStage {
    gate: CacheGate,
    materializer: Materializer,
    lookup_extensions: Vec<String>,
}

pub struct Pipeline {
    resolver: Resolver,
    storage: Option<StorageStage>,
}

impl Pipeline {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            storage: None,
        }
    }

    /// Everything from config: egress, default chain, S3 store when enabled
    pub fn from_config(config: &ResolverConfig) -> ResolveResult<Self> {
        config.validate()?;
        let egress = egress_from_config(&config.network)?;
        let resolver = Resolver::new(config, egress).with_default_chain(config);
        let pipeline = Self::new(resolver);

        if !config.storage.enabled {
            return Ok(pipeline);
        }
        let store = S3ObjectStore::from_config(&config.storage)?;
        Ok(pipeline.with_store(Arc::new(store), config))
    }

    /// Gate and materialize through `store`
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>, config: &ResolverConfig) -> Self {
        let mut materializer = Materializer::new(Arc::clone(&store), config);
        if config.delegate.enabled {
            materializer = materializer.with_delegate(Arc::new(YtDlpDelegate::new(
                &config.delegate,
                &config.selection,
            )));
        }
        self.storage = Some(StorageStage {
            gate: CacheGate::new(store, KeyScheme::new(&config.storage.key_prefix))
                .with_head_timeout(config.storage_request_timeout()),
            materializer,
            lookup_extensions: config.storage.lookup_extensions(),
        });
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// `Ok(None)` when the input carries no identifier
    pub async fn run(&self, input: &str) -> ResolveResult<Option<PipelineOutcome>> {
        let Some(id) = identifier::parse(input) else {
            tracing::info!(input, "input has no video identifier");
            return Ok(None);
        };
        self.run_identifier(&id).await.map(Some)
    }

    pub async fn run_identifier(&self, id: &Identifier) -> ResolveResult<PipelineOutcome> {
        if let Some(storage) = &self.storage {
            if let Some(asset) = storage.gate.lookup(id, &storage.lookup_extensions).await? {
                let resolution = ResolutionResult::from_cache(id.clone(), &asset);
                return Ok(PipelineOutcome::Cached { resolution, asset });
            }
        }

        let resolution = self.resolver.resolve(id).await?;

        let asset = match &self.storage {
            Some(storage) => {
                let ctx = MaterializeContext::new(&resolution, self.resolver.policy());
                Some(
                    storage
                        .materializer
                        .materialize(id, resolution.selected_variant(), &ctx)
                        .await?,
                )
            }
            None => None,
        };

        Ok(PipelineOutcome::Resolved { resolution, asset })
    }
}
