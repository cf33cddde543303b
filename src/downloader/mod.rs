// Downloader module - stream resolution pipeline
//
// identifier -> cache gate -> resolver (strategies, rotation, backoff)
//            -> format selector -> materializer -> object store

pub mod backoff;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod errors;
pub mod extractors;
pub mod format_selector;
pub mod identifier;
pub mod identity;
pub mod materializer;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;
pub mod utils;

pub use backoff::BackoffPolicy;
pub use cache::CacheGate;
pub use cipher::{CipherResolver, QueryCipherResolver};
pub use config::ResolverConfig;
pub use errors::{classify_failure_text, ConfigError, ErrorKind, ResolveError, ResolveResult};
pub use extractors::ExtractionStrategy;
pub use format_selector::{FormatSelector, QualityLabel, SelectionPolicy};
pub use identifier::Identifier;
pub use identity::{
    DirectEgress, EgressProvider, HttpEgressProvider, IdentityRotator, NetworkIdentity, StaticProxyPool,
};
pub use materializer::{MaterializeContext, Materializer};
pub use metadata::{SourceKind, StreamMetadataParser};
pub use models::{
    CachedAsset, ExtractionAttempt, ResolutionResult, StrategyOutput, StreamVariant, VariantOrigin,
    VariantReference,
};
pub use orchestrator::{Resolver, ResolverState};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use storage::{KeyScheme, ObjectHead, ObjectStore, S3Credentials, S3ObjectStore};
