// ExtractionStrategy trait - one way of obtaining stream variants

use std::time::Duration;

use async_trait::async_trait;

use crate::downloader::errors::ResolveResult;
use crate::downloader::identifier::Identifier;
use crate::downloader::identity::NetworkIdentity;
use crate::downloader::models::StrategyOutput;

/// Host of the public watch surfaces
pub const WATCH_HOST: &str = "www.youtube.com";

/// Trait for extraction strategies
///
/// Implementations make no retries of their own: the resolver owns rotation,
/// backoff and the attempt timeout. Every request must go out with the
/// headers and egress of the identity passed in.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// Name of the strategy (for logging and provenance)
    fn name(&self) -> &'static str;

    /// Host contacted by this strategy; selects the backoff base
    fn host(&self) -> &str {
        WATCH_HOST
    }

    /// Own upper bound for one attempt, used when longer than the resolver's
    fn attempt_budget(&self) -> Option<Duration> {
        None
    }

    /// Produce candidate variants, or a delegate result, for one identifier
    async fn attempt(&self, id: &Identifier, identity: &NetworkIdentity) -> ResolveResult<StrategyOutput>;
}
