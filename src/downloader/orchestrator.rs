// Resolver - runs the strategy chain with rotation and backoff
//
// State machine per identifier:
//   Idle -> Attempting(0) -> Succeeded
//                         -> RotatingAndRetrying(1) -> Attempting(1) -> ...
//                         -> Exhausted (after the last strategy)
//
// Strategies never run concurrently for one identifier; every attempt gets
// a fresh identity after a failure and is bounded by the attempt timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use time::OffsetDateTime;
use tokio::time::timeout;

use super::backoff::BackoffPolicy;
use super::config::ResolverConfig;
use super::errors::{ResolveError, ResolveResult};
use super::extractors::{ExtractionStrategy, PageStrategy, PlayerApiStrategy, YtDlpDelegate};
use super::format_selector::{FormatSelector, SelectionPolicy};
use super::identifier::Identifier;
use super::identity::{EgressProvider, IdentityRotator, NetworkIdentity};
use super::models::{ExtractionAttempt, ResolutionResult, StrategyOutput, StreamVariant};
use super::utils::elapsed_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Idle,
    Attempting(usize),
    RotatingAndRetrying(usize),
    Succeeded,
    Exhausted,
}

impl ResolverState {
    pub fn can_transition_to(&self, next: ResolverState) -> bool {
        use ResolverState::*;
        match (*self, next) {
            (Idle, Attempting(0)) | (Idle, Exhausted) => true,
            (Attempting(_), Succeeded) | (Attempting(_), Exhausted) => true,
            (Attempting(i), RotatingAndRetrying(j)) => j == i + 1,
            (RotatingAndRetrying(i), Attempting(j)) => i == j,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolverState::Succeeded | ResolverState::Exhausted)
    }
}

pub struct Resolver {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    rotator: IdentityRotator,
    selector: FormatSelector,
    policy: SelectionPolicy,
    backoff: BackoffPolicy,
    attempt_timeout: Duration,
    seed: Option<u64>,
}

impl Resolver {
    pub fn new(config: &ResolverConfig, egress: Arc<dyn EgressProvider>) -> Self {
        Self {
            strategies: Vec::new(),
            rotator: IdentityRotator::new(egress, &config.network),
            selector: FormatSelector::default(),
            policy: config.selection.clone(),
            backoff: BackoffPolicy::new(&config.backoff),
            attempt_timeout: config.attempt_timeout(),
            seed: None,
        }
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn ExtractionStrategy>) {
        self.strategies.push(strategy);
    }

    /// Watch, embed, mobile, player API, then the delegate if enabled
    pub fn with_default_chain(mut self, config: &ResolverConfig) -> Self {
        let request_timeout = config.attempt_timeout();
        self.add_strategy(Box::new(PageStrategy::watch().with_timeout(request_timeout)));
        self.add_strategy(Box::new(PageStrategy::embed().with_timeout(request_timeout)));
        self.add_strategy(Box::new(PageStrategy::mobile().with_timeout(request_timeout)));
        self.add_strategy(Box::new(PlayerApiStrategy::default().with_timeout(request_timeout)));
        if config.delegate.enabled {
            self.add_strategy(Box::new(YtDlpDelegate::new(&config.delegate, &config.selection)));
        }
        self
    }

    pub fn with_selector(mut self, selector: FormatSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Deterministic profile draws and jitter
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rotator = self.rotator.with_seed(seed);
        self.seed = Some(seed);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    pub async fn resolve(&self, id: &Identifier) -> ResolveResult<ResolutionResult> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut state = ResolverState::Idle;
        let mut provenance: Vec<ExtractionAttempt> = Vec::new();
        let mut next_identity = Some(self.rotator.initial().await);
        let mut last_identity: Option<NetworkIdentity> = None;

        for (index, strategy) in self.strategies.iter().enumerate() {
            transition(&mut state, ResolverState::Attempting(index), id);
            let started = Instant::now();

            let identity_result = match next_identity.take() {
                Some(result) => result,
                None => self.rotator.initial().await,
            };

            let (outcome, egress) = match identity_result {
                Ok(identity) => {
                    let egress = identity.egress.clone();
                    let outcome = self.run_attempt(strategy.as_ref(), id, &identity).await;
                    last_identity = Some(identity);
                    (outcome, egress)
                }
                // Rotation failed under proxy_only: the strategy does not run
                Err(err) => (Err(err), None),
            };

            match outcome {
                Ok(variant) => {
                    provenance.push(ExtractionAttempt::success(strategy.name(), elapsed_ms(started), egress));
                    transition(&mut state, ResolverState::Succeeded, id);
                    tracing::info!(
                        identifier = %id,
                        strategy = strategy.name(),
                        format_id = %variant.format_id,
                        attempts = provenance.len(),
                        "resolved stream"
                    );
                    return Ok(ResolutionResult::new(
                        id.clone(),
                        variant,
                        provenance,
                        OffsetDateTime::now_utc(),
                    ));
                }
                Err(err) => {
                    tracing::warn!(
                        identifier = %id,
                        strategy = strategy.name(),
                        egress = egress.as_deref().unwrap_or("direct"),
                        error = %err,
                        "strategy attempt failed"
                    );
                    provenance.push(ExtractionAttempt::failure(
                        strategy.name(),
                        err.kind(),
                        err.to_string(),
                        elapsed_ms(started),
                        egress,
                    ));
                }
            }

            let Some(next_strategy) = self.strategies.get(index + 1) else {
                break;
            };

            transition(&mut state, ResolverState::RotatingAndRetrying(index + 1), id);
            next_identity = Some(match &last_identity {
                Some(previous) => self.rotator.rotate(previous).await,
                None => self.rotator.initial().await,
            });

            let failures = u32::try_from(provenance.len()).unwrap_or(u32::MAX);
            let delay = self.backoff.delay_for(failures, next_strategy.host(), &mut rng);
            if !delay.is_zero() {
                tracing::debug!(
                    identifier = %id,
                    next_strategy = next_strategy.name(),
                    delay_ms = delay.as_millis() as u64,
                    "backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        transition(&mut state, ResolverState::Exhausted, id);
        tracing::warn!(identifier = %id, attempts = provenance.len(), "all strategies exhausted");
        Err(ResolveError::AllStrategiesExhausted { provenance })
    }

    /// One bounded strategy call followed by selection
    async fn run_attempt(
        &self,
        strategy: &dyn ExtractionStrategy,
        id: &Identifier,
        identity: &NetworkIdentity,
    ) -> ResolveResult<StreamVariant> {
        let budget = strategy
            .attempt_budget()
            .map_or(self.attempt_timeout, |own| own.max(self.attempt_timeout));
        let output = timeout(budget, strategy.attempt(id, identity))
            .await
            .map_err(|_| {
                ResolveError::Timeout(format!(
                    "{} exceeded {}ms",
                    strategy.name(),
                    budget.as_millis()
                ))
            })??;

        match output {
            StrategyOutput::Variants(variants) => {
                if variants.is_empty() {
                    return Err(ResolveError::NoMetadataFound(format!(
                        "{} returned no variants",
                        strategy.name()
                    )));
                }
                self.selector
                    .select(&variants, &self.policy)
                    .ok_or_else(|| self.explain_empty_selection(&variants))
            }
            StrategyOutput::Fallback(output) => Ok(output.into_variant()),
        }
    }

    fn explain_empty_selection(&self, variants: &[StreamVariant]) -> ResolveError {
        let all_cipher = variants.iter().all(|v| v.is_cipher());
        if all_cipher && self.selector.resolvable(variants).is_empty() {
            ResolveError::CipherDecodeFailed(format!("none of {} cipher references decoded", variants.len()))
        } else {
            ResolveError::NoUsableVariant(format!(
                "{} variants, none matched policy {}",
                variants.len(),
                self.policy.describe()
            ))
        }
    }
}

fn transition(state: &mut ResolverState, next: ResolverState, id: &Identifier) {
    debug_assert!(state.can_transition_to(next), "illegal transition {:?} -> {:?}", state, next);
    tracing::trace!(identifier = %id, from = ?state, to = ?next, "resolver state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::config::ResolverConfig;
    use crate::downloader::errors::ErrorKind;
    use crate::downloader::identity::{DirectEgress, StaticProxyPool};
    use crate::downloader::models::{
        DelegateOutput, DelegateTarget, VariantOrigin, VariantReference,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum Script {
        Fail(fn() -> ResolveError),
        Variants(Vec<StreamVariant>),
        Fallback,
        Hang,
    }

    struct ScriptedStrategy {
        name: &'static str,
        script: Script,
        seen_egress: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl ExtractionStrategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn attempt(&self, _id: &Identifier, identity: &NetworkIdentity) -> ResolveResult<StrategyOutput> {
            self.seen_egress.lock().unwrap().push(identity.egress.clone());
            match &self.script {
                Script::Fail(make) => Err(make()),
                Script::Variants(v) => Ok(StrategyOutput::Variants(v.clone())),
                Script::Fallback => Ok(StrategyOutput::Fallback(DelegateOutput {
                    target: DelegateTarget::Url("https://cdn.example/delegate".to_string()),
                    container: Some("m4a".to_string()),
                    bitrate_hint: Some(128_000),
                    codec_hint: Some("mp4a.40.2".to_string()),
                    format_id: Some("140".to_string()),
                    audio_only: true,
                })),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StrategyOutput::Variants(Vec::new()))
                }
            }
        }
    }

    fn audio_variant() -> StreamVariant {
        StreamVariant {
            reference: VariantReference::Direct("https://cdn.example/251".to_string()),
            container: "webm".to_string(),
            is_audio_only: true,
            codec_hint: "opus".to_string(),
            bitrate_hint: Some(130_000),
            size_hint: None,
            quality_label: "AUDIO_QUALITY_MEDIUM".to_string(),
            format_id: "251".to_string(),
            origin: VariantOrigin::Adaptive,
        }
    }

    fn resolver_with(scripts: Vec<(&'static str, Script)>, proxies: Vec<String>) -> (Resolver, Arc<Mutex<Vec<Option<String>>>>) {
        let config = ResolverConfig::default()
            .without_backoff()
            .with_proxies(proxies.clone());
        let egress: Arc<dyn EgressProvider> = if proxies.is_empty() {
            Arc::new(DirectEgress)
        } else {
            Arc::new(StaticProxyPool::new(proxies))
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut resolver = Resolver::new(&config, egress)
            .with_seed(3)
            .with_attempt_timeout(Duration::from_millis(200));
        for (name, script) in scripts {
            resolver.add_strategy(Box::new(ScriptedStrategy {
                name,
                script,
                seen_egress: Arc::clone(&seen),
            }));
        }
        (resolver, seen)
    }

    fn blocked() -> ResolveError {
        ResolveError::UpstreamBlocked("captcha".to_string())
    }

    #[tokio::test]
    async fn exhaustion_records_one_attempt_per_strategy() {
        let (resolver, _) = resolver_with(
            vec![
                ("first", Script::Fail(blocked)),
                ("second", Script::Variants(Vec::new())),
                ("third", Script::Hang),
            ],
            Vec::new(),
        );
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let err = resolver.resolve(&id).await.unwrap_err();
        let provenance = err.provenance().unwrap();
        assert_eq!(provenance.len(), 3);
        let names: Vec<_> = provenance.iter().map(|a| a.strategy_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(provenance[0].error_kind, Some(ErrorKind::UpstreamBlocked));
        assert_eq!(provenance[1].error_kind, Some(ErrorKind::NoMetadataFound));
        assert_eq!(provenance[2].error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let (resolver, seen) = resolver_with(
            vec![
                ("first", Script::Fail(blocked)),
                ("second", Script::Variants(vec![audio_variant()])),
                ("third", Script::Fail(blocked)),
            ],
            Vec::new(),
        );
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let result = resolver.resolve(&id).await.unwrap();
        assert_eq!(result.selected_variant().format_id, "251");
        assert_eq!(result.provenance().len(), 2);
        assert!(!result.provenance()[0].is_success());
        assert!(result.provenance()[1].is_success());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delegate_fallback_counts_as_success() {
        let (resolver, _) = resolver_with(vec![("delegate", Script::Fallback)], Vec::new());
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let result = resolver.resolve(&id).await.unwrap();
        assert_eq!(result.selected_variant().origin, VariantOrigin::Delegate);
        assert_eq!(result.selected_variant().direct_url(), Some("https://cdn.example/delegate"));
    }

    #[tokio::test]
    async fn undecodable_ciphers_are_reported() {
        let mut cipher = audio_variant();
        cipher.reference = VariantReference::Cipher("garbage".to_string());
        let (resolver, _) = resolver_with(vec![("only", Script::Variants(vec![cipher]))], Vec::new());
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let err = resolver.resolve(&id).await.unwrap_err();
        assert_eq!(err.provenance().unwrap()[0].error_kind, Some(ErrorKind::CipherDecodeFailed));
    }

    #[tokio::test]
    async fn provenance_records_egress_per_attempt() {
        let (resolver, seen) = resolver_with(
            vec![
                ("first", Script::Fail(blocked)),
                ("second", Script::Fail(blocked)),
            ],
            vec!["http://p1:3128".to_string(), "http://p2:3128".to_string()],
        );
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let err = resolver.resolve(&id).await.unwrap_err();
        let provenance = err.provenance().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(provenance[0].egress_address, seen[0]);
        assert_eq!(provenance[1].egress_address, seen[1]);
    }

    #[tokio::test]
    async fn consecutive_attempts_use_different_egress() {
        let (resolver, seen) = resolver_with(
            vec![
                ("first", Script::Fail(blocked)),
                ("second", Script::Fail(blocked)),
                ("third", Script::Fail(blocked)),
                ("fourth", Script::Fail(blocked)),
            ],
            vec!["http://p1:3128".to_string(), "http://p2:3128".to_string()],
        );
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        resolver.resolve(&id).await.unwrap_err();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for pair in seen.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delegate_outlives_attempt_timeout_to_reach_next_client() {
        use crate::downloader::config::DelegateSection;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("yt-dlp");
        std::fs::write(
            &script,
            r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    *player_client=android*) exec sleep 10 ;;
  esac
done
echo '{"url": "https://cdn.example/tv", "ext": "m4a", "format_id": "140", "vcodec": "none", "acodec": "mp4a.40.2"}'
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let delegate_config = DelegateSection {
            binary: Some(script.to_string_lossy().into_owned()),
            timeout_secs: 1,
            player_clients: vec!["android".to_string(), "tv".to_string()],
            ..DelegateSection::default()
        };
        let config = ResolverConfig::default().without_backoff();
        let mut resolver = Resolver::new(&config, Arc::new(DirectEgress))
            .with_attempt_timeout(Duration::from_millis(200));
        resolver.add_strategy(Box::new(YtDlpDelegate::new(&delegate_config, &config.selection)));

        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let result = resolver.resolve(&id).await.unwrap();
        assert_eq!(result.selected_variant().direct_url(), Some("https://cdn.example/tv"));
        assert_eq!(result.provenance().len(), 1);
    }

    #[tokio::test]
    async fn empty_chain_is_exhausted_immediately() {
        let (resolver, _) = resolver_with(Vec::new(), Vec::new());
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let err = resolver.resolve(&id).await.unwrap_err();
        assert_eq!(err.provenance().map(|p| p.len()), Some(0));
    }

    #[test]
    fn default_chain_order() {
        let config = ResolverConfig::default();
        let resolver = Resolver::new(&config, Arc::new(DirectEgress)).with_default_chain(&config);
        assert_eq!(
            resolver.strategy_names(),
            vec!["watch-page", "embed-page", "mobile-page", "player-api", "subprocess-delegate"]
        );
    }

    #[test]
    fn state_transitions() {
        use ResolverState::*;
        assert!(Idle.can_transition_to(Attempting(0)));
        assert!(Attempting(0).can_transition_to(RotatingAndRetrying(1)));
        assert!(RotatingAndRetrying(1).can_transition_to(Attempting(1)));
        assert!(Attempting(1).can_transition_to(Succeeded));
        assert!(!Attempting(0).can_transition_to(Attempting(1)));
        assert!(!Succeeded.can_transition_to(Attempting(0)));
        assert!(Exhausted.is_terminal());
    }
}
