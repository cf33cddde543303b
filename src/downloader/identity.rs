// Network identity: header profile plus egress address, replaced on rotation
//
// Handles:
// - A fixed pool of internally consistent header profiles
// - Egress providers (static proxy pool, provisioning endpoint, direct)
// - Rotation that avoids reusing the previous egress when possible

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use super::config::NetworkSection;
use super::errors::{ResolveError, ResolveResult};

/// Re-draws allowed when the provider hands back the previous address
const MAX_EGRESS_DRAWS: usize = 3;

/// Env var with extra comma-separated proxies for the static pool
pub const PROXIES_ENV: &str = "YT_RESOLVER_PROXIES";

/// A browser fingerprint whose headers agree with each other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderProfile {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub accept_language: &'static str,
    /// `sec-ch-ua-platform`, only sent by Chromium-based profiles
    pub platform_hint: Option<&'static str>,
    pub mobile: bool,
}

impl HeaderProfile {
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("User-Agent".to_string(), self.user_agent.to_string()),
            ("Accept-Language".to_string(), self.accept_language.to_string()),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
        ];
        if let Some(platform) = self.platform_hint {
            headers.push(("sec-ch-ua-platform".to_string(), format!("\"{}\"", platform)));
            headers.push((
                "sec-ch-ua-mobile".to_string(),
                if self.mobile { "?1" } else { "?0" }.to_string(),
            ));
        }
        headers
    }
}

pub const HEADER_PROFILES: &[HeaderProfile] = &[
    HeaderProfile {
        name: "chrome-windows",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        platform_hint: Some("Windows"),
        mobile: false,
    },
    HeaderProfile {
        name: "chrome-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        platform_hint: Some("macOS"),
        mobile: false,
    },
    HeaderProfile {
        name: "firefox-linux",
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        accept_language: "en-US,en;q=0.5",
        platform_hint: None,
        mobile: false,
    },
    HeaderProfile {
        name: "safari-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        accept_language: "en-GB,en;q=0.9",
        platform_hint: None,
        mobile: false,
    },
    HeaderProfile {
        name: "chrome-android",
        user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
        accept_language: "en-US,en;q=0.9",
        platform_hint: Some("Android"),
        mobile: true,
    },
    HeaderProfile {
        name: "safari-ios",
        user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
        accept_language: "en-US,en;q=0.9",
        platform_hint: None,
        mobile: true,
    },
];

/// Headers and egress used by exactly one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub headers: Vec<(String, String)>,
    /// Proxy URL, `None` for direct egress
    pub egress: Option<String>,
    pub country: Option<String>,
    pub profile_name: &'static str,
}

impl NetworkIdentity {
    pub fn from_profile(profile: &HeaderProfile, egress: Option<String>, country: Option<String>) -> Self {
        Self {
            headers: profile.headers(),
            egress,
            country,
            profile_name: profile.name,
        }
    }

    /// First desktop profile, no proxy
    pub fn direct() -> Self {
        Self::from_profile(&HEADER_PROFILES[0], None, None)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("User-Agent")
    }
}

/// Source of egress addresses
#[async_trait]
pub trait EgressProvider: Send + Sync {
    /// Name of the provider (for logging)
    fn name(&self) -> &'static str;

    /// Proxy URL to use next; `Ok(None)` means connect directly
    async fn request_egress(
        &self,
        country: Option<&str>,
        group: Option<&str>,
    ) -> ResolveResult<Option<String>>;

    /// Like `request_egress`, steering away from `avoid` when the provider can
    ///
    /// Opaque providers keep the default and rely on the rotator's re-draws.
    async fn request_egress_avoiding(
        &self,
        country: Option<&str>,
        group: Option<&str>,
        _avoid: Option<&str>,
    ) -> ResolveResult<Option<String>> {
        self.request_egress(country, group).await
    }
}

/// No proxy at all
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectEgress;

#[async_trait]
impl EgressProvider for DirectEgress {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn request_egress(&self, _country: Option<&str>, _group: Option<&str>) -> ResolveResult<Option<String>> {
        Ok(None)
    }
}

/// Non-blank entries of `YT_RESOLVER_PROXIES`
pub fn env_proxies() -> Vec<String> {
    std::env::var(PROXIES_ENV)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

/// Random choice from a fixed list of proxies
#[derive(Debug, Clone, Default)]
pub struct StaticProxyPool {
    entries: Vec<String>,
}

impl StaticProxyPool {
    /// Trims entries and drops blanks and duplicates, keeping first occurrences
    pub fn new(entries: Vec<String>) -> Self {
        let mut seen = BTreeSet::new();
        let entries = entries
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && seen.insert(value.clone()))
            .collect();
        Self { entries }
    }

    /// Configured proxies plus any listed in `YT_RESOLVER_PROXIES`
    pub fn from_config(network: &NetworkSection) -> Self {
        let mut entries = env_proxies();
        entries.extend(network.proxies.iter().cloned());
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EgressProvider for StaticProxyPool {
    fn name(&self) -> &'static str {
        "static-pool"
    }

    async fn request_egress(&self, country: Option<&str>, _group: Option<&str>) -> ResolveResult<Option<String>> {
        if self.entries.is_empty() {
            return Err(ResolveError::EgressUnavailable("proxy pool is empty".to_string()));
        }
        if let Some(country) = country {
            tracing::debug!(country, "static pool ignores country hint");
        }
        let mut rng = rand::thread_rng();
        Ok(self.entries.choose(&mut rng).cloned())
    }

    async fn request_egress_avoiding(
        &self,
        country: Option<&str>,
        group: Option<&str>,
        avoid: Option<&str>,
    ) -> ResolveResult<Option<String>> {
        let alternatives: Vec<&String> = self
            .entries
            .iter()
            .filter(|entry| Some(entry.as_str()) != avoid)
            .collect();
        if alternatives.is_empty() {
            return self.request_egress(country, group).await;
        }
        let mut rng = rand::thread_rng();
        Ok(alternatives.choose(&mut rng).map(|entry| entry.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct EgressResponse {
    proxy: Option<String>,
    address: Option<String>,
}

/// Proxy-provisioning service answering `{"proxy": "..."}`
#[derive(Debug, Clone)]
pub struct HttpEgressProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEgressProvider {
    pub fn new(endpoint: impl Into<String>) -> ResolveResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl EgressProvider for HttpEgressProvider {
    fn name(&self) -> &'static str {
        "http-endpoint"
    }

    async fn request_egress(&self, country: Option<&str>, group: Option<&str>) -> ResolveResult<Option<String>> {
        let mut query = Vec::new();
        if let Some(country) = country {
            query.push(("country", country));
        }
        if let Some(group) = group {
            query.push(("group", group));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|e| ResolveError::EgressUnavailable(format!("egress endpoint unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(ResolveError::EgressUnavailable(format!(
                "egress endpoint returned HTTP {}",
                response.status()
            )));
        }
        let body: EgressResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::EgressUnavailable(format!("malformed egress response: {}", e)))?;
        Ok(body.proxy.or(body.address).filter(|value| !value.trim().is_empty()))
    }
}

/// Pick the provider the config asks for
pub fn egress_from_config(network: &NetworkSection) -> ResolveResult<Arc<dyn EgressProvider>> {
    if let Some(endpoint) = &network.egress_endpoint {
        return Ok(Arc::new(HttpEgressProvider::new(endpoint.clone())?));
    }
    let pool = StaticProxyPool::from_config(network);
    if pool.is_empty() {
        Ok(Arc::new(DirectEgress))
    } else {
        Ok(Arc::new(pool))
    }
}

/// Draws fresh identities for successive attempts
pub struct IdentityRotator {
    egress: Arc<dyn EgressProvider>,
    country_hint: Option<String>,
    group_hint: Option<String>,
    proxy_only: bool,
    rng: Mutex<StdRng>,
}

impl IdentityRotator {
    pub fn new(egress: Arc<dyn EgressProvider>, network: &NetworkSection) -> Self {
        Self {
            egress,
            country_hint: network.country_hint.clone(),
            group_hint: network.group_hint.clone(),
            proxy_only: network.proxy_only,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible profile draws
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn proxy_only(&self) -> bool {
        self.proxy_only
    }

    pub async fn initial(&self) -> ResolveResult<NetworkIdentity> {
        self.draw(None).await
    }

    /// Replacement for `previous`, never reusing its egress if an alternative shows up
    pub async fn rotate(&self, previous: &NetworkIdentity) -> ResolveResult<NetworkIdentity> {
        self.draw(previous.egress.as_deref()).await
    }

    async fn draw(&self, avoid: Option<&str>) -> ResolveResult<NetworkIdentity> {
        let profile = self.pick_profile();
        let egress = self.pick_egress(avoid).await?;
        tracing::debug!(
            profile = profile.name,
            egress = egress.as_deref().unwrap_or("direct"),
            "drew network identity"
        );
        Ok(NetworkIdentity::from_profile(profile, egress, self.country_hint.clone()))
    }

    fn pick_profile(&self) -> &'static HeaderProfile {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        HEADER_PROFILES.choose(&mut *rng).unwrap_or(&HEADER_PROFILES[0])
    }

    async fn pick_egress(&self, avoid: Option<&str>) -> ResolveResult<Option<String>> {
        let country = self.country_hint.as_deref();
        let group = self.group_hint.as_deref();

        let mut chosen = None;
        for _ in 0..MAX_EGRESS_DRAWS {
            match self.egress.request_egress_avoiding(country, group, avoid).await {
                Ok(candidate) => {
                    let repeat = candidate.is_some() && candidate.as_deref() == avoid;
                    chosen = Some(candidate);
                    if !repeat {
                        break;
                    }
                }
                Err(err) => return self.degrade(err),
            }
        }

        match chosen.flatten() {
            Some(address) => Ok(Some(address)),
            None if self.proxy_only => Err(ResolveError::EgressUnavailable(format!(
                "{} returned no egress address",
                self.egress.name()
            ))),
            None => Ok(None),
        }
    }

    fn degrade(&self, err: ResolveError) -> ResolveResult<Option<String>> {
        if self.proxy_only {
            return Err(ResolveError::EgressUnavailable(err.to_string()));
        }
        tracing::warn!(
            provider = self.egress.name(),
            error = %err,
            "egress provider failed, falling back to direct egress"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out addresses from a script, cycling
    struct ScriptedEgress {
        script: Vec<Option<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EgressProvider for ScriptedEgress {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn request_egress(&self, _c: Option<&str>, _g: Option<&str>) -> ResolveResult<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.script[n % self.script.len()].map(str::to_string))
        }
    }

    struct FailingEgress;

    #[async_trait]
    impl EgressProvider for FailingEgress {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn request_egress(&self, _c: Option<&str>, _g: Option<&str>) -> ResolveResult<Option<String>> {
            Err(ResolveError::EgressUnavailable("provider down".to_string()))
        }
    }

    fn network(proxy_only: bool) -> NetworkSection {
        NetworkSection {
            proxy_only,
            country_hint: Some("NL".to_string()),
            ..NetworkSection::default()
        }
    }

    #[test]
    fn profiles_are_consistent() {
        for profile in HEADER_PROFILES {
            let ua_mobile = profile.user_agent.contains("Mobile");
            assert_eq!(ua_mobile, profile.mobile, "{}", profile.name);
            if let Some(platform) = profile.platform_hint {
                let mobile_platform = matches!(platform, "Android" | "iOS");
                assert_eq!(mobile_platform, profile.mobile, "{}", profile.name);
            }
        }
    }

    #[test]
    fn desktop_headers_never_claim_mobile() {
        for profile in HEADER_PROFILES.iter().filter(|p| !p.mobile) {
            let identity = NetworkIdentity::from_profile(profile, None, None);
            assert_ne!(identity.header("sec-ch-ua-mobile"), Some("?1"));
            assert_ne!(identity.header("sec-ch-ua-platform"), Some("\"Android\""));
        }
    }

    #[tokio::test]
    async fn rotation_avoids_previous_egress() {
        let egress = Arc::new(ScriptedEgress {
            script: vec![Some("socks5h://a:1080"), Some("socks5h://a:1080"), Some("socks5h://b:1080")],
            calls: AtomicUsize::new(0),
        });
        let rotator = IdentityRotator::new(egress, &network(false)).with_seed(7);
        let first = rotator.initial().await.unwrap();
        assert_eq!(first.egress.as_deref(), Some("socks5h://a:1080"));
        assert_eq!(first.country.as_deref(), Some("NL"));

        let second = rotator.rotate(&first).await.unwrap();
        assert_eq!(second.egress.as_deref(), Some("socks5h://b:1080"));
    }

    #[tokio::test]
    async fn single_address_is_reused_after_bounded_draws() {
        let egress = Arc::new(ScriptedEgress {
            script: vec![Some("http://only:8080")],
            calls: AtomicUsize::new(0),
        });
        let rotator = IdentityRotator::new(egress.clone(), &network(false));
        let first = rotator.initial().await.unwrap();
        let second = rotator.rotate(&first).await.unwrap();
        assert_eq!(second.egress, first.egress);
        assert_eq!(egress.calls.load(Ordering::SeqCst), 1 + MAX_EGRESS_DRAWS);
    }

    #[tokio::test]
    async fn egress_failure_degrades_to_direct() {
        let rotator = IdentityRotator::new(Arc::new(FailingEgress), &network(false));
        let identity = rotator.initial().await.unwrap();
        assert!(identity.egress.is_none());
    }

    #[tokio::test]
    async fn egress_failure_is_fatal_when_proxy_only() {
        let rotator = IdentityRotator::new(Arc::new(FailingEgress), &network(true));
        let err = rotator.initial().await.unwrap_err();
        assert!(matches!(err, ResolveError::EgressUnavailable(_)));

        let rotator = IdentityRotator::new(Arc::new(DirectEgress), &network(true));
        assert!(rotator.initial().await.is_err());
    }

    #[tokio::test]
    async fn static_pool_picks_from_entries() {
        let pool = StaticProxyPool::new(vec![" http://p1:1 ".to_string(), String::new()]);
        assert_eq!(pool.len(), 1);
        let picked = pool.request_egress(None, None).await.unwrap();
        assert_eq!(picked.as_deref(), Some("http://p1:1"));

        let empty = StaticProxyPool::default();
        assert!(empty.request_egress(None, None).await.is_err());
    }

    #[tokio::test]
    async fn two_entry_pool_alternates_on_every_rotation() {
        let pool = StaticProxyPool::new(vec!["http://p1:1".to_string(), "http://p2:2".to_string()]);
        let rotator = IdentityRotator::new(Arc::new(pool), &network(false));
        let mut current = rotator.initial().await.unwrap();
        for _ in 0..400 {
            let next = rotator.rotate(&current).await.unwrap();
            assert!(next.egress.is_some());
            assert_ne!(next.egress, current.egress);
            current = next;
        }
    }

    #[tokio::test]
    async fn pool_steers_away_from_avoided_entry() {
        let pool = StaticProxyPool::new(vec!["http://p1:1".to_string(), "http://p2:2".to_string()]);
        for _ in 0..50 {
            let picked = pool
                .request_egress_avoiding(None, None, Some("http://p1:1"))
                .await
                .unwrap();
            assert_eq!(picked.as_deref(), Some("http://p2:2"));
        }

        let single = StaticProxyPool::new(vec!["http://p1:1".to_string()]);
        let picked = single
            .request_egress_avoiding(None, None, Some("http://p1:1"))
            .await
            .unwrap();
        assert_eq!(picked.as_deref(), Some("http://p1:1"));
    }

    #[test]
    fn pool_drops_non_adjacent_duplicates() {
        let pool = StaticProxyPool::new(vec![
            "http://a:1".to_string(),
            "http://b:2".to_string(),
            " http://a:1".to_string(),
        ]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn seeded_rotators_draw_the_same_profiles() {
        let a = IdentityRotator::new(Arc::new(DirectEgress), &network(false)).with_seed(42);
        let b = IdentityRotator::new(Arc::new(DirectEgress), &network(false)).with_seed(42);
        for _ in 0..8 {
            assert_eq!(a.pick_profile().name, b.pick_profile().name);
        }
    }
}
