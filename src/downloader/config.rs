// Resolver configuration, loadable from TOML

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ConfigError;
use super::format_selector::SelectionPolicy;
use super::identity::env_proxies;
use super::models::STORABLE_EXTENSIONS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub network: NetworkSection,
    pub backoff: BackoffSection,
    pub selection: SelectionPolicy,
    pub storage: StorageSection,
    pub delegate: DelegateSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Upper bound for a single strategy attempt
    pub attempt_timeout_secs: u64,
    /// Upper bound for download plus upload in the materializer
    pub transfer_timeout_secs: u64,
    /// Fail attempts instead of falling back to direct egress
    pub proxy_only: bool,
    pub country_hint: Option<String>,
    pub group_hint: Option<String>,
    /// Static egress pool (http://, socks5h://)
    pub proxies: Vec<String>,
    /// Proxy-provisioning service, preferred over `proxies` when set
    pub egress_endpoint: Option<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 30,
            transfer_timeout_secs: 300,
            proxy_only: false,
            country_hint: None,
            group_hint: None,
            proxies: Vec::new(),
            egress_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_delay_ms: u64,
    /// Base used for hosts listed in `aggressive_hosts`
    pub aggressive_base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    /// Jitter ceiling for hosts listed in `aggressive_hosts`
    pub aggressive_jitter_ms: u64,
    pub aggressive_hosts: Vec<String>,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 750,
            aggressive_base_delay_ms: 2_500,
            factor: 2.0,
            max_delay_ms: 20_000,
            jitter_ms: 1_000,
            aggressive_jitter_ms: 3_000,
            aggressive_hosts: vec!["www.youtube.com".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Gate and materialize through the object store
    pub enabled: bool,
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub key_prefix: String,
    /// Base for access URLs; defaults to the path-style object URL
    pub public_base_url: Option<String>,
    /// Looked up first, in order, by the cache gate
    pub candidate_extensions: Vec<String>,
    pub access_key_env: String,
    pub secret_key_env: String,
    pub session_token_env: String,
    /// Bound for a single HEAD and for connecting to the store
    pub request_timeout_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://s3.amazonaws.com".to_string(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            key_prefix: "media".to_string(),
            public_base_url: None,
            candidate_extensions: vec!["webm".to_string(), "m4a".to_string(), "mp4".to_string()],
            access_key_env: "AWS_ACCESS_KEY_ID".to_string(),
            secret_key_env: "AWS_SECRET_ACCESS_KEY".to_string(),
            session_token_env: "AWS_SESSION_TOKEN".to_string(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateSection {
    pub enabled: bool,
    /// Explicit yt-dlp path; detected when unset
    pub binary: Option<String>,
    pub timeout_secs: u64,
    /// Player clients tried in order within one attempt
    pub player_clients: Vec<String>,
    /// Download to disk instead of reporting a direct URL
    pub download_to_disk: bool,
    /// Scratch directory for delegate downloads
    pub work_dir: Option<PathBuf>,
}

impl Default for DelegateSection {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            timeout_secs: 120,
            player_clients: vec!["android".to_string(), "tv".to_string(), "web".to_string()],
            download_to_disk: false,
            work_dir: None,
        }
    }
}

impl StorageSection {
    /// Configured candidates first, then every other extension an artifact can be stored under
    pub fn lookup_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = Vec::new();
        let configured = self.candidate_extensions.iter().map(String::as_str);
        for extension in configured.chain(STORABLE_EXTENSIONS.iter().copied()) {
            let extension = extension.trim_start_matches('.').to_ascii_lowercase();
            if !extension.is_empty() && !extensions.contains(&extension) {
                extensions.push(extension);
            }
        }
        extensions
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl DelegateSection {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("youtube-resolver")
        })
    }
}

impl ResolverConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Self::parse_toml(&raw, path)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Self::parse_toml(raw, Path::new("<inline>"))
    }

    fn parse_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with_env_proxies(env_proxies().len())
    }

    fn validate_with_env_proxies(&self, env_proxies: usize) -> Result<(), ConfigError> {
        if self.network.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "network.attempt_timeout_secs must be positive".to_string(),
            ));
        }
        if self.backoff.factor < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.factor must be at least 1.0".to_string(),
            ));
        }
        if self.storage.enabled && self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.bucket is required when storage is enabled".to_string(),
            ));
        }
        if self.network.proxy_only
            && self.network.proxies.is_empty()
            && env_proxies == 0
            && self.network.egress_endpoint.is_none()
        {
            return Err(ConfigError::Invalid(
                "network.proxy_only needs proxies or an egress_endpoint".to_string(),
            ));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.network.attempt_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.network.transfer_timeout_secs)
    }

    pub fn storage_request_timeout(&self) -> Duration {
        self.storage.request_timeout()
    }

    pub fn with_selection(mut self, policy: SelectionPolicy) -> Self {
        self.selection = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, seconds: u64) -> Self {
        self.network.attempt_timeout_secs = seconds;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.network.proxies = proxies;
        self
    }

    pub fn with_proxy_only(mut self, enabled: bool) -> Self {
        self.network.proxy_only = enabled;
        self
    }

    pub fn with_country_hint(mut self, country: Option<String>) -> Self {
        self.network.country_hint = country;
        self
    }

    pub fn with_storage(mut self, storage: StorageSection) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSection) -> Self {
        self.backoff = backoff;
        self
    }

    /// Zero delays everywhere; used by tests and batch tooling
    pub fn without_backoff(mut self) -> Self {
        self.backoff.base_delay_ms = 0;
        self.backoff.aggressive_base_delay_ms = 0;
        self.backoff.jitter_ms = 0;
        self.backoff.aggressive_jitter_ms = 0;
        self
    }
}
