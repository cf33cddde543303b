// Error types for the resolution pipeline

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::extractors::diagnostics::{diagnose_error, BlockingReason};
use super::models::ExtractionAttempt;

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Discriminant of [`ResolveError`], recorded in attempt provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidIdentifier,
    UpstreamBlocked,
    NoMetadataFound,
    CipherDecodeFailed,
    NoUsableVariant,
    AllStrategiesExhausted,
    StorageUnavailable,
    Timeout,
    EgressUnavailable,
    Http,
    Io,
    Delegate,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier => "invalid_identifier",
            Self::UpstreamBlocked => "upstream_blocked",
            Self::NoMetadataFound => "no_metadata_found",
            Self::CipherDecodeFailed => "cipher_decode_failed",
            Self::NoUsableVariant => "no_usable_variant",
            Self::AllStrategiesExhausted => "all_strategies_exhausted",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Timeout => "timeout",
            Self::EgressUnavailable => "egress_unavailable",
            Self::Http => "http",
            Self::Io => "io",
            Self::Delegate => "delegate",
            Self::Config => "config",
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Input does not carry a well-formed 11-character identifier
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Upstream answered with a block page, a bot wall or a non-success status
    #[error("upstream blocked the request: {0}")]
    UpstreamBlocked(String),

    /// No embedded player document could be located
    #[error("no stream metadata found: {0}")]
    NoMetadataFound(String),

    /// Obfuscated variant reference could not be reconstructed
    #[error("cipher decode failed: {0}")]
    CipherDecodeFailed(String),

    /// Metadata was found but no variant survived selection
    #[error("no usable variant: {0}")]
    NoUsableVariant(String),

    /// Every strategy of the chain failed
    #[error("all {} strategies exhausted ({})", .provenance.len(), summarize(.provenance))]
    AllStrategiesExhausted { provenance: Vec<ExtractionAttempt> },

    /// Object store unreachable or rejected the request
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A bounded operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Egress address could not be provisioned while proxies are mandatory
    #[error("egress unavailable: {0}")]
    EgressUnavailable(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// External downloader exited non-zero, was missing or printed garbage
    #[error("delegate failed: {0}")]
    Delegate(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            Self::UpstreamBlocked(_) => ErrorKind::UpstreamBlocked,
            Self::NoMetadataFound(_) => ErrorKind::NoMetadataFound,
            Self::CipherDecodeFailed(_) => ErrorKind::CipherDecodeFailed,
            Self::NoUsableVariant(_) => ErrorKind::NoUsableVariant,
            Self::AllStrategiesExhausted { .. } => ErrorKind::AllStrategiesExhausted,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::EgressUnavailable(_) => ErrorKind::EgressUnavailable,
            Self::Http(_) => ErrorKind::Http,
            Self::Io(_) => ErrorKind::Io,
            Self::Delegate(_) => ErrorKind::Delegate,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Provenance carried by a terminal exhaustion error
    pub fn provenance(&self) -> Option<&[ExtractionAttempt]> {
        match self {
            Self::AllStrategiesExhausted { provenance } => Some(provenance),
            _ => None,
        }
    }
}

fn summarize(provenance: &[ExtractionAttempt]) -> String {
    provenance
        .iter()
        .map(|attempt| {
            let kind = attempt.error_kind.map(|k| k.as_str()).unwrap_or("ok");
            format!("{}: {}", attempt.strategy_name, kind)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 403 || status.as_u16() == 429 {
                return Self::UpstreamBlocked(format!("HTTP {}", status));
            }
        }
        Self::Http(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ResolveError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

/// Classify free-form failure text (subprocess stderr, provider reasons)
pub fn classify_failure_text(text: &str) -> ResolveError {
    if let Some(reason) = diagnose_error(text) {
        if reason != BlockingReason::Unknown {
            return reason.into_error(text);
        }
    }

    // Tool not found
    if text.contains("not found") || text.contains("No such file") || text.contains("command not found") {
        return ResolveError::Delegate(text.to_string());
    }

    // Parse errors
    if text.contains("parse") || text.contains("JSON") {
        return ResolveError::NoMetadataFound(text.to_string());
    }

    if text.contains("Invalid URL") || text.contains("Unsupported URL") {
        return ResolveError::InvalidIdentifier(text.to_string());
    }

    ResolveError::Delegate(text.to_string())
}

impl From<String> for ResolveError {
    fn from(s: String) -> Self {
        classify_failure_text(&s)
    }
}

/// Errors raised while loading [`ResolverConfig`](super::config::ResolverConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ResolveError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
