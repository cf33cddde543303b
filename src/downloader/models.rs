// Common data models for the resolution pipeline

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::errors::ErrorKind;
use super::identifier::Identifier;

/// Where the bytes of a variant can be obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VariantReference {
    /// Ready-to-fetch URL
    Direct(String),
    /// Form-encoded parameter set (base URL plus signature) needing reconstruction
    Cipher(String),
    /// File already written to local disk by the subprocess delegate
    LocalFile(PathBuf),
}

/// Which list of the provider document a variant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantOrigin {
    /// Muxed audio+video entry
    Combined,
    /// Audio-only or video-only entry
    Adaptive,
    /// Reported by the external downloader
    Delegate,
    /// Rebuilt from a previously stored artifact
    Cached,
}

/// One retrievable encoding of the content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamVariant {
    pub reference: VariantReference,
    /// Container subtype (mp4, webm, ...)
    pub container: String,
    pub is_audio_only: bool,
    /// Provider-supplied codec string, untrusted
    pub codec_hint: String,
    /// Bits per second, approximate when present
    pub bitrate_hint: Option<u64>,
    pub size_hint: Option<u64>,
    /// Free-form label ("720p60", "AUDIO_QUALITY_MEDIUM")
    pub quality_label: String,
    /// Provider-specific id, used for tie-breaks and cache metadata
    pub format_id: String,
    pub origin: VariantOrigin,
}

impl StreamVariant {
    pub fn direct_url(&self) -> Option<&str> {
        match &self.reference {
            VariantReference::Direct(url) => Some(url),
            _ => None,
        }
    }

    pub fn is_cipher(&self) -> bool {
        matches!(self.reference, VariantReference::Cipher(_))
    }

    /// Copy of this variant pointing at a reconstructed URL
    pub fn with_direct_url(&self, url: String) -> Self {
        Self {
            reference: VariantReference::Direct(url),
            ..self.clone()
        }
    }

    /// File extension used for storage keys
    pub fn extension(&self) -> String {
        let container = self.container.to_ascii_lowercase();
        match container.as_str() {
            "mp4" if self.is_audio_only => "m4a".to_string(),
            "" => "bin".to_string(),
            _ => container,
        }
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.extension(), self.is_audio_only)
    }
}

/// Every extension the materializer writes under; the cache gate checks all of them
pub const STORABLE_EXTENSIONS: &[&str] = &["webm", "m4a", "mp4", "mp3", "opus", "ogg", "3gp", "bin"];

/// Lowercased `extension` if storable, otherwise `bin`
pub fn storable_extension(extension: &str) -> String {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    if STORABLE_EXTENSIONS.contains(&extension.as_str()) {
        extension
    } else {
        "bin".to_string()
    }
}

/// MIME type for a storage extension
pub fn content_type_for(extension: &str, audio_only: bool) -> &'static str {
    match (extension, audio_only) {
        ("m4a", _) => "audio/mp4",
        ("mp4", true) => "audio/mp4",
        ("mp4", false) => "video/mp4",
        ("webm", true) => "audio/webm",
        ("webm", false) => "video/webm",
        ("mp3", _) => "audio/mpeg",
        ("opus", _) | ("ogg", _) => "audio/ogg",
        ("3gp", _) => "video/3gpp",
        _ => "application/octet-stream",
    }
}

/// What the external downloader hands back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateTarget {
    Url(String),
    File(PathBuf),
}

/// Delegate result with best-effort format metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateOutput {
    pub target: DelegateTarget,
    pub container: Option<String>,
    pub bitrate_hint: Option<u64>,
    pub codec_hint: Option<String>,
    pub format_id: Option<String>,
    pub audio_only: bool,
}

impl DelegateOutput {
    pub fn into_variant(self) -> StreamVariant {
        let reference = match self.target {
            DelegateTarget::Url(url) => VariantReference::Direct(url),
            DelegateTarget::File(path) => VariantReference::LocalFile(path),
        };
        StreamVariant {
            reference,
            container: self.container.unwrap_or_default(),
            is_audio_only: self.audio_only,
            codec_hint: self.codec_hint.unwrap_or_default(),
            bitrate_hint: self.bitrate_hint,
            size_hint: None,
            quality_label: String::new(),
            format_id: self.format_id.unwrap_or_else(|| "delegate".to_string()),
            origin: VariantOrigin::Delegate,
        }
    }
}

/// Result of one strategy invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutput {
    Variants(Vec<StreamVariant>),
    Fallback(DelegateOutput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One entry of the append-only attempt log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub strategy_name: String,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub duration_ms: u64,
    pub egress_address: Option<String>,
}

impl ExtractionAttempt {
    pub fn success(strategy_name: &str, duration_ms: u64, egress_address: Option<String>) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            outcome: AttemptOutcome::Success,
            error_kind: None,
            detail: None,
            duration_ms,
            egress_address,
        }
    }

    pub fn failure(
        strategy_name: &str,
        error_kind: ErrorKind,
        detail: impl Into<String>,
        duration_ms: u64,
        egress_address: Option<String>,
    ) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            outcome: AttemptOutcome::Failure,
            error_kind: Some(error_kind),
            detail: Some(detail.into()),
            duration_ms,
            egress_address,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// A previously materialized artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAsset {
    pub key: String,
    pub url: String,
    pub etag: Option<String>,
    pub size_bytes: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Outcome of one successful resolution; immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    identifier: Identifier,
    selected_variant: StreamVariant,
    provenance: Vec<ExtractionAttempt>,
    #[serde(with = "time::serde::rfc3339")]
    extracted_at: OffsetDateTime,
}

impl ResolutionResult {
    pub fn new(
        identifier: Identifier,
        selected_variant: StreamVariant,
        provenance: Vec<ExtractionAttempt>,
        extracted_at: OffsetDateTime,
    ) -> Self {
        Self {
            identifier,
            selected_variant,
            provenance,
            extracted_at,
        }
    }

    /// Rebuild a result from a stored artifact; no strategy ran
    pub fn from_cache(identifier: Identifier, asset: &CachedAsset) -> Self {
        let meta = |key: &str| asset.metadata.get(key).cloned();
        let extension = asset
            .key
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        let container = meta("container").unwrap_or(extension);
        let variant = StreamVariant {
            reference: VariantReference::Direct(asset.url.clone()),
            container,
            is_audio_only: meta("audio-only").map(|v| v == "true").unwrap_or(false),
            codec_hint: meta("codec").unwrap_or_default(),
            bitrate_hint: meta("bitrate").and_then(|v| v.parse().ok()),
            size_hint: Some(asset.size_bytes),
            quality_label: meta("quality").unwrap_or_default(),
            format_id: meta("format-id").unwrap_or_else(|| "cached".to_string()),
            origin: VariantOrigin::Cached,
        };
        let extracted_at = meta("extracted-at")
            .and_then(|v| {
                OffsetDateTime::parse(&v, &time::format_description::well_known::Rfc3339).ok()
            })
            .unwrap_or_else(OffsetDateTime::now_utc);
        Self::new(identifier, variant, Vec::new(), extracted_at)
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn selected_variant(&self) -> &StreamVariant {
        &self.selected_variant
    }

    pub fn provenance(&self) -> &[ExtractionAttempt] {
        &self.provenance
    }

    pub fn extracted_at(&self) -> OffsetDateTime {
        self.extracted_at
    }
}
