// FormatSelector - deterministic choice of one variant for a policy
//
// Handles:
// - Dropping variants whose reference cannot be resolved (cipher failures)
// - Container restriction and quality ceiling
// - Audio-only preference (falls back to everything if no audio-only entry)
// - Smallest-bitrate selection for transcription-style consumers
// - Fixed quality-label preference order otherwise

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cipher::{CipherResolver, QueryCipherResolver};
use super::models::{StreamVariant, VariantReference};

/// Normalized quality tier, highest first in [`QualityLabel::PREFERENCE_ORDER`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityLabel {
    #[serde(rename = "2160p")]
    P2160,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "144p")]
    P144,
    #[serde(rename = "audio_high")]
    AudioHigh,
    #[serde(rename = "audio_medium")]
    AudioMedium,
    #[serde(rename = "audio_low")]
    AudioLow,
}

impl QualityLabel {
    pub const PREFERENCE_ORDER: [QualityLabel; 11] = [
        Self::P2160,
        Self::P1440,
        Self::P1080,
        Self::P720,
        Self::P480,
        Self::P360,
        Self::P240,
        Self::P144,
        Self::AudioHigh,
        Self::AudioMedium,
        Self::AudioLow,
    ];

    /// Parse a provider label such as "1080p60", "720p HDR" or "AUDIO_QUALITY_LOW"
    pub fn parse(label: &str) -> Option<Self> {
        let lower = label.trim().to_ascii_lowercase();
        match lower.as_str() {
            "audio_quality_high" | "audio_high" => return Some(Self::AudioHigh),
            "audio_quality_medium" | "audio_medium" => return Some(Self::AudioMedium),
            "audio_quality_low" | "audio_quality_ultralow" | "audio_low" => {
                return Some(Self::AudioLow)
            }
            _ => {}
        }

        let digits: String = lower.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() || lower[digits.len()..].chars().next() != Some('p') {
            return None;
        }
        let height: u32 = digits.parse().ok()?;
        Some(match height {
            h if h >= 2160 => Self::P2160,
            h if h >= 1440 => Self::P1440,
            h if h >= 1080 => Self::P1080,
            h if h >= 720 => Self::P720,
            h if h >= 480 => Self::P480,
            h if h >= 360 => Self::P360,
            h if h >= 240 => Self::P240,
            _ => Self::P144,
        })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::AudioHigh | Self::AudioMedium | Self::AudioLow)
    }

    /// Position in the preference order; lower is better
    pub fn rank(&self) -> usize {
        Self::PREFERENCE_ORDER
            .iter()
            .position(|label| label == self)
            .unwrap_or(Self::PREFERENCE_ORDER.len())
    }

    /// Above the ceiling within the same kind (video vs audio)
    pub fn exceeds(&self, ceiling: QualityLabel) -> bool {
        self.is_audio() == ceiling.is_audio() && self.rank() < ceiling.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P2160 => "2160p",
            Self::P1440 => "1440p",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
            Self::P240 => "240p",
            Self::P144 => "144p",
            Self::AudioHigh => "audio_high",
            Self::AudioMedium => "audio_medium",
            Self::AudioLow => "audio_low",
        }
    }

    fn height(&self) -> Option<u32> {
        match self {
            Self::P2160 => Some(2160),
            Self::P1440 => Some(1440),
            Self::P1080 => Some(1080),
            Self::P720 => Some(720),
            Self::P480 => Some(480),
            Self::P360 => Some(360),
            Self::P240 => Some(240),
            Self::P144 => Some(144),
            _ => None,
        }
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller wants out of the candidate list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    pub prefer_audio_only: bool,
    pub max_quality_label: Option<QualityLabel>,
    pub minimize_size: bool,
    pub require_container_in: Option<BTreeSet<String>>,
}

impl SelectionPolicy {
    /// Smallest usable audio stream, the transcription default
    pub fn transcription() -> Self {
        Self {
            prefer_audio_only: true,
            minimize_size: true,
            ..Self::default()
        }
    }

    /// Compact form stored in object metadata
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.prefer_audio_only {
            parts.push("audio-only".to_string());
        }
        if self.minimize_size {
            parts.push("min-size".to_string());
        }
        if let Some(label) = self.max_quality_label {
            parts.push(format!("max={}", label));
        }
        if let Some(containers) = &self.require_container_in {
            let list = containers.iter().cloned().collect::<Vec<_>>().join("|");
            parts.push(format!("containers={}", list));
        }
        if parts.is_empty() {
            "best".to_string()
        } else {
            parts.join(",")
        }
    }
}

/// Format selector backed by a swappable cipher resolver
#[derive(Clone)]
pub struct FormatSelector {
    cipher: Arc<dyn CipherResolver>,
}

impl FormatSelector {
    pub fn new(cipher: Arc<dyn CipherResolver>) -> Self {
        Self { cipher }
    }

    /// Pick at most one variant; `None` only if nothing usable remains
    pub fn select(&self, variants: &[StreamVariant], policy: &SelectionPolicy) -> Option<StreamVariant> {
        let mut pool = self.resolvable(variants);

        if let Some(containers) = &policy.require_container_in {
            let allowed: BTreeSet<String> =
                containers.iter().map(|c| c.to_ascii_lowercase()).collect();
            pool.retain(|v| {
                allowed.contains(&v.container.to_ascii_lowercase()) || allowed.contains(&v.extension())
            });
        }

        if let Some(ceiling) = policy.max_quality_label {
            pool.retain(|v| {
                QualityLabel::parse(&v.quality_label).map_or(true, |label| !label.exceeds(ceiling))
            });
        }

        if pool.is_empty() {
            return None;
        }

        if policy.prefer_audio_only && pool.iter().any(|v| v.is_audio_only) {
            pool.retain(|v| v.is_audio_only);
        }

        if policy.minimize_size {
            return Self::smallest(pool);
        }

        Self::by_quality_order(pool)
    }

    /// Variants whose reference is fetchable, ciphers replaced by their URL
    pub fn resolvable(&self, variants: &[StreamVariant]) -> Vec<StreamVariant> {
        variants
            .iter()
            .filter_map(|variant| match &variant.reference {
                VariantReference::Direct(_) | VariantReference::LocalFile(_) => Some(variant.clone()),
                VariantReference::Cipher(_) => match self.cipher.resolve(variant) {
                    Some(url) => Some(variant.with_direct_url(url)),
                    None => {
                        tracing::debug!(
                            format_id = %variant.format_id,
                            resolver = self.cipher.name(),
                            "variant excluded: cipher decode failed"
                        );
                        None
                    }
                },
            })
            .collect()
    }

    /// Lowest bitrate first; missing hints sort last
    fn smallest(mut pool: Vec<StreamVariant>) -> Option<StreamVariant> {
        pool.sort_by(|a, b| {
            a.bitrate_hint
                .is_none()
                .cmp(&b.bitrate_hint.is_none())
                .then(a.bitrate_hint.cmp(&b.bitrate_hint))
                .then(
                    a.size_hint
                        .unwrap_or(u64::MAX)
                        .cmp(&b.size_hint.unwrap_or(u64::MAX)),
                )
                .then(a.format_id.cmp(&b.format_id))
        });
        pool.into_iter().next()
    }

    fn by_quality_order(pool: Vec<StreamVariant>) -> Option<StreamVariant> {
        for label in QualityLabel::PREFERENCE_ORDER {
            let best = pool
                .iter()
                .filter(|v| QualityLabel::parse(&v.quality_label) == Some(label))
                .min_by(|a, b| {
                    b.bitrate_hint
                        .cmp(&a.bitrate_hint)
                        .then(a.format_id.cmp(&b.format_id))
                });
            if let Some(best) = best {
                return Some(best.clone());
            }
        }

        // No known label, keep provider order
        pool.into_iter().next()
    }

    /// yt-dlp format spec matching the policy
    pub fn delegate_format_spec(policy: &SelectionPolicy) -> String {
        let height = policy
            .max_quality_label
            .and_then(|label| label.height())
            .map(|h| format!("[height<={}]", h))
            .unwrap_or_default();

        match (policy.prefer_audio_only, policy.minimize_size) {
            (true, true) => "wa/w".to_string(),
            (true, false) => "ba/b".to_string(),
            (false, true) => format!("w{}/w", height),
            (false, false) => format!("b{}/b", height),
        }
    }
}

impl Default for FormatSelector {
    fn default() -> Self {
        Self::new(Arc::new(QueryCipherResolver))
    }
}

impl fmt::Debug for FormatSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatSelector")
            .field("cipher", &self.cipher.name())
            .finish()
    }
}
