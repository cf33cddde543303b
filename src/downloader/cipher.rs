// CipherResolver - best-effort reconstruction of obfuscated stream references
//
// The provider sometimes ships a form-encoded parameter set instead of a URL:
//   s=<signature>&sp=<param name>&url=<percent-encoded base URL>
// The scheme changes without notice, so everything here returns `None` on
// failure and callers treat the variant as currently unusable.

use url::form_urlencoded;
use url::Url;

use super::models::{StreamVariant, VariantReference};

/// Swappable decoder for obfuscated references
pub trait CipherResolver: Send + Sync {
    /// Name of the resolver (for logging)
    fn name(&self) -> &'static str;

    /// Fetchable URL for the variant, or `None` if it cannot be reconstructed
    fn resolve(&self, variant: &StreamVariant) -> Option<String>;
}

/// Recombines base URL and signature from the encoded parameter set
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryCipherResolver;

impl QueryCipherResolver {
    pub fn new() -> Self {
        Self
    }

    fn reconstruct(encoded: &str) -> Option<String> {
        let mut base = None;
        let mut signature = None;
        let mut signature_param = None;

        for (key, value) in form_urlencoded::parse(encoded.as_bytes()) {
            match key.as_ref() {
                "url" => base = Some(value.into_owned()),
                "s" | "sig" => signature = Some(value.into_owned()),
                "sp" => signature_param = Some(value.into_owned()),
                _ => {}
            }
        }

        let base = base.filter(|b| !b.is_empty())?;
        let signature = signature.filter(|s| !s.is_empty())?;
        let param = signature_param
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "signature".to_string());

        let mut url = Url::parse(&base).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.query_pairs_mut().append_pair(&param, &signature);
        Some(url.to_string())
    }
}

impl CipherResolver for QueryCipherResolver {
    fn name(&self) -> &'static str {
        "query-cipher"
    }

    fn resolve(&self, variant: &StreamVariant) -> Option<String> {
        match &variant.reference {
            VariantReference::Direct(url) => Some(url.clone()),
            VariantReference::Cipher(encoded) => {
                let resolved = Self::reconstruct(encoded);
                if resolved.is_none() {
                    tracing::debug!(
                        format_id = %variant.format_id,
                        "cipher reference could not be reconstructed"
                    );
                }
                resolved
            }
            VariantReference::LocalFile(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::VariantOrigin;

    fn cipher_variant(encoded: &str) -> StreamVariant {
        StreamVariant {
            reference: VariantReference::Cipher(encoded.to_string()),
            container: "webm".to_string(),
            is_audio_only: true,
            codec_hint: "opus".to_string(),
            bitrate_hint: Some(135_000),
            size_hint: None,
            quality_label: "AUDIO_QUALITY_MEDIUM".to_string(),
            format_id: "251".to_string(),
            origin: VariantOrigin::Adaptive,
        }
    }

    #[test]
    fn recombines_signature_with_named_param() {
        let variant = cipher_variant(
            "s=AOq0QJ8wRQIhAK&sp=sig&url=https%3A%2F%2Frr1.googlevideo.com%2Fvideoplayback%3Fitag%3D251%26expire%3D1700000000",
        );
        let url = QueryCipherResolver.resolve(&variant).unwrap();
        assert_eq!(
            url,
            "https://rr1.googlevideo.com/videoplayback?itag=251&expire=1700000000&sig=AOq0QJ8wRQIhAK"
        );
    }

    #[test]
    fn defaults_to_signature_param() {
        let variant = cipher_variant("url=https%3A%2F%2Fcdn.example%2Fv&s=abc");
        assert_eq!(
            QueryCipherResolver.resolve(&variant).as_deref(),
            Some("https://cdn.example/v?signature=abc")
        );
    }

    #[test]
    fn missing_parts_yield_none() {
        assert!(QueryCipherResolver
            .resolve(&cipher_variant("url=https%3A%2F%2Fcdn.example%2Fv"))
            .is_none());
        assert!(QueryCipherResolver.resolve(&cipher_variant("s=abc&sp=sig")).is_none());
        assert!(QueryCipherResolver.resolve(&cipher_variant("url=not%20a%20url&s=abc")).is_none());
        assert!(QueryCipherResolver.resolve(&cipher_variant("")).is_none());
    }

    #[test]
    fn direct_reference_passes_through() {
        let mut variant = cipher_variant("");
        variant.reference = VariantReference::Direct("https://cdn.example/a".to_string());
        assert_eq!(
            QueryCipherResolver.resolve(&variant).as_deref(),
            Some("https://cdn.example/a")
        );
    }
}
