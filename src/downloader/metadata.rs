// StreamMetadataParser - turns provider documents into stream variants
//
// HTML pages embed the player JSON under one of several assignments; the
// object is decoded with a streaming deserializer so whatever follows the
// closing brace (`;var meta = ...`, `</script>`) is ignored.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::errors::{ResolveError, ResolveResult};
use super::extractors::diagnostics::diagnose_error;
use super::models::{StreamVariant, VariantOrigin, VariantReference};

lazy_static! {
    /// Tried in order; each match ends on the opening brace of a candidate
    static ref BOUNDARY_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"ytInitialPlayerResponse\s*=\s*\{"#).unwrap(),
        Regex::new(r#"window\[["']ytInitialPlayerResponse["']\]\s*=\s*\{"#).unwrap(),
        Regex::new(r#""playerResponse"\s*:\s*\{"#).unwrap(),
        Regex::new(r#"ytplayer\.config\s*=\s*\{"#).unwrap(),
    ];
    static ref MIME_RE: Regex =
        Regex::new(r#"^\s*(audio|video)/([A-Za-z0-9.+-]+)(?:\s*;\s*codecs\s*=\s*"?([^"]*)"?)?"#).unwrap();
}

/// Anti-JSON-hijacking prefix on some API responses
const XSSI_PREFIX: &str = ")]}'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Watch/embed/mobile page markup
    Html,
    /// Player API response body
    Json,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamMetadataParser;

impl StreamMetadataParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &[u8], kind: SourceKind) -> ResolveResult<Vec<StreamVariant>> {
        let text = String::from_utf8_lossy(raw);
        let player = match kind {
            SourceKind::Html => Self::locate_in_html(&text),
            SourceKind::Json => Self::decode_json(&text),
        }
        .ok_or_else(|| ResolveError::NoMetadataFound("no player response in document".to_string()))?;

        parse_player_response(&player)
    }

    fn locate_in_html(text: &str) -> Option<Value> {
        for pattern in BOUNDARY_PATTERNS.iter() {
            for found in pattern.find_iter(text) {
                // Match ends just past the '{'
                let start = found.end() - 1;
                if let Some(value) = decode_prefix(&text[start..]) {
                    if let Some(player) = unwrap_player(value) {
                        return Some(player);
                    }
                }
            }
        }
        None
    }

    fn decode_json(text: &str) -> Option<Value> {
        let trimmed = text.trim_start();
        let trimmed = trimmed.strip_prefix(XSSI_PREFIX).unwrap_or(trimmed);
        decode_prefix(trimmed).and_then(unwrap_player)
    }
}

/// First JSON value at the start of `text`, ignoring anything after it
fn decode_prefix(text: &str) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_str(text.trim_start()).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Some(value),
        Some(Err(err)) => {
            tracing::debug!(error = %err, "candidate player JSON did not decode");
            None
        }
        None => None,
    }
}

/// The player object itself, or the one wrapped inside config/API envelopes
fn unwrap_player(value: Value) -> Option<Value> {
    if is_player_object(&value) {
        return Some(value);
    }
    if let Some(inner) = value.get("playerResponse") {
        return unwrap_player(inner.clone());
    }
    let args = value.get("args")?;
    if let Some(raw) = args.get("raw_player_response") {
        return unwrap_player(raw.clone());
    }
    match args.get("player_response") {
        Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded).ok().and_then(unwrap_player),
        Some(other) => unwrap_player(other.clone()),
        None => None,
    }
}

fn is_player_object(value: &Value) -> bool {
    value.get("streamingData").is_some() || value.get("playabilityStatus").is_some()
}

/// Variants from a decoded player object; combined formats first
pub fn parse_player_response(player: &Value) -> ResolveResult<Vec<StreamVariant>> {
    check_playability(player)?;

    let streaming = player
        .get("streamingData")
        .ok_or_else(|| ResolveError::NoMetadataFound("player response has no streamingData".to_string()))?;

    let mut variants = Vec::new();
    for (list, origin) in [
        ("formats", VariantOrigin::Combined),
        ("adaptiveFormats", VariantOrigin::Adaptive),
    ] {
        let entries = streaming.get(list).and_then(Value::as_array);
        for (index, entry) in entries.into_iter().flatten().enumerate() {
            match parse_format(entry, origin) {
                Some(variant) => variants.push(variant),
                None => tracing::debug!(list, index, "skipping format entry without a reference"),
            }
        }
    }

    if variants.is_empty() {
        return Err(ResolveError::NoMetadataFound(
            "streamingData contained no usable formats".to_string(),
        ));
    }
    Ok(variants)
}

/// `playabilityStatus.status` other than OK ends the attempt
fn check_playability(player: &Value) -> ResolveResult<()> {
    let Some(playability) = player.get("playabilityStatus") else {
        return Ok(());
    };
    let status = playability.get("status").and_then(Value::as_str).unwrap_or("OK");
    if status == "OK" {
        return Ok(());
    }

    let reason = playability
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let detail = if reason.is_empty() {
        format!("playability status {}", status)
    } else {
        format!("playability status {}: {}", status, reason)
    };

    let blocked = status == "LOGIN_REQUIRED"
        || diagnose_error(reason).map_or(false, |r| r.rotation_might_help());
    if blocked {
        Err(ResolveError::UpstreamBlocked(detail))
    } else {
        Err(ResolveError::NoMetadataFound(detail))
    }
}

fn parse_format(entry: &Value, origin: VariantOrigin) -> Option<StreamVariant> {
    let text = |key: &str| entry.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());

    let reference = if let Some(url) = text("url") {
        VariantReference::Direct(url.to_string())
    } else if let Some(cipher) = text("signatureCipher").or_else(|| text("cipher")) {
        VariantReference::Cipher(cipher.to_string())
    } else {
        return None;
    };

    let (is_audio_only, container, codec_hint) = text("mimeType")
        .and_then(split_mime)
        .unwrap_or((false, String::new(), String::new()));

    let bitrate_hint = lenient_u64(entry.get("bitrate")).or_else(|| lenient_u64(entry.get("averageBitrate")));
    let quality_label = text("qualityLabel")
        .or_else(|| text("audioQuality"))
        .or_else(|| text("quality"))
        .unwrap_or_default()
        .to_string();
    let format_id = lenient_u64(entry.get("itag"))
        .map(|itag| itag.to_string())
        .or_else(|| text("itag").map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    Some(StreamVariant {
        reference,
        container,
        is_audio_only,
        codec_hint,
        bitrate_hint,
        size_hint: lenient_u64(entry.get("contentLength")),
        quality_label,
        format_id,
        origin,
    })
}

/// `audio/webm; codecs="opus"` -> (audio-only, "webm", "opus")
fn split_mime(mime: &str) -> Option<(bool, String, String)> {
    let caps = MIME_RE.captures(mime)?;
    let audio = caps.get(1).map_or(false, |m| m.as_str() == "audio");
    let container = caps.get(2).map(|m| m.as_str().to_ascii_lowercase())?;
    let codecs = caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some((audio, container, codecs))
}

/// Numbers arrive both as JSON numbers and as decimal strings
fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::errors::ErrorKind;

    const PLAYER: &str = r#"{
        "playabilityStatus": {"status": "OK"},
        "streamingData": {
            "formats": [
                {"itag": 18, "url": "https://rr1.googlevideo.com/videoplayback?itag=18",
                 "mimeType": "video/mp4; codecs=\"avc1.42001E, mp4a.40.2\"",
                 "bitrate": 503000, "qualityLabel": "360p", "contentLength": "1234567"}
            ],
            "adaptiveFormats": [
                {"itag": 251, "signatureCipher": "s=abc&url=https%3A%2F%2Frr1.googlevideo.com%2Fvideoplayback",
                 "mimeType": "audio/webm; codecs=\"opus\"",
                 "averageBitrate": 129000, "audioQuality": "AUDIO_QUALITY_MEDIUM"},
                {"itag": 137, "mimeType": "video/mp4"}
            ]
        }
    }"#;

    #[test]
    fn html_with_trailing_script_is_parsed() {
        let html = format!(
            "<html><script>var ytInitialPlayerResponse = {};var meta = document.createElement('meta');</script></html>",
            PLAYER
        );
        let variants = StreamMetadataParser::new()
            .parse(html.as_bytes(), SourceKind::Html)
            .unwrap();
        assert_eq!(variants.len(), 2);

        let combined = &variants[0];
        assert_eq!(combined.origin, VariantOrigin::Combined);
        assert_eq!(combined.container, "mp4");
        assert!(!combined.is_audio_only);
        assert_eq!(combined.codec_hint, "avc1.42001E, mp4a.40.2");
        assert_eq!(combined.size_hint, Some(1_234_567));
        assert_eq!(combined.format_id, "18");

        let audio = &variants[1];
        assert_eq!(audio.origin, VariantOrigin::Adaptive);
        assert!(audio.is_cipher());
        assert!(audio.is_audio_only);
        assert_eq!(audio.bitrate_hint, Some(129_000));
        assert_eq!(audio.quality_label, "AUDIO_QUALITY_MEDIUM");
    }

    #[test]
    fn later_boundary_pattern_is_used_when_first_is_absent() {
        let html = format!(r#"<script>window.config = {{"playerResponse": {}, "other": 1}};</script>"#, PLAYER);
        let variants = StreamMetadataParser::new()
            .parse(html.as_bytes(), SourceKind::Html)
            .unwrap();
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn legacy_config_with_encoded_player_response() {
        let encoded = serde_json::to_string(&serde_json::from_str::<Value>(PLAYER).unwrap().to_string()).unwrap();
        let html = format!(r#"<script>ytplayer.config = {{"args": {{"player_response": {}}}}};</script>"#, encoded);
        let variants = StreamMetadataParser::new()
            .parse(html.as_bytes(), SourceKind::Html)
            .unwrap();
        assert_eq!(variants[0].format_id, "18");
    }

    #[test]
    fn json_wrapper_and_prefix_accepted() {
        let wrapped = format!(")]}}'\n{{\"playerResponse\": {}}}", PLAYER);
        let variants = StreamMetadataParser::new()
            .parse(wrapped.as_bytes(), SourceKind::Json)
            .unwrap();
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn page_without_player_is_no_metadata() {
        let err = StreamMetadataParser::new()
            .parse(b"<html><body>hello</body></html>", SourceKind::Html)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMetadataFound);
    }

    #[test]
    fn truncated_json_is_no_metadata() {
        let err = StreamMetadataParser::new()
            .parse(b"var ytInitialPlayerResponse = {\"streamingData\": {\"formats\": [", SourceKind::Html)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMetadataFound);
    }

    #[test]
    fn login_required_is_blocked() {
        let body = r#"{"playabilityStatus": {"status": "LOGIN_REQUIRED", "reason": "Sign in to confirm you're not a bot"}}"#;
        let err = StreamMetadataParser::new()
            .parse(body.as_bytes(), SourceKind::Json)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamBlocked);
    }

    #[test]
    fn unplayable_is_no_metadata() {
        let body = r#"{"playabilityStatus": {"status": "UNPLAYABLE", "reason": "This video is unavailable"}}"#;
        let err = StreamMetadataParser::new()
            .parse(body.as_bytes(), SourceKind::Json)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMetadataFound);
    }

    #[test]
    fn mime_splitting() {
        assert_eq!(
            split_mime("audio/mp4; codecs=\"mp4a.40.2\""),
            Some((true, "mp4".to_string(), "mp4a.40.2".to_string()))
        );
        assert_eq!(split_mime("video/webm"), Some((false, "webm".to_string(), String::new())));
        assert_eq!(split_mime("text/plain"), None);
    }
}
