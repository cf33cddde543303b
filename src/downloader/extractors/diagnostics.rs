// Blocking diagnostics - identifies why the upstream refused us
//
// Two inputs are analyzed:
// - free-form error text (subprocess stderr, playability reasons)
// - raw HTML bodies that came back with a success status but are really
//   interstitials (captcha, consent wall, "unusual traffic")

use serde::{Deserialize, Serialize};

use crate::downloader::errors::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingReason {
    /// 403 with no more specific signal
    Forbidden,
    /// Player demands a proof-of-origin token
    PoTokenRequired,
    AgeGated,
    GeoBlocked,
    /// Connection stalls; usually a soft block on the egress address
    SoftTimeout,
    RateLimited,
    /// Captcha or "confirm you're not a bot"
    BotDetection,
    /// Cookie consent page served in place of the watch page
    ConsentWall,
    PrivateVideo,
    Removed,
    DrmProtected,
    Unknown,
}

impl BlockingReason {
    /// A fresh identity (new profile, new egress) may get past this
    pub fn rotation_might_help(&self) -> bool {
        matches!(
            self,
            Self::Forbidden
                | Self::PoTokenRequired
                | Self::GeoBlocked
                | Self::SoftTimeout
                | Self::RateLimited
                | Self::BotDetection
                | Self::ConsentWall
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::PoTokenRequired => "po token required",
            Self::AgeGated => "age gated",
            Self::GeoBlocked => "geo blocked",
            Self::SoftTimeout => "stalled connection",
            Self::RateLimited => "rate limited",
            Self::BotDetection => "bot check",
            Self::ConsentWall => "consent interstitial",
            Self::PrivateVideo => "private video",
            Self::Removed => "video removed",
            Self::DrmProtected => "drm protected",
            Self::Unknown => "unclassified refusal",
        }
    }

    /// Map to the pipeline error taxonomy
    pub fn into_error(self, context: impl Into<String>) -> ResolveError {
        let detail = format!("{}: {}", self.label(), context.into().trim());
        match self {
            Self::SoftTimeout => ResolveError::Timeout(detail),
            Self::PrivateVideo | Self::Removed | Self::DrmProtected => {
                ResolveError::NoUsableVariant(detail)
            }
            Self::Unknown => ResolveError::Delegate(detail),
            _ => ResolveError::UpstreamBlocked(detail),
        }
    }
}

/// First matching row wins; specific phrases sit above generic ones
const TEXT_SIGNATURES: &[(BlockingReason, &[&str])] = &[
    (
        BlockingReason::DrmProtected,
        &["drm", "widevine", "playready", "fairplay", "requires purchase"],
    ),
    (BlockingReason::PoTokenRequired, &["po token", "proof of origin"]),
    // "sign in to confirm" prefixes both the bot check and the age gate
    (
        BlockingReason::BotDetection,
        &["not a bot", "captcha", "unusual traffic", "automated queries"],
    ),
    (
        BlockingReason::AgeGated,
        &["age-restricted", "confirm your age", "age_verification"],
    ),
    (
        BlockingReason::PrivateVideo,
        &["private video", "video is private", "been granted access"],
    ),
    (
        BlockingReason::Removed,
        &["video unavailable", "has been removed", "no longer available", "video is unavailable"],
    ),
    (
        BlockingReason::GeoBlocked,
        &["in your country", "geo restricted", "geo-restricted"],
    ),
    (BlockingReason::RateLimited, &["429", "rate limit", "too many requests"]),
    (BlockingReason::BotDetection, &["bot"]),
    (BlockingReason::Forbidden, &["403", "forbidden"]),
    (
        BlockingReason::SoftTimeout,
        &["timeout", "timed out", "connection refused", "network unreachable"],
    ),
];

/// Classify free-form failure text; `None` only for empty input
pub fn diagnose_error(error: &str) -> Option<BlockingReason> {
    if error.trim().is_empty() {
        return None;
    }
    let lower = error.to_lowercase();
    let reason = TEXT_SIGNATURES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lower.contains(needle)))
        .map(|(reason, _)| *reason)
        .unwrap_or(BlockingReason::Unknown);
    Some(reason)
}

/// Markers of interstitial pages served with a 200 status
const BOT_WALL_MARKERS: &[(&str, BlockingReason)] = &[
    ("www.google.com/recaptcha", BlockingReason::BotDetection),
    ("g-recaptcha", BlockingReason::BotDetection),
    ("unusual traffic from your computer network", BlockingReason::BotDetection),
    ("confirm you're not a bot", BlockingReason::BotDetection),
    ("confirm you\u{2019}re not a bot", BlockingReason::BotDetection),
    ("/sorry/index", BlockingReason::RateLimited),
    ("consent.youtube.com", BlockingReason::ConsentWall),
    ("action=\"https://consent.", BlockingReason::ConsentWall),
];

/// Scan a response body for bot-detection signatures
pub fn detect_bot_wall(body: &str) -> Option<BlockingReason> {
    let lower = body.to_lowercase();
    BOT_WALL_MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, reason)| *reason)
}
