// Identifier extraction from the URL shapes the provider hands out

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::errors::ResolveError;

lazy_static::lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap();
}

/// Hosts serving the canonical watch page and its path variants
const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];

/// Short-link hosts carrying the token as the first path segment
const SHORT_HOSTS: &[&str] = &["youtu.be", "www.youtu.be"];

/// Path prefixes followed directly by the token
const PATH_PREFIXES: &[&str] = &["embed", "v", "e", "shorts", "live"];

/// The 11-character opaque token naming one piece of content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Accepts an already-isolated token
    pub fn from_token(token: &str) -> Option<Self> {
        if TOKEN_RE.is_match(token) {
            Some(Self(token.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s).ok_or_else(|| ResolveError::InvalidIdentifier(s.to_string()))
    }
}

impl TryFrom<String> for Identifier {
    type Error = ResolveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_token(&value).ok_or(ResolveError::InvalidIdentifier(value))
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

/// Extract the identifier from a watch, short-link, embed or bare-path URL.
///
/// A bare 11-character token is accepted as-is. Anything else without a
/// well-formed token yields `None`; this function never panics.
pub fn parse(input: &str) -> Option<Identifier> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(id) = Identifier::from_token(trimmed) {
        return Some(id);
    }

    let url = Url::parse(trimmed)
        .or_else(|_| Url::parse(&format!("https://{}", trimmed)))
        .ok()?;

    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let mut segments = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();

    if SHORT_HOSTS.contains(&host.as_str()) {
        return segments.first().and_then(|seg| Identifier::from_token(seg));
    }

    if !WATCH_HOSTS.contains(&host.as_str()) {
        return None;
    }

    if segments.first() == Some(&"watch") {
        return url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .and_then(|(_, value)| Identifier::from_token(&value));
    }

    if segments.len() >= 2 && PATH_PREFIXES.contains(&segments[0]) {
        let token = segments.swap_remove(1);
        return Identifier::from_token(token);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "dQw4w9WgXcQ";

    #[test]
    fn short_link() {
        assert_eq!(
            parse("https://youtu.be/dQw4w9WgXcQ").map(|id| id.to_string()),
            Some(TOKEN.to_string())
        );
    }

    #[test]
    fn all_shapes_yield_same_token() {
        let shapes = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ&t=42",
            "http://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ&list=RDAMVM",
            "https://youtu.be/dQw4w9WgXcQ?si=abcdef",
            "https://www.youtube.com/embed/dQw4w9WgXcQ?autoplay=1",
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/v/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/live/dQw4w9WgXcQ",
            "www.youtube.com/watch?v=dQw4w9WgXcQ",
            "youtu.be/dQw4w9WgXcQ",
            "dQw4w9WgXcQ",
        ];
        for shape in shapes {
            assert_eq!(
                parse(shape).as_ref().map(Identifier::as_str),
                Some(TOKEN),
                "shape {shape}"
            );
        }
    }

    #[test]
    fn rejects_inputs_without_token() {
        let rejects = [
            "https://example.com",
            "",
            "   ",
            "not a url at all",
            "https://www.youtube.com/",
            "https://www.youtube.com/watch",
            "https://www.youtube.com/watch?v=short",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQextra",
            "https://www.youtube.com/watch?v=dQw4w9WgX!Q",
            "https://youtu.be/",
            "https://www.youtube.com/channel/UCuAXFkgsw1L7xaCfnd5JJOw",
            "https://evil.example/watch?v=dQw4w9WgXcQ",
            "https://youtube.com.evil.example/watch?v=dQw4w9WgXcQ",
            "ftp://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/embed/",
        ];
        for input in rejects {
            assert!(parse(input).is_none(), "accepted {input:?}");
        }
    }

    #[test]
    fn from_str_reports_invalid_identifier() {
        let err = "https://example.com".parse::<Identifier>().unwrap_err();
        assert!(matches!(err, ResolveError::InvalidIdentifier(_)));
        let id: Identifier = "https://youtu.be/dQw4w9WgXcQ".parse().unwrap();
        assert_eq!(id.watch_url(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn serde_roundtrip_validates() {
        let id: Identifier = serde_json::from_str("\"dQw4w9WgXcQ\"").unwrap();
        assert_eq!(id.as_str(), TOKEN);
        assert!(serde_json::from_str::<Identifier>("\"nope\"").is_err());
    }
}
