// Page strategies - scrape the player JSON embedded in HTML surfaces
//
// Three surfaces share one implementation:
// - watch page (desktop markup, largest payload)
// - embed page (lighter, different gating)
// - mobile page (m.youtube.com, needs a mobile fingerprint)

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{ExtractionStrategy, WATCH_HOST};
use crate::downloader::errors::ResolveResult;
use crate::downloader::identifier::Identifier;
use crate::downloader::identity::{NetworkIdentity, HEADER_PROFILES};
use crate::downloader::metadata::{SourceKind, StreamMetadataParser};
use crate::downloader::models::StrategyOutput;
use crate::downloader::utils::{build_client, fetch_text};

const MOBILE_HOST: &str = "m.youtube.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Watch,
    Embed,
    Mobile,
}

impl PageKind {
    fn url_for(&self, id: &Identifier) -> String {
        match self {
            Self::Watch => format!(
                "https://{}/watch?v={}&bpctr=9999999999&has_verified=1",
                WATCH_HOST,
                id.as_str()
            ),
            Self::Embed => format!("https://{}/embed/{}", WATCH_HOST, id.as_str()),
            Self::Mobile => format!("https://{}/watch?v={}", MOBILE_HOST, id.as_str()),
        }
    }
}

/// HTML scraping strategy for one page surface
#[derive(Debug, Clone)]
pub struct PageStrategy {
    kind: PageKind,
    request_timeout: Duration,
    parser: StreamMetadataParser,
}

impl PageStrategy {
    pub fn new(kind: PageKind) -> Self {
        Self {
            kind,
            request_timeout: Duration::from_secs(20),
            parser: StreamMetadataParser::new(),
        }
    }

    pub fn watch() -> Self {
        Self::new(PageKind::Watch)
    }

    pub fn embed() -> Self {
        Self::new(PageKind::Embed)
    }

    pub fn mobile() -> Self {
        Self::new(PageKind::Mobile)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Mobile markup is only served to mobile fingerprints; egress is kept
    fn identity_for(&self, identity: &NetworkIdentity) -> NetworkIdentity {
        if self.kind != PageKind::Mobile {
            return identity.clone();
        }
        let already_mobile = identity.header("sec-ch-ua-mobile") == Some("?1")
            || identity.user_agent().map_or(false, |ua| ua.contains("Mobile"));
        if already_mobile {
            return identity.clone();
        }
        match HEADER_PROFILES.iter().find(|p| p.mobile) {
            Some(profile) => NetworkIdentity::from_profile(profile, identity.egress.clone(), identity.country.clone()),
            None => identity.clone(),
        }
    }
}

#[async_trait]
impl ExtractionStrategy for PageStrategy {
    fn name(&self) -> &'static str {
        match self.kind {
            PageKind::Watch => "watch-page",
            PageKind::Embed => "embed-page",
            PageKind::Mobile => "mobile-page",
        }
    }

    fn host(&self) -> &str {
        match self.kind {
            PageKind::Mobile => MOBILE_HOST,
            _ => WATCH_HOST,
        }
    }

    async fn attempt(&self, id: &Identifier, identity: &NetworkIdentity) -> ResolveResult<StrategyOutput> {
        let identity = self.identity_for(identity);
        let client = build_client(&identity, self.request_timeout)?;
        let url = self.kind.url_for(id);

        tracing::debug!(strategy = self.name(), %url, profile = identity.profile_name, "fetching page");
        let body = fetch_text(&client, &url).await?;
        let variants = self.parser.parse(body.as_bytes(), SourceKind::Html)?;
        Ok(StrategyOutput::Variants(variants))
    }
}
