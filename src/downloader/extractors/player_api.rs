// Player API strategy - asks the internal player endpoint directly
//
// The VR client gets direct URLs without signature ciphers or tokens, which
// makes it the most useful API client when the HTML surfaces are gated.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::traits::{ExtractionStrategy, WATCH_HOST};
use crate::downloader::errors::ResolveResult;
use crate::downloader::identifier::Identifier;
use crate::downloader::identity::NetworkIdentity;
use crate::downloader::metadata::{SourceKind, StreamMetadataParser};
use crate::downloader::models::StrategyOutput;
use crate::downloader::utils::{build_client, post_json};

const PLAYER_ENDPOINT: &str = "https://www.youtube.com/youtubei/v1/player?prettyPrint=false";

/// API client the request claims to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiClient {
    pub name: &'static str,
    pub version: &'static str,
    pub user_agent: &'static str,
    pub extra: Value,
}

impl ApiClient {
    pub fn android_vr() -> Self {
        Self {
            name: "ANDROID_VR",
            version: "1.71.26",
            user_agent: "com.google.android.apps.youtube.vr.oculus/1.71.26 (Linux; U; Android 12L; eureka-user Build/SQ3A.220605.009.A1) gzip",
            extra: json!({
                "androidSdkVersion": 32,
                "deviceMake": "Oculus",
                "deviceModel": "Quest 3"
            }),
        }
    }

    fn payload(&self, id: &Identifier) -> Value {
        let mut client = json!({
            "clientName": self.name,
            "clientVersion": self.version,
            "hl": "en",
        });
        if let (Some(target), Some(extra)) = (client.as_object_mut(), self.extra.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        json!({
            "context": { "client": client },
            "videoId": id.as_str(),
            "contentCheckOk": true,
            "racyCheckOk": true
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlayerApiStrategy {
    client: ApiClient,
    endpoint: String,
    request_timeout: Duration,
    parser: StreamMetadataParser,
}

impl PlayerApiStrategy {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            endpoint: PLAYER_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(20),
            parser: StreamMetadataParser::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Same egress, but the app's own user agent instead of a browser's
    fn identity_for(&self, identity: &NetworkIdentity) -> NetworkIdentity {
        let mut headers: Vec<(String, String)> = identity
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("User-Agent") && !name.to_ascii_lowercase().starts_with("sec-ch-ua")
            })
            .cloned()
            .collect();
        headers.push(("User-Agent".to_string(), self.client.user_agent.to_string()));
        headers.push(("X-YouTube-Client-Name".to_string(), "28".to_string()));
        headers.push(("X-YouTube-Client-Version".to_string(), self.client.version.to_string()));
        NetworkIdentity {
            headers,
            egress: identity.egress.clone(),
            country: identity.country.clone(),
            profile_name: identity.profile_name,
        }
    }
}

impl Default for PlayerApiStrategy {
    fn default() -> Self {
        Self::new(ApiClient::android_vr())
    }
}

#[async_trait]
impl ExtractionStrategy for PlayerApiStrategy {
    fn name(&self) -> &'static str {
        "player-api"
    }

    fn host(&self) -> &str {
        WATCH_HOST
    }

    async fn attempt(&self, id: &Identifier, identity: &NetworkIdentity) -> ResolveResult<StrategyOutput> {
        let identity = self.identity_for(identity);
        let client = build_client(&identity, self.request_timeout)?;

        tracing::debug!(strategy = self.name(), api_client = self.client.name, "posting player request");
        let body = post_json(&client, &self.endpoint, &self.client.payload(id)).await?;
        let variants = self.parser.parse(body.as_bytes(), SourceKind::Json)?;
        Ok(StrategyOutput::Variants(variants))
    }
}
