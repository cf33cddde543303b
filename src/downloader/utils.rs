// Helper functions shared by strategies and the materializer

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

use super::errors::{ResolveError, ResolveResult};
use super::extractors::diagnostics::detect_bot_wall;
use super::identity::NetworkIdentity;

/// Player data present in the body; interstitial markers are then incidental
const PLAYER_DATA_MARKERS: &[&str] = &["ytInitialPlayerResponse", "\"streamingData\""];

/// Run command with timeout (shared utility)
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> ResolveResult<std::process::Output> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ResolveError::Delegate(format!("Failed to start {}: {}", program, e)))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| ResolveError::Delegate(format!("Failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| ResolveError::Delegate(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    let waited = timeout(Duration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(status_res) => {
            let status = status_res?;
            let stdout = stdout_task
                .await
                .map_err(|e| ResolveError::Delegate(format!("stdout task failed: {}", e)))??;
            let stderr = stderr_task
                .await
                .map_err(|e| ResolveError::Delegate(format!("stderr task failed: {}", e)))??;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(ResolveError::Timeout(format!(
                "{} timed out after {}s",
                program, timeout_secs
            )))
        }
    }
}

/// HTTP client carrying the identity's headers and egress
pub fn build_client(identity: &NetworkIdentity, request_timeout: Duration) -> ResolveResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &identity.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ResolveError::Http(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ResolveError::Http(format!("invalid header value: {}", e)))?;
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(request_timeout);

    if let Some(proxy_url) = identity.egress.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| ResolveError::EgressUnavailable(format!("invalid proxy {}: {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// GET a page; non-2xx and bot walls become `UpstreamBlocked`
pub async fn fetch_text(client: &reqwest::Client, url: &str) -> ResolveResult<String> {
    let response = client.get(url).send().await?;
    read_checked(response, url).await
}

/// POST a JSON body and return the raw response text
pub async fn post_json(client: &reqwest::Client, url: &str, body: &serde_json::Value) -> ResolveResult<String> {
    let response = client.post(url).json(body).send().await?;
    read_checked(response, url).await
}

/// GET raw bytes of a stream
pub async fn fetch_bytes(client: &reqwest::Client, url: &str) -> ResolveResult<Bytes> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ResolveError::UpstreamBlocked(format!(
            "HTTP {} fetching stream",
            status.as_u16()
        )));
    }
    Ok(response.bytes().await?)
}

async fn read_checked(response: reqwest::Response, url: &str) -> ResolveResult<String> {
    let status = response.status();
    if !status.is_success() {
        return Err(ResolveError::UpstreamBlocked(format!("HTTP {} from {}", status.as_u16(), url)));
    }
    let body = response.text().await?;
    check_body(&body)?;
    Ok(body)
}

/// Reject interstitial pages served with a success status
pub fn check_body(body: &str) -> ResolveResult<()> {
    if PLAYER_DATA_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Ok(());
    }
    match detect_bot_wall(body) {
        Some(reason) => Err(ResolveError::UpstreamBlocked(reason.label().to_string())),
        None => Ok(()),
    }
}

/// Build proxy arguments for yt-dlp
pub fn proxy_args(identity: &NetworkIdentity) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(proxy) = &identity.egress {
        args.push("--proxy".to_string());
        args.push(proxy.clone());
    }

    args
}

/// Build header arguments for yt-dlp
pub fn header_args(identity: &NetworkIdentity) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(user_agent) = identity.user_agent() {
        args.push("--user-agent".to_string());
        args.push(user_agent.to_string());
    }
    if let Some(language) = identity.header("Accept-Language") {
        args.push("--add-header".to_string());
        args.push(format!("Accept-Language:{}", language));
    }

    args
}

/// Milliseconds elapsed, saturating
pub fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
