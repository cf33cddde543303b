// Subprocess delegate - hands the whole job to a yt-dlp binary
//
// Advantages:
// - Tracks upstream changes (ciphers, tokens) without code changes here
// - Several player clients can be tried inside one attempt
//
// Disadvantages:
// - Slow (process start, full extraction)
// - Needs the binary installed on the host

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::traits::ExtractionStrategy;
use crate::downloader::config::DelegateSection;
use crate::downloader::errors::{ResolveError, ResolveResult};
use crate::downloader::format_selector::{FormatSelector, SelectionPolicy};
use crate::downloader::identifier::Identifier;
use crate::downloader::identity::NetworkIdentity;
use crate::downloader::models::{DelegateOutput, DelegateTarget, StrategyOutput};
use crate::downloader::utils::{header_args, proxy_args, run_output_with_timeout};

/// yt-dlp backed strategy
#[derive(Debug, Clone)]
pub struct YtDlpDelegate {
    ytdlp_path: String,
    timeout_secs: u64,
    player_clients: Vec<String>,
    format_spec: String,
    download_to_disk: bool,
    work_dir: PathBuf,
}

impl YtDlpDelegate {
    pub fn new(config: &DelegateSection, policy: &SelectionPolicy) -> Self {
        let player_clients = if config.player_clients.is_empty() {
            vec!["web".to_string()]
        } else {
            config.player_clients.clone()
        };
        Self {
            ytdlp_path: config.binary.clone().unwrap_or_else(Self::find_ytdlp),
            timeout_secs: config.timeout_secs.max(1),
            player_clients,
            format_spec: FormatSelector::delegate_format_spec(policy),
            download_to_disk: config.download_to_disk,
            work_dir: config.work_dir(),
        }
    }

    /// Find yt-dlp binary
    fn find_ytdlp() -> String {
        let common_paths = [
            "/opt/homebrew/bin/yt-dlp", // Homebrew on Apple Silicon
            "/usr/local/bin/yt-dlp",    // Homebrew on Intel Mac
            "/usr/bin/yt-dlp",          // System installation
        ];

        for path in common_paths {
            if Path::new(path).exists() {
                return path.to_string();
            }
        }

        // Try to find via `which`
        if let Ok(output) = StdCommand::new("which").arg("yt-dlp").output() {
            if output.status.success() {
                if let Ok(path) = String::from_utf8(output.stdout) {
                    let trimmed = path.trim();
                    if !trimmed.is_empty() {
                        return trimmed.to_string();
                    }
                }
            }
        }

        "yt-dlp".to_string()
    }

    pub fn binary(&self) -> &str {
        &self.ytdlp_path
    }

    pub fn format_spec(&self) -> &str {
        &self.format_spec
    }

    fn output_template(&self, dir: &Path, id: &Identifier) -> String {
        dir.join(format!("{}.%(ext)s", id.as_str()))
            .to_string_lossy()
            .into_owned()
    }

    /// Build command arguments
    fn build_args(&self, id: &Identifier, identity: &NetworkIdentity, client: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            self.timeout_secs.min(60).to_string(),
            "--retries".to_string(),
            "2".to_string(),
            "-f".to_string(),
            self.format_spec.clone(),
            "--extractor-args".to_string(),
            format!("youtube:player_client={}", client),
        ];

        if self.download_to_disk {
            args.push("--no-simulate".to_string());
            args.push("-o".to_string());
            args.push(self.output_template(&self.work_dir, id));
        }

        args.extend(header_args(identity));
        args.extend(proxy_args(identity));
        args.push(id.watch_url());
        args
    }

    /// Parse the info JSON; the last non-empty stdout line holds it
    fn parse_output(&self, stdout: &[u8]) -> ResolveResult<DelegateOutput> {
        let text = String::from_utf8_lossy(stdout);
        let line = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| ResolveError::NoMetadataFound("yt-dlp produced no output".to_string()))?;
        let json: Value = serde_json::from_str(line.trim())
            .map_err(|e| ResolveError::NoMetadataFound(format!("Invalid JSON from yt-dlp: {}", e)))?;

        let target = if self.download_to_disk {
            let path = json["filename"]
                .as_str()
                .or_else(|| json["_filename"].as_str())
                .ok_or_else(|| ResolveError::Delegate("yt-dlp did not report a filename".to_string()))?;
            DelegateTarget::File(PathBuf::from(path))
        } else {
            let url = json["url"]
                .as_str()
                .or_else(|| json["requested_formats"][0]["url"].as_str())
                .ok_or_else(|| ResolveError::NoUsableVariant("yt-dlp reported no stream URL".to_string()))?;
            DelegateTarget::Url(url.to_string())
        };

        let vcodec = json["vcodec"].as_str().unwrap_or("");
        let acodec = json["acodec"].as_str().filter(|a| *a != "none");
        let audio_only = vcodec == "none" && acodec.is_some();
        let codec_hint = if audio_only {
            acodec.map(str::to_string)
        } else {
            Some(vcodec.to_string()).filter(|v| !v.is_empty() && v != "none")
        };
        // tbr/abr are kbit/s
        let bitrate_hint = json["tbr"]
            .as_f64()
            .or_else(|| json["abr"].as_f64())
            .map(|kbps| (kbps * 1000.0).round() as u64);

        Ok(DelegateOutput {
            target,
            container: json["ext"].as_str().map(str::to_string),
            bitrate_hint,
            codec_hint,
            format_id: json["format_id"].as_str().map(str::to_string),
            audio_only,
        })
    }

    /// Try extraction with multiple player clients
    async fn try_with_clients(&self, id: &Identifier, identity: &NetworkIdentity) -> ResolveResult<DelegateOutput> {
        let mut last_error = ResolveError::Delegate("No clients to try".to_string());

        if self.download_to_disk {
            tokio::fs::create_dir_all(&self.work_dir).await?;
        }

        for client in &self.player_clients {
            let args = self.build_args(id, identity, client);
            tracing::debug!(
                strategy = self.name(),
                player_client = %client,
                binary = %self.ytdlp_path,
                "running delegate"
            );

            match run_output_with_timeout(&self.ytdlp_path, args, self.timeout_secs).await {
                Ok(out) if out.status.success() => {
                    tracing::info!(player_client = %client, identifier = %id, "delegate succeeded");
                    return self.parse_output(&out.stdout);
                }
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    tracing::warn!(player_client = %client, stderr = %stderr.trim(), "delegate client failed");
                    last_error = ResolveError::from(stderr.to_string());
                }
                Err(err) => {
                    tracing::warn!(player_client = %client, error = %err, "delegate client error");
                    // Missing binary will not improve with another client
                    if matches!(err, ResolveError::Delegate(_)) {
                        return Err(err);
                    }
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    /// Download one specific format into `dir`, returning the written path
    pub async fn download_format(
        &self,
        id: &Identifier,
        format_id: &str,
        identity: &NetworkIdentity,
        dir: &Path,
    ) -> ResolveResult<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            format_id.to_string(),
            "-o".to_string(),
            self.output_template(dir, id),
            "--print".to_string(),
            "after_move:filepath".to_string(),
        ];
        args.extend(header_args(identity));
        args.extend(proxy_args(identity));
        args.push(id.watch_url());

        let out = run_output_with_timeout(&self.ytdlp_path, args, self.timeout_secs).await?;
        if !out.status.success() {
            return Err(ResolveError::from(String::from_utf8_lossy(&out.stderr).to_string()));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let path = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| ResolveError::Delegate("yt-dlp did not print the output path".to_string()))?;
        Ok(path)
    }
}

#[async_trait]
impl ExtractionStrategy for YtDlpDelegate {
    fn name(&self) -> &'static str {
        "subprocess-delegate"
    }

    /// Every player client gets its full subprocess timeout
    fn attempt_budget(&self) -> Option<Duration> {
        let clients = self.player_clients.len().max(1) as u64;
        Some(Duration::from_secs((self.timeout_secs + 1).saturating_mul(clients)))
    }

    async fn attempt(&self, id: &Identifier, identity: &NetworkIdentity) -> ResolveResult<StrategyOutput> {
        let output = self.try_with_clients(id, identity).await?;
        Ok(StrategyOutput::Fallback(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delegate(download_to_disk: bool) -> YtDlpDelegate {
        let config = DelegateSection {
            binary: Some("/usr/bin/true".to_string()),
            download_to_disk,
            work_dir: Some(PathBuf::from("/tmp/resolver-test")),
            ..DelegateSection::default()
        };
        YtDlpDelegate::new(&config, &SelectionPolicy::transcription())
    }

    #[test]
    fn args_carry_client_format_and_proxy() {
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let mut identity = NetworkIdentity::direct();
        identity.egress = Some("socks5h://127.0.0.1:1080".to_string());
        let args = delegate(false).build_args(&id, &identity, "tv");

        assert!(args.contains(&"youtube:player_client=tv".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "wa/w"));
        assert!(args.windows(2).any(|w| w[0] == "--proxy" && w[1] == "socks5h://127.0.0.1:1080"));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert!(!args.contains(&"--no-simulate".to_string()));
    }

    #[test]
    fn disk_mode_adds_output_template() {
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let args = delegate(true).build_args(&id, &NetworkIdentity::direct(), "android");
        assert!(args.contains(&"--no-simulate".to_string()));
        assert!(args.contains(&"/tmp/resolver-test/dQw4w9WgXcQ.%(ext)s".to_string()));
    }

    #[test]
    fn parses_audio_only_url_output() {
        let stdout = br#"[debug] noise
{"id": "dQw4w9WgXcQ", "url": "https://rr1.googlevideo.com/videoplayback?itag=249", "ext": "webm", "format_id": "249", "vcodec": "none", "acodec": "opus", "abr": 50.5}
"#;
        let output = delegate(false).parse_output(stdout).unwrap();
        assert_eq!(
            output.target,
            DelegateTarget::Url("https://rr1.googlevideo.com/videoplayback?itag=249".to_string())
        );
        assert!(output.audio_only);
        assert_eq!(output.codec_hint.as_deref(), Some("opus"));
        assert_eq!(output.bitrate_hint, Some(50_500));
        assert_eq!(output.format_id.as_deref(), Some("249"));
    }

    #[test]
    fn parses_file_output_in_disk_mode() {
        let stdout = br#"{"filename": "/tmp/resolver-test/dQw4w9WgXcQ.m4a", "ext": "m4a", "format_id": "140", "vcodec": "none", "acodec": "mp4a.40.2"}"#;
        let output = delegate(true).parse_output(stdout).unwrap();
        assert_eq!(
            output.target,
            DelegateTarget::File(PathBuf::from("/tmp/resolver-test/dQw4w9WgXcQ.m4a"))
        );
    }

    #[test]
    fn garbage_output_is_no_metadata() {
        let err = delegate(false).parse_output(b"not json").unwrap_err();
        assert!(matches!(err, ResolveError::NoMetadataFound(_)));
        let err = delegate(false).parse_output(b"").unwrap_err();
        assert!(matches!(err, ResolveError::NoMetadataFound(_)));
    }

    #[test]
    fn budget_covers_every_client() {
        let config = DelegateSection {
            binary: Some("/usr/bin/true".to_string()),
            timeout_secs: 120,
            ..DelegateSection::default()
        };
        let delegate = YtDlpDelegate::new(&config, &SelectionPolicy::default());
        assert_eq!(delegate.attempt_budget(), Some(Duration::from_secs(121 * 3)));
    }

    #[tokio::test]
    async fn missing_binary_fails_fast() {
        let config = DelegateSection {
            binary: Some("/nonexistent/yt-dlp".to_string()),
            ..DelegateSection::default()
        };
        let delegate = YtDlpDelegate::new(&config, &SelectionPolicy::default());
        let id = Identifier::from_token("dQw4w9WgXcQ").unwrap();
        let err = delegate.attempt(&id, &NetworkIdentity::direct()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Delegate(_)));
    }
}
