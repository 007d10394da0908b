use std::time::Duration;

use log::{debug, warn};
use reqwest::Url;
use serde::Deserialize;

use crate::error::UpdateError;
use crate::version::AppVersion;

/// Remote descriptor of the latest release.
///
/// `archive_hash` is the only trust anchor for the archive's content; it is
/// normalized to lowercase hex on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionManifest {
    pub version: AppVersion,
    pub archive_url: Url,
    pub archive_hash: String,
    pub archive_size: Option<u64>,
}

#[derive(Deserialize)]
struct RawManifest {
    version: Option<String>,
    archive_url: Option<String>,
    archive_hash: Option<String>,
    #[serde(default)]
    archive_size: Option<u64>,
}

impl VersionManifest {
    /// Parse and validate a manifest document.
    ///
    /// # Errors
    /// Returns a human-readable reason when the document is not JSON, lacks a
    /// required field, or carries an invalid version, URL or digest.
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let raw: RawManifest =
            serde_json::from_slice(bytes).map_err(|error| format!("invalid JSON: {error}"))?;

        let version = raw.version.ok_or("missing field `version`")?;
        let version =
            AppVersion::parse(&version).ok_or_else(|| format!("invalid version '{version}'"))?;

        let archive_url = raw.archive_url.ok_or("missing field `archive_url`")?;
        let archive_url = Url::parse(&archive_url)
            .map_err(|error| format!("invalid archive_url '{archive_url}': {error}"))?;
        if !is_trusted_transport(&archive_url) {
            return Err(format!(
                "archive_url must use https, got '{}'",
                archive_url.scheme()
            ));
        }

        let archive_hash = raw.archive_hash.ok_or("missing field `archive_hash`")?;
        let archive_hash = parse_sha256_hex(&archive_hash)
            .ok_or_else(|| format!("archive_hash '{archive_hash}' is not a hex SHA-256 digest"))?;

        Ok(Self {
            version,
            archive_url,
            archive_hash,
            archive_size: raw.archive_size,
        })
    }

    /// File name for the downloaded archive, derived from the URL.
    #[must_use]
    pub fn archive_file_name(&self) -> String {
        self.archive_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty() && !name.contains(".."))
            .map_or_else(|| format!("kalkor-{}.zip", self.version), ToString::to_string)
    }
}

fn is_trusted_transport(url: &Url) -> bool {
    match url.scheme() {
        "https" => true,
        "http" => matches!(
            url.host_str(),
            Some("localhost" | "127.0.0.1" | "[::1]" | "::1")
        ),
        _ => false,
    }
}

fn parse_sha256_hex(hash: &str) -> Option<String> {
    let hash = hash.trim();
    let hash = hash.strip_prefix("sha256:").unwrap_or(hash);
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}

/// Build the HTTP client used for manifest and archive retrieval.
///
/// `read_timeout` bounds idle time between chunks rather than the whole
/// transfer, so large archives on slow links still complete.
///
/// # Errors
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_http_client(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<reqwest::Client, UpdateError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .user_agent(format!("kalkor-updater/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| UpdateError::http("failed to build update client", error))
}

/// Fetch and parse the manifest at `url`, bounded by `timeout`.
///
/// No retries: update checks are background work and the caller decides
/// whether to try again later.
///
/// # Errors
/// `Network` on connectivity or timeout failures, `ManifestUnreachable` on a
/// non-success status and `ManifestMalformed` when the body does not parse.
pub async fn fetch_manifest(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<VersionManifest, UpdateError> {
    debug!("Fetching update manifest from {url}");

    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|error| UpdateError::http("manifest request failed", error))?;

    if !response.status().is_success() {
        return Err(UpdateError::ManifestUnreachable {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|error| UpdateError::http("failed to read manifest body", error))?;

    VersionManifest::parse(&body).map_err(|reason| UpdateError::ManifestMalformed {
        url: url.to_string(),
        reason,
    })
}

/// Try each mirror in order and return the first manifest that parses.
///
/// # Errors
/// Returns the last mirror's error when every mirror fails, or
/// `ManifestMalformed` when `urls` is empty.
pub async fn fetch_manifest_from_mirrors(
    client: &reqwest::Client,
    urls: &[String],
    timeout: Duration,
) -> Result<VersionManifest, UpdateError> {
    let mut last_error = None;

    for url in urls {
        match fetch_manifest(client, url, timeout).await {
            Ok(manifest) => return Ok(manifest),
            Err(error) => {
                warn!("Manifest mirror {url} failed: {error}");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| UpdateError::ManifestMalformed {
        url: String::new(),
        reason: "no manifest URLs configured".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{VersionManifest, build_http_client, fetch_manifest, fetch_manifest_from_mirrors};
    use crate::error::ErrorKind;
    use crate::version::AppVersion;

    const HASH: &str = "012BCFA70D63B1C1053E515BD555292292F7CB3F9C57733A2E8559C3E1DE638B";

    fn client() -> reqwest::Client {
        build_http_client(Duration::from_secs(5), Duration::from_secs(5))
            .expect("client should build")
    }

    #[test]
    fn parse_accepts_complete_manifest() {
        let body = format!(
            r#"{{"version":"1.2.0","archive_url":"https://example.com/releases/kalkor-1.2.0.zip","archive_hash":"{HASH}","archive_size":1024}}"#
        );

        let manifest = VersionManifest::parse(body.as_bytes()).expect("manifest should parse");

        assert_eq!(manifest.version, AppVersion::new(1, 2, 0));
        assert_eq!(manifest.archive_hash, HASH.to_ascii_lowercase());
        assert_eq!(manifest.archive_size, Some(1024));
        assert_eq!(manifest.archive_file_name(), "kalkor-1.2.0.zip");
    }

    #[test]
    fn parse_rejects_missing_and_invalid_fields() {
        let missing_hash =
            br#"{"version":"1.2.0","archive_url":"https://example.com/kalkor.zip"}"#;
        let bad_version = format!(
            r#"{{"version":"latest","archive_url":"https://example.com/k.zip","archive_hash":"{HASH}"}}"#
        );
        let plain_http = format!(
            r#"{{"version":"1.2.0","archive_url":"http://example.com/k.zip","archive_hash":"{HASH}"}}"#
        );
        let short_hash =
            br#"{"version":"1.2.0","archive_url":"https://example.com/k.zip","archive_hash":"abcd"}"#;

        assert_eq!(
            VersionManifest::parse(missing_hash),
            Err("missing field `archive_hash`".to_string())
        );
        assert!(VersionManifest::parse(bad_version.as_bytes()).is_err());
        assert!(VersionManifest::parse(plain_http.as_bytes()).is_err());
        assert!(VersionManifest::parse(short_hash).is_err());
        assert!(VersionManifest::parse(b"<html>").is_err());
    }

    #[test]
    fn parse_allows_plain_http_on_loopback_only() {
        let body = format!(
            r#"{{"version":"1.2.0","archive_url":"http://127.0.0.1:8080/k.zip","archive_hash":"{HASH}"}}"#
        );
        assert!(VersionManifest::parse(body.as_bytes()).is_ok());
    }

    #[tokio::test]
    async fn fetch_manifest_maps_status_and_body_failures() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/missing.json")
            .with_status(404)
            .create_async()
            .await;
        let _garbage = server
            .mock("GET", "/garbage.json")
            .with_status(200)
            .with_body("{\"version\": 3")
            .create_async()
            .await;

        let client = client();
        let unreachable = fetch_manifest(
            &client,
            &format!("{}/missing.json", server.url()),
            Duration::from_secs(5),
        )
        .await
        .expect_err("404 should fail");
        let malformed = fetch_manifest(
            &client,
            &format!("{}/garbage.json", server.url()),
            Duration::from_secs(5),
        )
        .await
        .expect_err("garbage should fail");

        assert_eq!(unreachable.kind(), ErrorKind::ManifestUnreachable);
        assert_eq!(malformed.kind(), ErrorKind::ManifestMalformed);
    }

    #[tokio::test]
    async fn fetch_manifest_reports_connection_failures_as_network_errors() {
        let error = fetch_manifest(
            &client(),
            "http://127.0.0.1:9/latest_version.json",
            Duration::from_secs(2),
        )
        .await
        .expect_err("closed port should fail");

        assert_eq!(error.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn mirrors_fall_back_in_order() {
        let mut server = mockito::Server::new_async().await;
        let _down = server
            .mock("GET", "/primary.json")
            .with_status(503)
            .create_async()
            .await;
        let body = format!(
            r#"{{"version":"1.2.0","archive_url":"https://example.com/kalkor.zip","archive_hash":"{HASH}"}}"#
        );
        let _up = server
            .mock("GET", "/mirror.json")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let urls = vec![
            format!("{}/primary.json", server.url()),
            format!("{}/mirror.json", server.url()),
        ];
        let manifest = fetch_manifest_from_mirrors(&client(), &urls, Duration::from_secs(5))
            .await
            .expect("second mirror should serve the manifest");

        assert_eq!(manifest.version, AppVersion::new(1, 2, 0));
    }

    #[tokio::test]
    async fn mirrors_without_urls_is_malformed_configuration() {
        let error = fetch_manifest_from_mirrors(&client(), &[], Duration::from_secs(1))
            .await
            .expect_err("empty mirror list should fail");
        assert_eq!(error.kind(), ErrorKind::ManifestMalformed);
    }
}
