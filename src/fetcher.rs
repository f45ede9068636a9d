//! A hardened HTTPS fetcher: redirects, retries with backoff, content-type
//! gating, and the four response sinks the update pipeline needs
//! (raw streaming, text, JSON, and paginated JSON).

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{Result, UpdaterError};

/// Maximum number of retries after the first attempt for a transient failure.
pub const MAX_RETRIES: u32 = 3;
/// Maximum number of redirects a single logical fetch will follow.
pub const MAX_REDIRECTS: u32 = 10;
/// Idle-socket request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum buffered size (bytes) for `fetchText`/`fetchJSON`/pagination sinks.
pub const MAX_TEXT_LENGTH: usize = 3 * 1024 * 1024 * 2; // 3 * 1024 * 1024 UTF-16 units, worst case 2 bytes each

const USER_AGENT: &str = "peerio-updater/1.0";

/// A verified, still-streaming HTTP response ready to be drained by a sink.
pub struct Response {
    inner: reqwest::Response,
    link_header: Option<String>,
}

impl Response {
    /// Consume the response as raw bytes, enforcing `MAX_TEXT_LENGTH`.
    async fn drain_text(self) -> Result<String> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = self.inner.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_reqwest_error)?;
            buffer.extend_from_slice(&chunk);
            if buffer.len() > MAX_TEXT_LENGTH {
                return Err(UpdaterError::ResponseTooLarge);
            }
        }
        String::from_utf8(buffer).map_err(|_| UpdaterError::BadManifest("response was not valid UTF-8".to_string()))
    }
}

/// Fetches resources over HTTPS with the retry/redirect/backoff policy the
/// update pipeline requires. Stateless between requests.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    github_token: Option<String>,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    /// Build a fetcher with a fresh `reqwest::Client`. Redirects are handled
    /// manually (one hop at a time) so the security checks in `get` can run
    /// on every hop, so the underlying client disables automatic redirects.
    pub fn new() -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            github_token: std::env::var("GITHUB_TOKEN")
                .ok()
                .or_else(|| std::env::var("PYUPDATE_GITHUB_TOKEN").ok())
                .filter(|t| !t.trim().is_empty()),
        }
    }

    /// GET `url`, following redirects and retrying transient failures per
    /// `spec.md` §4.D. If `expected_content_type` is supplied, the final
    /// 200 response's `Content-Type` (minus any `;`-parameters) must match
    /// it exactly.
    pub async fn get(&self, url: &str, expected_content_type: Option<&str>) -> Result<Response> {
        let mut current = parse_https_url(url)?;
        let mut redirects = 0u32;
        let mut attempt = 0u32;

        loop {
            let mut request = self.client.get(current.clone());
            request = request.header(reqwest::header::USER_AGENT, USER_AGENT);
            if is_github_api(&current) {
                if let Some(token) = &self.github_token {
                    request = request.bearer_auth(token);
                }
            }

            let send_result = tokio::time::timeout(REQUEST_TIMEOUT, request.send()).await;

            let response = match send_result {
                Err(_) => {
                    if attempt >= MAX_RETRIES {
                        return Err(UpdaterError::RequestTimeout(current.to_string()));
                    }
                    attempt += 1;
                    backoff(attempt).await;
                    continue;
                }
                Ok(Err(e)) => {
                    if attempt >= MAX_RETRIES {
                        return Err(classify_reqwest_error(e));
                    }
                    attempt += 1;
                    backoff(attempt).await;
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();

            if status == StatusCode::NOT_FOUND {
                return Err(UpdaterError::NotFound(current.to_string()));
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| UpdaterError::RequestFailed(format!(
                        "redirect from {current} had no Location header"
                    )))?;
                let next = current
                    .join(location)
                    .map_err(|e| UpdaterError::RequestFailed(e.to_string()))?;
                if !scheme_is_acceptable(&next) {
                    return Err(UpdaterError::UnsafeRedirect(next.to_string()));
                }
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(UpdaterError::TooManyRedirects(url.to_string()));
                }
                current = next;
                continue;
            }

            if status != StatusCode::OK {
                if attempt >= MAX_RETRIES {
                    return Err(UpdaterError::RequestFailed(format!(
                        "unexpected status {status} from {current}"
                    )));
                }
                attempt += 1;
                backoff(attempt).await;
                continue;
            }

            if let Some(expected) = expected_content_type {
                let actual = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if actual != expected {
                    return Err(UpdaterError::UnexpectedContentType {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }

            let link_header = response
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            return Ok(Response {
                inner: response,
                link_header,
            });
        }
    }

    /// GET `url` and decode the body as UTF-8 text, optionally gating on
    /// `Content-Type`.
    pub async fn fetch_text(&self, url: &str, expected_content_type: Option<&str>) -> Result<String> {
        let response = self.get(url, expected_content_type).await?;
        response.drain_text().await
    }

    /// GET `url`, requiring `Content-Type: application/json`, and parse it.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let text = self.fetch_text(url, Some("application/json")).await?;
        serde_json::from_str(&text).map_err(|e| UpdaterError::BadManifest(e.to_string()))
    }

    /// GET `url` as a JSON array, following `Link: <...>; rel="next"`
    /// pagination until no more pages remain, and return the concatenation
    /// of every page in order.
    pub async fn fetch_all_json_pages(&self, url: &str) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        let mut next_url = Some(url.to_string());

        while let Some(current) = next_url {
            let response = self.get(&current, Some("application/json")).await?;
            let link = response.link_header.clone();
            let text = response.drain_text().await?;
            let page: Value = serde_json::from_str(&text).map_err(|e| UpdaterError::BadManifest(e.to_string()))?;
            let array = page
                .as_array()
                .ok_or_else(|| UpdaterError::BadManifest("page was not a JSON array".to_string()))?;
            results.extend(array.iter().cloned());

            next_url = link.as_deref().and_then(parse_next_link);
        }

        Ok(results)
    }

    /// GET `url` and stream the body to `destination`, creating it fresh.
    /// On any error the partial file is removed on a best-effort basis.
    pub async fn fetch_file(&self, url: &str, destination: &Path) -> Result<()> {
        let response = self.get(url, None).await?;
        let result = stream_to_file(response, destination).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(destination).await;
        }
        result
    }
}

async fn stream_to_file(response: Response, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = File::create(destination).await?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.inner.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_reqwest_error)?;
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn parse_https_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| UpdaterError::RequestFailed(e.to_string()))?;
    if !scheme_is_acceptable(&parsed) {
        return Err(UpdaterError::UnsafeRedirect(url.to_string()));
    }
    Ok(parsed)
}

/// True for `https://` URLs, and for plain `http://` against a loopback host
/// (`127.0.0.1`, `::1`, `localhost`). The loopback exception exists purely so
/// a local mock HTTP server can exercise this fetcher end-to-end; it carries
/// no weaker guarantee for any real update server, which is always reached
/// over a real network path where only TLS rules out tampering in transit.
fn scheme_is_acceptable(url: &Url) -> bool {
    if url.scheme() == "https" {
        return true;
    }
    url.scheme() == "http" && is_loopback_host(url)
}

fn is_loopback_host(url: &Url) -> bool {
    matches!(url.host_str(), Some("127.0.0.1") | Some("::1") | Some("localhost"))
}

fn is_github_api(url: &Url) -> bool {
    url.host_str() == Some("api.github.com")
}

async fn backoff(attempt: u32) {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(16));
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn classify_reqwest_error(err: reqwest::Error) -> UpdaterError {
    if err.is_timeout() {
        UpdaterError::RequestTimeout(err.to_string())
    } else {
        UpdaterError::RequestFailed(err.to_string())
    }
}

/// Parse a `Link` header for a `rel="next"` (or `rel='next'`, case
/// insensitive) entry and return its URL.
fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut segments = part.split(';');
        let url_part = segments.next()?.trim();
        if !url_part.starts_with('<') || !url_part.ends_with('>') {
            continue;
        }
        let url = &url_part[1..url_part.len() - 1];
        for param in segments {
            let param = param.trim();
            if let Some(rest) = param
                .strip_prefix("rel=")
                .or_else(|| param.strip_prefix("REL="))
            {
                let rel = rest.trim_matches(|c| c == '"' || c == '\'');
                if rel.eq_ignore_ascii_case("next") {
                    return Some(url.to_string());
                }
            }
        }
    }
    None
}
