//! Upstream API client.
//!
//! A thin blocking wrapper over the GitHub REST surface the orchestrator
//! needs. GET responses are cached on disk per path for sixty seconds and
//! revalidated with `If-None-Match` after that; 403/429 responses whose
//! body mentions the rate limit are retried with linear backoff before
//! surfacing as `rate_limited`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use shipwright_retry::{BackoffStrategy, RetryConfig};
use shipwright_types::ErrorKind;

/// How long a cached GET response is served without revalidation.
const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    etag: Option<String>,
    fetched_at: DateTime<Utc>,
    body: Value,
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    api_base: String,
    token: Option<String>,
    cache_dir: PathBuf,
    retry: RetryConfig,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: Option<String>, cache_dir: PathBuf) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("shipwright/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            cache_dir,
            retry: RetryConfig {
                strategy: BackoffStrategy::Linear,
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(15),
                jitter: 0.0,
            },
        })
    }

    /// Override the rate-limit retry envelope (tests shrink the delays).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn list_workflow_runs(&self, repo: &str) -> Result<Value> {
        self.get(&format!("/repos/{repo}/actions/runs"))
    }

    pub fn get_workflow_run(&self, repo: &str, run_id: u64) -> Result<Value> {
        self.get(&format!("/repos/{repo}/actions/runs/{run_id}"))
    }

    pub fn list_releases(&self, repo: &str) -> Result<Value> {
        self.get(&format!("/repos/{repo}/releases"))
    }

    pub fn get_latest_release(&self, repo: &str) -> Result<Value> {
        self.get(&format!("/repos/{repo}/releases/latest"))
    }

    pub fn compare_commits(&self, repo: &str, base: &str, head: &str) -> Result<Value> {
        self.get(&format!("/repos/{repo}/compare/{base}...{head}"))
    }

    pub fn list_tags(&self, repo: &str) -> Result<Value> {
        self.get(&format!("/repos/{repo}/tags"))
    }

    /// Resolve a tag name to the commit SHA it points at.
    pub fn resolve_tag_sha(&self, repo: &str, tag: &str) -> Result<String> {
        let value = self.get(&format!("/repos/{repo}/git/ref/tags/{tag}"))?;
        value["object"]["sha"]
            .as_str()
            .map(str::to_string)
            .with_context(|| format!("tag {tag} has no object sha"))
    }

    pub fn create_release(&self, repo: &str, tag: &str, name: &str, notes: &str) -> Result<Value> {
        let body = serde_json::json!({
            "tag_name": tag,
            "name": name,
            "body": notes,
            "draft": false,
            "prerelease": false,
        });
        self.post(&format!("/repos/{repo}/releases"), &body)?
            .context("create release returned no body")
    }

    /// Upload a release asset. The upload endpoint lives on a separate
    /// host, so the caller passes the `upload_url` from the release record.
    pub fn upload_release_asset(
        &self,
        upload_url: &str,
        asset_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Value> {
        // The API hands back a hypermedia template: …/assets{?name,label}
        let base = upload_url.split('{').next().unwrap_or(upload_url);
        let url = format!("{base}?name={asset_name}");
        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().context("asset upload failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("asset upload returned {status}");
        }
        response.json().context("asset upload returned invalid JSON")
    }

    /// Open an issue; used for downstream repos we cannot push to.
    pub fn create_issue(&self, repo: &str, title: &str, body_text: &str) -> Result<Value> {
        let body = serde_json::json!({"title": title, "body": body_text});
        self.post(&format!("/repos/{repo}/issues"), &body)?
            .context("create issue returned no body")
    }

    /// Fire a repository_dispatch event. Success is a 204 with no body.
    pub fn repository_dispatch(&self, repo: &str, event_type: &str, payload: &Value) -> Result<()> {
        let body = serde_json::json!({
            "event_type": event_type,
            "client_payload": payload,
        });
        self.post(&format!("/repos/{repo}/dispatches"), &body)?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Value> {
        let cached = self.read_cache(path);
        if let Some(entry) = &cached {
            let age = Utc::now().signed_duration_since(entry.fetched_at);
            if age.num_seconds() >= 0 && (age.num_seconds() as u64) < CACHE_TTL.as_secs() {
                return Ok(entry.body.clone());
            }
        }

        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.http.get(&url);
            if let Some(token) = &self.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            if let Some(entry) = &cached
                && let Some(etag) = &entry.etag
            {
                request = request.header("If-None-Match", etag.clone());
            }

            let response = request.send().with_context(|| format!("GET {path} failed"))?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                let entry = cached.context("304 without a cached body")?;
                self.write_cache(path, &entry.body, entry.etag.as_deref());
                return Ok(entry.body);
            }

            if matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) {
                let body = response.text().unwrap_or_default();
                if !body.to_ascii_lowercase().contains("rate limit") {
                    bail!("GET {path} returned {status}: {body}");
                }
                if self.retry.can_retry(attempt) {
                    std::thread::sleep(self.retry.delay_for(attempt));
                    continue;
                }
                return Err(anyhow::Error::new(ErrorKind::RateLimited(format!(
                    "GET {path} still throttled after {attempt} attempts"
                ))));
            }

            if !status.is_success() {
                bail!("GET {path} returned {status}");
            }
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body: Value = response
                .json()
                .with_context(|| format!("GET {path} returned invalid JSON"))?;
            self.write_cache(path, &body, etag.as_deref());
            return Ok(body);
        }
    }

    fn post(&self, path: &str, body: &Value) -> Result<Option<Value>> {
        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.http.post(&url).json(body);
            if let Some(token) = &self.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            let response = request.send().with_context(|| format!("POST {path} failed"))?;
            let status = response.status();

            if matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) {
                let body = response.text().unwrap_or_default();
                if !body.to_ascii_lowercase().contains("rate limit") {
                    bail!("POST {path} returned {status}: {body}");
                }
                if self.retry.can_retry(attempt) {
                    std::thread::sleep(self.retry.delay_for(attempt));
                    continue;
                }
                return Err(anyhow::Error::new(ErrorKind::RateLimited(format!(
                    "POST {path} still throttled after {attempt} attempts"
                ))));
            }

            if !status.is_success() {
                bail!("POST {path} returned {status}");
            }
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            return Ok(Some(
                response
                    .json()
                    .with_context(|| format!("POST {path} returned invalid JSON"))?,
            ));
        }
    }

    fn cache_path(&self, path: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(path.as_bytes()));
        self.cache_dir.join(format!("{digest}.json"))
    }

    fn read_cache(&self, path: &str) -> Option<CacheEntry> {
        let content = fs::read_to_string(self.cache_path(path)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_cache(&self, path: &str, body: &Value, etag: Option<&str>) {
        // Best-effort; a missing cache only costs another request.
        if fs::create_dir_all(&self.cache_dir).is_err() {
            return;
        }
        let entry = CacheEntry {
            etag: etag.map(str::to_string),
            fetched_at: Utc::now(),
            body: body.clone(),
        };
        if let Ok(data) = serde_json::to_vec(&entry) {
            let _ = fs::write(self.cache_path(path), data);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use tempfile::tempdir;
    use tiny_http::{Header, Response, Server};

    use super::*;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            strategy: BackoffStrategy::Linear,
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    fn spawn_server<F>(handler: F) -> (String, thread::JoinHandle<()>)
    where
        F: Fn(usize, tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let mut count = 0;
            // Serve a bounded number of requests, then stop.
            while count < 16 {
                match server.recv_timeout(Duration::from_secs(2)) {
                    Ok(Some(request)) => {
                        handler(count, request);
                        count += 1;
                    }
                    _ => break,
                }
            }
        });
        (base, handle)
    }

    #[test]
    fn get_caches_within_ttl() {
        let td = tempdir().expect("tempdir");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_server = Arc::clone(&hits);
        let (base, handle) = spawn_server(move |_, request| {
            hits_in_server.fetch_add(1, Ordering::SeqCst);
            let response = Response::from_string(r#"{"tags": []}"#).with_header(
                Header::from_bytes("ETag", "\"abc\"").expect("header"),
            );
            request.respond(response).expect("respond");
        });

        let client = GitHubClient::new(&base, None, td.path().join("api")).expect("client");
        let first = client.list_tags("doodlestein/demo").expect("first");
        let second = client.list_tags("doodlestein/demo").expect("second");
        assert_eq!(first, second);
        drop(client);
        handle.join().expect("server");
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second call came from cache");
    }

    #[test]
    fn stale_cache_revalidates_with_etag() {
        let td = tempdir().expect("tempdir");
        let (base, handle) = spawn_server(|count, request| {
            if count == 0 {
                let response = Response::from_string(r#"{"n": 1}"#).with_header(
                    Header::from_bytes("ETag", "\"v1\"").expect("header"),
                );
                request.respond(response).expect("respond");
            } else {
                // Expect revalidation: reply 304 with no body.
                let sent_etag = request
                    .headers()
                    .iter()
                    .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case("if-none-match"))
                    .map(|h| h.value.as_str().to_string());
                assert_eq!(sent_etag.as_deref(), Some("\"v1\""));
                request
                    .respond(Response::empty(304))
                    .expect("respond 304");
            }
        });

        let client = GitHubClient::new(&base, None, td.path().join("api")).expect("client");
        let first = client.list_tags("doodlestein/demo").expect("first");

        // Age the cache entry past the TTL by rewriting its timestamp.
        let cache_file = fs::read_dir(td.path().join("api"))
            .expect("dir")
            .next()
            .expect("entry")
            .expect("entry")
            .path();
        let mut entry: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&cache_file).expect("read")).expect("parse");
        entry["fetched_at"] = serde_json::json!(Utc::now() - chrono::Duration::seconds(120));
        fs::write(&cache_file, serde_json::to_vec(&entry).expect("ser")).expect("write");

        let second = client.list_tags("doodlestein/demo").expect("second");
        assert_eq!(first, second);
        drop(client);
        handle.join().expect("server");
    }

    #[test]
    fn rate_limit_retries_then_succeeds() {
        let td = tempdir().expect("tempdir");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_server = Arc::clone(&hits);
        let (base, handle) = spawn_server(move |count, request| {
            hits_in_server.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                request
                    .respond(Response::from_string("API rate limit exceeded").with_status_code(429))
                    .expect("respond 429");
            } else {
                request
                    .respond(Response::empty(204))
                    .expect("respond 204");
            }
        });

        let client = GitHubClient::new(&base, None, td.path().join("api"))
            .expect("client")
            .with_retry(fast_retry());
        client
            .repository_dispatch(
                "doodlestein/homebrew-tap",
                "release",
                &serde_json::json!({"tool": "demo"}),
            )
            .expect("dispatch eventually succeeds");
        drop(client);
        handle.join().expect("server");
        assert_eq!(hits.load(Ordering::SeqCst), 3, "two 429s then one 204");
    }

    #[test]
    fn persistent_rate_limit_surfaces_typed_error() {
        let td = tempdir().expect("tempdir");
        let (base, handle) = spawn_server(|_, request| {
            request
                .respond(Response::from_string("rate limit").with_status_code(403))
                .expect("respond 403");
        });

        let client = GitHubClient::new(&base, None, td.path().join("api"))
            .expect("client")
            .with_retry(fast_retry());
        let err = client.list_tags("doodlestein/demo").unwrap_err();
        let kind = err.downcast_ref::<ErrorKind>().expect("typed");
        assert!(matches!(kind, ErrorKind::RateLimited(_)));
        assert_eq!(kind.exit_code(), 8);
        drop(client);
        handle.join().expect("server");
    }

    #[test]
    fn resolve_tag_sha_reads_the_object() {
        let td = tempdir().expect("tempdir");
        let (base, handle) = spawn_server(|_, request| {
            request
                .respond(Response::from_string(
                    r#"{"ref": "refs/tags/v1.0.0", "object": {"sha": "abc123", "type": "commit"}}"#,
                ))
                .expect("respond");
        });

        let client = GitHubClient::new(&base, None, td.path().join("api")).expect("client");
        let sha = client
            .resolve_tag_sha("doodlestein/demo", "v1.0.0")
            .expect("sha");
        assert_eq!(sha, "abc123");
        drop(client);
        handle.join().expect("server");
    }

    #[test]
    fn upload_url_template_is_flattened() {
        let td = tempdir().expect("tempdir");
        let (base, handle) = spawn_server(|_, request| {
            assert!(request.url().contains("/assets?name=demo.tar.gz"));
            request
                .respond(Response::from_string(r#"{"id": 1}"#).with_status_code(201))
                .expect("respond");
        });

        let client = GitHubClient::new(&base, None, td.path().join("api")).expect("client");
        let value = client
            .upload_release_asset(
                &format!("{base}/repos/d/demo/releases/1/assets{{?name,label}}"),
                "demo.tar.gz",
                b"bytes".to_vec(),
            )
            .expect("upload");
        assert_eq!(value["id"], 1);
        drop(client);
        handle.join().expect("server");
    }
}
