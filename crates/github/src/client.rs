use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    Commit, GitHubError, Job, JobList, Repository, Result, User, Workflow, WorkflowList,
    WorkflowRun, WorkflowRunList,
};

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

/// Page parameters; GitHub caps `per_page` at 100
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, 100),
        }
    }

    fn query(&self) -> [(&'static str, String); 2] {
        [
            ("page", self.page.to_string()),
            ("per_page", self.per_page.to_string()),
        ]
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 30)
    }
}

pub struct GitHubClientBuilder {
    token: Option<String>,
    base_url: String,
    user_agent: String,
    timeout: Duration,
}

impl GitHubClientBuilder {
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<GitHubClient> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));

        let client = reqwest::Client::builder()
            .user_agent(self.user_agent)
            .timeout(self.timeout)
            .default_headers(headers)
            .build()?;

        Ok(GitHubClient {
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            token: self.token,
        })
    }
}

/// Read-only client for the REST endpoints the dashboard shows
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn builder() -> GitHubClientBuilder {
        GitHubClientBuilder {
            token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: concat!("codetracker/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The account the token belongs to
    pub async fn current_user(&self) -> Result<User> {
        self.get("/user", &[]).await
    }

    /// Repositories of the authenticated user, most recently updated first
    pub async fn list_repositories(&self, page: Page) -> Result<Vec<Repository>> {
        let [p, pp] = page.query();
        self.get("/user/repos", &[("sort", "updated".to_string()), p, pp])
            .await
    }

    pub async fn list_commits(&self, owner: &str, repo: &str, page: Page) -> Result<Vec<Commit>> {
        let [p, pp] = page.query();
        self.get(&format!("/repos/{}/{}/commits", owner, repo), &[p, pp])
            .await
    }

    pub async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>> {
        let list: WorkflowList = self
            .get(&format!("/repos/{}/{}/actions/workflows", owner, repo), &[])
            .await?;
        Ok(list.workflows)
    }

    /// Runs of one workflow, or of every workflow in the repository
    pub async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: Option<u64>,
        page: Page,
    ) -> Result<Vec<WorkflowRun>> {
        let path = match workflow_id {
            Some(id) => format!("/repos/{}/{}/actions/workflows/{}/runs", owner, repo, id),
            None => format!("/repos/{}/{}/actions/runs", owner, repo),
        };
        let [p, pp] = page.query();
        let list: WorkflowRunList = self.get(&path, &[p, pp]).await?;
        Ok(list.workflow_runs)
    }

    pub async fn list_run_jobs(&self, owner: &str, repo: &str, run_id: u64) -> Result<Vec<Job>> {
        let list: JobList = self
            .get(
                &format!("/repos/{}/{}/actions/runs/{}/jobs", owner, repo, run_id),
                &[],
            )
            .await?;
        Ok(list.jobs)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);

        let mut request = self.client.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        if !status.is_success() {
            let err = classify_error(status, &headers, &body);
            warn!("GET {} failed: {}", url, err);
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| GitHubError::Decode(format!("{}: {}", path, e)))
    }
}

/// Map a non-success response to an error, spotting exhausted rate limits
fn classify_error(status: StatusCode, headers: &HeaderMap, body: &str) -> GitHubError {
    let exhausted = header_str(headers, "x-ratelimit-remaining") == Some("0");
    if exhausted && matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) {
        let reset_at = header_str(headers, "x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        return GitHubError::RateLimited { reset_at };
    }

    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    GitHubError::Status {
        status: status.as_u16(),
        message,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// When a rate-limited caller may try again
pub fn retry_after(err: &GitHubError, now: DateTime<Utc>) -> Option<chrono::Duration> {
    match err {
        GitHubError::RateLimited {
            reset_at: Some(reset_at),
        } => Some((*reset_at - now).max(chrono::Duration::zero())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer a single request with a canned response and hand back the request head
    async fn serve_once(
        status: &'static str,
        headers: &'static [(&'static str, &'static str)],
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let mut response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
                status,
                body.len()
            );
            for (name, value) in headers {
                response.push_str(&format!("{}: {}\r\n", name, value));
            }
            response.push_str("\r\n");
            response.push_str(body);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn test_page_clamps() {
        assert_eq!(Page::new(0, 500), Page { page: 1, per_page: 100 });
        assert_eq!(Page::new(3, 0), Page { page: 3, per_page: 1 });
        assert_eq!(Page::default().per_page, 30);
    }

    #[test]
    fn test_rate_limit_detection() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));

        let err = classify_error(StatusCode::FORBIDDEN, &headers, "{}");
        let reset = Utc.timestamp_opt(1_700_000_000, 0).single();
        assert!(matches!(err, GitHubError::RateLimited { reset_at } if reset_at == reset));

        let now = Utc.timestamp_opt(1_699_999_940, 0).single().unwrap();
        assert_eq!(retry_after(&err, now), Some(chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_plain_forbidden_is_status_error() {
        let headers = HeaderMap::new();
        let err = classify_error(
            StatusCode::FORBIDDEN,
            &headers,
            r#"{"message": "Resource not accessible by integration"}"#,
        );
        match err {
            GitHubError::Status { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Resource not accessible by integration");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_workflow_runs_sends_auth_and_paging() {
        let (base_url, server) = serve_once(
            "200 OK",
            &[],
            r#"{"total_count": 1, "workflow_runs": [{
                "id": 5, "workflow_id": 9, "run_number": 1, "head_sha": "abc", "event": "push",
                "status": "queued", "conclusion": null,
                "html_url": "https://github.com/o/r/actions/runs/5",
                "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z"
            }]}"#,
        )
        .await;

        let client = GitHubClient::builder()
            .base_url(format!("{}/", base_url))
            .token("secret")
            .build()
            .unwrap();
        let runs = client
            .list_workflow_runs("octo", "repo", Some(9), Page::new(2, 10))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, 5);

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with(
            "get /repos/octo/repo/actions/workflows/9/runs?page=2&per_page=10 "
        ));
        assert!(request.contains("authorization: bearer secret"));
        assert!(request.contains("accept: application/vnd.github+json"));
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let (base_url, server) = serve_once(
            "429 Too Many Requests",
            &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1700000000")],
            r#"{"message": "API rate limit exceeded"}"#,
        )
        .await;

        let client = GitHubClient::builder().base_url(base_url).build().unwrap();
        let err = client.current_user().await.unwrap_err();
        assert!(matches!(err, GitHubError::RateLimited { reset_at: Some(_) }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let (base_url, server) = serve_once("200 OK", &[], r#"{"login": 42}"#).await;

        let client = GitHubClient::builder().base_url(base_url).build().unwrap();
        let err = client.current_user().await.unwrap_err();
        assert!(matches!(err, GitHubError::Decode(_)));
        server.await.unwrap();
    }
}
