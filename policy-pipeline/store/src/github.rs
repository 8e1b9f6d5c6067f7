//! A `RemoteRepository` backed by the GitHub contents API.

use crate::remote::{EntryKind, RemoteEntry, RemoteFile, RemoteRepository, StoreError, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header, HeaderMap, StatusCode};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("policy-pipeline/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct GitHubRepository {
    client: Client,
    config: GitHubConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Dir(Vec<ContentItem>),
    Item(ContentItem),
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    path: String,
    sha: String,

    #[serde(default)]
    content: Option<String>,

    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    content: WrittenContent,
}

#[derive(Debug, Deserialize)]
struct WrittenContent {
    sha: String,
}

// === impl GitHubConfig ===

impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("api_url", &self.api_url)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

// === impl GitHubRepository ===

impl GitHubRepository {
    pub fn new(config: GitHubConfig) -> Result<Self, StoreError> {
        for (name, value) in [
            ("owner", &config.owner),
            ("repo", &config.repo),
            ("branch", &config.branch),
        ] {
            if value.trim().is_empty() {
                return Err(StoreError::Configuration(format!(
                    "GitHub {name} must be set"
                )));
            }
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StoreError::Configuration(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/'),
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, self.url(path))
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, path: &str, req: RequestBuilder) -> Result<Response, StoreError> {
        let rsp = req.send().await.map_err(transport_error)?;
        let status = rsp.status();
        debug!(%status, path, "GitHub contents API");
        if status.is_success() {
            return Ok(rsp);
        }
        let headers = rsp.headers().clone();
        let body = rsp.text().await.unwrap_or_default();
        Err(status_error(status, &headers, path, &body))
    }

    async fn contents(&self, path: &str) -> Result<ContentsResponse, StoreError> {
        let req = self
            .request(Method::GET, path)
            .query(&[("ref", self.config.branch.as_str())]);
        self.send(path, req)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Unexpected(e.to_string()))
    }

    async fn put(
        &self,
        path: &str,
        content: &str,
        sha: Option<&str>,
        message: &str,
    ) -> Result<Version, StoreError> {
        let body = WriteRequest {
            message,
            content: STANDARD.encode(content),
            branch: &self.config.branch,
            sha,
        };
        let rsp: WriteResponse = self
            .send(path, self.request(Method::PUT, path).json(&body))
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Unexpected(e.to_string()))?;
        Ok(Version(rsp.content.sha))
    }
}

#[async_trait::async_trait]
impl RemoteRepository for GitHubRepository {
    async fn get(&self, path: &str) -> Result<RemoteFile, StoreError> {
        match self.contents(path).await? {
            ContentsResponse::Item(item) if item.kind == "file" => decode_file(item),
            _ => Err(StoreError::Unexpected(format!("{path} is not a file"))),
        }
    }

    async fn create(
        &self,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<Version, StoreError> {
        self.put(path, content, None, message).await
    }

    async fn update(
        &self,
        path: &str,
        content: &str,
        version: &Version,
        message: &str,
    ) -> Result<Version, StoreError> {
        self.put(path, content, Some(&version.0), message).await
    }

    async fn delete(
        &self,
        path: &str,
        version: &Version,
        message: &str,
    ) -> Result<(), StoreError> {
        let body = DeleteRequest {
            message,
            sha: &version.0,
            branch: &self.config.branch,
        };
        self.send(path, self.request(Method::DELETE, path).json(&body))
            .await?;
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, StoreError> {
        match self.contents(dir).await? {
            ContentsResponse::Dir(items) => Ok(items
                .into_iter()
                .map(|item| RemoteEntry {
                    kind: if item.kind == "dir" {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                    name: item.name,
                    path: item.path,
                })
                .collect()),
            ContentsResponse::Item(_) => {
                Err(StoreError::Unexpected(format!("{dir} is not a directory")))
            }
        }
    }
}

fn decode_file(item: ContentItem) -> Result<RemoteFile, StoreError> {
    match item.encoding.as_deref() {
        Some("base64") => {}
        other => {
            return Err(StoreError::Unexpected(format!(
                "{} has unsupported encoding {other:?}",
                item.path
            )))
        }
    }
    // The API wraps encoded content across lines.
    let encoded = item
        .content
        .unwrap_or_default()
        .split_whitespace()
        .collect::<String>();
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Unexpected(format!("{}: {e}", item.path)))?;
    let content = String::from_utf8(bytes)
        .map_err(|_| StoreError::Unexpected(format!("{} is not UTF-8", item.path)))?;
    Ok(RemoteFile {
        content,
        version: Version(item.sha),
    })
}

fn transport_error(error: reqwest::Error) -> StoreError {
    if error.is_builder() {
        StoreError::Configuration(error.to_string())
    } else {
        StoreError::Transient(error.to_string())
    }
}

fn status_error(status: StatusCode, headers: &HeaderMap, path: &str, body: &str) -> StoreError {
    let rate_limited = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(path.to_string()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED | StatusCode::UNPROCESSABLE_ENTITY => {
            StoreError::Conflict(path.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => StoreError::Transient(format!("{status} for {path}")),
        StatusCode::FORBIDDEN if rate_limited => {
            StoreError::Transient(format!("rate limited for {path}"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::Configuration(format!("{status} for {path}: check the GitHub token"))
        }
        s if s.is_server_error() => StoreError::Transient(format!("{status} for {path}")),
        _ => StoreError::Unexpected(format!("{status} for {path}: {}", body.trim())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> GitHubConfig {
        GitHubConfig {
            api_url: "https://github.example.com/api/v3/".to_string(),
            owner: "acme".to_string(),
            repo: "policies".to_string(),
            branch: "main".to_string(),
            token: Some("secret".to_string()),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn builds_contents_urls() {
        let repo = GitHubRepository::new(config()).unwrap();
        assert_eq!(
            repo.url("policies/orders/sandbox/draft/policy_1.rego"),
            "https://github.example.com/api/v3/repos/acme/policies/contents/policies/orders/sandbox/draft/policy_1.rego"
        );
    }

    #[test]
    fn requires_repository_coordinates() {
        let err = GitHubRepository::new(GitHubConfig {
            owner: " ".to_string(),
            ..config()
        })
        .unwrap_err();
        assert_eq!(
            err,
            StoreError::Configuration("GitHub owner must be set".to_string())
        );
    }

    #[test]
    fn token_is_not_logged() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("secret"), "{debug}");
    }

    #[test]
    fn decodes_wrapped_base64() {
        let item = ContentItem {
            kind: "file".to_string(),
            name: "policy_1.rego".to_string(),
            path: "policies/default/sandbox/draft/policy_1.rego".to_string(),
            sha: "abc123".to_string(),
            content: Some("cGFja2FnZSBh\ndXRoego=\n".to_string()),
            encoding: Some("base64".to_string()),
        };
        assert_eq!(
            decode_file(item).unwrap(),
            RemoteFile {
                content: "package authz\n".to_string(),
                version: Version("abc123".to_string()),
            }
        );
    }

    #[test]
    fn parses_directory_listings() {
        let body = r#"[
            {"type":"file","name":"policy_1.rego","path":"policies/a/sandbox/draft/policy_1.rego","sha":"1"},
            {"type":"dir","name":"nested","path":"policies/a/sandbox/draft/nested","sha":"2"}
        ]"#;
        let ContentsResponse::Dir(items) = serde_json::from_str(body).unwrap() else {
            panic!("expected a listing");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].kind, "dir");
    }

    #[rstest]
    #[case(StatusCode::NOT_FOUND, None, "not_found")]
    #[case(StatusCode::CONFLICT, None, "conflict")]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, None, "conflict")]
    #[case(StatusCode::TOO_MANY_REQUESTS, None, "transient")]
    #[case(StatusCode::FORBIDDEN, Some("0"), "transient")]
    #[case(StatusCode::FORBIDDEN, Some("4999"), "configuration")]
    #[case(StatusCode::UNAUTHORIZED, None, "configuration")]
    #[case(StatusCode::BAD_GATEWAY, None, "transient")]
    #[case(StatusCode::BAD_REQUEST, None, "unexpected")]
    fn maps_status_codes(
        #[case] status: StatusCode,
        #[case] remaining: Option<&str>,
        #[case] kind: &str,
    ) {
        let mut headers = HeaderMap::new();
        if let Some(remaining) = remaining {
            headers.insert("x-ratelimit-remaining", remaining.parse().unwrap());
        }
        assert_eq!(status_error(status, &headers, "p", "").kind(), kind);
    }
}
