//! GitHub REST client for pull requests and their review state.
//!
//! Without both a repository (`owner/name`) and a token the client is
//! inert: `open_pr` returns `None` and the PR step is skipped.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use afterburner_core::{PrRequest, ReviewState, ToolError};

const TOOL: &str = "github";
const API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// `owner/name`.
    pub repo: Option<String>,
    pub token: Option<String>,
    pub api_base: String,
}

impl GithubConfig {
    pub fn new(repo: Option<String>, token: Option<String>) -> Self {
        Self {
            repo,
            token,
            api_base: API_BASE.to_string(),
        }
    }

    /// Token from `GITHUB_TOKEN`.
    pub fn from_env(repo: Option<String>) -> Self {
        Self::new(repo, std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()))
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PullState {
    state: String,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct Review {
    state: String,
    #[serde(default)]
    user: Option<ReviewUser>,
}

#[derive(Debug, Deserialize)]
struct ReviewUser {
    login: String,
}

pub struct GithubClient {
    config: GithubConfig,
    http: reqwest::Client,
}

impl GithubClient {
    pub fn new(config: GithubConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("afterburner/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, http }
    }

    pub fn is_configured(&self) -> bool {
        self.config.repo.is_some() && self.config.token.is_some()
    }

    fn endpoint(&self, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}", self.config.api_base, repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json");
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ToolError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ToolError::failed(TOOL, e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::failed(
                TOOL,
                format!("{status}: {}", body.chars().take(300).collect::<String>()),
            ));
        }
        Ok(response)
    }

    /// Open the PR, then attach labels and reviewers (best effort).
    pub async fn open_pr(&self, request: &PrRequest) -> Result<Option<String>, ToolError> {
        let (Some(repo), true) = (self.config.repo.as_deref(), self.is_configured()) else {
            debug!("github repo or token not configured; skipping PR");
            return Ok(None);
        };

        let created: PullResponse = self
            .send(
                self.request(reqwest::Method::POST, &self.endpoint(repo, "pulls"))
                    .json(&json!({
                        "title": request.title,
                        "head": request.branch,
                        "base": request.base_branch,
                        "body": request.body,
                    })),
            )
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Parse {
                tool: TOOL.into(),
                detail: e.to_string(),
            })?;

        if !request.labels.is_empty() {
            let url = self.endpoint(repo, &format!("issues/{}/labels", created.number));
            if let Err(e) = self
                .send(
                    self.request(reqwest::Method::POST, &url)
                        .json(&json!({ "labels": request.labels })),
                )
                .await
            {
                warn!(pr = created.number, error = %e, "could not label PR");
            }
        }
        if !request.reviewers.is_empty() {
            let url = self.endpoint(repo, &format!("pulls/{}/requested_reviewers", created.number));
            if let Err(e) = self
                .send(
                    self.request(reqwest::Method::POST, &url)
                        .json(&json!({ "reviewers": request.reviewers })),
                )
                .await
            {
                warn!(pr = created.number, error = %e, "could not request reviewers");
            }
        }
        Ok(Some(created.html_url))
    }

    pub async fn review_state(&self, pr_url: &str) -> Result<ReviewState, ToolError> {
        let repo = self
            .config
            .repo
            .as_deref()
            .ok_or_else(|| ToolError::failed(TOOL, "no GitHub repository configured"))?;
        let number = pr_number(pr_url)
            .ok_or_else(|| ToolError::failed(TOOL, format!("not a pull request URL: {pr_url}")))?;

        let pull: PullState = self
            .send(self.request(reqwest::Method::GET, &self.endpoint(repo, &format!("pulls/{number}"))))
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Parse {
                tool: TOOL.into(),
                detail: e.to_string(),
            })?;
        if pull.merged {
            return Ok(ReviewState::Approved);
        }
        if pull.state == "closed" {
            return Ok(ReviewState::Rejected {
                reason: "pull request closed without merging".into(),
            });
        }

        let reviews: Vec<Review> = self
            .send(self.request(
                reqwest::Method::GET,
                &self.endpoint(repo, &format!("pulls/{number}/reviews")),
            ))
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Parse {
                tool: TOOL.into(),
                detail: e.to_string(),
            })?;
        Ok(review_verdict(&reviews))
    }
}

fn pr_number(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit_once("/pull/")
        .or_else(|| url.trim_end_matches('/').rsplit_once("/pulls/"))
        .and_then(|(_, n)| n.split('/').next())
        .and_then(|n| n.parse().ok())
}

/// Latest review per reviewer decides; any outstanding change request wins.
fn review_verdict(reviews: &[Review]) -> ReviewState {
    let mut latest: std::collections::BTreeMap<&str, &str> = std::collections::BTreeMap::new();
    for review in reviews {
        if review.state == "COMMENTED" {
            continue;
        }
        let who = review.user.as_ref().map(|u| u.login.as_str()).unwrap_or("");
        latest.insert(who, review.state.as_str());
    }
    if let Some((who, _)) = latest.iter().find(|(_, s)| **s == "CHANGES_REQUESTED") {
        return ReviewState::Rejected {
            reason: format!("changes requested by {who}"),
        };
    }
    if latest.values().any(|s| *s == "APPROVED") {
        return ReviewState::Approved;
    }
    ReviewState::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(login: &str, state: &str) -> Review {
        Review {
            state: state.into(),
            user: Some(ReviewUser {
                login: login.into(),
            }),
        }
    }

    #[test]
    fn pr_number_from_html_and_api_urls() {
        assert_eq!(pr_number("https://github.com/acme/app/pull/42"), Some(42));
        assert_eq!(
            pr_number("https://api.github.com/repos/acme/app/pulls/7"),
            Some(7)
        );
        assert_eq!(pr_number("https://github.com/acme/app"), None);
    }

    #[test]
    fn latest_review_per_user_decides() {
        assert_eq!(review_verdict(&[]), ReviewState::Pending);
        assert_eq!(
            review_verdict(&[review("ana", "CHANGES_REQUESTED"), review("ana", "APPROVED")]),
            ReviewState::Approved
        );
        assert!(matches!(
            review_verdict(&[review("ana", "APPROVED"), review("bo", "CHANGES_REQUESTED")]),
            ReviewState::Rejected { .. }
        ));
        assert_eq!(
            review_verdict(&[review("ana", "COMMENTED")]),
            ReviewState::Pending
        );
    }

    #[tokio::test]
    async fn unconfigured_client_skips_pr() {
        let client = GithubClient::new(GithubConfig::new(None, None));
        let url = client
            .open_pr(&PrRequest {
                branch: "afterburner/fix/x".into(),
                base_branch: "main".into(),
                title: "fix".into(),
                body: String::new(),
                labels: vec![],
                reviewers: vec![],
            })
            .await
            .unwrap();
        assert!(url.is_none());
    }
}
