//! Collaborator capability traits + reqwest implementations.
//!
//! The pipeline depends only on the traits here; every source-specific
//! record shape is normalized into [`obr_core::ItemDraft`] at this boundary.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obr_core::{ItemDraft, ItemSource, Reward};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "obr-sources";

const GITHUB_API: &str = "https://api.github.com";
const ALGORA_API: &str = "https://console.algora.io";
const SLACK_API: &str = "https://slack.com/api";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat api rejected the call: {0}")]
    Rejected(String),
    #[error("this chat client cannot upload files")]
    UploadUnsupported,
}

/// Issue-search capability: label-OR query over a created/updated window.
#[async_trait]
pub trait IssueSearch: Send + Sync {
    async fn search(&self, query: &IssueQuery) -> Result<Vec<RawIssue>, SourceError>;
}

/// Bounty-platform capability: active bounties for one org slug.
#[async_trait]
pub trait BountyPlatform: Send + Sync {
    async fn active_bounties(&self, org: &str) -> Result<Vec<RawBounty>, SourceError>;
}

/// Chat capability. File upload is optional; callers check
/// [`Chat::supports_file_upload`] before relying on it.
#[async_trait]
pub trait Chat: Send + Sync {
    async fn post_message(&self, text: &str) -> Result<(), ChatError>;

    fn supports_file_upload(&self) -> bool {
        false
    }

    async fn upload_file(&self, _path: &Path, _title: &str) -> Result<(), ChatError> {
        Err(ChatError::UploadUnsupported)
    }
}

/// Profile-language capability, consumed only by the explicit cache refresh.
#[async_trait]
pub trait ProfileLanguages: Send + Sync {
    async fn profile_languages(&self, username: &str) -> Result<Vec<String>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "obr/0.1".to_string(),
        }
    }
}

pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client, SourceError> {
    let client = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()?;
    Ok(client)
}

// ---------------------------------------------------------------------------
// Issue search (GitHub)
// ---------------------------------------------------------------------------

/// Parameters for one issue-search poll.
#[derive(Debug, Clone)]
pub struct IssueQuery {
    /// Non-empty label OR-filter.
    pub labels: Vec<String>,
    /// Empty means no language clause.
    pub languages: Vec<String>,
    /// Empty means no repo restriction.
    pub repos: Vec<String>,
    pub window_start: DateTime<Utc>,
}

impl IssueQuery {
    pub fn without_languages(&self) -> IssueQuery {
        IssueQuery {
            languages: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawIssue {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub repository_url: String,
    #[serde(default)]
    pub labels: Vec<RawIssueLabel>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawIssueLabel {
    #[serde(default)]
    pub name: String,
}

fn quote_token(token: &str) -> String {
    let needs_quotes = token
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | ':' | '#' | '(' | ')' | '+'))
        || !token.is_ascii();
    if needs_quotes {
        format!("\"{token}\"")
    } else {
        token.to_string()
    }
}

/// Render the advanced search query string. The time clause is an OR over
/// created and updated so items touched after creation still land in the
/// window.
pub fn build_search_query(query: &IssueQuery) -> String {
    let mut clauses = vec!["is:issue".to_string(), "is:open".to_string()];

    let label_or = query
        .labels
        .iter()
        .map(|l| format!("label:{}", quote_token(l)))
        .collect::<Vec<_>>()
        .join(" OR ");
    clauses.push(format!("({label_or})"));

    if !query.languages.is_empty() {
        let lang_or = query
            .languages
            .iter()
            .map(|l| format!("language:{}", quote_token(l)))
            .collect::<Vec<_>>()
            .join(" OR ");
        clauses.push(format!("({lang_or})"));
    }

    if !query.repos.is_empty() {
        let repo_or = query
            .repos
            .iter()
            .map(|r| format!("repo:{r}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        clauses.push(format!("({repo_or})"));
    }

    let since = query.window_start.format("%Y-%m-%dT%H:%M:%SZ");
    clauses.push(format!("(created:>={since} OR updated:>={since})"));

    clauses.join(" ")
}

pub struct GithubClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl GithubClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            api_base: GITHUB_API.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
struct RepoLanguage {
    #[serde(default)]
    language: Option<String>,
}

#[async_trait]
impl IssueSearch for GithubClient {
    async fn search(&self, query: &IssueQuery) -> Result<Vec<RawIssue>, SourceError> {
        let q = build_search_query(query);
        let url = format!("{}/search/issues", self.api_base);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/vnd.github+json")
            .query(&[
                ("q", q.as_str()),
                ("sort", "created"),
                ("order", "desc"),
                ("per_page", "100"),
                ("advanced_search", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 422 {
            // Almost always a malformed qualifier; keep the query visible.
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(500).collect();
            error!(query = %q, body = %body, "issue search rejected (422)");
            return Err(SourceError::Status { status: 422, url });
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.items)
    }
}

#[async_trait]
impl ProfileLanguages for GithubClient {
    async fn profile_languages(&self, username: &str) -> Result<Vec<String>, SourceError> {
        let mut languages = Vec::new();
        for page in 1..=5u32 {
            let url = format!(
                "{}/users/{username}/repos?per_page=100&page={page}",
                self.api_base
            );
            let response = self
                .client
                .get(&url)
                .header("Authorization", self.auth_header())
                .header("Accept", "application/vnd.github+json")
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    url,
                });
            }
            let repos: Vec<RepoLanguage> = response.json().await?;
            if repos.is_empty() {
                break;
            }
            languages.extend(repos.into_iter().filter_map(|r| r.language));
        }
        Ok(top_languages(languages, 8))
    }
}

/// Most frequent languages first, ties broken alphabetically for stability.
pub fn top_languages(observed: impl IntoIterator<Item = String>, keep: usize) -> Vec<String> {
    let mut counts = std::collections::BTreeMap::<String, usize>::new();
    for lang in observed {
        *counts.entry(lang).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(keep).map(|(lang, _)| lang).collect()
}

// ---------------------------------------------------------------------------
// Bounty platform (Algora)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RawBounty {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    /// Reward in minor units (cents).
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub issue: Option<RawBountyIssue>,
    #[serde(default)]
    pub repo_owner: Option<String>,
    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBountyIssue {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

pub struct AlgoraClient {
    client: reqwest::Client,
    api_base: String,
}

impl AlgoraClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: ALGORA_API.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct BountyPage {
    #[serde(default)]
    items: Vec<RawBounty>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[async_trait]
impl BountyPlatform for AlgoraClient {
    async fn active_bounties(&self, org: &str) -> Result<Vec<RawBounty>, SourceError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut url = format!("{}/api/orgs/{org}/bounties?limit=100", self.api_base);
            if let Some(cursor) = &cursor {
                url.push_str("&cursor=");
                url.push_str(cursor);
            }
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    url,
                });
            }
            let page: BountyPage = response.json().await?;
            out.extend(page.items.into_iter().filter(|b| b.status == "active"));
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Normalization into the canonical item shape
// ---------------------------------------------------------------------------

/// Map one raw issue-search record. Records without a permalink cannot be
/// keyed and are dropped with a warning.
pub fn normalize_issue(raw: &RawIssue, fetched_at: DateTime<Utc>) -> Option<ItemDraft> {
    let url = raw.html_url.trim();
    if url.is_empty() {
        warn!(issue_id = raw.id, "skipping issue-search record without permalink");
        return None;
    }
    let repo = raw
        .repository_url
        .split_once("/repos/")
        .map(|(_, tail)| tail.to_string())
        .unwrap_or_default();
    Some(ItemDraft {
        source: ItemSource::IssueSearch,
        repo,
        title: raw.title.clone(),
        labels: raw.labels.iter().map(|l| l.name.clone()).collect(),
        url: url.to_string(),
        reward: None,
        created_at: raw.created_at.unwrap_or(fetched_at),
    })
}

/// Map one raw bounty-platform record. Only active bounties with an issue
/// permalink survive: without one there is no stable identity key.
pub fn normalize_bounty(raw: &RawBounty, fetched_at: DateTime<Utc>) -> Option<ItemDraft> {
    if raw.status != "active" {
        return None;
    }
    let url = raw
        .issue
        .as_ref()
        .and_then(|i| i.html_url.as_deref())
        .map(str::trim)
        .unwrap_or_default();
    if url.is_empty() {
        warn!(bounty_id = %raw.id, "skipping bounty record without issue permalink");
        return None;
    }

    let currency = raw.currency.clone().unwrap_or_else(|| "USD".to_string());
    let reward = raw.amount.map(|cents| Reward {
        amount: cents as f64 / 100.0,
        currency: currency.clone(),
    });
    let labels = reward
        .as_ref()
        .map(|r| vec![format!("{} {:.2}", r.currency, r.amount)])
        .unwrap_or_default();
    let repo = match (raw.repo_owner.as_deref(), raw.repo_name.as_deref()) {
        (Some(owner), Some(name)) if !owner.is_empty() && !name.is_empty() => {
            format!("{owner}/{name}")
        }
        _ => String::new(),
    };

    Some(ItemDraft {
        source: ItemSource::BountyPlatform,
        repo,
        title: raw
            .issue
            .as_ref()
            .and_then(|i| i.title.clone())
            .unwrap_or_else(|| "(no title)".to_string()),
        labels,
        url: url.to_string(),
        reward,
        created_at: raw.created_at.unwrap_or(fetched_at),
    })
}

// ---------------------------------------------------------------------------
// Chat (Slack)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SlackResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Bot-token chat client; posts every chunk as an independent top-level
/// message and can upload the CSV export.
pub struct SlackBotChat {
    client: reqwest::Client,
    token: String,
    channel: String,
    unfurl_links: bool,
    api_base: String,
}

impl SlackBotChat {
    pub fn new(
        client: reqwest::Client,
        token: impl Into<String>,
        channel: impl Into<String>,
        unfurl_links: bool,
    ) -> Self {
        Self {
            client,
            token: token.into(),
            channel: channel.into(),
            unfurl_links,
            api_base: SLACK_API.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

#[async_trait]
impl Chat for SlackBotChat {
    async fn post_message(&self, text: &str) -> Result<(), ChatError> {
        let mut payload = serde_json::json!({
            "channel": self.channel,
            "text": text,
        });
        if !self.unfurl_links {
            payload["unfurl_links"] = serde_json::json!(false);
            payload["unfurl_media"] = serde_json::json!(false);
        }
        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&payload)
            .send()
            .await?;
        let body: SlackResponse = response.json().await?;
        if body.ok {
            Ok(())
        } else {
            Err(ChatError::Rejected(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ))
        }
    }

    fn supports_file_upload(&self) -> bool {
        true
    }

    async fn upload_file(&self, path: &Path, title: &str) -> Result<(), ChatError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::Rejected(format!("reading {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export.csv".to_string());
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(filename.clone()),
            )
            .text("channels", self.channel.clone())
            .text("filename", filename)
            .text("title", title.to_string());
        let response = self
            .client
            .post(format!("{}/files.upload", self.api_base))
            .header("Authorization", format!("Bearer {}", self.token))
            .multipart(form)
            .send()
            .await?;
        let body: SlackResponse = response.json().await?;
        if body.ok {
            Ok(())
        } else {
            Err(ChatError::Rejected(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ))
        }
    }
}

/// Incoming-webhook chat client. No file capability.
pub struct SlackWebhookChat {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhookChat {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Chat for SlackWebhookChat {
    async fn post_message(&self, text: &str) -> Result<(), ChatError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() && matches!(body.trim(), "ok" | "") {
            Ok(())
        } else {
            Err(ChatError::Rejected(format!(
                "webhook_status_{}:{}",
                status.as_u16(),
                body.chars().take(120).collect::<String>()
            )))
        }
    }
}
