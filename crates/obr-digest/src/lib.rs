//! Ingestion, digest composition and delivery pipeline.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use obr_core::{Item, RunStatus};
use obr_sources::{
    normalize_bounty, normalize_issue, BountyPlatform, Chat, IssueQuery, IssueSearch,
    ProfileLanguages, SourceError,
};
use obr_store::{ItemStore, LanguageProfile, UpsertOutcome};
use serde::Serialize;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "obr-digest";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub github_token: String,
    pub github_username: String,
    pub use_profile_langs: bool,
    pub static_languages: Vec<String>,
    pub labels: Vec<String>,
    /// Validated owner/name allow-list; applies to both sources.
    pub repos: Vec<String>,
    pub window_minutes: i64,
    pub bootstrap_days: i64,
    pub algora_orgs: Vec<String>,
    pub slack_channel: String,
    pub slack_bot_token: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub slack_unfurl: bool,
    pub max_chunk_chars: usize,
    pub max_items_in_digest: i64,
    pub write_csv: bool,
    pub csv_dir: PathBuf,
    pub upload_csv: bool,
    pub db_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_token = std::env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN is required (set it in the environment or .env)")?;
        let slack_bot_token = std::env::var("SLACK_BOT_TOKEN").ok().filter(|s| !s.is_empty());
        let slack_webhook_url = std::env::var("SLACK_WEBHOOK_URL").ok().filter(|s| !s.is_empty());
        if slack_bot_token.is_none() && slack_webhook_url.is_none() {
            bail!("provide SLACK_BOT_TOKEN or SLACK_WEBHOOK_URL");
        }

        Ok(Self {
            github_token,
            github_username: std::env::var("GITHUB_USERNAME")
                .unwrap_or_else(|_| "octocat".to_string()),
            use_profile_langs: env_bool("USE_PROFILE_LANGS", true),
            static_languages: env_csv("STATIC_LANGUAGES", "TypeScript,Go,Python"),
            labels: env_csv("LABELS", "bounty,reward,algora"),
            repos: clean_repos(&env_csv("REPOS", "")),
            window_minutes: env_i64("WINDOW_MINUTES", 12),
            bootstrap_days: env_i64("BOOTSTRAP_DAYS", 7),
            algora_orgs: env_csv("ALGORA_ORGS", ""),
            slack_channel: std::env::var("SLACK_CHANNEL")
                .unwrap_or_else(|_| "#bounties".to_string()),
            slack_bot_token,
            slack_webhook_url,
            slack_unfurl: env_bool("SLACK_UNFURL", true),
            max_chunk_chars: env_i64("MAX_SLACK_CHARS", 3500).max(1) as usize,
            max_items_in_digest: env_i64("MAX_ITEMS_IN_DIGEST", 50),
            write_csv: env_bool("WRITE_CSV", true),
            csv_dir: std::env::var("CSV_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./bounty_csv")),
            upload_csv: env_bool("UPLOAD_CSV_TO_SLACK", false),
            db_path: std::env::var("BOUNTY_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./bounties.db")),
            http_timeout_secs: env_i64("OBR_HTTP_TIMEOUT_SECS", 20).max(1) as u64,
            user_agent: std::env::var("OBR_USER_AGENT").unwrap_or_else(|_| "obr/0.1".to_string()),
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

fn env_csv(name: &str, default: &str) -> Vec<String> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Keep only well-formed `owner/name` entries; stray quotes and `#` comment
/// lines from a hand-edited .env are tolerated.
pub fn clean_repos(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|r| r.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|r| !r.is_empty() && !r.starts_with('#'))
        .filter(|r| is_valid_repo(r))
        .collect()
}

fn is_valid_repo(s: &str) -> bool {
    let Some((owner, name)) = s.split_once('/') else {
        return false;
    };
    let ok = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    };
    ok(owner) && ok(name) && !name.contains('/')
}

// ---------------------------------------------------------------------------
// Language filter
// ---------------------------------------------------------------------------

/// Effective language set for the issue-search source. Constructed from an
/// explicitly passed-in cache snapshot or the static configured list, never
/// from ambient state. An empty set disables filtering.
#[derive(Debug, Clone, Default)]
pub struct LanguageFilter {
    languages: Vec<String>,
}

impl LanguageFilter {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_static(languages: &[String]) -> Self {
        Self {
            languages: languages.to_vec(),
        }
    }

    pub fn from_profile(profile: &LanguageProfile) -> Self {
        Self {
            languages: profile.languages.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.languages.is_empty()
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn matches(&self, language: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceReport {
    pub attempted: bool,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

impl SourceReport {
    fn tally(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => {}
        }
    }

    fn failed(&self) -> bool {
        self.attempted && self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    pub window_start: DateTime<Utc>,
    pub fallback_used: bool,
    pub issue_search: SourceReport,
    pub bounty_platform: SourceReport,
}

impl CollectReport {
    pub fn status(&self) -> RunStatus {
        let attempted: Vec<&SourceReport> = [&self.issue_search, &self.bounty_platform]
            .into_iter()
            .filter(|r| r.attempted)
            .collect();
        let failed = attempted.iter().filter(|r| r.failed()).count();
        if !attempted.is_empty() && failed == attempted.len() {
            RunStatus::Failed
        } else if failed > 0 {
            RunStatus::CompletedDegraded
        } else {
            RunStatus::Completed
        }
    }
}

// ---------------------------------------------------------------------------
// Digest composition + chunking
// ---------------------------------------------------------------------------

/// Rendered digest: ordered chunks plus the items that contributed to them.
#[derive(Debug, Clone)]
pub struct Digest {
    pub chunks: Vec<String>,
    pub items: Vec<Item>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn urls(&self) -> Vec<String> {
        self.items.iter().map(|i| i.url.clone()).collect()
    }
}

pub fn render_line(item: &Item) -> String {
    let labels = item.labels.join(", ");
    let mut line = format!("{} — {} [{}] {}", item.repo, item.title, labels, item.url);
    if let Some(reward) = &item.reward {
        line.push_str(&format!(" ({} {:.2})", reward.currency, reward.amount));
    }
    line
}

pub fn digest_header(count: usize) -> String {
    format!(
        "Bounty digest: {count} undelivered item{}",
        if count == 1 { "" } else { "s" }
    )
}

/// Split the rendered document into chunks of at most `max_chars`, cutting
/// only at line boundaries. The header rides on the first chunk only. A
/// single line longer than `max_chars` becomes its own oversized chunk;
/// splitting it would corrupt the embedded url.
pub fn chunk_lines(header: &str, lines: &[String], max_chars: usize) -> Vec<String> {
    if lines.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = header.to_string();
    for line in lines {
        let joined_len = if current.is_empty() {
            line.len()
        } else {
            current.len() + 1 + line.len()
        };
        if joined_len <= max_chars {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        } else {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if line.len() > max_chars {
                chunks.push(line.clone());
            } else {
                current = line.clone();
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Render the undelivered selection into bounded chunks. Items are expected
/// in the store's ascending order; zero items yield zero chunks.
pub fn compose_digest(items: Vec<Item>, max_chunk_chars: usize) -> Digest {
    let lines: Vec<String> = items.iter().map(render_line).collect();
    let chunks = chunk_lines(&digest_header(items.len()), &lines, max_chunk_chars);
    Digest { chunks, items }
}

// ---------------------------------------------------------------------------
// Delivery driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every chunk was accepted; carries the full contributing url set.
    AllOk { delivered: Vec<String> },
    /// A chunk was refused. Chunks before `failed_at` went out on the wire,
    /// but nothing is marked delivered: the next digest run resends.
    PartialFailure { sent_chunks: usize, failed_at: usize },
}

/// Send chunks strictly in order as independent top-level messages.
pub async fn deliver(chat: &dyn Chat, digest: &Digest) -> SendOutcome {
    for (index, chunk) in digest.chunks.iter().enumerate() {
        if let Err(err) = chat.post_message(chunk).await {
            warn!(chunk = index, error = %err, "chat delivery failed mid-digest");
            return SendOutcome::PartialFailure {
                sent_chunks: index,
                failed_at: index,
            };
        }
    }
    SendOutcome::AllOk {
        delivered: digest.urls(),
    }
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

pub const CSV_HEADER: &str = "created_at_utc,source,repo,title,labels,url,amount,currency";

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One row per digested item; labels are joined with `|`, an absent reward
/// leaves amount and currency empty.
pub fn render_csv(items: &[Item]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for item in items {
        let (amount, currency) = match &item.reward {
            Some(r) => (format!("{}", r.amount), r.currency.clone()),
            None => (String::new(), String::new()),
        };
        let row = [
            item.created_at.to_rfc3339(),
            item.source.to_string(),
            item.repo.clone(),
            item.title.clone(),
            item.labels.join("|"),
            item.url.clone(),
            amount,
            currency,
        ]
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
        out.push_str(&row);
        out.push('\n');
    }
    out
}

pub fn export_filename(now: DateTime<Utc>) -> String {
    format!("bounty_digest_{}.csv", now.format("%Y%m%d_%H%M"))
}

// ---------------------------------------------------------------------------
// Pipeline + modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DigestReport {
    pub status: RunStatus,
    pub selected: usize,
    pub chunks_total: usize,
    pub chunks_sent: usize,
    pub marked_delivered: u64,
    pub csv_path: Option<PathBuf>,
}

pub struct Pipeline {
    config: Config,
    store: ItemStore,
    issues: Box<dyn IssueSearch>,
    bounties: Box<dyn BountyPlatform>,
    chat: Box<dyn Chat>,
    profile: Box<dyn ProfileLanguages>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: ItemStore,
        issues: Box<dyn IssueSearch>,
        bounties: Box<dyn BountyPlatform>,
        chat: Box<dyn Chat>,
        profile: Box<dyn ProfileLanguages>,
    ) -> Self {
        Self {
            config,
            store,
            issues,
            bounties,
            chat,
            profile,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    /// Poll both sources over a lookback window and persist what they yield.
    /// One failed source degrades the run; the other source still lands.
    pub async fn collect(&self, lookback_minutes: i64) -> Result<CollectReport> {
        let window_start = Utc::now() - Duration::minutes(lookback_minutes.max(1));
        let filter = self.language_filter().await?;
        info!(
            %window_start,
            languages = ?filter.languages(),
            "collect starting"
        );

        let mut report = CollectReport {
            window_start,
            fallback_used: false,
            issue_search: SourceReport {
                attempted: true,
                ..Default::default()
            },
            bounty_platform: SourceReport::default(),
        };

        let query = IssueQuery {
            labels: self.config.labels.clone(),
            languages: filter.languages().to_vec(),
            repos: self.config.repos.clone(),
            window_start,
        };
        match self.fetch_issues(&query, filter.is_enabled()).await {
            Ok((raws, fallback_used)) => {
                report.fallback_used = fallback_used;
                report.issue_search.fetched = raws.len();
                let fetched_at = Utc::now();
                for raw in &raws {
                    let Some(draft) = normalize_issue(raw, fetched_at) else {
                        report.issue_search.skipped += 1;
                        continue;
                    };
                    if !self.repo_allowed(&draft.repo) {
                        report.issue_search.skipped += 1;
                        continue;
                    }
                    let outcome = self.store.upsert(&draft).await?;
                    report.issue_search.tally(outcome);
                }
            }
            Err(err) => {
                warn!(error = %err, "issue-search source unavailable this poll");
                report.issue_search.error = Some(err.to_string());
            }
        }

        if !self.config.algora_orgs.is_empty() {
            report.bounty_platform.attempted = true;
            let mut org_errors = Vec::new();
            let mut any_ok = false;
            for org in &self.config.algora_orgs {
                match self.bounties.active_bounties(org).await {
                    Ok(raws) => {
                        any_ok = true;
                        report.bounty_platform.fetched += raws.len();
                        let fetched_at = Utc::now();
                        for raw in &raws {
                            let Some(draft) = normalize_bounty(raw, fetched_at) else {
                                report.bounty_platform.skipped += 1;
                                continue;
                            };
                            // The allow-list applies to this source too.
                            if !self.repo_allowed(&draft.repo) {
                                report.bounty_platform.skipped += 1;
                                continue;
                            }
                            let outcome = self.store.upsert(&draft).await?;
                            report.bounty_platform.tally(outcome);
                        }
                    }
                    Err(err) => {
                        warn!(org = %org, error = %err, "bounty-platform org skipped");
                        org_errors.push(format!("{org}: {err}"));
                    }
                }
            }
            if !any_ok && !org_errors.is_empty() {
                report.bounty_platform.error = Some(org_errors.join("; "));
            }
        }

        info!(
            status = %report.status(),
            gh_inserted = report.issue_search.inserted,
            bounty_inserted = report.bounty_platform.inserted,
            fallback = report.fallback_used,
            "collect finished"
        );
        Ok(report)
    }

    /// Two-step decision: the filtered query, then at most one unfiltered
    /// retry when the filter starved the result set.
    async fn fetch_issues(
        &self,
        query: &IssueQuery,
        filter_enabled: bool,
    ) -> Result<(Vec<obr_sources::RawIssue>, bool), SourceError> {
        let first = self.issues.search(query).await?;
        if filter_enabled && first.is_empty() {
            info!("language filter yielded nothing; retrying once without it");
            let second = self.issues.search(&query.without_languages()).await?;
            return Ok((second, true));
        }
        Ok((first, false))
    }

    fn repo_allowed(&self, repo: &str) -> bool {
        self.config.repos.is_empty() || self.config.repos.iter().any(|r| r == repo)
    }

    async fn language_filter(&self) -> Result<LanguageFilter> {
        if !self.config.use_profile_langs {
            return Ok(LanguageFilter::from_static(&self.config.static_languages));
        }
        match self.store.profile_languages().await? {
            Some(profile) => Ok(LanguageFilter::from_profile(&profile)),
            None => {
                warn!("profile language cache is empty (run the langs mode); using static list");
                Ok(LanguageFilter::from_static(&self.config.static_languages))
            }
        }
    }

    /// Render and send the undelivered selection. `mark_delivered` is false
    /// for the test mode, which must leave the store untouched.
    pub async fn digest(&self, mark_delivered: bool) -> Result<DigestReport> {
        let limit = (self.config.max_items_in_digest > 0).then_some(self.config.max_items_in_digest);
        let allowlist = (!self.config.repos.is_empty()).then_some(self.config.repos.as_slice());
        let items = self.store.select_undelivered(limit, allowlist).await?;
        let selected = items.len();
        let digest = compose_digest(items, self.config.max_chunk_chars);

        if digest.is_empty() {
            info!("digest: nothing to send");
            return Ok(DigestReport {
                status: RunStatus::Completed,
                selected: 0,
                chunks_total: 0,
                chunks_sent: 0,
                marked_delivered: 0,
                csv_path: None,
            });
        }

        let chunks_total = digest.chunks.len();
        let outcome = deliver(self.chat.as_ref(), &digest).await;

        // The tabular export covers the same selection whatever the chat
        // outcome was.
        let csv_path = if self.config.write_csv {
            Some(self.write_csv_export(&digest.items).await?)
        } else {
            None
        };

        match outcome {
            SendOutcome::AllOk { delivered } => {
                if let Some(path) = &csv_path {
                    if self.config.upload_csv && self.chat.supports_file_upload() {
                        if let Err(err) = self.chat.upload_file(path, "Bounty digest CSV").await {
                            warn!(error = %err, "csv upload failed; export kept on disk");
                        }
                    }
                }
                let marked = if mark_delivered {
                    self.store.mark_delivered(&delivered).await?
                } else {
                    0
                };
                info!(selected, chunks_total, marked, "digest sent");
                Ok(DigestReport {
                    status: RunStatus::Completed,
                    selected,
                    chunks_total,
                    chunks_sent: chunks_total,
                    marked_delivered: marked,
                    csv_path,
                })
            }
            SendOutcome::PartialFailure {
                sent_chunks,
                failed_at,
            } => {
                warn!(
                    sent_chunks,
                    failed_at, "digest delivery incomplete; items stay undelivered for resend"
                );
                Ok(DigestReport {
                    status: RunStatus::CompletedDegraded,
                    selected,
                    chunks_total,
                    chunks_sent: sent_chunks,
                    marked_delivered: 0,
                    csv_path,
                })
            }
        }
    }

    /// Wide-lookback catch-up collection followed immediately by a digest.
    pub async fn bootstrap(&self) -> Result<(CollectReport, DigestReport)> {
        let minutes = (self.config.bootstrap_days * 24 * 60).max(1);
        info!(days = self.config.bootstrap_days, "bootstrap collecting");
        let collected = self.collect(minutes).await?;
        let digested = self.digest(true).await?;
        Ok((collected, digested))
    }

    /// Insert a throwaway row and run the digest without marking anything.
    pub async fn test_digest(&self) -> Result<DigestReport> {
        let now = Utc::now();
        let draft = obr_core::ItemDraft {
            source: obr_core::ItemSource::BountyPlatform,
            repo: "owner/repo".to_string(),
            title: "(TEST) Example Bounty Title".to_string(),
            labels: vec!["bounty".to_string()],
            url: format!("https://example.com/bounty/{}", now.timestamp()),
            reward: Some(obr_core::Reward {
                amount: 123.0,
                currency: "USD".to_string(),
            }),
            created_at: now,
        };
        self.store.upsert(&draft).await?;
        self.digest(false).await
    }

    /// Explicit, operator-triggered refresh of the profile-language cache.
    pub async fn refresh_languages(&self) -> Result<Vec<String>> {
        let fetched = self
            .profile
            .profile_languages(&self.config.github_username)
            .await
            .context("fetching profile languages")?;
        let languages = if fetched.is_empty() {
            self.config.static_languages.clone()
        } else {
            fetched
        };
        self.store
            .set_profile_languages(&languages, Utc::now())
            .await?;
        info!(?languages, "profile language cache refreshed");
        Ok(languages)
    }

    pub async fn reset_recent(&self, cutoff_minutes: i64) -> Result<u64> {
        let reset = self.store.reset_notified_since(cutoff_minutes).await?;
        info!(reset, cutoff_minutes, "recently delivered items reset for resend");
        Ok(reset)
    }

    async fn write_csv_export(&self, items: &[Item]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.csv_dir)
            .await
            .with_context(|| format!("creating {}", self.config.csv_dir.display()))?;
        let path = self.config.csv_dir.join(export_filename(Utc::now()));
        tokio::fs::write(&path, render_csv(items))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), rows = items.len(), "csv export written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use obr_core::{ItemDraft, ItemSource, Reward};
    use obr_sources::{ChatError, RawBounty, RawBountyIssue, RawIssue, RawIssueLabel};
    use std::sync::Mutex;

    fn test_config() -> Config {
        Config {
            github_token: "t".to_string(),
            github_username: "octocat".to_string(),
            use_profile_langs: false,
            static_languages: vec!["Rust".to_string()],
            labels: vec!["bounty".to_string()],
            repos: Vec::new(),
            window_minutes: 12,
            bootstrap_days: 7,
            algora_orgs: Vec::new(),
            slack_channel: "#bounties".to_string(),
            slack_bot_token: Some("x".to_string()),
            slack_webhook_url: None,
            slack_unfurl: true,
            max_chunk_chars: 3500,
            max_items_in_digest: 50,
            write_csv: false,
            csv_dir: PathBuf::from("./bounty_csv"),
            upload_csv: false,
            db_path: PathBuf::from(":memory:"),
            http_timeout_secs: 20,
            user_agent: "obr-test".to_string(),
        }
    }

    fn raw_issue(id: u64, repo: &str) -> RawIssue {
        RawIssue {
            id,
            title: format!("Issue {id}"),
            html_url: format!("https://github.com/{repo}/issues/{id}"),
            repository_url: format!("https://api.github.com/repos/{repo}"),
            labels: vec![RawIssueLabel {
                name: "bounty".to_string(),
            }],
            created_at: Some(Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap()),
            updated_at: None,
        }
    }

    fn raw_bounty(id: &str, repo_owner: &str, repo_name: &str) -> RawBounty {
        RawBounty {
            id: id.to_string(),
            status: "active".to_string(),
            amount: Some(10_000),
            currency: Some("USD".to_string()),
            issue: Some(RawBountyIssue {
                title: Some(format!("Bounty {id}")),
                html_url: Some(format!(
                    "https://github.com/{repo_owner}/{repo_name}/issues/{id}"
                )),
            }),
            repo_owner: Some(repo_owner.to_string()),
            repo_name: Some(repo_name.to_string()),
            created_at: Some(Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).single().unwrap()),
        }
    }

    #[derive(Default)]
    struct FakeIssues {
        filtered: Vec<RawIssue>,
        unfiltered: Vec<RawIssue>,
        fail: bool,
        queries: Mutex<Vec<IssueQuery>>,
    }

    #[async_trait]
    impl IssueSearch for FakeIssues {
        async fn search(&self, query: &IssueQuery) -> Result<Vec<RawIssue>, SourceError> {
            self.queries.lock().unwrap().push(query.clone());
            if self.fail {
                return Err(SourceError::Status {
                    status: 500,
                    url: "https://api.github.test/search/issues".to_string(),
                });
            }
            if query.languages.is_empty() {
                Ok(self.unfiltered.clone())
            } else {
                Ok(self.filtered.clone())
            }
        }
    }

    #[derive(Default)]
    struct FakeBounties {
        bounties: Vec<RawBounty>,
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BountyPlatform for FakeBounties {
        async fn active_bounties(&self, org: &str) -> Result<Vec<RawBounty>, SourceError> {
            self.calls.lock().unwrap().push(org.to_string());
            if self.fail {
                return Err(SourceError::Status {
                    status: 503,
                    url: format!("https://console.algora.test/api/orgs/{org}/bounties"),
                });
            }
            Ok(self.bounties.clone())
        }
    }

    #[derive(Default)]
    struct FakeChat {
        sent: Mutex<Vec<String>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl Chat for FakeChat {
        async fn post_message(&self, text: &str) -> Result<(), ChatError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_at == Some(sent.len()) {
                return Err(ChatError::Rejected("channel_not_found".to_string()));
            }
            sent.push(text.to_string());
            Ok(())
        }
    }

    struct FakeProfile {
        languages: Vec<String>,
    }

    #[async_trait]
    impl ProfileLanguages for FakeProfile {
        async fn profile_languages(&self, _username: &str) -> Result<Vec<String>, SourceError> {
            Ok(self.languages.clone())
        }
    }

    async fn pipeline_with(
        config: Config,
        issues: FakeIssues,
        bounties: FakeBounties,
        chat: FakeChat,
    ) -> Pipeline {
        let store = ItemStore::open_in_memory().await.expect("store");
        Pipeline::new(
            config,
            store,
            Box::new(issues),
            Box::new(bounties),
            Box::new(chat),
            Box::new(FakeProfile {
                languages: vec!["Rust".to_string()],
            }),
        )
    }

    /// Shares a fake with the pipeline so the test keeps a handle on the
    /// recorded call history.
    struct SharedIssues(std::sync::Arc<FakeIssues>);

    #[async_trait]
    impl IssueSearch for SharedIssues {
        async fn search(&self, query: &IssueQuery) -> Result<Vec<RawIssue>, SourceError> {
            self.0.search(query).await
        }
    }

    #[tokio::test]
    async fn fallback_fires_exactly_once_when_filter_starves() {
        let issues = std::sync::Arc::new(FakeIssues {
            filtered: Vec::new(),
            unfiltered: vec![raw_issue(1, "acme/widget")],
            ..Default::default()
        });
        let store = ItemStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            test_config(),
            store,
            Box::new(SharedIssues(issues.clone())),
            Box::new(FakeBounties::default()),
            Box::new(FakeChat::default()),
            Box::new(FakeProfile { languages: vec![] }),
        );

        let report = pipeline.collect(12).await.expect("collect");
        assert!(report.fallback_used);
        assert_eq!(report.status(), RunStatus::Completed);
        assert_eq!(report.issue_search.inserted, 1);

        let queries = issues.queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert!(!queries[0].languages.is_empty());
        assert!(queries[1].languages.is_empty());
    }

    #[tokio::test]
    async fn no_fallback_when_filtered_query_has_results() {
        let issues = std::sync::Arc::new(FakeIssues {
            filtered: vec![raw_issue(2, "acme/widget")],
            unfiltered: vec![raw_issue(2, "acme/widget"), raw_issue(3, "acme/widget")],
            ..Default::default()
        });
        let store = ItemStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            test_config(),
            store,
            Box::new(SharedIssues(issues.clone())),
            Box::new(FakeBounties::default()),
            Box::new(FakeChat::default()),
            Box::new(FakeProfile { languages: vec![] }),
        );

        let report = pipeline.collect(12).await.expect("collect");
        assert!(!report.fallback_used);
        assert_eq!(issues.queries.lock().unwrap().len(), 1);
        assert_eq!(report.issue_search.inserted, 1);
    }

    #[tokio::test]
    async fn no_fallback_when_filter_disabled() {
        let issues = std::sync::Arc::new(FakeIssues::default());
        let mut config = test_config();
        config.static_languages = Vec::new();
        let store = ItemStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            config,
            store,
            Box::new(SharedIssues(issues.clone())),
            Box::new(FakeBounties::default()),
            Box::new(FakeChat::default()),
            Box::new(FakeProfile { languages: vec![] }),
        );

        pipeline.collect(12).await.expect("collect");
        assert_eq!(issues.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_failed_source_degrades_but_other_still_lands() {
        let mut config = test_config();
        config.algora_orgs = vec!["acme".to_string()];
        let pipeline = pipeline_with(
            config,
            FakeIssues {
                fail: true,
                ..Default::default()
            },
            FakeBounties {
                bounties: vec![raw_bounty("b1", "acme", "widget")],
                ..Default::default()
            },
            FakeChat::default(),
        )
        .await;

        let report = pipeline.collect(12).await.expect("collect");
        assert_eq!(report.status(), RunStatus::CompletedDegraded);
        assert_eq!(report.bounty_platform.inserted, 1);
        assert_eq!(pipeline.store().select_undelivered(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_sources_failing_is_a_failed_run() {
        let mut config = test_config();
        config.algora_orgs = vec!["acme".to_string()];
        let pipeline = pipeline_with(
            config,
            FakeIssues {
                fail: true,
                ..Default::default()
            },
            FakeBounties {
                fail: true,
                ..Default::default()
            },
            FakeChat::default(),
        )
        .await;

        let report = pipeline.collect(12).await.expect("collect");
        assert_eq!(report.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn no_orgs_configured_skips_bounty_source_entirely() {
        let pipeline = pipeline_with(
            test_config(),
            FakeIssues::default(),
            FakeBounties::default(),
            FakeChat::default(),
        )
        .await;
        let report = pipeline.collect(12).await.expect("collect");
        assert!(!report.bounty_platform.attempted);
        assert_eq!(report.status(), RunStatus::Completed);
    }

    // Config assumption: the repo allow-list restricts the bounty-platform
    // source the same way it restricts issue search.
    #[tokio::test]
    async fn allowlist_applies_to_bounty_source_too() {
        let mut config = test_config();
        config.repos = vec!["acme/widget".to_string()];
        config.algora_orgs = vec!["acme".to_string()];
        let pipeline = pipeline_with(
            config,
            FakeIssues::default(),
            FakeBounties {
                bounties: vec![
                    raw_bounty("b1", "acme", "widget"),
                    raw_bounty("b2", "other", "repo"),
                ],
                ..Default::default()
            },
            FakeChat::default(),
        )
        .await;

        let report = pipeline.collect(12).await.expect("collect");
        assert_eq!(report.bounty_platform.inserted, 1);
        assert_eq!(report.bounty_platform.skipped, 1);
        let stored = pipeline.store().select_undelivered(None, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].repo, "acme/widget");
    }

    fn item(day: u32, title: &str) -> Item {
        Item {
            source: ItemSource::IssueSearch,
            repo: "acme/widget".to_string(),
            title: title.to_string(),
            labels: vec!["bounty".to_string()],
            url: format!("https://github.com/acme/widget/issues/{day}"),
            reward: None,
            created_at: Utc.with_ymd_and_hms(2026, 8, day, 0, 0, 0).single().unwrap(),
            first_seen: Utc::now(),
            notified: false,
            notified_at: None,
        }
    }

    #[test]
    fn chunks_respect_the_length_bound() {
        let lines: Vec<String> = (0..40).map(|i| format!("line number {i:02}")).collect();
        for max in [20usize, 40, 80, 200] {
            let chunks = chunk_lines("header", &lines, max);
            for chunk in &chunks {
                assert!(
                    chunk.len() <= max || !chunk.contains('\n'),
                    "chunk of {} chars exceeds {max}",
                    chunk.len()
                );
            }
            let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split('\n')).collect();
            assert_eq!(rejoined.len(), lines.len() + 1, "header + every line survives");
        }
    }

    #[test]
    fn oversized_line_becomes_its_own_chunk_verbatim() {
        let long = "x".repeat(500);
        let lines = vec!["short".to_string(), long.clone(), "tail".to_string()];
        let chunks = chunk_lines("hdr", &lines, 50);
        assert!(chunks.contains(&long));
    }

    #[test]
    fn zero_items_yield_zero_chunks() {
        let digest = compose_digest(Vec::new(), 3500);
        assert!(digest.is_empty());
    }

    #[test]
    fn header_only_on_first_chunk() {
        let items = vec![item(1, "aaaa"), item(2, "bbbb"), item(3, "cccc")];
        let lines: Vec<String> = items.iter().map(render_line).collect();
        let header = digest_header(items.len());
        let max = header.len() + 1 + lines[0].len() + 1 + lines[1].len();
        let chunks = chunk_lines(&header, &lines, max);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with(&header));
        assert!(!chunks[1].contains(&header));
    }

    #[test]
    fn render_line_includes_reward_when_present() {
        let mut it = item(1, "Fix crash");
        assert_eq!(
            render_line(&it),
            "acme/widget — Fix crash [bounty] https://github.com/acme/widget/issues/1"
        );
        it.reward = Some(Reward {
            amount: 250.0,
            currency: "USD".to_string(),
        });
        assert!(render_line(&it).ends_with("(USD 250.00)"));
    }

    #[test]
    fn csv_rows_quote_awkward_fields() {
        let mut it = item(1, "Fix \"quoted\", tricky title");
        it.labels = vec!["bounty".to_string(), "good first issue".to_string()];
        let csv = render_csv(&[it]);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().expect("row");
        assert!(row.contains("\"Fix \"\"quoted\"\", tricky title\""));
        assert!(row.contains("bounty|good first issue"));
        assert!(row.ends_with(",,"), "absent reward leaves amount+currency empty");
    }

    #[test]
    fn export_filename_is_utc_stamped() {
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 9, 5, 0).single().unwrap();
        assert_eq!(export_filename(now), "bounty_digest_20260823_0905.csv");
    }

    #[test]
    fn clean_repos_drops_malformed_entries() {
        let raw = vec![
            "acme/widget".to_string(),
            "\"quoted/repo\"".to_string(),
            "# a comment".to_string(),
            "not-a-repo".to_string(),
            "bad/own/er".to_string(),
            "".to_string(),
        ];
        assert_eq!(clean_repos(&raw), vec!["acme/widget", "quoted/repo"]);
    }

    async fn seeded_pipeline(chat: FakeChat, max_chunk_chars: usize) -> Pipeline {
        let store = ItemStore::open_in_memory().await.expect("store");
        for day in [1u32, 2, 3] {
            let draft = ItemDraft {
                source: ItemSource::IssueSearch,
                repo: "acme/widget".to_string(),
                title: format!("item {day}"),
                labels: vec!["bounty".to_string()],
                url: format!("https://github.com/acme/widget/issues/{day}"),
                reward: None,
                created_at: Utc.with_ymd_and_hms(2026, 8, day, 0, 0, 0).single().unwrap(),
            };
            store.upsert(&draft).await.unwrap();
        }
        let mut config = test_config();
        config.max_chunk_chars = max_chunk_chars;
        Pipeline::new(
            config,
            store,
            Box::new(FakeIssues::default()),
            Box::new(FakeBounties::default()),
            Box::new(chat),
            Box::new(FakeProfile { languages: vec![] }),
        )
    }

    #[tokio::test]
    async fn three_items_two_chunks_then_nothing_left() {
        // Size the bound so the first chunk holds the header plus two lines.
        let probe = item(1, "item 1");
        let line_len = render_line(&probe).len();
        let max = digest_header(3).len() + 2 * (line_len + 1);

        let pipeline = seeded_pipeline(FakeChat::default(), max).await;
        let report = pipeline.digest(true).await.expect("digest");
        assert_eq!(report.selected, 3);
        assert_eq!(report.chunks_total, 2);
        assert_eq!(report.chunks_sent, 2);
        assert_eq!(report.marked_delivered, 3);
        assert_eq!(report.status, RunStatus::Completed);

        let again = pipeline.digest(true).await.expect("second digest");
        assert_eq!(again.selected, 0);
        assert_eq!(again.chunks_total, 0);
        assert_eq!(again.marked_delivered, 0);
    }

    #[tokio::test]
    async fn partial_failure_marks_nothing() {
        let probe = item(1, "item 1");
        let max = render_line(&probe).len() + 2;
        let pipeline = seeded_pipeline(
            FakeChat {
                fail_at: Some(1),
                ..Default::default()
            },
            max,
        )
        .await;

        let report = pipeline.digest(true).await.expect("digest");
        assert!(report.chunks_total > 1);
        assert_eq!(report.chunks_sent, 1);
        assert_eq!(report.marked_delivered, 0);
        assert_eq!(report.status, RunStatus::CompletedDegraded);
        assert_eq!(
            pipeline.store().select_undelivered(None, None).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn csv_export_is_written_even_when_delivery_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ItemStore::open_in_memory().await.expect("store");
        store
            .upsert(&ItemDraft {
                source: ItemSource::IssueSearch,
                repo: "acme/widget".to_string(),
                title: "item".to_string(),
                labels: vec![],
                url: "https://github.com/acme/widget/issues/1".to_string(),
                reward: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let mut config = test_config();
        config.write_csv = true;
        config.csv_dir = dir.path().to_path_buf();
        let pipeline = Pipeline::new(
            config,
            store,
            Box::new(FakeIssues::default()),
            Box::new(FakeBounties::default()),
            Box::new(FakeChat {
                fail_at: Some(0),
                ..Default::default()
            }),
            Box::new(FakeProfile { languages: vec![] }),
        );

        let report = pipeline.digest(true).await.expect("digest");
        assert_eq!(report.status, RunStatus::CompletedDegraded);
        assert_eq!(report.marked_delivered, 0);
        let path = report.csv_path.expect("csv written");
        let contents = std::fs::read_to_string(path).expect("read csv");
        assert!(contents.starts_with(CSV_HEADER));
        assert!(contents.contains("https://github.com/acme/widget/issues/1"));
    }

    #[tokio::test]
    async fn test_digest_sends_but_never_marks() {
        let pipeline = seeded_pipeline(FakeChat::default(), 3500).await;
        let report = pipeline.test_digest().await.expect("test digest");
        assert!(report.chunks_sent > 0);
        assert_eq!(report.marked_delivered, 0);
        // The three seeded items and the injected dummy all stay undelivered.
        assert_eq!(
            pipeline.store().select_undelivered(None, None).await.unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn refresh_languages_overwrites_cache_and_falls_back_to_static() {
        let store = ItemStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            test_config(),
            store,
            Box::new(FakeIssues::default()),
            Box::new(FakeBounties::default()),
            Box::new(FakeChat::default()),
            Box::new(FakeProfile {
                languages: vec!["Rust".to_string(), "Go".to_string()],
            }),
        );
        let langs = pipeline.refresh_languages().await.expect("refresh");
        assert_eq!(langs, vec!["Rust", "Go"]);
        let cached = pipeline.store().profile_languages().await.unwrap().unwrap();
        assert_eq!(cached.languages, vec!["Rust", "Go"]);

        // Empty profile answer falls back to the static configured list.
        let store2 = ItemStore::open_in_memory().await.expect("store");
        let pipeline2 = Pipeline::new(
            test_config(),
            store2,
            Box::new(FakeIssues::default()),
            Box::new(FakeBounties::default()),
            Box::new(FakeChat::default()),
            Box::new(FakeProfile { languages: vec![] }),
        );
        let langs = pipeline2.refresh_languages().await.expect("refresh");
        assert_eq!(langs, vec!["Rust"]);
    }

    #[test]
    fn language_filter_matches_case_insensitively_and_disabled_passes_all() {
        let filter = LanguageFilter::from_static(&["Rust".to_string()]);
        assert!(filter.matches("rust"));
        assert!(!filter.matches("Go"));
        assert!(LanguageFilter::disabled().matches("anything"));
    }
}
