//! Durable item store + language profile cache on SQLite.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use obr_core::{Item, ItemDraft, ItemSource, Reward};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "obr-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("encoding labels: {0}")]
    Labels(#[from] serde_json::Error),
    #[error("refusing to store item with empty url")]
    EmptyUrl,
    #[error("unknown item source {0:?} in store")]
    UnknownSource(String),
    #[error("invalid cached timestamp {0:?}")]
    BadCachedTimestamp(String),
}

/// What a call to [`ItemStore::upsert`] did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Row existed; descriptive fields were refreshed.
    Updated,
    Unchanged,
}

/// Cached profile-language set; written only by an explicit refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageProfile {
    pub languages: Vec<String>,
    pub refreshed_at: DateTime<Utc>,
}

const META_PROFILE_LANGUAGES: &str = "profile_languages";
const META_PROFILE_REFRESHED_AT: &str = "profile_languages_refreshed_at";

#[derive(Debug, Clone)]
pub struct ItemStore {
    pool: Pool<Sqlite>,
}

impl ItemStore {
    /// Open (creating if missing) the store at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Sqlx(sqlx::Error::Io(e))
                })?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Overlapping scheduled invocations share this file; wait out
            // the other writer instead of failing with "database is locked".
            .busy_timeout(Duration::from_secs(5));

        Self::connect(opts).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<Self, StoreError> {
        // A single connection keeps upsert and mark_delivered serializable.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS items (
                url TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                repo TEXT NOT NULL,
                title TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '[]',
                amount REAL,
                currency TEXT,
                created_at TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                notified INTEGER NOT NULL DEFAULT 0,
                notified_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_created_at ON items(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_notified ON items(notified)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS meta (k TEXT PRIMARY KEY, v TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or refresh a discovered item, keyed by url.
    ///
    /// A fresh row starts undelivered with `first_seen` stamped now. An
    /// existing row only has its descriptive fields (title, labels, reward)
    /// refreshed; `first_seen`, `notified` and `notified_at` are never
    /// touched here, so repeated polling is idempotent and a delivered item
    /// can never regress to undelivered through this path.
    pub async fn upsert(&self, draft: &ItemDraft) -> Result<UpsertOutcome, StoreError> {
        if draft.url.trim().is_empty() {
            return Err(StoreError::EmptyUrl);
        }
        let labels_json = serde_json::to_string(&draft.labels)?;
        let (amount, currency) = match &draft.reward {
            Some(reward) => (Some(reward.amount), Some(reward.currency.clone())),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await?;
        let existing =
            sqlx::query("SELECT title, labels, amount, currency FROM items WHERE url = ?1")
                .bind(&draft.url)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO items
                     (url, source, repo, title, labels, amount, currency,
                      created_at, first_seen, notified, notified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL)",
                )
                .bind(&draft.url)
                .bind(draft.source.as_str())
                .bind(&draft.repo)
                .bind(&draft.title)
                .bind(&labels_json)
                .bind(amount)
                .bind(currency.as_deref())
                .bind(draft.created_at)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(row) => {
                let same = row.try_get::<String, _>("title")? == draft.title
                    && row.try_get::<String, _>("labels")? == labels_json
                    && row.try_get::<Option<f64>, _>("amount")? == amount
                    && row.try_get::<Option<String>, _>("currency")? == currency;
                if same {
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        "UPDATE items SET title = ?2, labels = ?3, amount = ?4, currency = ?5
                         WHERE url = ?1",
                    )
                    .bind(&draft.url)
                    .bind(&draft.title)
                    .bind(&labels_json)
                    .bind(amount)
                    .bind(currency.as_deref())
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Undelivered items ordered oldest-first, optionally capped and
    /// restricted to a repo allow-list.
    pub async fn select_undelivered(
        &self,
        limit: Option<i64>,
        repo_allowlist: Option<&[String]>,
    ) -> Result<Vec<Item>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT url, source, repo, title, labels, amount, currency,
                    created_at, first_seen, notified, notified_at
             FROM items WHERE notified = 0",
        );
        if let Some(repos) = repo_allowlist {
            if !repos.is_empty() {
                qb.push(" AND repo IN (");
                let mut sep = qb.separated(", ");
                for repo in repos {
                    sep.push_bind(repo);
                }
                qb.push(")");
            }
        }
        qb.push(" ORDER BY created_at ASC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    /// Flip the given urls to delivered. Idempotent: urls already delivered
    /// (or unknown) are no-ops and do not count.
    pub async fn mark_delivered(&self, urls: &[String]) -> Result<u64, StoreError> {
        if urls.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE items SET notified = 1, notified_at = ");
        qb.push_bind(Utc::now());
        qb.push(" WHERE notified = 0 AND url IN (");
        let mut sep = qb.separated(", ");
        for url in urls {
            sep.push_bind(url);
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
        debug!(updated = result.rows_affected(), "marked items delivered");
        Ok(result.rows_affected())
    }

    /// Deliberate resend path: flip recently handled rows back to
    /// undelivered. A row qualifies when its `first_seen` or `notified_at`
    /// falls within the last `cutoff_minutes`.
    pub async fn reset_notified_since(&self, cutoff_minutes: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(cutoff_minutes.max(0));
        let result = sqlx::query(
            "UPDATE items SET notified = 0, notified_at = NULL
             WHERE notified = 1
               AND (first_seen >= ?1 OR (notified_at IS NOT NULL AND notified_at >= ?1))",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Read the cached profile-language set, if one was ever refreshed.
    pub async fn profile_languages(&self) -> Result<Option<LanguageProfile>, StoreError> {
        let languages = match self.meta_get(META_PROFILE_LANGUAGES).await? {
            Some(json) => serde_json::from_str::<Vec<String>>(&json)?,
            None => return Ok(None),
        };
        let refreshed_at = match self.meta_get(META_PROFILE_REFRESHED_AT).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|_| StoreError::BadCachedTimestamp(raw))?
                .with_timezone(&Utc),
            None => return Ok(None),
        };
        Ok(Some(LanguageProfile {
            languages,
            refreshed_at,
        }))
    }

    /// Overwrite (not merge) the cached profile-language set.
    pub async fn set_profile_languages(
        &self,
        languages: &[String],
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.meta_set(META_PROFILE_LANGUAGES, &serde_json::to_string(languages)?)
            .await?;
        self.meta_set(META_PROFILE_REFRESHED_AT, &refreshed_at.to_rfc3339())
            .await
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT v FROM meta WHERE k = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<String, _>("v"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn meta_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO meta (k, v) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_item(row: &SqliteRow) -> Result<Item, StoreError> {
    let source_raw: String = row.try_get("source")?;
    let source = ItemSource::parse(&source_raw).ok_or(StoreError::UnknownSource(source_raw))?;
    let labels_json: String = row.try_get("labels")?;
    let labels: Vec<String> = serde_json::from_str(&labels_json)?;
    let amount: Option<f64> = row.try_get("amount")?;
    let currency: Option<String> = row.try_get("currency")?;
    let reward = match (amount, currency) {
        (Some(amount), Some(currency)) => Some(Reward { amount, currency }),
        _ => None,
    };
    Ok(Item {
        source,
        repo: row.try_get("repo")?,
        title: row.try_get("title")?,
        labels,
        url: row.try_get("url")?,
        reward,
        created_at: row.try_get("created_at")?,
        first_seen: row.try_get("first_seen")?,
        notified: row.try_get::<i64, _>("notified")? != 0,
        notified_at: row.try_get("notified_at")?,
    })
}
