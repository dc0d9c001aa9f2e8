use super::model::QueueCounts;
use crate::error::{Error, Result};
use crate::model::{
    ActionKind, ActionStatus, Article, Bookmark, CachedArticle, PendingAction, StorageStats,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Open the pool and bring the schema up to date.
pub async fn open(database_url: &str) -> Result<Pool> {
    let pool = init_pool(database_url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn article_from_row(row: &SqliteRow) -> Result<Article> {
    let payload: String = row.try_get("payload")?;
    Ok(serde_json::from_str(&payload)?)
}

// --- bookmarks -------------------------------------------------------------

/// Insert or refresh a bookmark. Re-bookmarking a URL overwrites its payload and
/// `bookmarked_at`.
#[instrument(skip_all, fields(url = %article.url))]
pub async fn put_bookmark(pool: &Pool, article: &Article) -> Result<Bookmark> {
    let mut tx = pool.begin().await?;
    let bookmark = put_bookmark_tx(&mut tx, article).await?;
    tx.commit().await?;
    Ok(bookmark)
}

/// Bookmark `article` and queue its replay in one transaction, so the local
/// change never exists without its pending action.
#[instrument(skip_all, fields(url = %article.url))]
pub async fn put_bookmark_with_intent(
    pool: &Pool,
    article: &Article,
    payload: &Value,
) -> Result<(Bookmark, PendingAction)> {
    let mut tx = pool.begin().await?;
    let bookmark = put_bookmark_tx(&mut tx, article).await?;
    let action = enqueue_pending_action_tx(&mut tx, ActionKind::AddBookmark, payload).await?;
    tx.commit().await?;
    Ok((bookmark, action))
}

async fn put_bookmark_tx(tx: &mut Transaction<'_, Sqlite>, article: &Article) -> Result<Bookmark> {
    let bookmark = Bookmark {
        article: article.clone(),
        bookmarked_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO bookmarks (url, payload, bookmarked_at) VALUES (?, ?, ?) \
         ON CONFLICT(url) DO UPDATE SET payload = excluded.payload, bookmarked_at = excluded.bookmarked_at",
    )
    .bind(&article.url)
    .bind(serde_json::to_string(article)?)
    .bind(bookmark.bookmarked_at)
    .execute(&mut **tx)
    .await?;
    Ok(bookmark)
}

/// Returns whether a row was removed; a missing URL is not an error.
#[instrument(skip_all, fields(url = %url))]
pub async fn remove_bookmark(pool: &Pool, url: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let removed = remove_bookmark_tx(&mut tx, url).await?;
    tx.commit().await?;
    Ok(removed)
}

/// Remove the bookmark and queue its replay in one transaction. A URL that was
/// not bookmarked changes nothing and queues nothing.
#[instrument(skip_all, fields(url = %url))]
pub async fn remove_bookmark_with_intent(
    pool: &Pool,
    url: &str,
    payload: &Value,
) -> Result<Option<PendingAction>> {
    let mut tx = pool.begin().await?;
    if !remove_bookmark_tx(&mut tx, url).await? {
        return Ok(None);
    }
    let action = enqueue_pending_action_tx(&mut tx, ActionKind::RemoveBookmark, payload).await?;
    tx.commit().await?;
    Ok(Some(action))
}

async fn remove_bookmark_tx(tx: &mut Transaction<'_, Sqlite>, url: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM bookmarks WHERE url = ?")
        .bind(url)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn is_bookmarked(pool: &Pool, url: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM bookmarks WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

pub async fn get_bookmark(pool: &Pool, url: &str) -> Result<Option<Bookmark>> {
    let row = sqlx::query("SELECT payload, bookmarked_at FROM bookmarks WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await?;
    row.map(|row| bookmark_from_row(&row)).transpose()
}

/// All bookmarks, most recently bookmarked first.
pub async fn get_bookmarks(pool: &Pool) -> Result<Vec<Bookmark>> {
    let rows = sqlx::query(
        "SELECT payload, bookmarked_at FROM bookmarks ORDER BY bookmarked_at DESC, rowid DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(bookmark_from_row).collect()
}

fn bookmark_from_row(row: &SqliteRow) -> Result<Bookmark> {
    Ok(Bookmark {
        article: article_from_row(row)?,
        bookmarked_at: row.try_get("bookmarked_at")?,
    })
}

// --- cached articles -------------------------------------------------------

#[instrument(skip_all, fields(url = %article.url))]
pub async fn cache_article(pool: &Pool, article: &Article) -> Result<CachedArticle> {
    let cached = CachedArticle {
        article: article.clone(),
        cached_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO cached_articles (url, payload, cached_at) VALUES (?, ?, ?) \
         ON CONFLICT(url) DO UPDATE SET payload = excluded.payload, cached_at = excluded.cached_at",
    )
    .bind(&article.url)
    .bind(serde_json::to_string(article)?)
    .bind(cached.cached_at)
    .execute(pool)
    .await?;
    Ok(cached)
}

pub async fn get_cached_article(pool: &Pool, url: &str) -> Result<Option<CachedArticle>> {
    let row = sqlx::query("SELECT payload, cached_at FROM cached_articles WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await?;
    row.map(|row| cached_article_from_row(&row)).transpose()
}

pub async fn get_cached_articles(pool: &Pool) -> Result<Vec<CachedArticle>> {
    let rows = sqlx::query("SELECT payload, cached_at FROM cached_articles ORDER BY rowid ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(cached_article_from_row).collect()
}

/// The most recently cached articles, newest first.
pub async fn recent_cached_articles(pool: &Pool, limit: u32) -> Result<Vec<CachedArticle>> {
    let rows = sqlx::query(
        "SELECT payload, cached_at FROM cached_articles ORDER BY cached_at DESC, rowid DESC LIMIT ?",
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(cached_article_from_row).collect()
}

/// Empty the cached-article collection in one transaction. Bookmarks are untouched.
#[instrument(skip_all)]
pub async fn clear_article_cache(pool: &Pool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query("DELETE FROM cached_articles")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

fn cached_article_from_row(row: &SqliteRow) -> Result<CachedArticle> {
    Ok(CachedArticle {
        article: article_from_row(row)?,
        cached_at: row.try_get("cached_at")?,
    })
}

// --- pending actions -------------------------------------------------------

/// Append an action with status `pending`. The returned `id` is its FIFO position.
#[instrument(skip_all, fields(kind = kind.as_str()))]
pub async fn enqueue_pending_action(
    pool: &Pool,
    kind: ActionKind,
    payload: &Value,
) -> Result<PendingAction> {
    let mut tx = pool.begin().await?;
    let action = enqueue_pending_action_tx(&mut tx, kind, payload).await?;
    tx.commit().await?;
    Ok(action)
}

async fn enqueue_pending_action_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: ActionKind,
    payload: &Value,
) -> Result<PendingAction> {
    let action_id = Uuid::new_v4();
    let enqueued_at = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO pending_actions (action_id, kind, payload, status, attempt, enqueued_at) \
         VALUES (?, ?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(action_id.to_string())
    .bind(kind.as_str())
    .bind(serde_json::to_string(payload)?)
    .bind(ActionStatus::Pending.as_str())
    .bind(enqueued_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(PendingAction {
        id: rec.try_get("id")?,
        action_id,
        kind,
        payload: payload.clone(),
        status: ActionStatus::Pending,
        attempt: 0,
        last_error: None,
        enqueued_at,
    })
}

/// Every queued action (pending and failed) in insertion order.
pub async fn list_pending_actions(pool: &Pool) -> Result<Vec<PendingAction>> {
    let rows = sqlx::query(
        "SELECT id, action_id, kind, payload, status, attempt, last_error, enqueued_at \
         FROM pending_actions ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(pending_action_from_row).collect()
}

pub async fn count_pending_actions(pool: &Pool) -> Result<QueueCounts> {
    let row = sqlx::query(
        "SELECT \
            COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending, \
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed \
         FROM pending_actions",
    )
    .fetch_one(pool)
    .await?;
    Ok(QueueCounts {
        pending: row.try_get("pending")?,
        failed: row.try_get("failed")?,
    })
}

#[instrument(skip_all)]
pub async fn delete_pending_action(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM pending_actions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_action_failed(pool: &Pool, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        "UPDATE pending_actions SET status = ?, attempt = attempt + 1, last_error = ? WHERE id = ?",
    )
    .bind(ActionStatus::Failed.as_str())
    .bind(reason)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn clear_pending_actions(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("DELETE FROM pending_actions")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

fn pending_action_from_row(row: &SqliteRow) -> Result<PendingAction> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let action_id: String = row.try_get("action_id")?;
    let payload: String = row.try_get("payload")?;
    Ok(PendingAction {
        id,
        action_id: Uuid::parse_str(&action_id).map_err(|err| {
            Error::StorageUnavailable(format!("pending action {id} has bad action_id: {err}"))
        })?,
        kind: ActionKind::parse_kind(&kind).ok_or_else(|| {
            Error::StorageUnavailable(format!("pending action {id} has unknown kind {kind}"))
        })?,
        payload: serde_json::from_str(&payload)?,
        status: ActionStatus::parse_status(&status).ok_or_else(|| {
            Error::StorageUnavailable(format!("pending action {id} has unknown status {status}"))
        })?,
        attempt: row.try_get("attempt")?,
        last_error: row.try_get("last_error")?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}

// --- sync bookkeeping ------------------------------------------------------

pub async fn last_synced_at(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT last_synced_at FROM sync_state WHERE id = 1")
            .fetch_optional(pool)
            .await?
            .flatten();
    Ok(at)
}

#[instrument(skip_all)]
pub async fn record_sync(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (id, last_synced_at, updated_at) VALUES (1, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(id) DO UPDATE SET last_synced_at = excluded.last_synced_at, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

// --- statistics ------------------------------------------------------------

/// Counts plus the serialized size of every bookmark and cached article.
#[instrument(skip_all)]
pub async fn compute_storage_stats(pool: &Pool) -> Result<StorageStats> {
    let bookmarks = get_bookmarks(pool).await?;
    let articles = get_cached_articles(pool).await?;

    let mut estimated_size = 0u64;
    for bookmark in &bookmarks {
        estimated_size += serde_json::to_vec(bookmark)?.len() as u64;
    }
    for article in &articles {
        estimated_size += serde_json::to_vec(article)?.len() as u64;
    }

    Ok(StorageStats {
        bookmarks: bookmarks.len() as u64,
        articles: articles.len() as u64,
        estimated_size,
    })
}
