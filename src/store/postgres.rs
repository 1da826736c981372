// src/store/postgres.rs
// Postgres implementation of the storage seam.
//
// Inserts that can lose a cross-process race run inside savepoints so a
// unique-constraint violation never poisons the enclosing entry
// transaction. Advisory locks use pg_advisory_xact_lock and release with
// the transaction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Postgres, Row, Transaction};
use tracing::info;

use super::{
    ArticleRow, ArticleTickerRow, ArticleUpdate, CatalogCounts, EntryTx, IngestionRunRow,
    NewArticle, NewRawFeedItem, RunStatus, SourceRow, Store, StoreError, TickerRecord,
};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;

        info!(target: "store", "connected to postgres and applied migrations");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::UniqueViolation;
        }
    }
    StoreError::Database(e)
}

fn map_article(row: &PgRow) -> Result<ArticleRow, sqlx::Error> {
    Ok(ArticleRow {
        id: row.try_get("id")?,
        canonical_url: row.try_get("canonical_url")?,
        canonical_url_hash: row.try_get("canonical_url_hash")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        published_at: row.try_get("published_at")?,
        source_name: row.try_get("source_name")?,
        provider_name: row.try_get("provider_name")?,
        content_hash: row.try_get("content_hash")?,
        title_normalized_hash: row.try_get("title_normalized_hash")?,
        cluster_key: row.try_get("cluster_key")?,
    })
}

fn map_association(row: &PgRow) -> Result<ArticleTickerRow, sqlx::Error> {
    Ok(ArticleTickerRow {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        ticker_id: row.try_get("ticker_id")?,
        match_type: row.try_get("match_type")?,
        confidence: row.try_get("confidence")?,
    })
}

fn map_run(row: &PgRow) -> Result<IngestionRunRow, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(IngestionRunRow {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        feed_url: row.try_get("feed_url")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        items_seen: row.try_get("items_seen")?,
        items_inserted: row.try_get("items_inserted")?,
        error_text: row.try_get("error_text")?,
    })
}

const ARTICLE_COLUMNS: &str = "id, canonical_url, canonical_url_hash, title, summary, \
     published_at, source_name, provider_name, content_hash, title_normalized_hash, cluster_key";

pub struct PgEntryTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EntryTx for PgEntryTx {
    async fn lock_identity(&mut self, keys: &[i64]) -> Result<(), StoreError> {
        for key in keys {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(key)
                .execute(&mut *self.tx)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn article_by_url_hash(
        &mut self,
        url_hash: &str,
    ) -> Result<Option<ArticleRow>, StoreError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE canonical_url_hash = $1");
        let row = sqlx::query(&sql)
            .bind(url_hash)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)?;
        row.as_ref().map(map_article).transpose().map_err(map_err)
    }

    async fn article_by_title_window(
        &mut self,
        title_hash: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<ArticleRow>, StoreError> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles \
             WHERE title_normalized_hash = $1 AND published_at >= $2 AND published_at <= $3 \
             ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(title_hash)
            .bind(from)
            .bind(to)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)?;
        row.as_ref().map(map_article).transpose().map_err(map_err)
    }

    async fn insert_article(&mut self, article: &NewArticle) -> Result<ArticleRow, StoreError> {
        // Savepoint: a concurrent insert of the same URL must not abort the
        // entry transaction.
        let mut sp = self.tx.begin().await.map_err(map_err)?;
        let sql = format!(
            "INSERT INTO articles (canonical_url, canonical_url_hash, title, summary, \
             published_at, source_name, provider_name, content_hash, title_normalized_hash, \
             cluster_key) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {ARTICLE_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(&article.canonical_url)
            .bind(&article.canonical_url_hash)
            .bind(&article.title)
            .bind(&article.summary)
            .bind(article.published_at)
            .bind(&article.source_name)
            .bind(&article.provider_name)
            .bind(&article.content_hash)
            .bind(&article.title_normalized_hash)
            .bind(&article.cluster_key)
            .fetch_one(&mut *sp)
            .await;

        match inserted {
            Ok(row) => {
                sp.commit().await.map_err(map_err)?;
                map_article(&row).map_err(map_err)
            }
            Err(e) => {
                sp.rollback().await.map_err(map_err)?;
                Err(map_err(e))
            }
        }
    }

    async fn update_article(
        &mut self,
        id: i64,
        update: &ArticleUpdate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE articles SET title = $2, summary = $3, published_at = $4, \
             source_name = $5, provider_name = $6, content_hash = $7, cluster_key = $8, \
             updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(&update.title)
        .bind(&update.summary)
        .bind(update.published_at)
        .bind(&update.source_name)
        .bind(&update.provider_name)
        .bind(&update.content_hash)
        .bind(&update.cluster_key)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn associations_for(
        &mut self,
        article_id: i64,
    ) -> Result<Vec<ArticleTickerRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, article_id, ticker_id, match_type, confidence \
             FROM article_tickers WHERE article_id = $1",
        )
        .bind(article_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        rows.iter()
            .map(|row| map_association(row).map_err(map_err))
            .collect()
    }

    async fn association_for(
        &mut self,
        article_id: i64,
        ticker_id: i64,
    ) -> Result<Option<ArticleTickerRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, article_id, ticker_id, match_type, confidence \
             FROM article_tickers WHERE article_id = $1 AND ticker_id = $2",
        )
        .bind(article_id)
        .bind(ticker_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.as_ref()
            .map(map_association)
            .transpose()
            .map_err(map_err)
    }

    async fn insert_association(
        &mut self,
        article_id: i64,
        ticker_id: i64,
        match_type: &str,
        confidence: f64,
    ) -> Result<ArticleTickerRow, StoreError> {
        let mut sp = self.tx.begin().await.map_err(map_err)?;
        let inserted = sqlx::query(
            "INSERT INTO article_tickers (article_id, ticker_id, match_type, confidence) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, article_id, ticker_id, match_type, confidence",
        )
        .bind(article_id)
        .bind(ticker_id)
        .bind(match_type)
        .bind(confidence)
        .fetch_one(&mut *sp)
        .await;

        match inserted {
            Ok(row) => {
                sp.commit().await.map_err(map_err)?;
                map_association(&row).map_err(map_err)
            }
            Err(e) => {
                sp.rollback().await.map_err(map_err)?;
                Err(map_err(e))
            }
        }
    }

    async fn update_association(
        &mut self,
        id: i64,
        match_type: &str,
        confidence: f64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE article_tickers SET match_type = $2, confidence = $3 WHERE id = $1")
            .bind(id)
            .bind(match_type)
            .bind(confidence)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete_association(&mut self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM article_tickers WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn insert_raw_item(&mut self, item: &NewRawFeedItem) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO raw_feed_items (source_id, article_id, feed_url, raw_guid, \
             raw_title, raw_link, raw_pub_date, raw_payload_json) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(item.source_id)
        .bind(item.article_id)
        .bind(&item.feed_url)
        .bind(&item.raw_guid)
        .bind(&item.raw_title)
        .bind(&item.raw_link)
        .bind(item.raw_pub_date)
        .bind(&item.raw_payload)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_err)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin_entry(&self) -> Result<Box<dyn EntryTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_err)?;
        Ok(Box::new(PgEntryTx { tx }))
    }

    async fn health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn upsert_source(
        &self,
        code: &str,
        name: &str,
        base_url: &str,
    ) -> Result<SourceRow, StoreError> {
        let row = sqlx::query(
            "INSERT INTO sources (code, name, base_url, enabled) VALUES ($1, $2, $3, TRUE) \
             ON CONFLICT (code) DO UPDATE SET name = $2, base_url = $3, enabled = TRUE \
             RETURNING id, code, name, base_url, enabled",
        )
        .bind(code)
        .bind(name)
        .bind(base_url)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(SourceRow {
            id: row.try_get("id").map_err(map_err)?,
            code: row.try_get("code").map_err(map_err)?,
            name: row.try_get("name").map_err(map_err)?,
            base_url: row.try_get("base_url").map_err(map_err)?,
            enabled: row.try_get("enabled").map_err(map_err)?,
        })
    }

    async fn sync_tickers(&self, records: &[TickerRecord]) -> Result<CatalogCounts, StoreError> {
        let mut counts = CatalogCounts {
            loaded: records.len(),
            ..CatalogCounts::default()
        };
        if records.is_empty() {
            return Ok(counts);
        }

        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let symbols: Vec<String> = records.iter().map(|r| r.symbol.clone()).collect();
        let rows = sqlx::query(
            "SELECT symbol, fund_name, sponsor, active FROM tickers WHERE symbol = ANY($1)",
        )
        .bind(&symbols)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        let mut existing: HashMap<String, (Option<String>, Option<String>, bool)> =
            HashMap::new();
        for row in &rows {
            let symbol: String = row.try_get("symbol").map_err(map_err)?;
            existing.insert(
                symbol,
                (
                    row.try_get("fund_name").map_err(map_err)?,
                    row.try_get("sponsor").map_err(map_err)?,
                    row.try_get("active").map_err(map_err)?,
                ),
            );
        }

        for record in records {
            match existing.get(&record.symbol) {
                None => {
                    sqlx::query(
                        "INSERT INTO tickers (symbol, fund_name, sponsor, active) \
                         VALUES ($1, $2, $3, $4) ON CONFLICT (symbol) DO NOTHING",
                    )
                    .bind(&record.symbol)
                    .bind(&record.fund_name)
                    .bind(&record.sponsor)
                    .bind(record.active)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err)?;
                    // Duplicates inside one snapshot reuse the first row.
                    existing.insert(
                        record.symbol.clone(),
                        (record.fund_name.clone(), record.sponsor.clone(), record.active),
                    );
                    counts.created += 1;
                }
                Some((fund_name, sponsor, active))
                    if fund_name == &record.fund_name
                        && sponsor == &record.sponsor
                        && *active == record.active =>
                {
                    counts.unchanged += 1;
                }
                Some(_) => {
                    sqlx::query(
                        "UPDATE tickers SET fund_name = $2, sponsor = $3, active = $4, \
                         updated_at = now() WHERE symbol = $1",
                    )
                    .bind(&record.symbol)
                    .bind(&record.fund_name)
                    .bind(&record.sponsor)
                    .bind(record.active)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err)?;
                    existing.insert(
                        record.symbol.clone(),
                        (record.fund_name.clone(), record.sponsor.clone(), record.active),
                    );
                    counts.updated += 1;
                }
            }
        }

        tx.commit().await.map_err(map_err)?;
        Ok(counts)
    }

    async fn active_symbols(&self) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query("SELECT id, symbol FROM tickers WHERE active")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        let mut mapping = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(map_err)?;
            let symbol: String = row.try_get("symbol").map_err(map_err)?;
            mapping.insert(symbol.to_uppercase(), id);
        }
        Ok(mapping)
    }

    async fn article_exists_by_url_hash(&self, url_hash: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM articles WHERE canonical_url_hash = $1")
            .bind(url_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.is_some())
    }

    async fn create_run(
        &self,
        source_id: i64,
        feed_url: &str,
    ) -> Result<IngestionRunRow, StoreError> {
        let row = sqlx::query(
            "INSERT INTO ingestion_runs (source_id, feed_url, status) \
             VALUES ($1, $2, 'running') \
             RETURNING id, source_id, feed_url, started_at, finished_at, status, \
             items_seen, items_inserted, error_text",
        )
        .bind(source_id)
        .bind(feed_url)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        map_run(&row).map_err(map_err)
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        items_seen: i64,
        items_inserted: i64,
        error_text: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ingestion_runs SET status = $2, items_seen = $3, items_inserted = $4, \
             error_text = $5, finished_at = now() WHERE id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(items_seen)
        .bind(items_inserted)
        .bind(error_text)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn recent_runs(
        &self,
        limit: i64,
    ) -> Result<Vec<(IngestionRunRow, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT r.id, r.source_id, r.feed_url, r.started_at, r.finished_at, r.status, \
             r.items_seen, r.items_inserted, r.error_text, s.code AS source_code \
             FROM ingestion_runs r JOIN sources s ON s.id = r.source_id \
             ORDER BY r.started_at DESC, r.id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let run = map_run(row).map_err(map_err)?;
            let code: String = row.try_get("source_code").map_err(map_err)?;
            out.push((run, code));
        }
        Ok(out)
    }

    async fn recent_articles_by_provider(
        &self,
        provider_name: &str,
        only_unmapped: bool,
        limit: i64,
    ) -> Result<Vec<ArticleRow>, StoreError> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a WHERE a.provider_name = $1 \
             AND ($2 = FALSE OR NOT EXISTS \
                 (SELECT 1 FROM article_tickers t WHERE t.article_id = a.id)) \
             ORDER BY a.published_at DESC, a.id DESC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(provider_name)
            .bind(only_unmapped)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter()
            .map(|row| map_article(row).map_err(map_err))
            .collect()
    }
}
