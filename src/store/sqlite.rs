//! SQLite-backed implementation of the document store.
//!
//! All collections share a single `documents` table, partitioned by a
//! `collection` column. Timestamps are stored as INTEGER Unix milliseconds so
//! that lease comparisons are plain integer comparisons.
//!
//! A conditional update is issued as one statement:
//!
//! ```sql
//! UPDATE documents SET ...
//! WHERE seq = (SELECT seq FROM documents WHERE collection = ? AND <filter>
//!              ORDER BY seq LIMIT 1)
//! RETURNING ...
//! ```
//!
//! SQLite serializes writers, so the nested select and the update are
//! evaluated against the same database state and cannot interleave with
//! another writer's claim.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    types::Json,
    QueryBuilder, Sqlite, SqlitePool,
};
use tokio_stream::StreamExt;

use crate::{config::Config, error::Error, message::Message};

use super::{Collection, Filter, Update};

const COLUMNS: &str = "seq, key, payload, visible, ack, tries, deleted";

/// Most lease tokens bound into one `ack IN (...)` list. SQLite allows 32766
/// bound parameters per statement and one goes to the collection name.
const MAX_TOKENS_PER_QUERY: usize = 32_000;

/// Owns the connection pool and hands out named collection handles.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(&Config::default()).await
    }

    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::migrate(pool).await
    }

    /// A private in-memory database.
    ///
    /// Every pooled connection to `:memory:` would open its own database, so
    /// the pool is capped at one connection that is never recycled.
    pub async fn connect_in_memory() -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new().in_memory(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn collection(&self, name: impl Into<String>) -> SqliteCollection {
        SqliteCollection {
            pool: self.pool.clone(),
            name: name.into(),
        }
    }

    /// Names of all collections that currently hold at least one document.
    pub async fn list_collections(&self) -> Result<Vec<String>, Error> {
        let mut stream =
            sqlx::query_scalar("SELECT DISTINCT collection FROM documents ORDER BY collection")
                .fetch(&self.pool);

        let mut names: Vec<String> = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            names.push(res);
        }

        Ok(names)
    }
}

/// A named collection inside a [`SqliteStore`].
#[derive(Clone)]
pub struct SqliteCollection {
    pool: SqlitePool,
    name: String,
}

impl SqliteCollection {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    seq: i64,
    key: String,
    payload: Json<serde_json::Value>,
    visible: i64,
    ack: Option<String>,
    tries: i64,
    deleted: Option<i64>,
}

impl TryFrom<DocumentRow> for Message {
    type Error = Error;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Message {
            visible: from_millis(row.visible)?,
            deleted: row.deleted.map(from_millis).transpose()?,
            tries: u64::try_from(row.tries)
                .map_err(|_| Error::corrupt(format!("negative tries on {}", row.key)))?,
            key: row.key,
            payload: row.payload.0,
            ack: row.ack,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::corrupt(format!("timestamp out of range: {millis}")))
}

fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Splits oversized token lists so each statement stays under the bind limit.
fn split_filter(filter: Filter) -> Vec<Filter> {
    match filter {
        Filter::AckIn(tokens) if tokens.len() > MAX_TOKENS_PER_QUERY => tokens
            .chunks(MAX_TOKENS_PER_QUERY)
            .map(|chunk| Filter::AckIn(chunk.to_vec()))
            .collect(),
        filter => vec![filter],
    }
}

/// Appends `<filter>` as a boolean SQL expression.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("1 = 1");
        }
        Filter::Key(key) => {
            qb.push("key = ").push_bind(key.clone());
        }
        Filter::Claimable { now } => {
            qb.push("deleted IS NULL AND visible <= ")
                .push_bind(to_millis(now));
        }
        Filter::InFlight { now } => {
            qb.push("deleted IS NULL AND ack IS NOT NULL AND visible > ")
                .push_bind(to_millis(now));
        }
        Filter::Done => {
            qb.push("deleted IS NOT NULL");
        }
        Filter::Lease { ack, now } => {
            qb.push("deleted IS NULL AND ack = ")
                .push_bind(ack.clone())
                .push(" AND visible > ")
                .push_bind(to_millis(now));
        }
        Filter::AckIn(tokens) if tokens.is_empty() => {
            qb.push("0 = 1");
        }
        Filter::AckIn(tokens) => {
            qb.push("deleted IS NULL AND ack IN (");
            let mut separated = qb.separated(", ");
            for token in tokens {
                separated.push_bind(token.clone());
            }
            separated.push_unseparated(")");
        }
    }
}

fn push_update(qb: &mut QueryBuilder<'_, Sqlite>, update: &Update) {
    match update {
        Update::Claim { ack, visible } => {
            qb.push("tries = tries + 1, ack = ")
                .push_bind(ack.clone())
                .push(", visible = ")
                .push_bind(to_millis(visible));
        }
        Update::Extend { visible } => {
            qb.push("visible = ").push_bind(to_millis(visible));
        }
        Update::Finalize { deleted } => {
            qb.push("deleted = ").push_bind(to_millis(deleted));
        }
    }
}

impl SqliteCollection {
    /// Appends ` WHERE collection = ? AND (<filter>)`.
    fn push_scope(&self, qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
        qb.push(" WHERE collection = ")
            .push_bind(self.name.clone())
            .push(" AND (");
        push_filter(qb, filter);
        qb.push(")");
    }
}

impl Collection for SqliteCollection {
    fn update_if_match(
        &self,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'_, Result<Option<Message>, Error>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::new("UPDATE documents SET ");
            push_update(&mut qb, &update);
            qb.push(" WHERE seq = (SELECT seq FROM documents");
            self.push_scope(&mut qb, &filter);
            qb.push(" ORDER BY seq LIMIT 1) RETURNING ").push(COLUMNS);

            let row: Option<DocumentRow> = qb.build_query_as().fetch_optional(&self.pool).await?;

            row.map(Message::try_from).transpose()
        })
    }

    fn insert_if_absent(&self, message: Message) -> BoxFuture<'_, Result<bool, Error>> {
        Box::pin(async move {
            let result = sqlx::query(
                "
                INSERT INTO documents (collection, key, payload, visible, ack, tries, deleted)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (collection, key) DO NOTHING
                ",
            )
            .bind(&self.name)
            .bind(&message.key)
            .bind(Json(&message.payload))
            .bind(to_millis(&message.visible))
            .bind(&message.ack)
            .bind(message.tries as i64)
            .bind(message.deleted.as_ref().map(to_millis))
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn find(&self, filter: Filter) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        Box::pin(async move {
            let mut rows: Vec<DocumentRow> = Vec::new();

            for filter in split_filter(filter) {
                let mut qb = QueryBuilder::new("SELECT ");
                qb.push(COLUMNS).push(" FROM documents");
                self.push_scope(&mut qb, &filter);
                qb.push(" ORDER BY seq");

                let mut stream = qb.build_query_as::<DocumentRow>().fetch(&self.pool);

                while let Some(row) = stream.next().await.transpose()? {
                    rows.push(row);
                }
            }

            // Chunks are each ordered; restore insertion order across them.
            rows.sort_by_key(|row| row.seq);

            rows.into_iter().map(Message::try_from).collect()
        })
    }

    fn count(&self, filter: Filter) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move {
            let mut total = 0;

            for filter in split_filter(filter) {
                let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM documents");
                self.push_scope(&mut qb, &filter);

                let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
                total += count as u64;
            }

            Ok(total)
        })
    }

    fn delete_many(&self, filter: Filter) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move {
            let mut removed = 0;

            for filter in split_filter(filter) {
                let mut qb = QueryBuilder::new("DELETE FROM documents");
                self.push_scope(&mut qb, &filter);

                removed += qb.build().execute(&self.pool).await?.rows_affected();
            }

            Ok(removed)
        })
    }
}
