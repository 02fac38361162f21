use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    QueryBuilder, Sqlite, SqlitePool,
};
use thiserror::Error;

use hooksink_core::types::{CapturedRequest, Listener, StringMap};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
// Stays well below SQLite's bound-parameter limit.
const DELETE_CHUNK: usize = 500;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Same as [`connect`](Self::connect) with an explicit pool size.
    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        // Options are applied on every pooled connection, so cascades hold
        // regardless of which connection runs the delete.
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Options)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for listener identities.
    pub fn listeners(&self) -> ListenerRepository {
        ListenerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for captured requests.
    pub fn requests(&self) -> RequestRepository {
        RequestRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection; later queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid database url: {0}")]
    Options(sqlx::Error),
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `listeners` table.
#[derive(Clone)]
pub struct ListenerRepository {
    pool: SqlitePool,
}

impl ListenerRepository {
    pub async fn create(&self, listener: &Listener) -> Result<(), ListenerError> {
        sqlx::query("INSERT INTO listeners (id, name, api_key, created_at) VALUES (?, ?, ?, ?)")
            .bind(&listener.id)
            .bind(&listener.name)
            .bind(&listener.api_key)
            .bind(to_rfc3339(listener.created_at))
            .execute(&self.pool)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("2067") => {
                    ListenerError::DuplicateApiKey
                }
                other => ListenerError::Database(other),
            })?;
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<Listener>, ListenerError> {
        let row = sqlx::query_as::<_, ListenerRow>(
            "SELECT id, name, api_key, created_at FROM listeners WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ListenerRow::into_domain))
    }

    pub async fn find_with_count(&self, id: &str) -> Result<Option<ListenerWithCount>, ListenerError> {
        let row = sqlx::query_as::<_, ListenerCountRow>(
            r#"
SELECT l.id,
       l.name,
       l.api_key,
       l.created_at,
       (SELECT COUNT(*) FROM captured_requests AS r WHERE r.listener_id = l.id) AS request_count
  FROM listeners AS l
 WHERE l.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ListenerCountRow::into_domain))
    }

    /// Lists every listener, newest first, with its stored request count.
    pub async fn list_with_counts(&self) -> Result<Vec<ListenerWithCount>, ListenerError> {
        let rows = sqlx::query_as::<_, ListenerCountRow>(
            r#"
SELECT l.id,
       l.name,
       l.api_key,
       l.created_at,
       (SELECT COUNT(*) FROM captured_requests AS r WHERE r.listener_id = l.id) AS request_count
  FROM listeners AS l
 ORDER BY l.created_at DESC, l.rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ListenerCountRow::into_domain).collect())
    }

    /// Deletes the listener and, through the foreign key, all of its requests.
    pub async fn delete(&self, id: &str) -> Result<bool, ListenerError> {
        let result = sqlx::query("DELETE FROM listeners WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Listener joined with the number of requests it currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerWithCount {
    pub listener: Listener,
    pub request_count: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct ListenerRow {
    id: String,
    name: Option<String>,
    api_key: String,
    created_at: DateTime<Utc>,
}

impl ListenerRow {
    fn into_domain(self) -> Listener {
        Listener {
            id: self.id,
            name: self.name,
            api_key: self.api_key,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ListenerCountRow {
    #[sqlx(flatten)]
    listener: ListenerRow,
    request_count: i64,
}

impl ListenerCountRow {
    fn into_domain(self) -> ListenerWithCount {
        ListenerWithCount {
            listener: self.listener.into_domain(),
            request_count: self.request_count.max(0) as u64,
        }
    }
}

/// Errors raised by [`ListenerRepository`].
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("api key is already assigned to another listener")]
    DuplicateApiKey,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `captured_requests` table.
#[derive(Clone)]
pub struct RequestRepository {
    pool: SqlitePool,
}

impl RequestRepository {
    /// Persists a captured request. The owning listener must exist.
    pub async fn insert(&self, record: &CapturedRequest) -> Result<(), RequestError> {
        let headers_json = serde_json::to_string(&record.headers).map_err(RequestError::Encode)?;
        let query_json = record
            .query_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(RequestError::Encode)?;

        let result = sqlx::query(
            "INSERT INTO captured_requests \
             (id, listener_id, method, path, headers_json, body, query_params_json, ip_address, user_agent, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.listener_id)
        .bind(&record.method)
        .bind(&record.path)
        .bind(headers_json)
        .bind(&record.body)
        .bind(query_json)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("787") => {
                Err(RequestError::MissingListener)
            }
            Err(err) => Err(RequestError::Database(err)),
        }
    }

    pub async fn find(
        &self,
        listener_id: &str,
        id: &str,
    ) -> Result<Option<CapturedRequest>, RequestError> {
        let row = sqlx::query_as::<_, CapturedRequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM captured_requests WHERE listener_id = ? AND id = ?"
        ))
        .bind(listener_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CapturedRequestRow::into_domain).transpose()
    }

    pub async fn count_for_listener(&self, listener_id: &str) -> Result<u64, RequestError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM captured_requests WHERE listener_id = ?")
                .bind(listener_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// Returns one page of requests, newest first.
    pub async fn list_for_listener(
        &self,
        listener_id: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<CapturedRequest>, RequestError> {
        let rows = sqlx::query_as::<_, CapturedRequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM captured_requests \
             WHERE listener_id = ? \
             ORDER BY received_at DESC, seq DESC \
             LIMIT ? OFFSET ?"
        ))
        .bind(listener_id)
        .bind(i64::from(limit))
        .bind(clamp_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CapturedRequestRow::into_domain).collect()
    }

    /// Ids of the `count` oldest requests, oldest first, insertion order breaking ties.
    pub async fn oldest_ids(&self, listener_id: &str, count: u64) -> Result<Vec<String>, RequestError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM captured_requests \
             WHERE listener_id = ? \
             ORDER BY received_at ASC, seq ASC \
             LIMIT ?",
        )
        .bind(listener_id)
        .bind(clamp_i64(count))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Deletes the given ids and returns how many rows were removed.
    pub async fn delete_ids(&self, ids: &[String]) -> Result<u64, RequestError> {
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM captured_requests WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            deleted += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    /// Deletes one request if it belongs to `listener_id`.
    pub async fn delete_one(&self, listener_id: &str, id: &str) -> Result<bool, RequestError> {
        let result = sqlx::query("DELETE FROM captured_requests WHERE listener_id = ? AND id = ?")
            .bind(listener_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the `count` oldest requests of a listener in one statement.
    pub async fn delete_oldest(&self, listener_id: &str, count: u64) -> Result<u64, RequestError> {
        let result = sqlx::query(
            "DELETE FROM captured_requests WHERE seq IN ( \
                 SELECT seq FROM captured_requests \
                 WHERE listener_id = ? \
                 ORDER BY received_at ASC, seq ASC \
                 LIMIT ? \
             )",
        )
        .bind(listener_id)
        .bind(clamp_i64(count))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

const REQUEST_COLUMNS: &str = "id, listener_id, method, path, headers_json, body, \
                               query_params_json, ip_address, user_agent, received_at";

#[derive(Debug, sqlx::FromRow)]
struct CapturedRequestRow {
    id: String,
    listener_id: String,
    method: String,
    path: String,
    headers_json: String,
    body: Option<String>,
    query_params_json: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    received_at: DateTime<Utc>,
}

impl CapturedRequestRow {
    fn into_domain(self) -> Result<CapturedRequest, RequestError> {
        let headers: StringMap =
            serde_json::from_str(&self.headers_json).map_err(RequestError::Decode)?;
        let query_params = self
            .query_params_json
            .as_deref()
            .map(serde_json::from_str::<StringMap>)
            .transpose()
            .map_err(RequestError::Decode)?;

        Ok(CapturedRequest {
            id: self.id,
            listener_id: self.listener_id,
            method: self.method,
            path: self.path,
            headers,
            body: self.body,
            query_params,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            received_at: self.received_at,
        })
    }
}

/// Errors raised by [`RequestRepository`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("listener does not exist")]
    MissingListener,
    #[error("failed to encode request json: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode stored request json: {0}")]
    Decode(serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
