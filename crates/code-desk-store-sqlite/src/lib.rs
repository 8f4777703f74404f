#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use code_desk_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, DeskError, NewQueryRecord, QueryId, QueryRecord,
    QueryUpdate,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use ulid::Ulid;

const QUERY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_QUERIES_V1: &str = r"
CREATE TABLE IF NOT EXISTS ai_queries (
  query_id TEXT PRIMARY KEY,
  question TEXT NOT NULL CHECK (length(trim(question)) > 0),
  response TEXT NOT NULL CHECK (length(trim(response)) > 0),
  created_at TEXT NOT NULL,
  raw_response TEXT,
  token_count INTEGER CHECK (token_count >= 0 OR token_count IS NULL),
  request_payload TEXT,
  existing_content TEXT,
  is_integrated INTEGER NOT NULL DEFAULT 0 CHECK (is_integrated IN (0, 1))
);

CREATE TRIGGER IF NOT EXISTS trg_ai_queries_no_delete
BEFORE DELETE ON ai_queries
BEGIN
  SELECT RAISE(FAIL, 'ai_queries rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_ai_queries_core_immutable
BEFORE UPDATE OF query_id, question, response, created_at, raw_response, token_count, request_payload
ON ai_queries
BEGIN
  SELECT RAISE(FAIL, 'ai_queries core fields are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_ai_queries_integration_one_way
BEFORE UPDATE OF is_integrated ON ai_queries
WHEN OLD.is_integrated = 1 AND NEW.is_integrated = 0
BEGIN
  SELECT RAISE(FAIL, 'is_integrated only moves false to true');
END;
";

pub struct SqliteQueryStore {
    conn: Connection,
}

impl SqliteQueryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_QUERIES_V1)
            .context("failed to apply query schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![QUERY_MIGRATION_VERSION, now],
            )
            .context("failed to register query schema migration")?;

        Ok(())
    }

    pub fn insert(&mut self, input: &NewQueryRecord) -> Result<QueryRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("query validation failed: {err}"))?;

        let id = QueryId::new();
        let created_at = now_utc();
        let created_at_raw = format_rfc3339(created_at).map_err(|err| anyhow!(err.to_string()))?;

        let raw_response_json = input
            .raw_response
            .as_ref()
            .map(|value| serde_json::to_string(value).context("failed to serialize raw_response"))
            .transpose()?;
        let request_payload_json = input
            .request_payload
            .as_ref()
            .map(|value| {
                serde_json::to_string(value).context("failed to serialize request_payload")
            })
            .transpose()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;

        tx.execute(
            "INSERT INTO ai_queries(
                query_id, question, response, created_at,
                raw_response, token_count, request_payload,
                existing_content, is_integrated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0)",
            params![
                id.to_string(),
                input.question,
                input.response,
                created_at_raw,
                raw_response_json,
                input.token_count,
                request_payload_json,
            ],
        )
        .context("failed to insert query record")?;

        tx.commit().context("failed to commit insert transaction")?;

        Ok(QueryRecord {
            id,
            question: input.question.clone(),
            response: input.response.clone(),
            created_at,
            raw_response: input.raw_response.clone(),
            token_count: input.token_count,
            request_payload: input.request_payload.clone(),
            existing_content: None,
            is_integrated: false,
        })
    }

    /// Returns up to `limit` records, newest first. Rows are never deleted,
    /// so rowid is a stable insertion sequence.
    pub fn latest(&self, limit: usize) -> Result<Vec<QueryRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT query_id, question, response, created_at, raw_response,
                    token_count, request_payload, existing_content, is_integrated
             FROM ai_queries
             ORDER BY rowid DESC
             LIMIT ?1",
        )?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit_i64], parse_query_row)?;
        collect_rows(rows)
    }

    pub fn get(&self, id: QueryId) -> Result<Option<QueryRecord>> {
        self.conn
            .query_row(
                "SELECT query_id, question, response, created_at, raw_response,
                        token_count, request_payload, existing_content, is_integrated
                 FROM ai_queries
                 WHERE query_id = ?1",
                params![id.to_string()],
                parse_query_row,
            )
            .optional()
            .context("failed to load query record")
    }

    /// Applies the lazily-written fields. Core fields stay immutable and
    /// `is_integrated` can only move false→true; both rules are enforced by
    /// schema triggers, so violations surface as errors here.
    pub fn update(&mut self, id: QueryId, update: &QueryUpdate) -> Result<QueryRecord> {
        if update.existing_content.is_none() && update.is_integrated.is_none() {
            return Err(anyhow!("update MUST set at least one field"));
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start update transaction")?;

        if let Some(content) = &update.existing_content {
            let changed = tx
                .execute(
                    "UPDATE ai_queries SET existing_content = ?1 WHERE query_id = ?2",
                    params![content, id.to_string()],
                )
                .context("failed to update existing_content")?;
            if changed == 0 {
                return Err(anyhow!("no query record with id {id}"));
            }
        }

        if let Some(flag) = update.is_integrated {
            let changed = tx
                .execute(
                    "UPDATE ai_queries SET is_integrated = ?1 WHERE query_id = ?2",
                    params![i64::from(flag), id.to_string()],
                )
                .context("failed to update is_integrated")?;
            if changed == 0 {
                return Err(anyhow!("no query record with id {id}"));
            }
        }

        tx.commit().context("failed to commit update transaction")?;

        self.get(id)?
            .ok_or_else(|| anyhow!("no query record with id {id}"))
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ai_queries", [], |row| row.get(0))
            .context("failed to count query records")?;
        usize::try_from(count).context("invalid row count")
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_query_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryRecord> {
    let id_raw: String = row.get(0)?;
    let id = Ulid::from_string(&id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid query_id ULID: {id_raw}"),
            )),
        )
    })?;

    let created_at = parse_rfc3339_utc(&row.get::<_, String>(3)?).map_err(to_sql_error)?;
    let raw_response = parse_json_column(row.get::<_, Option<String>>(4)?, 4)?;

    let token_count_i64: Option<i64> = row.get(5)?;
    let token_count = token_count_i64
        .map(|value| {
            u32::try_from(value).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Integer,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid token_count: {value}"),
                    )),
                )
            })
        })
        .transpose()?;

    let request_payload = parse_json_column(row.get::<_, Option<String>>(6)?, 6)?;

    Ok(QueryRecord {
        id: QueryId(id),
        question: row.get(1)?,
        response: row.get(2)?,
        created_at,
        raw_response,
        token_count,
        request_payload,
        existing_content: row.get(7)?,
        is_integrated: row.get::<_, i64>(8)? == 1,
    })
}

fn parse_json_column(raw: Option<String>, index: usize) -> rusqlite::Result<Option<Value>> {
    raw.as_deref()
        .map(|json| {
            serde_json::from_str(json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid stored JSON: {err}"),
                    )),
                )
            })
        })
        .transpose()
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: DeskError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
