use std::fmt::Debug;
use std::{
    marker::PhantomData,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use libsql::{de, Connection};
use serde::Deserialize;
use tracing::{error, info};

pub mod audit_entries;
pub mod blocked_clients;
pub mod parameters;
mod schema;

pub use schema::migrate;

#[derive(Debug, Deserialize)]
pub struct RowId {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct Count {
    pub count: u64,
}

pub const SQL_NOW_UTC_ISO: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";
pub const CHRONO_UTC_ISO_FMT: &str = "%Y-%m-%dT%H:%M:%S.%3fZ";

/// Formats a timestamp the same way `SQL_NOW_UTC_ISO` does, so stored
/// timestamps compare lexicographically.
pub fn iso(dt: DateTime<Utc>) -> String {
    dt.format(CHRONO_UTC_ISO_FMT).to_string()
}

pub fn parse_iso(raw: &str) -> Result<DateTime<Utc>, OrmError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrmError::Deserialisation(format!("invalid timestamp {raw}: {e}")))
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OrmError {
    #[error("{0} not found (id: {1:?})")]
    NotFound(String, Option<u64>),
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("query error: {0}")]
    QueryError(String),
    #[error("deserialisation error: {0}")]
    Deserialisation(String),
    #[error("no change: {0}")]
    NoChange(String),
    #[error("unknown storage error")]
    Unknown,
}

impl From<serde::de::value::Error> for OrmError {
    fn from(value: serde::de::value::Error) -> Self {
        tracing::error!(kind = "process_error", error = value.to_string());
        OrmError::Deserialisation(value.to_string())
    }
}

impl From<libsql::Error> for OrmError {
    fn from(value: libsql::Error) -> Self {
        use libsql::Error;

        tracing::error!(kind = "query", error = value.to_string());
        match value {
            Error::ColumnNotFound(e) => {
                OrmError::QueryError(format!("Column not found: {}", e).to_string())
            }
            Error::InvalidColumnName(e) => {
                OrmError::QueryError(format!("Column not found: {}", e).to_string())
            }
            Error::InvalidColumnIndex => OrmError::QueryError("Column not found".to_string()),
            Error::SqliteFailure(_, e) => OrmError::QueryError(e),
            _ => OrmError::Unknown,
        }
    }
}

pub trait OrmBase<T>
where
    T: Sized,
{
    #[allow(async_fn_in_trait)]
    async fn create(&self, connection: &Connection) -> Result<u64, OrmError>;
    #[allow(async_fn_in_trait)]
    async fn get(connection: &Connection, id: u64) -> Result<Option<T>, OrmError>;
    #[allow(async_fn_in_trait)]
    async fn update(&mut self, connection: &Connection) -> Result<(), OrmError>;
    #[allow(async_fn_in_trait)]
    async fn delete(&self, connection: &Connection) -> Result<(), OrmError>;
}

pub struct Orm<T> {
    _phantom: PhantomData<T>,
}

impl<T> Orm<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    pub fn placeholders(columns: usize) -> String {
        let indices: Vec<usize> = (1..=columns).collect();
        let placeholders: Vec<String> = indices.iter().map(|i| format!("?{}", i)).collect();
        placeholders.join(", ")
    }

    pub fn update_placeholders(columns: &[&str]) -> String {
        let updates = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| format!("{} = ?{}", col, idx + 1))
            .collect::<Vec<String>>();
        updates.join(", ")
    }

    fn now_ts() -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    pub async fn query(
        conn: &libsql::Connection,
        query: &String,
        replacements: Vec<String>,
    ) -> Result<Vec<T>, OrmError> {
        let qs = Orm::<T>::now_ts();

        let mut rows = match conn.query(query, replacements).await {
            Ok(r) => r,
            Err(e) => {
                let qe = Orm::<T>::now_ts();
                error!(
                    kind = "query",
                    query = query,
                    error = %e,
                    query_duration_ms = (qe - qs).as_millis(),
                    "Query failed"
                );
                return Err(OrmError::from(e));
            }
        };

        let qe = Orm::<T>::now_ts();
        let query_duration = qe - qs;

        let ds = Orm::<T>::now_ts();
        let mut results: Vec<T> = Vec::new();

        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(OrmError::from(e)),
            };
            match de::from_row::<T>(&row) {
                Ok(parsed_row) => results.push(parsed_row),
                Err(e) => {
                    let de = Orm::<T>::now_ts();
                    tracing::error!(
                        kind = "query",
                        query = query,
                        error = %e,
                        query_duration_ms = query_duration.as_millis(),
                        deserialize_duration_ms = (de - ds).as_millis(),
                        "Deserialization failed"
                    );
                    return Err(OrmError::from(e));
                }
            }
        }

        let de = Orm::<T>::now_ts();
        tracing::debug!(
            kind = "query",
            query = query,
            query_duration_ms = query_duration.as_millis(),
            deserialize_duration_ms = (de - ds).as_millis(),
            "Query completed"
        );

        Ok(results)
    }

    pub async fn execute(
        conn: &libsql::Connection,
        query: &String,
        replacements: Vec<String>,
    ) -> Result<u64, OrmError> {
        let qs = Orm::<T>::now_ts();

        let affected_rows = match conn.execute(query, replacements).await {
            Ok(r) => r,
            Err(e) => {
                let qe = Orm::<T>::now_ts();
                error!(
                    kind = "query",
                    query = query,
                    error = %e,
                    query_duration_ms = (qe - qs).as_millis(),
                    "Query failed"
                );
                return Err(OrmError::from(e));
            }
        };

        let qe = Orm::<T>::now_ts();
        let query_duration = qe - qs;

        info!(
            kind = "query",
            query = query,
            query_duration_ms = query_duration.as_millis(),
            affected_rows = affected_rows,
            "Query completed"
        );

        Ok(affected_rows)
    }

    /// Runs a query that selects a single `count` column.
    pub async fn count(
        conn: &libsql::Connection,
        query: &String,
        replacements: Vec<String>,
    ) -> Result<u64, OrmError> {
        let rows = Orm::<Count>::query(conn, query, replacements).await?;
        Ok(rows.first().map(|row| row.count).unwrap_or(0))
    }
}

#[macro_export]
macro_rules! add_if_present {
    ($columns:expr, $replacements:expr, $instance:expr, $field:ident) => {
        if let Some(value) = &$instance.$field {
            $columns.push(stringify!($field));
            $replacements.push(value.to_string());
        }
    };
}

/// Integer-backed column enums: stored as their discriminant, (de)serialised
/// as the same integer so rows survive a trip through the cache.
#[macro_export]
macro_rules! int_enum {
    ($name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "u8", into = "u8")]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(format!("invalid {} value: {}", stringify!($name), other)),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", *self as u8)
            }
        }
    };
}
