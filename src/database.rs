use libsql::Connection;
use std::sync::Arc;
use tables::OrmError;

use crate::env::Environment;

#[derive(Clone)]
pub enum Database {
    Local((Arc<libsql::Database>, Connection)),
    Remote(Arc<libsql::Database>),
}

impl Database {
    /// Remote libSQL when not in dev mode and both URL and token are set,
    /// otherwise the local file at `db_path`. The schema is migrated either way.
    pub async fn new(env: &Environment) -> Result<Self, OrmError> {
        let database = match (&env.db_url, &env.db_auth_token) {
            (Some(url), Some(token)) if !env.dev_mode => {
                let db = libsql::Builder::new_remote(url.clone(), token.secret_str().to_string())
                    .build()
                    .await?;
                tracing::info!(kind = "database", url = url, "Using remote database");
                Self::Remote(Arc::new(db))
            }
            _ => Self::local(&env.db_path).await?,
        };

        tables::migrate(&database.conn()?).await?;
        Ok(database)
    }

    async fn local(path: &str) -> Result<Self, OrmError> {
        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        tracing::info!(kind = "database", path = path, "Using local database");
        Ok(Self::Local((Arc::new(db), conn)))
    }

    /// Fresh, migrated database that lives as long as the handle.
    pub async fn in_memory() -> Result<Self, OrmError> {
        let database = Self::local(":memory:").await?;
        tables::migrate(&database.conn()?).await?;
        Ok(database)
    }

    pub fn conn(&self) -> Result<Connection, OrmError> {
        let conn = match self {
            // Held open for the life of the process.
            Self::Local((_, conn)) => conn.clone(),

            // Remote connections are TCP based and may drop; open one per use.
            Self::Remote(db) => db.connect()?,
        };
        Ok(conn)
    }
}
