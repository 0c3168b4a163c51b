use libsql::Connection;
use tracing::info;

use crate::OrmError;

const SCHEMA: &str = "
create table if not exists parameters (
    id integer primary key autoincrement,
    name text not null unique,
    value text not null,
    access_level integer not null default 0,
    data_type integer not null default 0,
    description text,
    created_at text not null,
    updated_at text not null
);

create table if not exists audit_entries (
    id integer primary key autoincrement,
    ip text not null,
    user_agent text,
    action integer not null,
    username text,
    created_at text not null
);
create index if not exists audit_entries_ip on audit_entries (ip);
create index if not exists audit_entries_action on audit_entries (action);

create table if not exists blocked_clients (
    id integer primary key autoincrement,
    ip text not null unique,
    user_agent text,
    block_type integer not null,
    blocked_times integer not null default 1,
    created_at text not null,
    updated_at text not null
);
";

/// Creates every table the defense pipeline reads or writes. Idempotent.
pub async fn migrate(conn: &Connection) -> Result<(), OrmError> {
    conn.execute_batch(SCHEMA).await?;
    info!(kind = "migration", "Schema up to date");
    Ok(())
}
