use std::{path::Path, sync::Arc};

use eyre::{eyre, Context};
use gatekeeper::{
    cache::{Cache, MemoryCache, RedisCache},
    database::Database,
    env::Environment,
    tools::install_tools,
    AppState,
};
use indicatif::ProgressBar;
use serde::Serialize;
use tables::{
    audit_entries::{AuditEntry, AuditFilter},
    blocked_clients::BlockedClient,
};

const EXPORT_BATCH: u64 = 500;

const USAGE: &str = "usage: maintenance <command>

commands:
  compact                  move the audit retention boundary and purge old posts
  seed                     insert missing default parameters
  unblock <ip>             clear the block on a client
  export-audit <file>      write the audit trail to a csv file
  export-blocked <file>    write the blocked clients to a csv file";

#[derive(Debug, Serialize)]
struct AuditRow<'a> {
    id: u64,
    ip: &'a str,
    user_agent: &'a str,
    action: &'static str,
    username: &'a str,
    created_at: &'a str,
}

impl<'a> From<&'a AuditEntry> for AuditRow<'a> {
    fn from(entry: &'a AuditEntry) -> Self {
        Self {
            id: entry.id,
            ip: &entry.ip,
            user_agent: entry.user_agent.as_deref().unwrap_or_default(),
            action: entry.action.label(),
            username: entry.username.as_deref().unwrap_or_default(),
            created_at: &entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct BlockedRow<'a> {
    ip: &'a str,
    user_agent: &'a str,
    block_type: &'static str,
    blocked_times: u64,
    created_at: &'a str,
    updated_at: &'a str,
}

impl<'a> From<&'a BlockedClient> for BlockedRow<'a> {
    fn from(client: &'a BlockedClient) -> Self {
        Self {
            ip: &client.ip,
            user_agent: client.user_agent.as_deref().unwrap_or_default(),
            block_type: client.block_type.label(),
            blocked_times: client.blocked_times,
            created_at: &client.created_at,
            updated_at: &client.updated_at,
        }
    }
}

async fn state() -> eyre::Result<AppState> {
    let env = Environment::new()?;
    install_tools(&env)?;

    let database = Database::new(&env)
        .await
        .wrap_err("failed to open the database")?;
    // Parameter writes must reach the server's cache, which is only shared
    // when it lives in redis.
    let cache: Arc<dyn Cache> = match &env.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            tracing::warn!("No redis configured, a running server keeps its cached parameters");
            Arc::new(MemoryCache::new())
        }
    };

    Ok(AppState::new(env, cache, database))
}

async fn export_audit(state: &AppState, path: &Path) -> eyre::Result<()> {
    let conn = state.database.conn()?;
    let filter = AuditFilter::default();
    let total = AuditEntry::count(&conn, &filter).await?;
    let mut writer = csv::Writer::from_path(path)?;

    let pb = ProgressBar::new(total);
    let mut offset = 0;
    loop {
        let entries = AuditEntry::page(&conn, &filter, EXPORT_BATCH, offset).await?;
        if entries.is_empty() {
            break;
        }
        for entry in entries.iter() {
            writer.serialize(AuditRow::from(entry))?;
            pb.inc(1);
        }
        offset += entries.len() as u64;
    }
    pb.finish();
    writer.flush()?;

    tracing::info!(rows = offset, path = %path.display(), "Audit trail exported");
    Ok(())
}

async fn export_blocked(state: &AppState, path: &Path) -> eyre::Result<()> {
    let conn = state.database.conn()?;
    let clients = BlockedClient::all(&conn).await?;
    let mut writer = csv::Writer::from_path(path)?;

    let pb = ProgressBar::new(clients.len() as u64);
    for client in clients.iter() {
        writer.serialize(BlockedRow::from(client))?;
        pb.inc(1);
    }
    pb.finish();
    writer.flush()?;

    tracing::info!(rows = clients.len(), path = %path.display(), "Blocked clients exported");
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str);
    let argument = || {
        args.get(1)
            .ok_or_else(|| eyre!("missing argument\n\n{USAGE}"))
    };

    match command {
        Some("compact") => {
            let compaction = state().await?.audit.compact().await?;
            println!(
                "magic number {}, {} entries purged",
                compaction.magic_number, compaction.purged
            );
        }
        Some("seed") => {
            let seeded = state().await?.parameters.seed_defaults().await?;
            println!("{seeded} parameters seeded");
        }
        Some("unblock") => {
            let ip = argument()?;
            let client = state().await?.blocklist.unblock(ip).await?;
            println!("{} unblocked after {} blocks", client.ip, client.blocked_times);
        }
        Some("export-audit") => {
            let path = argument()?;
            export_audit(&state().await?, Path::new(path)).await?;
        }
        Some("export-blocked") => {
            let path = argument()?;
            export_blocked(&state().await?, Path::new(path)).await?;
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}
