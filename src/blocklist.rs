use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tables::{
    blocked_clients::{BlockType, BlockedClient},
    parse_iso, OrmBase,
};

use crate::{
    cache::{keys, Cache},
    database::Database,
    error::{Error, Result},
    parameters::{defaults, ParameterStore},
};

pub const BLACKLIST_TTL: Duration = Duration::from_secs(5 * 60);
pub const WHITELIST_TTL: Duration = Duration::from_secs(60);

/// Per-client block state.
///
/// Storage is authoritative. The `BLACKLISTED:`/`WHITELISTED:` flags only
/// short-circuit the lookup for clients that are not blocked, and both expire,
/// so a flag left behind by a crash between the two writes heals itself.
#[derive(Clone)]
pub struct Blocklist {
    database: Database,
    cache: Arc<dyn Cache>,
    parameters: ParameterStore,
}

impl Blocklist {
    pub fn new(database: Database, cache: Arc<dyn Cache>, parameters: ParameterStore) -> Self {
        Self {
            database,
            cache,
            parameters,
        }
    }

    pub async fn status(&self, ip: &str) -> Result<Option<BlockedClient>> {
        let conn = self.database.conn()?;
        Ok(BlockedClient::get_by_ip(&conn, ip).await?)
    }

    /// The blocking row when `ip` is currently blocked.
    pub async fn check(&self, ip: &str) -> Result<Option<BlockedClient>> {
        if self.cache.exists(&keys::whitelisted(ip)).await? {
            return Ok(None);
        }

        match self.status(ip).await? {
            Some(client) if client.block_type.is_blocked() => {
                self.flag_blocked(ip).await?;
                Ok(Some(client))
            }
            _ => {
                self.flag_allowed(ip).await?;
                Ok(None)
            }
        }
    }

    pub async fn is_blocked(&self, ip: &str) -> Result<bool> {
        Ok(self.check(ip).await?.is_some())
    }

    async fn flag_blocked(&self, ip: &str) -> Result<()> {
        self.cache.delete(&keys::whitelisted(ip)).await?;
        self.cache
            .set(&keys::blacklisted(ip), "1", Some(BLACKLIST_TTL))
            .await?;
        Ok(())
    }

    async fn flag_allowed(&self, ip: &str) -> Result<()> {
        self.cache.delete(&keys::blacklisted(ip)).await?;
        self.cache
            .set(&keys::whitelisted(ip), "1", Some(WHITELIST_TTL))
            .await?;
        Ok(())
    }

    /// Records another violation for `ip`. The row is written before the
    /// cache flags change. An indefinite block never drops back to temporary.
    pub async fn escalate(
        &self,
        ip: &str,
        user_agent: &str,
        indefinitely: bool,
    ) -> Result<BlockedClient> {
        let conn = self.database.conn()?;
        // Read live so an admin change applies to clients already counted.
        let max_temporary = self.parameters.get_u64(defaults::MAX_TEMPORARY_BLOCK).await?;

        let client = match BlockedClient::escalate(&conn, ip, indefinitely, max_temporary).await? {
            Some(client) => client,
            None => {
                let block_type = if indefinitely {
                    BlockType::Indefinite
                } else {
                    BlockType::Temporary
                };
                match BlockedClient::new(ip, user_agent, block_type).create(&conn).await {
                    Ok(id) => BlockedClient::get(&conn, id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("blocked client {ip}")))?,
                    // Lost a race with another worker creating the same row.
                    Err(e) => BlockedClient::escalate(&conn, ip, indefinitely, max_temporary)
                        .await?
                        .ok_or(e)?,
                }
            }
        };

        self.flag_blocked(ip).await?;
        tracing::warn!(
            kind = "blocklist",
            ip = ip,
            block_type = client.block_type.label(),
            blocked_times = client.blocked_times,
            "Client blocked"
        );
        Ok(client)
    }

    /// Clears a temporary block whose period has run out. Returns whether it
    /// did; an already cleared client is left alone.
    pub async fn unblock_if_expired(&self, ip: &str) -> Result<bool> {
        let Some(client) = self.status(ip).await? else {
            return Ok(false);
        };
        if client.block_type != BlockType::Temporary {
            return Ok(false);
        }

        let period_days = self
            .parameters
            .get_i64(defaults::TEMPORARY_BLOCK_PERIOD)
            .await?;
        let expires = parse_iso(&client.updated_at)? + chrono::Duration::days(period_days);
        if expires > Utc::now() {
            return Ok(false);
        }

        self.clear(client).await?;
        tracing::warn!(kind = "blocklist", ip = ip, "Temporary block expired, client unblocked");
        Ok(true)
    }

    /// Admin reset; works on indefinite blocks too.
    pub async fn unblock(&self, ip: &str) -> Result<BlockedClient> {
        let client = self
            .status(ip)
            .await?
            .ok_or_else(|| Error::NotFound(format!("blocked client {ip}")))?;
        let client = self.clear(client).await?;
        tracing::warn!(kind = "blocklist", ip = ip, "Client unblocked by admin");
        Ok(client)
    }

    async fn clear(&self, mut client: BlockedClient) -> Result<BlockedClient> {
        let conn = self.database.conn()?;
        client.block_type = BlockType::Unblocked;
        client.update(&conn).await?;
        self.flag_allowed(&client.ip).await?;
        Ok(client)
    }

    pub async fn blocked_count(&self) -> Result<u64> {
        let conn = self.database.conn()?;
        Ok(BlockedClient::count_blocked(&conn).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use tables::{iso, Orm};
    use tracing_test::traced_test;

    async fn blocklist() -> Blocklist {
        let database = Database::in_memory().await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let parameters = ParameterStore::new(cache.clone(), database.clone());
        Blocklist::new(database, cache, parameters)
    }

    async fn backdate(blocklist: &Blocklist, ip: &str, days: i64) {
        let conn = blocklist.database.conn().unwrap();
        Orm::<BlockedClient>::execute(
            &conn,
            &"update blocked_clients set updated_at = ?1 where ip = ?2".to_string(),
            vec![iso(Utc::now() - chrono::Duration::days(days)), ip.to_string()],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn first_offense_is_temporary() {
        // arrange
        let blocklist = blocklist().await;

        // act
        let client = blocklist.escalate("7.7.7.7", "ua", false).await.unwrap();

        // assert
        assert_eq!(client.block_type, BlockType::Temporary);
        assert_eq!(client.blocked_times, 1);
        assert!(blocklist.is_blocked("7.7.7.7").await.unwrap());
        assert!(logs_contain("Client blocked"));
    }

    #[tokio::test]
    #[traced_test]
    async fn max_escalations_end_indefinite() {
        // arrange
        let blocklist = blocklist().await;

        // act
        let mut states = vec![];
        for _ in 0..5 {
            states.push(blocklist.escalate("7.7.7.8", "ua", false).await.unwrap());
        }

        // assert
        let types: Vec<BlockType> = states.iter().map(|c| c.block_type).collect();
        assert_eq!(&types[..4], &[BlockType::Temporary; 4]);
        assert_eq!(types[4], BlockType::Indefinite);
        assert_eq!(states[4].blocked_times, 5);
    }

    #[tokio::test]
    #[traced_test]
    async fn severe_offenses_are_indefinite_immediately() {
        // arrange
        let blocklist = blocklist().await;

        // act
        let client = blocklist.escalate("7.7.7.9", "ua", true).await.unwrap();

        // assert
        assert_eq!(client.block_type, BlockType::Indefinite);
        assert_eq!(client.blocked_times, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn expired_temporary_blocks_clear_once() {
        // arrange
        let blocklist = blocklist().await;
        blocklist.escalate("8.8.8.8", "ua", false).await.unwrap();
        backdate(&blocklist, "8.8.8.8", 2).await;

        // act
        let first = blocklist.unblock_if_expired("8.8.8.8").await.unwrap();
        let second = blocklist.unblock_if_expired("8.8.8.8").await.unwrap();

        // assert
        assert!(first);
        assert!(!second);
        let client = blocklist.status("8.8.8.8").await.unwrap().unwrap();
        assert_eq!(client.block_type, BlockType::Unblocked);
        assert_eq!(client.blocked_times, 1);
        assert!(!blocklist.is_blocked("8.8.8.8").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn running_blocks_do_not_clear() {
        // arrange
        let blocklist = blocklist().await;
        blocklist.escalate("8.8.4.4", "ua", false).await.unwrap();

        // act
        let cleared = blocklist.unblock_if_expired("8.8.4.4").await.unwrap();

        // assert
        assert!(!cleared);
        assert!(blocklist.is_blocked("8.8.4.4").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn indefinite_blocks_never_expire() {
        // arrange
        let blocklist = blocklist().await;
        blocklist.escalate("9.9.9.9", "ua", true).await.unwrap();
        backdate(&blocklist, "9.9.9.9", 400).await;

        // act
        let cleared = blocklist.unblock_if_expired("9.9.9.9").await.unwrap();
        let admin = blocklist.unblock("9.9.9.9").await.unwrap();

        // assert
        assert!(!cleared);
        assert_eq!(admin.block_type, BlockType::Unblocked);
        assert_eq!(blocklist.blocked_count().await.unwrap(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn indefinite_blocks_are_never_downgraded() {
        // arrange
        let blocklist = blocklist().await;
        blocklist.escalate("6.6.6.6", "ua", true).await.unwrap();

        // act
        let client = blocklist.escalate("6.6.6.6", "ua", false).await.unwrap();
        backdate(&blocklist, "6.6.6.6", 30).await;
        let cleared = blocklist.unblock_if_expired("6.6.6.6").await.unwrap();

        // assert
        assert_eq!(client.block_type, BlockType::Indefinite);
        assert_eq!(client.blocked_times, 2);
        assert!(!cleared);
        assert!(blocklist.is_blocked("6.6.6.6").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_escalations_are_all_counted() {
        // arrange
        let blocklist = blocklist().await;
        blocklist
            .parameters
            .set(defaults::MAX_TEMPORARY_BLOCK, "100")
            .await
            .unwrap();

        // act
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let blocklist = blocklist.clone();
                tokio::spawn(async move { blocklist.escalate("5.5.5.5", "ua", false).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // assert
        let client = blocklist.status("5.5.5.5").await.unwrap().unwrap();
        assert_eq!(client.blocked_times, 20);
        assert_eq!(client.block_type, BlockType::Temporary);
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_allow_flag_is_overridden_by_escalation() {
        // arrange
        let blocklist = blocklist().await;
        assert!(!blocklist.is_blocked("1.2.3.4").await.unwrap());

        // act
        blocklist.escalate("1.2.3.4", "ua", false).await.unwrap();

        // assert
        assert!(blocklist.is_blocked("1.2.3.4").await.unwrap());
    }
}
