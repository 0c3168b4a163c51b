use chrono::Utc;
use serde::Serialize;
use tables::{
    audit_entries::{AuditAction, AuditEntry, AuditFilter},
    blocked_clients::BlockedClient,
    iso, OrmBase,
};

use crate::{
    database::Database,
    error::Result,
    parameters::{defaults, ParameterStore},
};

/// Append-only audit trail with a sliding retention boundary.
///
/// `MAGIC_NUMBER` holds the smallest id still inside the failed-login reset
/// window; per-client lookups use `id >= MAGIC_NUMBER` instead of scanning
/// the whole table.
#[derive(Clone)]
pub struct AuditLog {
    database: Database,
    parameters: ParameterStore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Compaction {
    pub magic_number: u64,
    pub purged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub suspicious: u64,
    pub failed_logins_last_30_days: u64,
    pub blocked_clients: u64,
    pub first_visits: u64,
    pub member_form_posts: u64,
}

impl AuditLog {
    pub fn new(database: Database, parameters: ParameterStore) -> Self {
        Self {
            database,
            parameters,
        }
    }

    pub async fn record(
        &self,
        ip: &str,
        user_agent: &str,
        action: AuditAction,
        username: Option<&str>,
    ) -> Result<u64> {
        let conn = self.database.conn()?;
        let id = AuditEntry::new(ip, user_agent, action, username)
            .create(&conn)
            .await?;
        tracing::debug!(kind = "audit", ip = ip, action = action.label(), id = id);
        Ok(id)
    }

    pub async fn magic_number(&self) -> Result<u64> {
        self.parameters.get_u64(defaults::MAGIC_NUMBER).await
    }

    /// Entries for `ip` with `action` inside the retention window.
    pub async fn recent_count(&self, ip: &str, action: AuditAction) -> Result<u64> {
        let filter = AuditFilter::default()
            .ip(ip)
            .action(action)
            .min_id(self.magic_number().await?);
        let conn = self.database.conn()?;
        Ok(AuditEntry::count(&conn, &filter).await?)
    }

    /// Whether `ip` was ever recorded. The recent window answers most
    /// lookups; the full table is only scanned when it comes back empty.
    pub async fn has_any(&self, ip: &str) -> Result<bool> {
        let conn = self.database.conn()?;
        let recent = AuditFilter::default().ip(ip).min_id(self.magic_number().await?);
        if AuditEntry::exists(&conn, &recent).await? {
            return Ok(true);
        }
        Ok(AuditEntry::exists(&conn, &AuditFilter::default().ip(ip)).await?)
    }

    /// Moves the retention boundary forward and purges plain POST entries
    /// behind it. Login, suspicious and attack entries are kept forever.
    pub async fn compact(&self) -> Result<Compaction> {
        tracing::info!(kind = "audit", "Compaction started");
        let magic_number = self.magic_number().await?;
        let reset_days = self
            .parameters
            .get_i64(defaults::ALLOWED_LOGGED_IN_ATTEMPTS_RESET)
            .await?;
        let since = iso(Utc::now() - chrono::Duration::days(reset_days));

        let conn = self.database.conn()?;
        let in_window = AuditFilter::default()
            .min_id(magic_number)
            .created_since(since);
        let boundary = match AuditEntry::first_id(&conn, &in_window).await? {
            Some(id) => id,
            None => AuditEntry::last_id(&conn).await?.unwrap_or(1),
        };

        let expired_posts = AuditFilter::default()
            .action(AuditAction::NormalPost)
            .before_id(boundary);
        let purged = AuditEntry::delete_where(&conn, &expired_posts).await?;

        self.parameters
            .set(defaults::MAGIC_NUMBER, &boundary.to_string())
            .await?;
        tracing::info!(kind = "audit", magic_number = boundary, purged = purged, "Compaction finished");

        Ok(Compaction {
            magic_number: boundary,
            purged,
        })
    }

    /// Admin activity log, newest first. Plain POST entries are noise there.
    pub async fn activity(
        &self,
        action: Option<AuditAction>,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<AuditEntry>> {
        let mut filter = AuditFilter::default().exclude_action(AuditAction::NormalPost);
        if let Some(action) = action {
            filter = filter.action(action);
        }
        let conn = self.database.conn()?;
        let offset = page.saturating_sub(1) * per_page;
        Ok(AuditEntry::page(&conn, &filter, per_page, offset).await?)
    }

    pub async fn summary(&self) -> Result<MonitorSummary> {
        let conn = self.database.conn()?;
        let count = |filter: AuditFilter| {
            let conn = conn.clone();
            async move { AuditEntry::count(&conn, &filter).await }
        };

        let suspicious = count(AuditFilter::default().action(AuditAction::SuspiciousPost)).await?
            + count(AuditFilter::default().action(AuditAction::AttackAttempt)).await?;
        let month_ago = iso(Utc::now() - chrono::Duration::days(30));
        let failed_logins_last_30_days = count(
            AuditFilter::default()
                .action(AuditAction::LoggedFailed)
                .created_since(month_ago),
        )
        .await?;

        Ok(MonitorSummary {
            suspicious,
            failed_logins_last_30_days,
            blocked_clients: BlockedClient::count_blocked(&conn).await?,
            first_visits: count(AuditFilter::default().action(AuditAction::FirstVisit)).await?,
            member_form_posts: count(AuditFilter::default().action(AuditAction::MemberFormPost))
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::MemoryCache;
    use tables::Orm;
    use tracing_test::traced_test;

    async fn audit_log() -> AuditLog {
        let database = Database::in_memory().await.unwrap();
        let parameters = ParameterStore::new(Arc::new(MemoryCache::new()), database.clone());
        parameters.seed_defaults().await.unwrap();
        AuditLog::new(database, parameters)
    }

    async fn age(log: &AuditLog, id: u64, days: i64) {
        let conn = log.database.conn().unwrap();
        let created = iso(Utc::now() - chrono::Duration::days(days));
        Orm::<AuditEntry>::execute(
            &conn,
            &"update audit_entries set created_at = ?1 where id = ?2".to_string(),
            vec![created, id.to_string()],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn compaction_purges_only_old_plain_posts() {
        // arrange
        let log = audit_log().await;
        let old_post = log.record("1.1.1.1", "ua", AuditAction::NormalPost, None).await.unwrap();
        let old_failed = log.record("1.1.1.1", "ua", AuditAction::LoggedFailed, None).await.unwrap();
        let old_attack = log.record("1.1.1.1", "ua", AuditAction::AttackAttempt, None).await.unwrap();
        for id in [old_post, old_failed, old_attack] {
            age(&log, id, 3).await;
        }
        let fresh_post = log.record("1.1.1.1", "ua", AuditAction::NormalPost, None).await.unwrap();

        // act
        let compaction = log.compact().await.unwrap();

        // assert
        assert_eq!(compaction.magic_number, fresh_post);
        assert_eq!(compaction.purged, 1);
        let conn = log.database.conn().unwrap();
        assert!(AuditEntry::get(&conn, old_post).await.unwrap().is_none());
        assert!(AuditEntry::get(&conn, old_failed).await.unwrap().is_some());
        assert!(AuditEntry::get(&conn, old_attack).await.unwrap().is_some());
        assert_eq!(log.magic_number().await.unwrap(), fresh_post);
    }

    #[tokio::test]
    #[traced_test]
    async fn compaction_falls_back_to_last_row() {
        // arrange
        let log = audit_log().await;
        log.record("1.1.1.1", "ua", AuditAction::NormalPost, None).await.unwrap();
        let last = log.record("1.1.1.1", "ua", AuditAction::NormalPost, None).await.unwrap();
        age(&log, last - 1, 5).await;
        age(&log, last, 5).await;

        // act
        let compaction = log.compact().await.unwrap();

        // assert
        assert_eq!(compaction.magic_number, last);
        assert_eq!(compaction.purged, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn compaction_of_an_empty_table() {
        // arrange
        let log = audit_log().await;

        // act
        let compaction = log.compact().await.unwrap();

        // assert
        assert_eq!(compaction, Compaction { magic_number: 1, purged: 0 });
    }

    #[tokio::test]
    #[traced_test]
    async fn recent_counts_respect_the_boundary() {
        // arrange
        let log = audit_log().await;
        let old = log.record("2.2.2.2", "ua", AuditAction::LoggedFailed, None).await.unwrap();
        age(&log, old, 3).await;
        log.record("2.2.2.2", "ua", AuditAction::LoggedFailed, Some("sam")).await.unwrap();
        log.compact().await.unwrap();

        // act
        let recent = log.recent_count("2.2.2.2", AuditAction::LoggedFailed).await.unwrap();
        let seen = log.has_any("2.2.2.2").await.unwrap();
        let unseen = log.has_any("3.3.3.3").await.unwrap();

        // assert
        assert_eq!(recent, 1);
        assert!(seen);
        assert!(!unseen);
    }

    #[tokio::test]
    #[traced_test]
    async fn activity_hides_plain_posts() {
        // arrange
        let log = audit_log().await;
        log.record("4.4.4.4", "ua", AuditAction::FirstVisit, None).await.unwrap();
        log.record("4.4.4.4", "ua", AuditAction::NormalPost, None).await.unwrap();
        log.record("4.4.4.4", "ua", AuditAction::LoggedIn, Some("sam")).await.unwrap();

        // act
        let all = log.activity(None, 1, 15).await.unwrap();
        let logins = log.activity(Some(AuditAction::LoggedIn), 1, 15).await.unwrap();

        // assert
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, AuditAction::LoggedIn);
        assert_eq!(logins.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn summary_counts_events() {
        // arrange
        let log = audit_log().await;
        log.record("5.5.5.5", "ua", AuditAction::SuspiciousPost, None).await.unwrap();
        log.record("5.5.5.5", "ua", AuditAction::AttackAttempt, None).await.unwrap();
        log.record("5.5.5.5", "ua", AuditAction::LoggedFailed, None).await.unwrap();
        log.record("6.6.6.6", "ua", AuditAction::FirstVisit, None).await.unwrap();

        // act
        let summary = log.summary().await.unwrap();

        // assert
        assert_eq!(summary.suspicious, 2);
        assert_eq!(summary.failed_logins_last_30_days, 1);
        assert_eq!(summary.first_visits, 1);
        assert_eq!(summary.member_form_posts, 0);
        assert_eq!(summary.blocked_clients, 0);
    }
}
