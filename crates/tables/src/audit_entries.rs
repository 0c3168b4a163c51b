use serde::{Deserialize, Serialize};

use crate::{add_if_present, int_enum, Orm, SQL_NOW_UTC_ISO};

use super::{OrmBase, OrmError, RowId};

pub const USER_AGENT_MAX_LEN: usize = 256;

int_enum!(AuditAction {
    FirstVisit = 0,
    LoggedIn = 1,
    LoggedOut = 2,
    LoggedFailed = 3,
    NormalPost = 4,
    SuspiciousPost = 5,
    AttackAttempt = 6,
    MemberFormPost = 7,
});

impl AuditAction {
    pub fn label(&self) -> &'static str {
        match self {
            AuditAction::FirstVisit => "FIRST_VISIT",
            AuditAction::LoggedIn => "LOGGED_IN",
            AuditAction::LoggedOut => "LOGGED_OUT",
            AuditAction::LoggedFailed => "LOGGED_FAILED",
            AuditAction::NormalPost => "NORMAL_POST",
            AuditAction::SuspiciousPost => "SUSPICIOUS_POST",
            AuditAction::AttackAttempt => "ATTACK_ATTEMPT",
            AuditAction::MemberFormPost => "MEMBER_FORM_POST",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: u64,
    pub ip: String,
    pub user_agent: Option<String>,
    pub action: AuditAction,
    pub username: Option<String>,
    pub created_at: String,
}

impl AuditEntry {
    pub fn new(ip: &str, user_agent: &str, action: AuditAction, username: Option<&str>) -> Self {
        let user_agent: String = user_agent.chars().take(USER_AGENT_MAX_LEN).collect();
        Self {
            id: 0,
            ip: ip.to_string(),
            user_agent: Some(user_agent),
            action,
            username: username.map(str::to_string),
            created_at: String::new(),
        }
    }
}

/// Equality/range filter over `audit_entries`, the subset of a queryset the
/// defense pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub ip: Option<String>,
    pub action: Option<AuditAction>,
    pub exclude_action: Option<AuditAction>,
    pub min_id: Option<u64>,
    pub before_id: Option<u64>,
    pub created_since: Option<String>,
}

impl AuditFilter {
    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn exclude_action(mut self, action: AuditAction) -> Self {
        self.exclude_action = Some(action);
        self
    }

    pub fn min_id(mut self, id: u64) -> Self {
        self.min_id = Some(id);
        self
    }

    pub fn before_id(mut self, id: u64) -> Self {
        self.before_id = Some(id);
        self
    }

    pub fn created_since(mut self, iso: String) -> Self {
        self.created_since = Some(iso);
        self
    }

    fn where_clause(&self) -> (String, Vec<String>) {
        let mut columns: Vec<&str> = vec![];
        let mut replacements: Vec<String> = vec![];

        add_if_present!(columns, replacements, self, ip);
        add_if_present!(columns, replacements, self, action);

        let mut clauses: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| format!("{} = ?{}", col, idx + 1))
            .collect();

        let mut push = |clause: &str, value: String| {
            replacements.push(value);
            clauses.push(format!("{} ?{}", clause, replacements.len()));
        };
        if let Some(action) = self.exclude_action {
            push("action !=", action.to_string());
        }
        if let Some(id) = self.min_id {
            push("id >=", id.to_string());
        }
        if let Some(id) = self.before_id {
            push("id <", id.to_string());
        }
        if let Some(since) = &self.created_since {
            push("created_at >=", since.clone());
        }

        if clauses.is_empty() {
            return (String::new(), replacements);
        }
        (format!("where {}", clauses.join(" and ")), replacements)
    }
}

impl AuditEntry {
    pub async fn count(conn: &libsql::Connection, filter: &AuditFilter) -> Result<u64, OrmError> {
        let (clause, replacements) = filter.where_clause();
        let query = format!("select count(*) count from audit_entries {}", clause);

        Orm::<RowId>::count(conn, &query, replacements).await
    }

    pub async fn exists(conn: &libsql::Connection, filter: &AuditFilter) -> Result<bool, OrmError> {
        let (clause, replacements) = filter.where_clause();
        let query = format!(
            "select count(*) count from (select 1 from audit_entries {} limit 1)",
            clause
        );

        Ok(Orm::<RowId>::count(conn, &query, replacements).await? > 0)
    }

    /// Smallest id matching the filter.
    pub async fn first_id(
        conn: &libsql::Connection,
        filter: &AuditFilter,
    ) -> Result<Option<u64>, OrmError> {
        let (clause, replacements) = filter.where_clause();
        let query = format!(
            "select id from audit_entries {} order by id asc limit 1",
            clause
        );
        let rows = Orm::<RowId>::query(conn, &query, replacements).await?;

        Ok(rows.first().map(|row| row.id))
    }

    /// Id of the most recently inserted row.
    pub async fn last_id(conn: &libsql::Connection) -> Result<Option<u64>, OrmError> {
        let query = "select id from audit_entries order by id desc limit 1";
        let rows = Orm::<RowId>::query(conn, &query.to_string(), vec![]).await?;

        Ok(rows.first().map(|row| row.id))
    }

    pub async fn delete_where(
        conn: &libsql::Connection,
        filter: &AuditFilter,
    ) -> Result<u64, OrmError> {
        let (clause, replacements) = filter.where_clause();
        if clause.is_empty() {
            return Err(OrmError::BadInput(
                "refusing to delete every audit entry".to_string(),
            ));
        }
        let query = format!("delete from audit_entries {}", clause);

        Orm::<AuditEntry>::execute(conn, &query, replacements).await
    }

    /// Newest first.
    pub async fn page(
        conn: &libsql::Connection,
        filter: &AuditFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Self>, OrmError> {
        let (clause, mut replacements) = filter.where_clause();
        let query = format!(
            "select * from audit_entries {} order by id desc limit ?{} offset ?{}",
            clause,
            replacements.len() + 1,
            replacements.len() + 2,
        );
        replacements.push(limit.to_string());
        replacements.push(offset.to_string());

        Orm::<AuditEntry>::query(conn, &query, replacements).await
    }
}

impl OrmBase<AuditEntry> for AuditEntry {
    async fn create(&self, conn: &libsql::Connection) -> Result<u64, OrmError> {
        if self.ip.is_empty() {
            return Err(OrmError::BadInput("audit entry requires an ip".to_string()));
        }

        let mut columns = vec!["ip", "action"];
        let mut replacements = vec![self.ip.clone(), self.action.to_string()];

        add_if_present!(columns, replacements, self, user_agent);
        add_if_present!(columns, replacements, self, username);

        let query = format!(
            "insert into audit_entries (
                {}, created_at
            ) values (
                {}, {}
            ) returning id",
            columns.join(", "),
            Orm::<AuditEntry>::placeholders(columns.len()),
            SQL_NOW_UTC_ISO,
        );

        let rows = Orm::<RowId>::query(conn, &query, replacements).await?;

        match rows.first() {
            None => Err(OrmError::NoChange("No audit entry created".to_string())),
            Some(row) => Ok(row.id),
        }
    }

    async fn get(conn: &libsql::Connection, id: u64) -> Result<Option<Self>, OrmError> {
        let query = "select * from audit_entries where id = ?1 limit 1";
        let rows = Orm::<AuditEntry>::query(conn, &query.to_string(), vec![id.to_string()]).await?;

        Ok(rows.into_iter().next())
    }

    async fn update(&mut self, _conn: &libsql::Connection) -> Result<(), OrmError> {
        Err(OrmError::BadInput("audit entries are immutable".to_string()))
    }

    async fn delete(&self, conn: &libsql::Connection) -> Result<(), OrmError> {
        let query = "delete from audit_entries where id = ?1";
        let affected =
            Orm::<AuditEntry>::execute(conn, &query.to_string(), vec![self.id.to_string()]).await?;

        if affected == 0 {
            return Err(OrmError::NotFound("delete audit entry".to_string(), Some(self.id)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::conn;
    use rand::Rng;
    use tracing_test::traced_test;

    fn random_ip() -> String {
        let mut rng = rand::thread_rng();
        format!("10.{}.{}.{}", rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>())
    }

    #[tokio::test]
    #[traced_test]
    async fn create_assigns_monotonic_ids() {
        // arrange
        let conn = conn().await;
        let ip = random_ip();

        // act
        let first = AuditEntry::new(&ip, "ua", AuditAction::FirstVisit, None)
            .create(&conn)
            .await
            .unwrap();
        let second = AuditEntry::new(&ip, "ua", AuditAction::NormalPost, Some("sam"))
            .create(&conn)
            .await
            .unwrap();

        // assert
        assert!(second > first);
        let stored = AuditEntry::get(&conn, second).await.unwrap().unwrap();
        assert_eq!(stored.action, AuditAction::NormalPost);
        assert_eq!(stored.username, Some("sam".to_string()));
        assert!(stored.created_at.ends_with('Z'));
    }

    #[tokio::test]
    #[traced_test]
    async fn user_agent_is_truncated() {
        // arrange
        let conn = conn().await;
        let long_agent = "x".repeat(400);

        // act
        let id = AuditEntry::new("10.0.0.1", &long_agent, AuditAction::FirstVisit, None)
            .create(&conn)
            .await
            .unwrap();

        // assert
        let stored = AuditEntry::get(&conn, id).await.unwrap().unwrap();
        assert_eq!(stored.user_agent.unwrap().len(), USER_AGENT_MAX_LEN);
    }

    #[tokio::test]
    #[traced_test]
    async fn filters_by_ip_action_and_id() {
        // arrange
        let conn = conn().await;
        for action in [
            AuditAction::LoggedFailed,
            AuditAction::LoggedFailed,
            AuditAction::NormalPost,
        ] {
            AuditEntry::new("10.0.0.1", "ua", action, None)
                .create(&conn)
                .await
                .unwrap();
        }
        AuditEntry::new("10.0.0.2", "ua", AuditAction::LoggedFailed, None)
            .create(&conn)
            .await
            .unwrap();

        // act
        let failed = AuditFilter::default()
            .ip("10.0.0.1")
            .action(AuditAction::LoggedFailed);
        let count = AuditEntry::count(&conn, &failed).await.unwrap();
        let recent = AuditEntry::count(&conn, &failed.clone().min_id(2)).await.unwrap();

        // assert
        assert_eq!(count, 2);
        assert_eq!(recent, 1);
        assert!(AuditEntry::exists(&conn, &AuditFilter::default().ip("10.0.0.2"))
            .await
            .unwrap());
        assert!(!AuditEntry::exists(&conn, &AuditFilter::default().ip("10.0.0.3"))
            .await
            .unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_where_refuses_unfiltered() {
        // arrange
        let conn = conn().await;

        // act
        let res = AuditEntry::delete_where(&conn, &AuditFilter::default()).await;

        // assert
        assert!(matches!(res, Err(OrmError::BadInput(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn entries_are_immutable() {
        // arrange
        let conn = conn().await;
        let id = AuditEntry::new("10.0.0.1", "ua", AuditAction::LoggedIn, Some("sam"))
            .create(&conn)
            .await
            .unwrap();
        let mut entry = AuditEntry::get(&conn, id).await.unwrap().unwrap();

        // act
        let res = entry.update(&conn).await;

        // assert
        assert!(res.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn page_excludes_action_newest_first() {
        // arrange
        let conn = conn().await;
        for action in [
            AuditAction::FirstVisit,
            AuditAction::NormalPost,
            AuditAction::AttackAttempt,
        ] {
            AuditEntry::new("10.0.0.1", "ua", action, None)
                .create(&conn)
                .await
                .unwrap();
        }

        // act
        let rows = AuditEntry::page(
            &conn,
            &AuditFilter::default().exclude_action(AuditAction::NormalPost),
            10,
            0,
        )
        .await
        .unwrap();

        // assert
        let actions: Vec<AuditAction> = rows.iter().map(|row| row.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::AttackAttempt, AuditAction::FirstVisit]
        );
    }
}
