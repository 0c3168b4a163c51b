use serde::{Deserialize, Serialize};

use crate::{audit_entries::USER_AGENT_MAX_LEN, int_enum, Orm, SQL_NOW_UTC_ISO};

use super::{OrmBase, OrmError, RowId};

int_enum!(BlockType {
    Unblocked = 0,
    Temporary = 1,
    Indefinite = 2,
});

impl BlockType {
    pub fn label(&self) -> &'static str {
        match self {
            BlockType::Unblocked => "UNBLOCKED",
            BlockType::Temporary => "TEMPORARY",
            BlockType::Indefinite => "INDEFINITE",
        }
    }

    pub fn is_blocked(&self) -> bool {
        !matches!(self, BlockType::Unblocked)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlockedClient {
    pub id: u64,
    pub ip: String,
    pub user_agent: Option<String>,
    pub block_type: BlockType,
    pub blocked_times: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl BlockedClient {
    pub fn new(ip: &str, user_agent: &str, block_type: BlockType) -> Self {
        Self {
            id: 0,
            ip: ip.to_string(),
            user_agent: Some(user_agent.chars().take(USER_AGENT_MAX_LEN).collect()),
            block_type,
            blocked_times: 1,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub async fn get_by_ip(
        conn: &libsql::Connection,
        ip: &str,
    ) -> Result<Option<Self>, OrmError> {
        let query = "select * from blocked_clients where ip = ?1 limit 1";
        let rows = Orm::<BlockedClient>::query(conn, &query.to_string(), vec![ip.to_string()]).await?;

        Ok(rows.into_iter().next())
    }

    /// Clients whose block type is anything but `Unblocked`.
    pub async fn count_blocked(conn: &libsql::Connection) -> Result<u64, OrmError> {
        let query = "select count(*) count from blocked_clients where block_type != ?1";

        Orm::<RowId>::count(
            conn,
            &query.to_string(),
            vec![BlockType::Unblocked.to_string()],
        )
        .await
    }

    /// Records one more offense against an existing row in a single
    /// statement, so concurrent offenses are all counted. An indefinite block
    /// stays indefinite; otherwise the row becomes indefinite when the offense
    /// is severe or the client already collected `max_temporary - 1` blocks.
    /// `None` when the client has no row yet.
    pub async fn escalate(
        conn: &libsql::Connection,
        ip: &str,
        indefinitely: bool,
        max_temporary: u64,
    ) -> Result<Option<Self>, OrmError> {
        let query = format!(
            "update blocked_clients set
                block_type = case
                    when cast(?1 as integer) = 1
                        or block_type = {indefinite}
                        or blocked_times >= cast(?2 as integer)
                    then {indefinite}
                    else {temporary}
                end,
                blocked_times = blocked_times + 1,
                updated_at = {now}
            where ip = ?3
            returning *",
            indefinite = BlockType::Indefinite,
            temporary = BlockType::Temporary,
            now = SQL_NOW_UTC_ISO,
        );
        let replacements = vec![
            u8::from(indefinitely).to_string(),
            max_temporary.saturating_sub(1).to_string(),
            ip.to_string(),
        ];
        let rows = Orm::<BlockedClient>::query(conn, &query, replacements).await?;

        Ok(rows.into_iter().next())
    }

    pub async fn all(conn: &libsql::Connection) -> Result<Vec<Self>, OrmError> {
        let query = "select * from blocked_clients order by updated_at desc";

        Orm::<BlockedClient>::query(conn, &query.to_string(), vec![]).await
    }
}

impl OrmBase<BlockedClient> for BlockedClient {
    async fn create(&self, conn: &libsql::Connection) -> Result<u64, OrmError> {
        if self.ip.is_empty() {
            return Err(OrmError::BadInput("blocked client requires an ip".to_string()));
        }

        let columns = vec!["ip", "user_agent", "block_type", "blocked_times"];
        let replacements = vec![
            self.ip.clone(),
            self.user_agent.clone().unwrap_or_default(),
            self.block_type.to_string(),
            self.blocked_times.to_string(),
        ];

        let query = format!(
            "insert into blocked_clients (
                {}, created_at, updated_at
            ) values (
                {}, {}, {}
            ) returning id",
            columns.join(", "),
            Orm::<BlockedClient>::placeholders(columns.len()),
            SQL_NOW_UTC_ISO,
            SQL_NOW_UTC_ISO
        );

        let rows = Orm::<RowId>::query(conn, &query, replacements).await?;

        match rows.first() {
            None => Err(OrmError::NoChange("No blocked client created".to_string())),
            Some(row) => Ok(row.id),
        }
    }

    async fn get(conn: &libsql::Connection, id: u64) -> Result<Option<Self>, OrmError> {
        let query = "select * from blocked_clients where id = ?1 limit 1";
        let rows = Orm::<BlockedClient>::query(conn, &query.to_string(), vec![id.to_string()]).await?;

        Ok(rows.into_iter().next())
    }

    /// Persists `block_type` and `blocked_times` and stamps `updated_at`,
    /// which is what temporary blocks are measured from.
    async fn update(&mut self, conn: &libsql::Connection) -> Result<(), OrmError> {
        let existing = match BlockedClient::get(conn, self.id).await? {
            Some(existing) => existing,
            None => {
                return Err(OrmError::NotFound(
                    "update blocked client".to_string(),
                    Some(self.id),
                ))
            }
        };

        if self.blocked_times < existing.blocked_times {
            return Err(OrmError::BadInput(
                "blocked_times can only increase".to_string(),
            ));
        }

        let columns = vec!["block_type", "blocked_times"];
        let mut replacements = vec![self.block_type.to_string(), self.blocked_times.to_string()];

        let query = format!(
            "update blocked_clients set
                updated_at = {},
                {}
            where id = ?{}",
            SQL_NOW_UTC_ISO,
            Orm::<BlockedClient>::update_placeholders(&columns),
            columns.len() + 1,
        );
        replacements.push(self.id.to_string());

        Orm::<BlockedClient>::execute(conn, &query, replacements).await?;

        if let Some(stored) = BlockedClient::get(conn, self.id).await? {
            *self = stored;
        }

        Ok(())
    }

    async fn delete(&self, conn: &libsql::Connection) -> Result<(), OrmError> {
        let query = "delete from blocked_clients where id = ?1";
        let affected =
            Orm::<BlockedClient>::execute(conn, &query.to_string(), vec![self.id.to_string()])
                .await?;

        if affected == 0 {
            return Err(OrmError::NotFound(
                "delete blocked client".to_string(),
                Some(self.id),
            ));
        }

        Ok(())
    }
}
