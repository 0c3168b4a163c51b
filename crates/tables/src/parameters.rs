use serde::{Deserialize, Serialize};

use crate::{int_enum, Orm, SQL_NOW_UTC_ISO};

use super::{OrmBase, OrmError, RowId};

int_enum!(AccessLevel {
    None = 0,
    Admin = 1,
    Full = 2,
});

int_enum!(DataType {
    String = 0,
    Integer = 1,
    Float = 2,
    Boolean = 3,
});

impl DataType {
    pub fn label(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Parameter {
    pub id: u64,
    pub name: String,
    pub value: String,
    pub access_level: AccessLevel,
    pub data_type: DataType,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Parameter {
    pub fn new(
        name: &str,
        value: &str,
        access_level: AccessLevel,
        data_type: DataType,
        description: &str,
    ) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            value: value.to_string(),
            access_level,
            data_type,
            description: Some(description.to_string()),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub async fn get_by_name(
        conn: &libsql::Connection,
        name: &str,
    ) -> Result<Option<Self>, OrmError> {
        let query = "select * from parameters where name = ?1 limit 1";
        let rows = Orm::<Parameter>::query(conn, &query.to_string(), vec![name.to_string()]).await?;

        Ok(rows.into_iter().next())
    }

    pub async fn exists(conn: &libsql::Connection, name: &str) -> Result<bool, OrmError> {
        let query = "select count(*) count from parameters where name = ?1";
        let count = Orm::<RowId>::count(conn, &query.to_string(), vec![name.to_string()]).await?;

        Ok(count > 0)
    }

    pub async fn all(conn: &libsql::Connection) -> Result<Vec<Self>, OrmError> {
        let query = "select * from parameters order by name";

        Orm::<Parameter>::query(conn, &query.to_string(), vec![]).await
    }

    /// Writes a new raw value. Validation of the value against `data_type`
    /// belongs to the caller.
    pub async fn set_value(
        conn: &libsql::Connection,
        name: &str,
        value: &str,
    ) -> Result<(), OrmError> {
        let query = format!(
            "update parameters set value = ?1, updated_at = {} where name = ?2",
            SQL_NOW_UTC_ISO
        );
        let affected =
            Orm::<Parameter>::execute(conn, &query, vec![value.to_string(), name.to_string()])
                .await?;

        if affected == 0 {
            return Err(OrmError::NotFound(format!("parameter {name}"), None));
        }

        Ok(())
    }
}

impl OrmBase<Parameter> for Parameter {
    async fn create(&self, conn: &libsql::Connection) -> Result<u64, OrmError> {
        if self.name.is_empty() {
            return Err(OrmError::BadInput("parameter name is required".to_string()));
        }

        let columns = vec![
            "name",
            "value",
            "access_level",
            "data_type",
            "description",
        ];
        let replacements = vec![
            self.name.clone(),
            self.value.clone(),
            self.access_level.to_string(),
            self.data_type.to_string(),
            self.description.clone().unwrap_or_default(),
        ];

        let query = format!(
            "insert into parameters (
                {}, created_at, updated_at
            ) values (
                {}, {}, {}
            ) returning id",
            columns.join(", "),
            Orm::<Parameter>::placeholders(columns.len()),
            SQL_NOW_UTC_ISO,
            SQL_NOW_UTC_ISO
        );

        let rows = Orm::<RowId>::query(conn, &query, replacements).await?;

        match rows.first() {
            None => Err(OrmError::NoChange("No parameter created".to_string())),
            Some(row) => Ok(row.id),
        }
    }

    async fn get(conn: &libsql::Connection, id: u64) -> Result<Option<Self>, OrmError> {
        let query = "select * from parameters where id = ?1 limit 1";
        let rows = Orm::<Parameter>::query(conn, &query.to_string(), vec![id.to_string()]).await?;

        Ok(rows.into_iter().next())
    }

    async fn update(&mut self, conn: &libsql::Connection) -> Result<(), OrmError> {
        if Parameter::get(conn, self.id).await?.is_none() {
            return Err(OrmError::NotFound("update parameter".to_string(), Some(self.id)));
        }

        let columns = vec!["value", "description"];
        let mut replacements = vec![
            self.value.clone(),
            self.description.clone().unwrap_or_default(),
        ];

        let query = format!(
            "update parameters set
                updated_at = {},
                {}
            where id = ?{}",
            SQL_NOW_UTC_ISO,
            Orm::<Parameter>::update_placeholders(&columns),
            columns.len() + 1,
        );
        replacements.push(self.id.to_string());

        Orm::<Parameter>::execute(conn, &query, replacements).await?;

        if let Some(stored) = Parameter::get(conn, self.id).await? {
            *self = stored;
        }

        Ok(())
    }

    async fn delete(&self, conn: &libsql::Connection) -> Result<(), OrmError> {
        let query = "delete from parameters where id = ?1";
        let affected =
            Orm::<Parameter>::execute(conn, &query.to_string(), vec![self.id.to_string()]).await?;

        if affected == 0 {
            return Err(OrmError::NotFound("delete parameter".to_string(), Some(self.id)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::conn;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn create_and_get_by_name() {
        // arrange
        let conn = conn().await;
        let param = Parameter::new(
            "MAX_TEMPORARY_BLOCK",
            "5",
            AccessLevel::Admin,
            DataType::Integer,
            "Temporary blocks before an indefinite block.",
        );

        // act
        let id = param.create(&conn).await.unwrap();
        let stored = Parameter::get_by_name(&conn, "MAX_TEMPORARY_BLOCK")
            .await
            .unwrap()
            .unwrap();

        // assert
        assert_eq!(id, 1);
        assert_eq!(stored.value, "5");
        assert_eq!(stored.access_level, AccessLevel::Admin);
        assert_eq!(stored.data_type, DataType::Integer);
        assert!(!stored.created_at.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn duplicate_names_are_rejected() {
        // arrange
        let conn = conn().await;
        let param = Parameter::new("TEST", "a", AccessLevel::None, DataType::String, "");
        param.create(&conn).await.unwrap();

        // act
        let res = param.create(&conn).await;

        // assert
        assert!(res.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn set_value_updates_row() {
        // arrange
        let conn = conn().await;
        Parameter::new("A", "1", AccessLevel::Full, DataType::Integer, "")
            .create(&conn)
            .await
            .unwrap();

        // act
        Parameter::set_value(&conn, "A", "7").await.unwrap();

        // assert
        let stored = Parameter::get_by_name(&conn, "A").await.unwrap().unwrap();
        assert_eq!(stored.value, "7");
        assert!(Parameter::exists(&conn, "A").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn set_value_on_missing_row() {
        // arrange
        let conn = conn().await;

        // act
        let res = Parameter::set_value(&conn, "MISSING", "7").await;

        // assert
        assert_eq!(
            res.unwrap_err(),
            OrmError::NotFound("parameter MISSING".to_string(), None)
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn round_trips_through_json() {
        // arrange
        let conn = conn().await;
        Parameter::new("B", "yes", AccessLevel::Admin, DataType::Boolean, "flag")
            .create(&conn)
            .await
            .unwrap();
        let stored = Parameter::get_by_name(&conn, "B").await.unwrap().unwrap();

        // act
        let raw = serde_json::to_string(&stored);

        // assert
        let back: Parameter = serde_json::from_str(&raw.unwrap()).unwrap();
        assert_eq!(back, stored);
    }
}
