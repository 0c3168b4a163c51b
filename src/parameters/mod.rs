//! Typed runtime configuration.
//!
//! Reads go cache first, then storage, then the compiled-in default table.
//! Writes validate against the declared type before anything is persisted.
//!
//! Two failure modes are part of the contract and differ on purpose:
//! a key unknown to both storage and the defaults is
//! [`Error::UnknownParameter`], while a known key whose stored text does not
//! parse under its type is [`Error::InvalidValue`].

pub mod defaults;
mod value;

pub use value::{parse_bool, Value};

use std::{sync::Arc, time::Duration};

use tables::{
    parameters::{AccessLevel, Parameter},
    OrmBase,
};

use crate::{
    cache::{self, keys, Cache, CacheError},
    database::Database,
    error::{Error, Result},
};

pub const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct ParameterStore {
    cache: Arc<dyn Cache>,
    database: Database,
}

impl ParameterStore {
    pub fn new(cache: Arc<dyn Cache>, database: Database) -> Self {
        Self { cache, database }
    }

    async fn cached(&self, name: &str) -> Result<Option<Parameter>> {
        match cache::get_json::<Parameter>(self.cache.as_ref(), &keys::parameter(name)).await {
            Ok(found) => Ok(found),
            Err(CacheError::Decode { key, reason }) => {
                tracing::warn!(kind = "parameter", key = key, reason = reason, "Dropping undecodable cache entry");
                self.cache.delete(&key).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, name: &str) -> Result<Option<Parameter>> {
        if let Some(parameter) = self.cached(name).await? {
            return Ok(Some(parameter));
        }

        tracing::info!(kind = "parameter", name = name, "Parameter not cached, reading storage");
        let conn = self.database.conn()?;
        let stored = Parameter::get_by_name(&conn, name).await?;
        if let Some(parameter) = &stored {
            cache::set_json(self.cache.as_ref(), &keys::parameter(name), parameter, Some(CACHE_TTL))
                .await?;
        }
        Ok(stored)
    }

    pub async fn get(&self, name: &str) -> Result<Value> {
        if let Some(parameter) = self.load(name).await? {
            return Value::parse(parameter.data_type, &parameter.value).ok_or_else(|| {
                Error::InvalidValue {
                    name: name.to_string(),
                    value: parameter.value.clone(),
                }
            });
        }

        if name != defaults::TEST {
            tracing::warn!(kind = "parameter", name = name, "Parameter missing from storage, using default");
        }
        let default = defaults::lookup(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        Value::parse(default.data_type, default.value).ok_or_else(|| Error::InvalidValue {
            name: name.to_string(),
            value: default.value.to_string(),
        })
    }

    pub async fn get_i64(&self, name: &str) -> Result<i64> {
        let value = self.get(name).await?;
        value.as_i64().ok_or_else(|| Error::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub async fn get_f64(&self, name: &str) -> Result<f64> {
        let value = self.get(name).await?;
        value.as_f64().ok_or_else(|| Error::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub async fn get_bool(&self, name: &str) -> Result<bool> {
        let value = self.get(name).await?;
        value.as_bool().ok_or_else(|| Error::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub async fn get_string(&self, name: &str) -> Result<String> {
        Ok(self.get(name).await?.to_string())
    }

    /// Non-negative integer parameter, for counts and durations.
    pub async fn get_u64(&self, name: &str) -> Result<u64> {
        let value = self.get_i64(name).await?;
        u64::try_from(value).map_err(|_| Error::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Validates `raw` against the declared type, persists it, then refreshes
    /// the cache. A parameter known only to the defaults gets its row created.
    pub async fn set(&self, name: &str, raw: &str) -> Result<Parameter> {
        let conn = self.database.conn()?;
        let stored = Parameter::get_by_name(&conn, name).await?;
        let data_type = match (&stored, defaults::lookup(name)) {
            (Some(parameter), _) => parameter.data_type,
            (None, Some(default)) => default.data_type,
            (None, None) => return Err(Error::UnknownParameter(name.to_string())),
        };

        if Value::parse(data_type, raw).is_none() {
            return Err(Error::Validation(format!(
                "{} must be a valid {}, got {:?}",
                name,
                data_type.label(),
                raw
            )));
        }

        let parameter = match stored {
            Some(_) => {
                Parameter::set_value(&conn, name, raw).await?;
                Parameter::get_by_name(&conn, name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("parameter {name}")))?
            }
            None => {
                let mut parameter = defaults::lookup(name)
                    .map(|default| default.to_parameter())
                    .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
                parameter.value = raw.to_string();
                let id = parameter.create(&conn).await?;
                Parameter::get(&conn, id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("parameter {name}")))?
            }
        };

        cache::set_json(self.cache.as_ref(), &keys::parameter(name), &parameter, Some(CACHE_TTL))
            .await?;
        tracing::info!(kind = "parameter", name = name, value = raw, "Parameter updated");

        Ok(parameter)
    }

    /// Edit path of the admin API. System-controlled parameters are refused.
    pub async fn update_from_admin(&self, name: &str, raw: &str) -> Result<Parameter> {
        let conn = self.database.conn()?;
        let access_level = match Parameter::get_by_name(&conn, name).await? {
            Some(parameter) => parameter.access_level,
            None => defaults::lookup(name)
                .map(|default| default.access_level)
                .ok_or_else(|| Error::UnknownParameter(name.to_string()))?,
        };

        if access_level == AccessLevel::None {
            tracing::warn!(kind = "parameter", name = name, "Refused admin edit of system parameter");
            return Err(Error::ParameterAccess(name.to_string()));
        }

        self.set(name, raw).await
    }

    pub async fn list(&self) -> Result<Vec<Parameter>> {
        let conn = self.database.conn()?;
        Ok(Parameter::all(&conn).await?)
    }

    /// Inserts every default missing from storage. Returns how many were added.
    pub async fn seed_defaults(&self) -> Result<usize> {
        let conn = self.database.conn()?;
        let mut added = 0;
        for default in defaults::seedable() {
            if Parameter::exists(&conn, default.name).await? {
                continue;
            }
            default.to_parameter().create(&conn).await?;
            tracing::info!(kind = "parameter", name = default.name, value = default.value, "Default parameter added");
            added += 1;
        }
        Ok(added)
    }

    /// Drops every cached parameter so the next reads come from storage.
    pub async fn invalidate_cache(&self) -> Result<u64> {
        Ok(self.cache.delete_prefix(keys::PARAMETER_PREFIX).await?)
    }
}
