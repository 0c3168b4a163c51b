use std::str::FromStr;

#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn secret_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("secret", &"********")
            .finish()
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("********")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

trait ToSecret {
    fn to_secret(self) -> Secret;
}

impl ToSecret for String {
    fn to_secret(self) -> Secret {
        Secret(self)
    }
}

/// Named routes the pipeline redirects to or applies per-route throttles on.
#[derive(Debug, Clone)]
pub struct Routes {
    pub index: String,
    pub login: String,
    pub logout: String,
    pub unauthorized: String,
    pub member_form: String,
    pub donation: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            index: "/".to_string(),
            login: "/login".to_string(),
            logout: "/logout".to_string(),
            unauthorized: "/unauthorized".to_string(),
            member_form: "/member/form".to_string(),
            donation: "/donate".to_string(),
        }
    }
}

/// Hard request limits; exceeding any is treated as a malformed payload.
///
/// `max_body_bytes` covers everything but uploaded files, which are bounded
/// by the `IMAGE_MAX_SIZE` parameter instead.
#[derive(Debug, Clone)]
pub struct PayloadLimits {
    pub max_body_bytes: usize,
    pub max_fields: usize,
    pub max_files: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 2_621_440,
            max_fields: 1000,
            max_files: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Environment {
    pub dev_mode: bool,
    pub production: bool,
    pub port: u16,
    pub db_path: String,
    pub db_url: Option<String>,
    pub db_auth_token: Option<Secret>,
    pub redis_url: Option<String>,
    pub admin_token: Secret,
    pub limits: PayloadLimits,
    pub routes: Routes,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            dev_mode: true,
            production: false,
            port: 3000,
            db_path: ":memory:".to_string(),
            db_url: None,
            db_auth_token: None,
            redis_url: None,
            admin_token: "admin".to_string().to_secret(),
            limits: PayloadLimits::default(),
            routes: Routes::default(),
        }
    }
}

impl Environment {
    const PREFIX: &'static str = "GATEKEEPER_";

    fn optional(key: &str) -> Option<String> {
        let full_key = format!("{}{}", Self::PREFIX, key);
        std::env::var(full_key).ok().filter(|v| !v.is_empty())
    }

    fn string(key: &str) -> eyre::Result<String> {
        Self::optional(key).ok_or_else(|| eyre::eyre!("{}{} is required", Self::PREFIX, key))
    }

    fn string_or(key: &str, default: &str) -> String {
        Self::optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed_or<T>(key: &str, default: T) -> eyre::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| eyre::eyre!("invalid {}{}: {}", Self::PREFIX, key, e)),
        }
    }

    fn secret(key: &str) -> eyre::Result<Secret> {
        Ok(Self::string(key)?.to_secret())
    }

    pub fn new() -> eyre::Result<Self> {
        let _ = dotenvy::dotenv();

        let defaults = Routes::default();
        let routes = Routes {
            index: Self::string_or("ROUTE_INDEX", &defaults.index),
            login: Self::string_or("ROUTE_LOGIN", &defaults.login),
            logout: Self::string_or("ROUTE_LOGOUT", &defaults.logout),
            unauthorized: Self::string_or("ROUTE_UNAUTHORIZED", &defaults.unauthorized),
            member_form: Self::string_or("ROUTE_MEMBER_FORM", &defaults.member_form),
            donation: Self::string_or("ROUTE_DONATION", &defaults.donation),
        };

        let limits = PayloadLimits::default();
        let limits = PayloadLimits {
            max_body_bytes: Self::parsed_or("MAX_BODY_BYTES", limits.max_body_bytes)?,
            max_fields: Self::parsed_or("MAX_FIELDS", limits.max_fields)?,
            max_files: Self::parsed_or("MAX_FILES", limits.max_files)?,
        };

        Ok(Self {
            dev_mode: Self::parsed_or("DEV_MODE", false)?,
            production: Self::parsed_or("PRODUCTION", true)?,
            port: Self::parsed_or("PORT", 3000)?,
            db_path: Self::string_or("DB_PATH", "gatekeeper.sqlite"),
            db_url: Self::optional("DB_URL"),
            db_auth_token: Self::optional("DB_AUTH_TOKEN").map(ToSecret::to_secret),
            redis_url: Self::optional("REDIS_URL"),
            admin_token: Self::secret("ADMIN_TOKEN")?,
            limits,
            routes,
        })
    }
}
