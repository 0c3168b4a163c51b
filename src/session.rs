use std::{sync::Arc, time::Duration};

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{self, keys, Cache},
    error::Result,
    response::{self, SESSION_COOKIE},
    state::AppState,
};

pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// The authenticated user bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub session_key: String,
    pub last_login: DateTime<Utc>,
    pub is_staff: bool,
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn Cache>,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn save(&self, principal: &Principal) -> Result<()> {
        cache::set_json(
            self.cache.as_ref(),
            &keys::user(&principal.session_key),
            principal,
            Some(SESSION_TTL),
        )
        .await?;
        Ok(())
    }

    /// Loads the principal and keeps the session alive.
    pub async fn load(&self, session_key: &str) -> Result<Option<Principal>> {
        let key = keys::user(session_key);
        let principal = cache::get_json::<Principal>(self.cache.as_ref(), &key).await?;
        if principal.is_some() {
            self.cache.touch(&key, SESSION_TTL).await?;
        }
        Ok(principal)
    }

    pub async fn invalidate(&self, session_key: &str) -> Result<()> {
        self.cache.delete(&keys::user(session_key)).await?;
        Ok(())
    }
}

/// Attaches the session's [`Principal`] to the request, if there is one.
pub async fn session_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response> {
    if let Some(session_key) = response::cookie(req.headers(), SESSION_COOKIE) {
        if let Some(principal) = state.sessions.load(&session_key).await? {
            req.extensions_mut().insert(principal);
        }
    }
    Ok(next.run(req).await)
}
