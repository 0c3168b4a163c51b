use std::{any::Any, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::{
    cache::keys,
    defense::{middleware::client_ip, middleware::user_agent, ClientInfo, Notice},
    error::{FailureKind, Result},
    parameters::defaults,
    response::{self, SESSION_COOKIE},
    session::Principal,
    state::AppState,
};

/// Window in which a repeat of the same failure counts as the second strike.
pub const EXCEPTION_TTL: Duration = Duration::from_secs(60);

// Admin API authentication
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = req.headers().get(header::AUTHORIZATION);

    match auth_header {
        Some(header) => {
            if let Some(token) = header
                .to_str()
                .ok()
                .and_then(|value| value.strip_prefix("Bearer "))
            {
                if token == state.env.admin_token.secret_str() {
                    return next.run(req).await;
                }
            }
            tracing::warn!(kind = "auth", "Invalid admin token");
            (StatusCode::UNAUTHORIZED, "Invalid API token").into_response()
        }
        None => (StatusCode::UNAUTHORIZED, "API token required").into_response(),
    }
}

/// Logs out principals whose last login is older than `TIME_OUT_PERIOD`
/// minutes.
pub async fn session_timeout_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response> {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return Ok(next.run(req).await);
    };

    let time_out = state.parameters.get_i64(defaults::TIME_OUT_PERIOD).await?;
    if principal.last_login >= Utc::now() - chrono::Duration::minutes(time_out) {
        return Ok(next.run(req).await);
    }

    state.sessions.invalidate(&principal.session_key).await?;
    if let Ok(ip) = client_ip(&req) {
        let client = ClientInfo::new(&ip, &user_agent(req.headers()));
        state.defense.record_logout(&client, &principal.username).await?;
    }
    tracing::info!(kind = "session", username = principal.username, "Session timed out");

    let mut response = response::redirect(&state.env.routes.index, Some(Notice::TimeOut));
    response::clear_session(&mut response);
    Ok(response)
}

/// Two-strikes breaker over unexpected failures, keyed by client and failure
/// kind. The first strike gets a generic failure page; a repeat inside
/// [`EXCEPTION_TTL`] ends the session and sends the client home.
pub async fn error_containment_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&req).ok();
    let session_key = response::cookie(req.headers(), SESSION_COOKIE);

    let response = next.run(req).await;

    let Some(kind) = response.extensions().get::<FailureKind>().copied() else {
        return response;
    };
    if kind.is_expected() || !state.env.production {
        return response;
    }
    let Some(ip) = ip else {
        return response;
    };

    match state
        .cache
        .add(&keys::exception(&ip, kind.0), "1", Some(EXCEPTION_TTL))
        .await
    {
        Ok(true) => {
            tracing::warn!(kind = "containment", ip = ip, failure = kind.0, "First strike");
            response::failure_page()
        }
        Ok(false) => {
            tracing::warn!(kind = "containment", ip = ip, failure = kind.0, "Second strike, ending session");
            if let Some(session_key) = session_key {
                if let Err(e) = state.sessions.invalidate(&session_key).await {
                    tracing::error!(kind = "containment", error = %e, "Failed to end session");
                }
            }
            let mut redirect =
                response::redirect(&state.env.routes.index, Some(Notice::SomethingWrong));
            response::clear_session(&mut redirect);
            redirect
        }
        Err(e) => {
            tracing::error!(kind = "containment", error = %e, "Breaker unavailable");
            response::failure_page()
        }
    }
}

/// Panic handler for `CatchPanicLayer`; marks the response so the breaker
/// counts it.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(kind = "panic", detail = detail, "Handler panicked");

    let mut response = response::failure_page();
    response.extensions_mut().insert(FailureKind::PANIC);
    response
}
