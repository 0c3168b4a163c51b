//! Minimal site the pipeline guards: landing page, staff login/logout and
//! the two throttled public forms.

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Extension, Form, Router,
};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;

use crate::{
    defense::ClientInfo,
    env::Routes,
    error::{Error, Result},
    response::{self, SESSION_COOKIE},
    session::Principal,
    state::AppState,
};

const SESSION_KEY_LEN: usize = 32;

pub fn router(routes: &Routes) -> Router<AppState> {
    Router::new()
        .route(&routes.index, get(index))
        .route(&routes.login, get(login_form).post(login))
        .route(&routes.logout, get(logout).post(logout))
        .route(&routes.unauthorized, get(unauthorized))
        .route(&routes.member_form, get(member_form).post(submitted))
        .route(&routes.donation, get(donation_form).post(submitted))
}

async fn index(principal: Option<Extension<Principal>>) -> Html<String> {
    match principal {
        Some(Extension(principal)) => Html(format!("<h1>Welcome back, {}</h1>", principal.username)),
        None => Html("<h1>Welcome</h1>".to_string()),
    }
}

async fn login_form() -> Html<&'static str> {
    Html(
        r#"<form method="post">
  <input name="username"><input name="password" type="password">
  <button>Log in</button>
</form>"#,
    )
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Staff login. The admin token doubles as the staff password.
async fn login(
    State(state): State<AppState>,
    Extension(client): Extension<ClientInfo>,
    Form(credentials): Form<Credentials>,
) -> Result<Response> {
    let success = credentials.password == state.env.admin_token.secret_str();
    let feedback = state
        .defense
        .record_login_result(&client, &credentials.username, success)
        .await?;

    if !success {
        let mut body = "<p>Wrong username or password</p>".to_string();
        if feedback.warn {
            body.push_str(&format!(
                "<p>{} attempts left before this device is blocked</p>",
                feedback.remaining
            ));
        }
        return Ok((StatusCode::UNAUTHORIZED, Html(body)).into_response());
    }

    let session_key: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_KEY_LEN)
        .map(char::from)
        .collect();
    let principal = Principal {
        username: credentials.username,
        session_key: session_key.clone(),
        last_login: Utc::now(),
        is_staff: true,
    };
    state.sessions.save(&principal).await?;

    let mut response = response::redirect(&state.env.routes.index, None);
    let cookie = format!("{SESSION_COOKIE}={session_key}; Path=/; HttpOnly; SameSite=Lax");
    let value = HeaderValue::from_str(&cookie)
        .map_err(|e| Error::Validation(format!("session cookie: {e}")))?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(response)
}

async fn logout(
    State(state): State<AppState>,
    Extension(client): Extension<ClientInfo>,
    principal: Option<Extension<Principal>>,
) -> Result<Response> {
    if let Some(Extension(principal)) = principal {
        state.sessions.invalidate(&principal.session_key).await?;
        state.defense.record_logout(&client, &principal.username).await?;
    }
    let mut response = response::redirect(&state.env.routes.index, None);
    response::clear_session(&mut response);
    Ok(response)
}

async fn unauthorized() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::FORBIDDEN,
        Html("<h1>You are not allowed to see this page</h1>"),
    )
}

async fn member_form() -> Html<&'static str> {
    Html(r#"<form method="post"><input name="name"><button>Register</button></form>"#)
}

async fn donation_form() -> Html<&'static str> {
    Html(r#"<form method="post"><input name="amount"><button>Donate</button></form>"#)
}

async fn submitted() -> Html<&'static str> {
    Html("<p>Thank you, your submission was received</p>")
}

pub async fn not_found() -> Error {
    Error::NotFound("page".to_string())
}
